use thiserror::Error;

/// Error kinds surfaced by the training core. Each carries a context string
/// describing the violated contract.
#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("invalid codec request: {0}")]
    CodecSize(String),

    #[error("missing cached activation: {0}")]
    MissingActivation(String),

    #[error("missing kernel: {0}")]
    MissingKernel(String),

    #[error("empty batch: {0}")]
    EmptyBatch(String),

    #[error("numerical instability: {0}")]
    Numerical(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn shape(ctx: impl Into<String>) -> Self {
        Self::ShapeMismatch(ctx.into())
    }

    /// Recoverable errors let the training loop skip or retry the current
    /// step; everything else is surfaced to the driver.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailed(_)
                | Self::EmptyBatch(_)
                | Self::Numerical(_)
                | Self::MissingKernel(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
