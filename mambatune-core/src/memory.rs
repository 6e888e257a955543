//! Byte-level accounting of every live buffer, split by category.
//!
//! The accountant is the single piece of state shared between the training
//! loop and the background sampler; mutation is serialized through one mutex
//! so readers always observe a consistent snapshot.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Accounting tag attached to every allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
pub enum MemoryCategory {
    ModelWeights,
    Activations,
    OptimizerStates,
    Gradients,
    Temporary,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 5] = [
        MemoryCategory::ModelWeights,
        MemoryCategory::Activations,
        MemoryCategory::OptimizerStates,
        MemoryCategory::Gradients,
        MemoryCategory::Temporary,
    ];

    fn index(self) -> usize {
        match self {
            MemoryCategory::ModelWeights => 0,
            MemoryCategory::Activations => 1,
            MemoryCategory::OptimizerStates => 2,
            MemoryCategory::Gradients => 3,
            MemoryCategory::Temporary => 4,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CategoryUsage {
    pub current: usize,
    pub peak: usize,
}

#[derive(Debug, Default)]
struct AccountantInner {
    usage: [CategoryUsage; 5],
    total_current: usize,
    total_peak: usize,
}

/// Point-in-time snapshot of the accountant.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub current: usize,
    pub peak: usize,
    pub by_category: Vec<(MemoryCategory, CategoryUsage)>,
}

pub struct MemoryAccountant {
    inner: Mutex<AccountantInner>,
    /// Byte budget; 0 means unlimited.
    limit: AtomicUsize,
}

impl MemoryAccountant {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(AccountantInner {
                usage: [CategoryUsage { current: 0, peak: 0 }; 5],
                total_current: 0,
                total_peak: 0,
            }),
            limit: AtomicUsize::new(0),
        }
    }

    /// Set the total byte budget. Registrations that would exceed it fail
    /// with `AllocationFailed`.
    pub fn set_limit(&self, bytes: usize) {
        self.limit.store(bytes, Ordering::Relaxed);
    }

    pub fn register(&self, category: MemoryCategory, bytes: usize) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory accountant poisoned");
        let limit = self.limit.load(Ordering::Relaxed);
        if limit != 0 && inner.total_current + bytes > limit {
            return Err(Error::AllocationFailed(format!(
                "{bytes} bytes of {category} would exceed the {limit} byte budget \
                 ({} currently live)",
                inner.total_current
            )));
        }
        let usage = &mut inner.usage[category.index()];
        usage.current += bytes;
        usage.peak = usage.peak.max(usage.current);
        inner.total_current += bytes;
        inner.total_peak = inner.total_peak.max(inner.total_current);
        Ok(())
    }

    pub fn unregister(&self, category: MemoryCategory, bytes: usize) {
        let mut inner = self.inner.lock().expect("memory accountant poisoned");
        let usage = &mut inner.usage[category.index()];
        usage.current = usage.current.saturating_sub(bytes);
        inner.total_current = inner.total_current.saturating_sub(bytes);
    }

    pub fn current(&self, category: MemoryCategory) -> usize {
        let inner = self.inner.lock().expect("memory accountant poisoned");
        inner.usage[category.index()].current
    }

    pub fn report(&self) -> MemoryReport {
        let inner = self.inner.lock().expect("memory accountant poisoned");
        MemoryReport {
            current: inner.total_current,
            peak: inner.total_peak,
            by_category: MemoryCategory::ALL
                .iter()
                .map(|&c| (c, inner.usage[c.index()]))
                .collect(),
        }
    }
}

static ACCOUNTANT: Lazy<MemoryAccountant> = Lazy::new(MemoryAccountant::new);

/// The process-wide accountant every buffer registers against.
pub fn accountant() -> &'static MemoryAccountant {
    &ACCOUNTANT
}

/// RAII registration for buffers that do not live inside a `Tensor`
/// (e.g. the packed payload of a quantized tensor).
pub(crate) struct Registration {
    category: MemoryCategory,
    bytes: usize,
}

impl Registration {
    pub(crate) fn new(category: MemoryCategory, bytes: usize) -> Result<Self> {
        accountant().register(category, bytes)?;
        Ok(Self { category, bytes })
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        accountant().unregister(self.category, self.bytes);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registration({} x {} bytes)", self.category, self.bytes)
    }
}

/// Background task that periodically logs an accountant snapshot.
pub struct MemorySampler {
    stop: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl MemorySampler {
    pub fn spawn(interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = tokio::spawn(async move {
            let started = std::time::Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }
                let report = accountant().report();
                debug!(
                    elapsed_s = started.elapsed().as_secs(),
                    current_bytes = report.current,
                    peak_bytes = report.peak,
                    "memory sample"
                );
            }
        });
        Self { stop, handle }
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}
