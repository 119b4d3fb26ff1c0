//! Runtime configuration.

use serde::{Deserialize, Serialize};

/// Tunables an embedder may override before creating a runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads in the scheduler pool; 0 means hardware parallelism.
    pub worker_threads: usize,
    /// Total slot-allocation budget shared by all fibers. A fiber that
    /// exhausts it is terminated with `MemoryExhausted`.
    pub allocation_budget: i64,
    /// Priority given to fibers started without an explicit one.
    pub default_priority: u8,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 0,
            allocation_budget: 1 << 30,
            default_priority: 128,
        }
    }
}

impl RuntimeConfig {
    /// The worker-thread count after resolving the hardware default.
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads != 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert!(config.allocation_budget > 0);
        assert!(config.effective_worker_threads() >= 1);
    }

    #[test]
    fn explicit_thread_count_is_respected() {
        let config = RuntimeConfig {
            worker_threads: 3,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.effective_worker_threads(), 3);
    }
}
