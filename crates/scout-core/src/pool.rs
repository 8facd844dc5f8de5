//! Pipeline pool and concurrency limiter.
//!
//! A pipeline instance owns the per-task resources that are expensive to
//! set up (tool connections and loaded catalogs). The pool bounds how many
//! instances exist; the limiter bounds how many requests run at once. The
//! acquire order is limiter slot first, then instance; release reverses it
//! via guard drop order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::mcp::ToolManager;

/// One pre-initialized pipeline instance. Not shared across concurrently
/// running tasks.
pub struct PipelineInstance {
    pub id: usize,
    pub tools: Arc<ToolManager>,
    pub sub_agent_tools: Option<Arc<ToolManager>>,
}

/// Fixed pool of pipeline instances.
pub struct PipelinePool {
    instances: Vec<Arc<PipelineInstance>>,
    in_use: Mutex<Vec<bool>>,
    semaphore: Arc<Semaphore>,
}

impl PipelinePool {
    pub fn new(instances: Vec<PipelineInstance>) -> Self {
        let size = instances.len();
        info!(pool_size = size, "pipeline pool initialized");
        Self {
            instances: instances.into_iter().map(Arc::new).collect(),
            in_use: Mutex::new(vec![false; size]),
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn size(&self) -> usize {
        self.instances.len()
    }

    /// Claim an instance, waiting until one is free.
    pub async fn acquire(self: &Arc<Self>) -> PooledInstance {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");

        let index = {
            let mut in_use = self.in_use.lock().expect("pool lock");
            let index = in_use
                .iter()
                .position(|used| !used)
                .expect("semaphore guarantees a free instance");
            in_use[index] = true;
            index
        };

        debug!(instance = index, "acquired pipeline instance");
        PooledInstance {
            pool: Arc::clone(self),
            instance: Arc::clone(&self.instances[index]),
            index,
            _permit: permit,
        }
    }

    fn release(&self, index: usize) {
        let mut in_use = self.in_use.lock().expect("pool lock");
        in_use[index] = false;
        debug!(instance = index, "released pipeline instance");
    }
}

/// RAII handle on a claimed instance.
pub struct PooledInstance {
    pool: Arc<PipelinePool>,
    instance: Arc<PipelineInstance>,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledInstance {
    type Target = PipelineInstance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Global concurrency limiter across all requests.
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn acquire(&self) -> LimiterSlot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore closed");
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        info!(active, max = self.max_concurrent, "request slot acquired");
        LimiterSlot {
            active: Arc::clone(&self.active),
            max_concurrent: self.max_concurrent,
            _permit: permit,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// RAII handle on a limiter slot.
pub struct LimiterSlot {
    active: Arc<AtomicUsize>,
    max_concurrent: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for LimiterSlot {
    fn drop(&mut self) {
        let active = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        info!(active, max = self.max_concurrent, "request slot released");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    ShuttingDown,
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server is shutting down")
    }
}

impl std::error::Error for AcquireError {}

/// A claimed pipeline: limiter slot + pool instance. Dropping it releases
/// the instance first, then the slot.
pub struct AcquiredPipeline {
    pub instance: PooledInstance,
    _slot: LimiterSlot,
}

impl std::fmt::Debug for AcquiredPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredPipeline").finish()
    }
}

/// Pool + limiter, the only process-wide shared state of the engine.
pub struct PipelineManager {
    pool: Arc<PipelinePool>,
    limiter: ConcurrencyLimiter,
    shutting_down: AtomicBool,
}

impl PipelineManager {
    pub fn new(pool: PipelinePool, max_concurrent: usize) -> Self {
        Self {
            pool: Arc::new(pool),
            limiter: ConcurrencyLimiter::new(max_concurrent),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Acquire a concurrency slot, then a pipeline instance.
    pub async fn acquire(&self) -> Result<AcquiredPipeline, AcquireError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(AcquireError::ShuttingDown);
        }
        let slot = self.limiter.acquire().await;
        let instance = self.pool.acquire().await;
        Ok(AcquiredPipeline {
            instance,
            _slot: slot,
        })
    }

    pub fn active_requests(&self) -> usize {
        self.limiter.active_count()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Reject new acquisitions and wait up to `grace` for active tasks.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(
            active = self.active_requests(),
            "shutdown requested, draining active tasks"
        );

        let deadline = tokio::time::Instant::now() + grace;
        while self.active_requests() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_requests(),
                    "grace period elapsed, abandoning remaining tasks"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("all tasks drained");
    }
}
