//! Reserved execution context for engine compute.
//!
//! Compute runs on the blocking pool of a private tokio runtime. The caller's
//! runtime (and its own blocking pool, used for decoding, assembly and file
//! I/O) never executes a compute thunk, so long inference calls cannot starve
//! I/O work and vice versa.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::error::{Error, Result};

pub const COMPUTE_THREAD_NAME: &str = "cugan-compute";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Upper bound on concurrently running compute threads. Idle threads are
    /// kept around and reused.
    pub max_threads: usize,
    /// Raise the scheduling priority of compute threads (Linux only, best effort).
    pub priority_boost: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            max_threads: 4,
            priority_boost: true,
        }
    }
}

pub struct ComputeScheduler {
    runtime: Option<Runtime>,
    in_flight: Arc<AtomicUsize>,
}

impl ComputeScheduler {
    pub fn new(config: ComputeConfig) -> anyhow::Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder
            .worker_threads(1)
            .max_blocking_threads(config.max_threads.max(1))
            .thread_name(COMPUTE_THREAD_NAME);
        if config.priority_boost {
            builder.on_thread_start(boost_current_thread);
        }
        let runtime = builder.build()?;

        debug!(
            max_threads = config.max_threads.max(1),
            priority_boost = config.priority_boost,
            "Compute scheduler started"
        );
        Ok(Self {
            runtime: Some(runtime),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of submitted jobs that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Runs `job` on the compute pool and waits for it from the caller's
    /// context. Errors and panics inside `job` become [`Error::EngineCompute`].
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| Error::Internal("compute scheduler is shut down".to_string()))?;

        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);
        let task = runtime.spawn_blocking(move || {
            let _done = InFlightGuard(in_flight);
            job()
        });

        match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(Error::EngineCompute {
                reason: format!("{err:#}"),
            }),
            Err(join) if join.is_panic() => Err(Error::EngineCompute {
                reason: format!("compute panicked: {}", panic_message(join.into_panic())),
            }),
            Err(join) => Err(Error::EngineCompute {
                reason: format!("compute task did not complete: {join}"),
            }),
        }
    }
}

impl Drop for ComputeScheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(target_os = "linux")]
fn boost_current_thread() {
    const COMPUTE_NICE: libc::c_int = -10;
    // who = 0 addresses the calling thread on Linux.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, COMPUTE_NICE) };
    if rc != 0 {
        debug!(
            error = %std::io::Error::last_os_error(),
            "Compute thread priority boost not permitted"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn boost_current_thread() {
    tracing::warn!("Compute thread priority boost is not supported on this platform");
}
