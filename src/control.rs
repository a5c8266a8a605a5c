//! Run control
//!
//! Cancellation and deadlines for long-running phases, progress reporting, and the
//! bounded worker pool used for per-subject and per-lag fan-out.

use crate::error::ResearchError;
use crate::types::Phase;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                deadline: Some(deadline),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_expired(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fail fast if the caller cancelled or the deadline passed
    pub fn check(&self, phase: Phase) -> Result<(), ResearchError> {
        if self.is_cancelled() {
            return Err(ResearchError::Cancelled { phase });
        }
        if self.is_expired() {
            return Err(ResearchError::DeadlineExceeded { phase });
        }
        Ok(())
    }
}

/// Progress event: units of work completed out of the total for a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: Phase,
    pub processed: usize,
    pub total: usize,
}

/// Receiver for progress events. Called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Per-call execution context: cancellation plus optional progress reporting
#[derive(Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress<P>(mut self, sink: P) -> Self
    where
        P: ProgressSink + 'static,
    {
        self.progress = Some(Arc::new(sink));
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn checkpoint(&self, phase: Phase) -> Result<(), ResearchError> {
        self.cancel.check(phase)
    }

    pub fn report(&self, phase: Phase, processed: usize, total: usize) {
        if let Some(sink) = &self.progress {
            sink.report(Progress {
                phase,
                processed,
                total,
            });
        }
    }

    /// Thread-safe counter that reports each completed unit of work
    pub(crate) fn counter(&self, phase: Phase, total: usize) -> ProgressCounter<'_> {
        self.report(phase, 0, total);
        ProgressCounter {
            ctx: self,
            phase,
            total,
            done: AtomicUsize::new(0),
        }
    }
}

pub(crate) struct ProgressCounter<'a> {
    ctx: &'a RunContext,
    phase: Phase,
    total: usize,
    done: AtomicUsize,
}

impl ProgressCounter<'_> {
    pub(crate) fn tick(&self) {
        let processed = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.ctx.report(self.phase, processed, self.total);
    }
}

/// Thread pool bounded by the configured concurrency limit
pub(crate) fn worker_pool(concurrency: usize) -> Result<rayon::ThreadPool, ResearchError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(concurrency.max(1))
        .thread_name(|i| format!("cohort-lens-worker-{}", i))
        .build()
        .map_err(|e| ResearchError::Config(format!("failed to start worker pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check(Phase::Analysis).is_ok());

        clone.cancel();
        assert!(matches!(
            token.check(Phase::Analysis),
            Err(ResearchError::Cancelled {
                phase: Phase::Analysis
            })
        ));
    }

    #[test]
    fn test_expired_deadline() {
        let token = CancellationToken::with_timeout(Duration::ZERO);
        assert!(matches!(
            token.check(Phase::Anonymization),
            Err(ResearchError::DeadlineExceeded { .. })
        ));
    }

    #[test]
    fn test_progress_counter_reports_each_unit() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let ctx = RunContext::new().with_progress(move |p: Progress| {
            sink_events.lock().unwrap().push(p.processed);
        });

        let counter = ctx.counter(Phase::Anonymization, 3);
        counter.tick();
        counter.tick();
        counter.tick();

        assert_eq!(*events.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_worker_pool_respects_limit() {
        let pool = worker_pool(2).unwrap();
        assert_eq!(pool.current_num_threads(), 2);
    }
}
