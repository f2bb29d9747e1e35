//! Periodic reconciliation and supervision of long-running tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::arbiter::Arbiter;

/// Run [`Arbiter::reconcile`] every `interval` until cancelled.
pub async fn run_monitor(arbiter: Arc<Arbiter>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let action = arbiter.reconcile().await;
                tracing::debug!("Reconcile pass finished: {action:?}");
            }
            _ = token.cancelled() => {
                tracing::info!("GPU monitor cancelled");
                break;
            }
        }
    }
}

/// How a supervised task is restarted after a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A run lasting at least this long resets the backoff.
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            healthy_after: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Run the task produced by `make`, restarting it with exponential backoff
/// whenever it panics. Returns once the task completes on its own, fails
/// without panicking, or `token` is cancelled.
pub async fn supervise<F, Fut>(
    name: &str,
    policy: RestartPolicy,
    token: CancellationToken,
    mut make: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = policy.initial_backoff;

    loop {
        let started = Instant::now();
        let result = tokio::spawn(make()).await;
        if token.is_cancelled() {
            return;
        }

        match result {
            Ok(()) => {
                tracing::info!("{name} task completed");
                return;
            }
            Err(e) if e.is_panic() => {
                if started.elapsed() >= policy.healthy_after {
                    backoff = policy.initial_backoff;
                }
                tracing::error!("{name} task panicked, restarting in {backoff:?}");
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = token.cancelled() => return,
                }
                backoff = policy.next_backoff(backoff);
            }
            Err(e) => {
                tracing::error!("{name} task failed: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use futures::future::BoxFuture;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::arbiter::ArbiterConfig;
    use crate::classifier::ProcessPatterns;
    use crate::mock::ManualClock;
    use crate::mock::MockTelemetry;
    use crate::mock::MockUnit;
    use crate::mock::UnitCommand;

    fn flaky_task(
        attempts: Arc<AtomicUsize>,
        panics: usize,
    ) -> impl FnMut() -> BoxFuture<'static, ()> {
        move || {
            let attempts = attempts.clone();
            Box::pin(async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < panics {
                    panic!("simulated monitor fault");
                }
            })
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RestartPolicy::default();

        assert_eq!(policy.next_backoff(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(policy.next_backoff(Duration::from_secs(32)), Duration::from_secs(60));
        assert_eq!(policy.next_backoff(Duration::from_secs(60)), Duration::from_secs(60));
    }

    #[test(tokio::test(start_paused = true))]
    async fn restarts_panicking_task_with_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        supervise(
            "flaky",
            RestartPolicy::default(),
            CancellationToken::new(),
            flaky_task(attempts.clone(), 2),
        )
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4),
            "expected 1s + 2s of backoff, got {elapsed:?}"
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancellation_interrupts_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        let policy = RestartPolicy {
            initial_backoff: Duration::from_secs(30),
            ..Default::default()
        };

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(5)).await;
                token.cancel();
            })
        };
        supervise("doomed", policy, token, flaky_task(attempts.clone(), usize::MAX)).await;
        canceller.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn monitor_reconciles_every_interval_until_cancelled() {
        let telemetry = Arc::new(MockTelemetry::default());
        let unit = Arc::new(MockUnit::new(false));
        let arbiter = Arbiter::create(
            ArbiterConfig::new("120"),
            ProcessPatterns::default(),
            unit.clone(),
            telemetry.clone(),
            Arc::new(ManualClock::at_time_of_day(12, 0)),
        )
        .await;
        let token = CancellationToken::new();

        let monitor = tokio::spawn(run_monitor(
            arbiter.clone(),
            Duration::from_secs(10),
            token.clone(),
        ));
        sleep(Duration::from_secs(25)).await;
        token.cancel();
        monitor.await.unwrap();

        // ticks at 0s, 10s and 20s
        assert_eq!(telemetry.polls(), 3);
        assert_eq!(unit.commands(), vec![UnitCommand::Start]);
        assert!(arbiter.snapshot().await.unit_running);
    }
}
