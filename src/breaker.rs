//! Per-server circuit breaker.
//!
//! Explicit closed → open → half-open state machine wrapping one async
//! operation at a time. An unreachable server fails fast instead of delaying
//! calls routed to healthy servers behind the same manager. The breaker only
//! suppresses attempts; it never re-issues a call.

use crate::error::{BridgeError, Result};
use crate::logging;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing one trial call.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    phase: BreakerPhase,
    failures: u32,
    retry_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                phase: BreakerPhase::Closed,
                failures: 0,
                retry_at: None,
            }),
        }
    }

    /// Run `op` through the breaker. In the open phase the call fails with
    /// [`BridgeError::BreakerOpen`] without invoking `op`; in half-open
    /// exactly one trial is allowed through. The lock is never held across
    /// the awaited operation.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn try_acquire(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::HalfOpen => {
                // One trial is already in flight.
                Err(BridgeError::BreakerOpen(self.name.clone()))
            }
            BreakerPhase::Open => {
                let due = state
                    .retry_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    state.phase = BreakerPhase::HalfOpen;
                    logging::info(&format!(
                        "circuit breaker for '{}' half-open, allowing one trial",
                        self.name
                    ));
                    Ok(())
                } else {
                    Err(BridgeError::BreakerOpen(self.name.clone()))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase != BreakerPhase::Closed {
            logging::info(&format!("circuit breaker for '{}' closed", self.name));
        }
        state.phase = BreakerPhase::Closed;
        state.failures = 0;
        state.retry_at = None;
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            BreakerPhase::HalfOpen => {
                state.phase = BreakerPhase::Open;
                state.retry_at = Some(Instant::now() + self.config.reset_timeout);
                logging::warn(&format!(
                    "circuit breaker for '{}' reopened after failed trial",
                    self.name
                ));
            }
            BreakerPhase::Closed => {
                state.failures += 1;
                if state.failures >= self.config.failure_threshold {
                    state.phase = BreakerPhase::Open;
                    state.retry_at = Some(Instant::now() + self.config.reset_timeout);
                    logging::warn(&format!(
                        "circuit breaker for '{}' opened after {} consecutive failures",
                        self.name, state.failures
                    ));
                }
            }
            BreakerPhase::Open => {}
        }
    }

    pub fn phase(&self) -> BreakerPhase {
        self.state.lock().unwrap().phase
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().unwrap().failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "upstream",
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout: reset,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<()> {
        b.call(|| async { Err::<(), _>(BridgeError::Connection("down".into())) })
            .await
    }

    #[tokio::test]
    async fn success_resets_the_counter() {
        let b = breaker(3, Duration::from_secs(30));
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.failure_count(), 2);
        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_short_circuits() {
        let b = breaker(3, Duration::from_secs(30));
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.phase(), BreakerPhase::Open);

        // The wrapped operation must not run while open.
        let invoked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invoked);
        let result = b
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BridgeError::BreakerOpen(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_success_closes() {
        let b = breaker(2, Duration::from_secs(10));
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.phase(), BreakerPhase::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        b.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(b.phase(), BreakerPhase::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_failure_reopens() {
        let b = breaker(2, Duration::from_secs(10));
        let _ = fail(&b).await;
        let _ = fail(&b).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&b).await;
        assert_eq!(b.phase(), BreakerPhase::Open);

        // Reopened with a fresh timer: still short-circuiting before it.
        tokio::time::advance(Duration::from_secs(5)).await;
        let result = b.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(BridgeError::BreakerOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_exactly_one_trial() {
        let b = Arc::new(breaker(1, Duration::from_secs(10)));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.call(|| async {
                    let _ = gate_rx.await;
                    Ok(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.phase(), BreakerPhase::HalfOpen);

        // A second caller during the trial is rejected.
        let second = b.call(|| async { Ok(()) }).await;
        assert!(matches!(second, Err(BridgeError::BreakerOpen(_))));

        let _ = gate_tx.send(());
        trial.await.unwrap().unwrap();
        assert_eq!(b.phase(), BreakerPhase::Closed);
    }
}
