use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Bounded exponential retry settings for transient I/O faults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(200)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff, self.max_retries)
    }
}

/// Delays between attempts: `initial * 2^n`, capped at `max`, yielding at
/// most `max_attempts` values.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    remaining: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            current: initial.min(max),
            max,
            remaining: max_attempts,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        Some(delay)
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-transient error; not retried.
    Fatal(E),
    /// Every allowed attempt failed transiently.
    Exhausted { attempts: u32, last_error: E },
    /// Shutdown was requested while waiting to retry.
    Cancelled,
}

enum RetryState<E> {
    Attempting { attempt: u32 },
    Sleeping { attempt: u32, delay: Duration },
    Done(RetryError<E>),
}

/// Resolves once shutdown has been requested. Never resolves if the sender
/// is gone without having requested it.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `op` until it succeeds, fails fatally, exhausts the policy or is
/// cancelled by `shutdown`.
///
/// Each transient failure is followed by a backoff sleep; the sleep is cut
/// short by a shutdown request.
pub async fn retry_transient<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    operation: &str,
    is_transient: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut backoff = policy.backoff();
    let mut state = RetryState::Attempting { attempt: 1 };
    let mut last_error: Option<E> = None;

    loop {
        state = match state {
            RetryState::Attempting { attempt } => match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => RetryState::Done(RetryError::Fatal(e)),
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        tracing::warn!(
                            operation,
                            attempt,
                            backoff_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transient failure, retrying"
                        );
                        last_error = Some(e);
                        RetryState::Sleeping { attempt, delay }
                    }
                    None => {
                        tracing::error!(
                            operation,
                            attempts = attempt,
                            error = %e,
                            "Max retries exceeded"
                        );
                        RetryState::Done(RetryError::Exhausted {
                            attempts: attempt,
                            last_error: e,
                        })
                    }
                },
            },
            RetryState::Sleeping { attempt, delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => RetryState::Attempting { attempt: attempt + 1 },
                    _ = shutdown_requested(shutdown) => {
                        tracing::info!(
                            operation,
                            error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                            "Retry cancelled by shutdown"
                        );
                        RetryState::Done(RetryError::Cancelled)
                    }
                }
            }
            RetryState::Done(err) => return Err(err),
        };
    }
}
