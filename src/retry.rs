//! Retry policy for the descriptor-mode commit drain.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default pause between drain attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// Upper bound on how long a cancelled retry keeps sleeping.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Shared flag that stops a running retry loop after its current attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// New, not-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How long a failing commit drain keeps trying.
///
/// The default retries forever once per second: buffered bytes are never
/// dropped, and the committing thread blocks while storage is unwritable.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep between attempts.
    pub interval: Duration,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Give up once this token is cancelled.
    pub cancel: Option<CancelToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
            cancel: None,
        }
    }
}

impl RetryPolicy {
    /// Retry forever at `interval`.
    #[must_use]
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Try at most `max_attempts` times, sleeping `interval` in between.
    #[must_use]
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts.max(1)),
            cancel: None,
        }
    }

    /// Stop retrying once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Sleep one interval, waking early on cancellation. Returns false if
    /// the token fired.
    fn pause(&self) -> bool {
        if self.cancel.is_none() {
            thread::sleep(self.interval);
            return true;
        }
        let deadline = Instant::now() + self.interval;
        loop {
            if self.cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(CANCEL_POLL));
        }
    }
}

/// Failure of [`retry_until_success`]: the policy ran out before `op` succeeded.
#[derive(Debug)]
pub struct RetryExhausted {
    /// Attempts made.
    pub attempts: u32,
    /// Error of the last attempt.
    pub last: io::Error,
}

/// Run `op` until it succeeds or `policy` gives up, sleeping
/// `policy.interval` between attempts. Each failure is logged.
///
/// # Errors
///
/// Returns [`RetryExhausted`] with the last error once the attempt limit is
/// reached or the cancel token fires.
pub fn retry_until_success<F>(policy: &RetryPolicy, mut op: F) -> Result<(), RetryExhausted>
where
    F: FnMut() -> io::Result<()>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        let err = match op() {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        log::warn!("attempt {attempts} failed: {err}");

        let exhausted = policy.max_attempts.is_some_and(|max| attempts >= max);
        if exhausted || !policy.pause() {
            return Err(RetryExhausted {
                attempts,
                last: err,
            });
        }
    }
}
