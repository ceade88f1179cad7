//! Connection lifecycle state machine.
//!
//! Pure bookkeeping for the transport driver: which signal to raise on open,
//! and whether a close ends the transport, schedules a reconnect, or exhausts
//! the retry budget. No I/O or timers live here.

use std::time::Duration;

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(2000);

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// How many reconnect attempts are allowed per run of consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Never reconnect; the first unexpected close aborts.
    Never,
    /// Exactly this many attempts, then abort.
    Limited(u32),
    /// Keep trying forever.
    Unlimited,
}

impl RetryLimit {
    /// Interpret a signed `max-attempts` setting.
    ///
    /// Negative means unlimited, zero means never, positive is the limit.
    pub fn from_max_attempts(max_attempts: i64) -> Self {
        match max_attempts {
            n if n < 0 => Self::Unlimited,
            0 => Self::Never,
            n => Self::Limited(u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows(self, attempts_made: u32) -> bool {
        match self {
            Self::Never => false,
            Self::Limited(max) => attempts_made < max,
            Self::Unlimited => true,
        }
    }
}

impl Default for RetryLimit {
    fn default() -> Self {
        Self::Limited(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Reconnect policy: fixed delay plus an attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before each reconnect attempt.
    pub delay: Duration,
    /// Attempt limit.
    pub limit: RetryLimit,
}

impl RetryPolicy {
    /// Policy with the given delay and limit.
    pub fn new(delay: Duration, limit: RetryLimit) -> Self {
        Self { delay, limit }
    }

    /// Policy that never reconnects.
    pub fn never() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            limit: RetryLimit::Never,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            limit: RetryLimit::default(),
        }
    }
}

/// Signal raised when a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenSignal {
    /// First successful open of this transport.
    Start,
    /// A later open, after a reconnect.
    Reopen,
}

/// What the driver must do after a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The close was requested; the transport is done.
    Stopped,
    /// Reconnect after `delay`; this is attempt number `attempt`.
    Reconnect {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before connecting again.
        delay: Duration,
    },
    /// The retry budget is exhausted; the transport is done.
    Aborted,
}

/// Lifecycle bookkeeping for one transport.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    policy: RetryPolicy,
    has_started: bool,
    attempt: u32,
}

impl Lifecycle {
    /// Fresh lifecycle: never opened, no attempts made.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            has_started: false,
            attempt: 0,
        }
    }

    /// Record a successful open.
    ///
    /// Resets the attempt counter, so a later disconnect gets the full retry
    /// budget again.
    pub fn on_open(&mut self) -> OpenSignal {
        let signal = if self.has_started {
            OpenSignal::Reopen
        } else {
            OpenSignal::Start
        };
        self.has_started = true;
        self.attempt = 0;
        signal
    }

    /// Record a close and decide what happens next.
    pub fn on_close(&mut self, intentional: bool) -> CloseOutcome {
        if intentional {
            self.has_started = false;
            return CloseOutcome::Stopped;
        }

        if self.policy.limit.allows(self.attempt) {
            self.attempt = self.attempt.saturating_add(1);
            CloseOutcome::Reconnect {
                attempt: self.attempt,
                delay: self.policy.delay,
            }
        } else {
            CloseOutcome::Aborted
        }
    }

    /// Whether the transport has opened at least once since it last stopped.
    pub fn has_started(&self) -> bool {
        self.has_started
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The policy in force.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}
