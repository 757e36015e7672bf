//! Wall clock abstraction
//!
//! Bucket openness is judged against the user's local wall-clock time, and
//! outbox backoff deadlines against UTC. Both come from one injected clock so
//! tests can pin and advance time.

use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDateTime, SecondsFormat, Utc};

pub trait Clock: Send + Sync {
    /// Current instant with the user's local offset
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_local(&self) -> NaiveDateTime {
        self.now().naive_local()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.now().with_timezone(&Utc)
    }
}

/// System clock in the machine's local time zone
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Manually driven clock
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = *now + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stored timestamp format. Fixed precision keeps lexical order equal to
/// chronological order, which the outbox queries rely on.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
