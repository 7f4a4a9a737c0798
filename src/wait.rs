// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded polling.
//!
//! Some resources show up a little after the command that creates them
//! returns, e.g., a filesystem UUID after mkfs, or a database server that is
//! still starting. Both are polled at a fixed interval up to a fixed ceiling.

use std::{cell::RefCell, time::Duration};
use tracing::debug;

/// Interval between two probes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ceiling after which polling gives up.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Pause current thread between two probes.
pub trait Sleep {
    /// Block for given duration.
    fn sleep(&self, duration: Duration);
}

impl<S> Sleep for &S
where
    S: Sleep + ?Sized,
{
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Sleep through [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Sleeper that only records requested pauses.
#[derive(Debug, Default)]
pub struct RecordedSleep {
    pauses: RefCell<Vec<Duration>>,
}

impl RecordedSleep {
    /// Construct new recording sleeper.
    pub fn new() -> Self {
        Self::default()
    }

    /// All pauses requested so far.
    pub fn pauses(&self) -> Vec<Duration> {
        self.pauses.borrow().clone()
    }
}

impl Sleep for RecordedSleep {
    fn sleep(&self, duration: Duration) {
        self.pauses.borrow_mut().push(duration);
    }
}

/// Poll probe until it yields a value or timeout is reached.
///
/// The probe runs once immediately, then once after every interval. The
/// number of pauses never exceeds `timeout / interval`. Returns `Ok(None)`
/// once the ceiling is hit without the probe ever producing a value.
///
/// # Errors
///
/// - Return whatever error the probe itself raises. Probe errors are not
///   retried.
pub fn poll<T, E>(
    sleeper: &impl Sleep,
    interval: Duration,
    timeout: Duration,
    mut probe: impl FnMut() -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    let attempts = timeout.as_millis() / interval.as_millis().max(1);
    let mut waited = 0;

    loop {
        if let Some(value) = probe()? {
            return Ok(Some(value));
        }

        if waited >= attempts {
            return Ok(None);
        }

        debug!("probe not ready, retry in {interval:?}");
        sleeper.sleep(interval);
        waited += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;

    #[test]
    fn poll_returns_immediately_when_ready() {
        let sleeper = RecordedSleep::new();
        let result: Result<_, Infallible> =
            poll(&sleeper, POLL_INTERVAL, POLL_TIMEOUT, || Ok(Some("uuid")));
        assert_eq!(result, Ok(Some("uuid")));
        assert!(sleeper.pauses().is_empty());
    }

    #[test]
    fn poll_retries_until_value_appears() {
        let sleeper = RecordedSleep::new();
        let mut calls = 0;
        let result: Result<_, Infallible> = poll(&sleeper, POLL_INTERVAL, POLL_TIMEOUT, || {
            calls += 1;
            Ok((calls == 4).then_some(calls))
        });
        assert_eq!(result, Ok(Some(4)));
        assert_eq!(sleeper.pauses(), vec![POLL_INTERVAL; 3]);
    }

    #[test]
    fn poll_gives_up_at_ceiling() {
        let sleeper = RecordedSleep::new();
        let mut calls = 0;
        let result: Result<Option<()>, Infallible> =
            poll(&sleeper, POLL_INTERVAL, POLL_TIMEOUT, || {
                calls += 1;
                Ok(None)
            });
        assert_eq!(result, Ok(None));
        assert_eq!(sleeper.pauses().len(), 60);
        assert_eq!(calls, 61);
    }

    #[test]
    fn poll_propagates_probe_error() {
        let sleeper = RecordedSleep::new();
        let result: Result<Option<()>, &str> =
            poll(&sleeper, POLL_INTERVAL, POLL_TIMEOUT, || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(sleeper.pauses().is_empty());
    }
}
