//! Time source abstraction.
//!
//! All aging and timeout decisions in the stack (address deassociation, the
//! stale-reply barrier, data-stream gap skipping) compare monotonic
//! timestamps. They obtain them through the [`Clock`] trait instead of calling
//! `Instant::now` directly, so tests can script the passage of time.
//!
//! [`Clock`]: trait.Clock.html

use std::time::Instant;

/// Trait for monotonic time providers.
///
/// The runtime is handed an implementation when it is constructed. The
/// returned instants must never move backwards in time.
///
/// This trait can also be implemented by a mock clock for testing.
pub trait Clock: Send + Sync {
    /// Obtains the current time as an [`Instant`].
    ///
    /// [`Instant`]: https://doc.rust-lang.org/std/time/struct.Instant.html
    fn now(&self) -> Instant;
}

/// The operating system's monotonic clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::Clock;
    use crate::util;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// A clock that only moves when the test advances it.
    pub struct TestClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl TestClock {
        pub fn new() -> Self {
            TestClock {
                base: Instant::now(),
                offset: Mutex::new(Duration::from_secs(0)),
            }
        }

        pub fn advance(&self, by: Duration) {
            *util::lock(&self.offset) += by;
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.base + *util::lock(&self.offset)
        }
    }
}
