use std::time::{Duration, Instant as StdInstant};

#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::RwLock;

/// The source of access ticks.
///
/// A tick is the number of whole milliseconds elapsed since the clock was
/// created. Ticks are intentionally coarse; they only feed the eviction
/// heuristic.
#[derive(Default, Clone)]
pub(crate) struct Clock {
    ty: ClockType,
}

#[derive(Clone)]
enum ClockType {
    /// A clock that uses `std::time::Instant` as the source of time.
    Standard { origin: StdInstant },
    #[cfg(feature = "quanta")]
    /// A clock that uses `quanta::Instant` as the source of time. It is cheaper
    /// to read than `std::time::Instant` on most architectures, which matters
    /// because a tick is taken on every cache lookup.
    Quanta { origin: quanta::Instant },
    #[cfg(test)]
    /// A clock that uses a mocked source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for ClockType {
    /// Create a new `ClockType` with the current time as the origin.
    ///
    /// If the `quanta` feature is enabled, `Quanta` will be used. Otherwise,
    /// `Standard` will be used.
    fn default() -> Self {
        #[cfg(feature = "quanta")]
        {
            return ClockType::Quanta {
                origin: quanta::Instant::now(),
            };
        }

        #[allow(unreachable_code)]
        ClockType::Standard {
            origin: StdInstant::now(),
        }
    }
}

impl Clock {
    #[cfg(test)]
    /// Creates a new `Clock` with a mocked source of time.
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
        };
        (clock, mock)
    }

    /// Returns the elapsed time since the origin of this clock.
    pub(crate) fn elapsed(&self) -> Duration {
        match &self.ty {
            ClockType::Standard { origin } => origin.elapsed(),
            #[cfg(feature = "quanta")]
            ClockType::Quanta { origin } => origin.elapsed(),
            #[cfg(test)]
            ClockType::Mocked { mock } => mock.elapsed(),
        }
    }

    /// Returns the current tick, saturating at `i64::MAX`.
    pub(crate) fn tick(&self) -> i64 {
        i64::try_from(self.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
pub(crate) struct Mock {
    origin: StdInstant,
    now: RwLock<StdInstant>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        let origin = StdInstant::now();
        Self {
            origin,
            now: RwLock::new(origin),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        *self.now.write() += amount;
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.now.read().duration_since(self.origin)
    }
}
