/// Bytes of bookkeeping attributed to every node of a cache table: the node
/// itself, its slot in the chain arena and the key/value handles.
pub(crate) const OVERHEAD_ELEMENT: u64 = 48;

/// Bytes per slot of a bucket array.
pub(crate) const POINTER_SIZE: u64 = std::mem::size_of::<usize>() as u64;

/// The smallest bucket array a cache table will ever have.
pub(crate) const MIN_CAPACITY: usize = 1001;

pub(crate) const LOAD_FACTOR: f64 = 0.75;

pub(crate) const DEFAULT_AVERAGE_SIZE: u32 = 100;

/// Number of live objects above which a cache table registers itself with the
/// memory authority.
pub(crate) const DEFAULT_REGISTER_THRESHOLD: usize = 100;

/// Above this percentage a table that may release references is cleared
/// completely instead of being scanned.
pub(crate) const FULL_CLEAR_PERCENT: f64 = 0.9;

/// The percentage released by a background tidy-up pass.
pub(crate) const TIDY_UP_PERCENT: f64 = 0.05;

/// How long the tidy-up worker blocks on an empty queue before checking
/// whether it has been asked to shut down.
pub(crate) const TIDY_UP_IDLE_POLL_MILLIS: u64 = 500;

/// How many times `LongKeyMap` answers a query on an array of unknown
/// sortedness with a linear scan before it sorts the array.
pub(crate) const MAX_SORT_DEFERRALS: u8 = 2;

/// A lazy `LongKeyMap` moves its parked overflow key into the key array, to
/// make room for a new one, only while it holds at most this many keys.
pub(crate) const MAX_LAZY_SINGLE_KEYS: usize = 3;

/// The initial bucket count of a materialized `LongKeyMap`.
pub(crate) const LONG_MAP_MIN_CAPACITY: usize = 17;

/// Returns the number of entries a bucket array of `capacity` slots holds
/// before it must grow.
#[inline]
pub(crate) fn threshold_for(capacity: usize) -> usize {
    (capacity as f64 * LOAD_FACTOR) as usize + 1
}
