pub(crate) mod clock;

pub(crate) use clock::Clock;

#[cfg(test)]
pub(crate) use clock::Mock;

/// The value stored in an entry's access marker when it has never been stamped,
/// and in a table's first-accessed field before the first lookup.
pub(crate) const UNSET_TICK: i64 = i64::MIN;

/// Masks off the reserved low bit of an access tick.
///
/// Entries keep their last-accessed tick packed with the low bit cleared, so
/// every comparison against a tick limit goes through this function.
#[inline]
pub(crate) fn pack_tick(tick: i64) -> i64 {
    tick & !1
}
