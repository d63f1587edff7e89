use std::fmt;

/// The relative cost of dropping the content of a cache.
///
/// A memory authority drains caches in ascending order of cost: a `Lowest`
/// cache is emptied before a `Highest` one is touched. The cost is a priority
/// signal only; it never changes how a cache stores its entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Cost {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
    /// Accepted at construction time for compatibility and treated as
    /// `Highest`.
    Panic,
}

impl Cost {
    /// Maps `Panic` to `Highest`, leaving every other tier unchanged.
    pub fn normalize(self) -> Self {
        match self {
            Cost::Panic => Cost::Highest,
            other => other,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            Cost::Lowest => "lowest",
            Cost::Low => "low",
            Cost::Medium => "medium",
            Cost::High => "high",
            Cost::Highest => "highest",
            Cost::Panic => "panic",
        }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
