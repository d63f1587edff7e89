/// The error type for rejected configuration values.
///
/// These errors are raised synchronously at the call site. Values are never
/// clamped into range silently.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The average object size of a [`CacheTable`][cache-table] must be a
    /// positive number of bytes.
    ///
    /// [cache-table]: ./struct.CacheTable.html
    #[error("The average size must be a positive number of bytes, got {0}")]
    NonPositiveAverageSize(i64),

    /// An eviction percentage must be within `(0.0, 1.0]`.
    #[error("The eviction percentage must be within (0.0, 1.0], got {0}")]
    PercentOutOfRange(f64),

    /// The registration threshold of a [`CacheTable`][cache-table] must be at
    /// least one object.
    ///
    /// [cache-table]: ./struct.CacheTable.html
    #[error("The register threshold must be at least 1")]
    ZeroRegisterThreshold,
}

/// Rejects percentages outside of `(0.0, 1.0]`, including `NaN`.
pub(crate) fn check_percent(percent: f64) -> Result<f64, ConfigError> {
    if percent > 0.0 && percent <= 1.0 {
        Ok(percent)
    } else {
        Err(ConfigError::PercentOutOfRange(percent))
    }
}

pub(crate) fn check_average_size(size: i64) -> Result<u32, ConfigError> {
    if size > 0 {
        Ok(u32::try_from(size).unwrap_or(u32::MAX))
    } else {
        Err(ConfigError::NonPositiveAverageSize(size))
    }
}

#[cfg(test)]
mod tests {
    use super::{check_average_size, check_percent, ConfigError};

    #[test]
    fn percent_bounds() {
        assert_eq!(check_percent(1.0), Ok(1.0));
        assert_eq!(check_percent(0.05), Ok(0.05));
        assert_eq!(check_percent(0.0), Err(ConfigError::PercentOutOfRange(0.0)));
        assert_eq!(check_percent(1.5), Err(ConfigError::PercentOutOfRange(1.5)));
        assert!(check_percent(f64::NAN).is_err());
    }

    #[test]
    fn average_size_bounds() {
        assert_eq!(check_average_size(100), Ok(100));
        assert_eq!(check_average_size(i64::MAX), Ok(u32::MAX));
        assert_eq!(
            check_average_size(0),
            Err(ConfigError::NonPositiveAverageSize(0))
        );
        assert_eq!(
            check_average_size(-3),
            Err(ConfigError::NonPositiveAverageSize(-3))
        );
    }
}
