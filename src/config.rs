use crate::error::Error;

/// Default segment count
pub const DEFAULT_SEGMENTS: usize = 16;

/// Default bucket count per segment
pub const DEFAULT_BUCKETS_PER_SEGMENT: usize = 512;

/// Default neighborhood size (H parameter in hopscotch hashing)
pub const DEFAULT_HOP_RANGE: usize = 32;

/// Default linear probe limit when searching for an empty bucket
pub const DEFAULT_ADD_RANGE: usize = 64;

/// Default read-path retry budget on observed displacement
pub const DEFAULT_MAX_TRIES: u32 = 2;

/// Width of the per-bucket neighborhood bitmap; `hop_range` may not exceed it.
const BITMAP_BITS: usize = u32::BITS as usize;

/// Tuning parameters for a [`HopscotchMap`](crate::HopscotchMap).
///
/// Segment and bucket counts must be powers of two so that index arithmetic
/// reduces to shifts and masks. The remaining fields bound how far an entry
/// may land from its home bucket (`hop_range`), how far an insert will scan
/// for an empty bucket before forcing a resize (`add_range`), and how many
/// times a reader retries after observing a displacement (`max_tries`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Number of segments; each has its own lock and timestamp. Power of two.
    pub n_segments: usize,
    /// Buckets in each segment's ring. Power of two, at least `add_range`.
    pub n_buckets_per_segment: usize,
    /// Neighborhood size: maximum distance from an entry to its home bucket.
    /// At most the bitmap width of 32.
    pub hop_range: usize,
    /// Maximum linear probe distance when searching for an empty bucket.
    /// At least `hop_range`.
    pub add_range: usize,
    /// Read-path retry budget; at least 1. Higher values trade read latency
    /// for fewer spurious misses under heavy displacement traffic.
    pub max_tries: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            n_segments: DEFAULT_SEGMENTS,
            n_buckets_per_segment: DEFAULT_BUCKETS_PER_SEGMENT,
            hop_range: DEFAULT_HOP_RANGE,
            add_range: DEFAULT_ADD_RANGE,
            max_tries: DEFAULT_MAX_TRIES,
        }
    }
}

impl TableConfig {
    /// Checks every construction-time constraint, returning the first
    /// violation as [`Error::InvalidConfig`].
    pub fn validate(&self) -> Result<(), Error> {
        if !self.n_segments.is_power_of_two() {
            return Err(Error::InvalidConfig {
                reason: "segment count must be a power of two",
            });
        }
        if !self.n_buckets_per_segment.is_power_of_two() {
            return Err(Error::InvalidConfig {
                reason: "bucket count per segment must be a power of two",
            });
        }
        if self.hop_range == 0 || self.hop_range > BITMAP_BITS {
            return Err(Error::InvalidConfig {
                reason: "hop range must be between 1 and the bitmap width of 32",
            });
        }
        if self.add_range < self.hop_range {
            return Err(Error::InvalidConfig {
                reason: "add range must be at least the hop range",
            });
        }
        if self.n_buckets_per_segment < self.add_range {
            return Err(Error::InvalidConfig {
                reason: "bucket count per segment must be at least the add range",
            });
        }
        if self.max_tries == 0 {
            return Err(Error::InvalidConfig {
                reason: "read retry budget must be at least 1",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TableConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_segments() {
        let config = TableConfig {
            n_segments: 3,
            ..TableConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn rejects_zero_segments() {
        let config = TableConfig {
            n_segments: 0,
            ..TableConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_hop_range() {
        let config = TableConfig {
            hop_range: 33,
            add_range: 64,
            ..TableConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_add_range_below_hop_range() {
        let config = TableConfig {
            hop_range: 16,
            add_range: 8,
            ..TableConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_segment_smaller_than_add_range() {
        let config = TableConfig {
            n_buckets_per_segment: 32,
            add_range: 64,
            ..TableConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_max_tries() {
        let config = TableConfig {
            max_tries: 0,
            ..TableConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
