use std::fmt;

/// Typed errors for table construction and growth
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A table parameter failed validation at construction time
    InvalidConfig {
        /// Which rule the configuration broke
        reason: &'static str,
    },
    /// Growing the table would exceed the maximum supported capacity
    CapacityExhausted {
        /// Bucket count of the table that could not grow
        capacity: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig { reason } => {
                write!(f, "invalid table configuration: {}", reason)
            }
            Error::CapacityExhausted { capacity } => {
                write!(f, "table at {} buckets cannot grow further", capacity)
            }
        }
    }
}

impl std::error::Error for Error {}
