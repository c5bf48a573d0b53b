//! Policy Error Types
//!
//! Errors surfaced while turning a bandwidth declaration into a usable
//! [`PolicyConfig`](super::PolicyConfig).

/// Error returned when a bandwidth declaration cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The numeric part of a quantity is missing or not a base-10 integer
    #[error("Invalid number: {0:?}")]
    InvalidNumber(String),

    /// The quantity carries a unit suffix outside the supported table
    #[error("Unknown suffix: {0:?}")]
    UnknownSuffix(String),

    /// The structured document is not valid JSON or has mistyped fields
    #[error("Malformed policy document: {0}")]
    MalformedDocument(String),

    /// The quantity does not fit in a signed 64-bit byte count
    #[error("Quantity {0:?} overflows a 64-bit byte count")]
    Overflow(String),
}

/// Error returned when a resolved policy is unusable
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A sketch dimension is zero
    #[error("{field} must be positive")]
    NonPositiveDimension {
        /// Offending field name
        field: &'static str,
    },

    /// A rate field is negative
    #[error("{field} cannot be negative")]
    NegativeRate {
        /// Offending field name
        field: &'static str,
    },

    /// A burst field is negative
    #[error("{field} cannot be negative")]
    NegativeBurst {
        /// Offending field name
        field: &'static str,
    },

    /// The sketch would need more counters than a shaping instance may hold
    #[error("Sketch of {width}x{depth} counters exceeds the allowed size")]
    SketchTooLarge {
        /// Requested row width
        width: usize,
        /// Requested row count
        depth: usize,
    },

    /// An engine timing setting is zero or above its ceiling
    #[error("{field} must be between 1 and {max}, got {value}")]
    SettingOutOfRange {
        /// Offending field name
        field: &'static str,
        /// Configured value
        value: u64,
        /// Largest accepted value
        max: u64,
    },
}
