//! Encoding and decoding failures.

use thiserror::Error;

/// Errors from row encoding and decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The value count handed to the encoder does not match the layout's
    /// cardinality.
    #[error("layout expects {expected} values, got {actual}")]
    CardinalityMismatch {
        /// Present columns in the layout.
        expected: usize,
        /// Values supplied by the caller.
        actual: usize,
    },

    /// A supplied value's kind disagrees with the layout's declared kind
    /// for that column.
    #[error("column {column} declared as {declared}, value is {actual}")]
    KindMismatch {
        /// Column position.
        column: usize,
        /// Kind declared in the layout.
        declared: &'static str,
        /// Kind of the supplied value.
        actual: &'static str,
    },

    /// Input ended before the structure it promised.
    #[error("truncated input: {0}")]
    Truncated(&'static str),

    /// No `0x00` separator between index and payload.
    #[error("missing index/payload separator")]
    MissingSeparator,

    /// Bytes left over after all declared fields were decoded.
    #[error("{0} trailing bytes after last field")]
    TrailingBytes(usize),

    /// The payload could not be compressed or decompressed.
    #[error("payload compression: {0}")]
    Compression(#[from] std::io::Error),
}
