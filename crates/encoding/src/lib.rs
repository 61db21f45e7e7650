//! Compact serialization of sparse, typed rows.
//!
//! An encoded row is `[bit index][0x00][field payloads]`. The bit index
//! records which of the declared columns are present and the value kind of
//! each present column; payloads follow in column order. Index bytes always
//! have their high bit set, so the single `0x00` separator is unambiguous.
//! Payloads larger than a fixed threshold are compressed as a whole, with
//! the compression signaled by a reserved bit in the index's first byte.

pub mod bit_index;
pub mod error;
pub mod row;

pub use bit_index::{BitIndex, FieldKind, RowLayout};
pub use error::EncodingError;
pub use row::{DecodedRow, FieldValue, RowEncoder};
