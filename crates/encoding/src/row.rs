//! Row encoding and decoding over a [`BitIndex`].

use crate::bit_index::{BitIndex, FieldKind, RowLayout, COMPRESSED_DATA_BIT};
use crate::error::EncodingError;
use byteorder::{BigEndian, ByteOrder};

/// Payloads above this size are compressed as a whole. Chosen so the
/// compressor has enough input to actually gain something.
const DATA_COMPRESSION_THRESHOLD: usize = 150;

/// One typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Signed integer, 8 bytes big-endian on the wire.
    Scalar(i64),
    /// Single-precision float, 4 bytes big-endian.
    Float(f32),
    /// Double-precision float, 8 bytes big-endian.
    Double(f64),
    /// Opaque bytes with a 4-byte big-endian length prefix.
    Other(Vec<u8>),
}

impl FieldValue {
    /// The kind this value encodes as.
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Scalar(_) => FieldKind::Scalar,
            FieldValue::Float(_) => FieldKind::Float,
            FieldValue::Double(_) => FieldKind::Double,
            FieldValue::Other(_) => FieldKind::Other,
        }
    }
}

/// Encodes rows that share a layout.
///
/// The encoder caches the layout's wire form; callers that write many rows
/// with the same presence/kind pattern pay the index construction cost
/// once. [`RowEncoder::reset`] keeps the cached state when the new layout
/// is identical to the current one.
pub struct RowEncoder {
    index: BitIndex,
    index_bytes: Vec<u8>,
}

impl RowEncoder {
    pub fn new(layout: RowLayout) -> Self {
        let index = BitIndex::new(layout);
        let index_bytes = index.encode();
        Self { index, index_bytes }
    }

    pub fn layout(&self) -> &RowLayout {
        self.index.layout()
    }

    /// Point the encoder at a new layout. Returns true when the layout is
    /// identical to the current one and the built index was reused.
    pub fn reset(&mut self, layout: RowLayout) -> bool {
        if *self.index.layout() == layout {
            return true;
        }
        self.index = BitIndex::new(layout);
        self.index_bytes = self.index.encode();
        false
    }

    /// Encode one row's present values, in column order.
    pub fn encode(&self, values: &[FieldValue]) -> Result<Vec<u8>, EncodingError> {
        let expected = self.index.cardinality();
        if values.len() != expected {
            return Err(EncodingError::CardinalityMismatch {
                expected,
                actual: values.len(),
            });
        }

        let mut payload = Vec::new();
        for ((col, declared), value) in self.layout().iter_present().zip(values) {
            if value.kind() != declared {
                return Err(EncodingError::KindMismatch {
                    column: col,
                    declared: declared.name(),
                    actual: value.kind().name(),
                });
            }
            match value {
                FieldValue::Scalar(v) => {
                    let mut buf = [0u8; 8];
                    BigEndian::write_i64(&mut buf, *v);
                    payload.extend_from_slice(&buf);
                }
                FieldValue::Float(v) => {
                    let mut buf = [0u8; 4];
                    BigEndian::write_f32(&mut buf, *v);
                    payload.extend_from_slice(&buf);
                }
                FieldValue::Double(v) => {
                    let mut buf = [0u8; 8];
                    BigEndian::write_f64(&mut buf, *v);
                    payload.extend_from_slice(&buf);
                }
                FieldValue::Other(bytes) => {
                    let mut buf = [0u8; 4];
                    BigEndian::write_u32(&mut buf, bytes.len() as u32);
                    payload.extend_from_slice(&buf);
                    payload.extend_from_slice(bytes);
                }
            }
        }

        let mut entry = self.index_bytes.clone();
        if payload.len() > DATA_COMPRESSION_THRESHOLD {
            payload = zstd::stream::encode_all(payload.as_slice(), 0)?;
            entry[0] |= COMPRESSED_DATA_BIT;
        }
        entry.push(0);
        entry.extend_from_slice(&payload);
        Ok(entry)
    }
}

/// A decoded row: its layout and the present values in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    layout: RowLayout,
    values: Vec<FieldValue>,
}

impl DecodedRow {
    /// Decode an entry against the declared column count. The wire form
    /// does not carry the column count; the caller's schema supplies it.
    pub fn decode(entry: &[u8], n_cols: usize) -> Result<Self, EncodingError> {
        let sep = entry
            .iter()
            .position(|b| b & 0x80 == 0)
            .ok_or(EncodingError::MissingSeparator)?;
        if entry[sep] != 0 {
            return Err(EncodingError::MissingSeparator);
        }

        let (index, compressed) = BitIndex::decode(&entry[..sep], n_cols)?;
        let raw = &entry[sep + 1..];
        let decompressed;
        let mut payload: &[u8] = if compressed {
            decompressed = zstd::stream::decode_all(raw)?;
            &decompressed
        } else {
            raw
        };

        let mut values = Vec::with_capacity(index.cardinality());
        for (_, kind) in index.layout().iter_present() {
            values.push(match kind {
                FieldKind::Scalar => {
                    FieldValue::Scalar(BigEndian::read_i64(take(&mut payload, 8, "scalar")?))
                }
                FieldKind::Float => {
                    FieldValue::Float(BigEndian::read_f32(take(&mut payload, 4, "float")?))
                }
                FieldKind::Double => {
                    FieldValue::Double(BigEndian::read_f64(take(&mut payload, 8, "double")?))
                }
                FieldKind::Other => {
                    let len = BigEndian::read_u32(take(&mut payload, 4, "length prefix")?);
                    FieldValue::Other(take(&mut payload, len as usize, "bytes field")?.to_vec())
                }
            });
        }
        if !payload.is_empty() {
            return Err(EncodingError::TrailingBytes(payload.len()));
        }

        Ok(Self {
            layout: index.layout().clone(),
            values,
        })
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Value of a column, if present.
    pub fn get(&self, col: usize) -> Option<&FieldValue> {
        self.layout
            .iter_present()
            .position(|(c, _)| c == col)
            .map(|i| &self.values[i])
    }

    /// Present columns with their values, in column order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &FieldValue)> {
        self.layout
            .iter_present()
            .map(|(col, _)| col)
            .zip(self.values.iter())
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], EncodingError> {
    if input.len() < n {
        return Err(EncodingError::Truncated(what));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}
