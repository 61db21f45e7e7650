//! The presence-and-kind bit index that prefixes every encoded row.
//!
//! The index packs, MSB first, one presence bit per declared column
//! followed by a two-bit kind code for each present column. Packed bits
//! are spread over bytes that always carry their high bit, which keeps the
//! plain `0x00` separator byte unrepresentable inside the index:
//!
//! ```text
//! first byte:  1 r c d d d d d   (r reserved, c compression flag, 5 data bits)
//! later bytes: 1 d d d d d d d   (7 data bits)
//! ```

use crate::error::EncodingError;

/// Marks the first byte of an encoded index.
const CONTINUATION_BIT: u8 = 0x80;
/// Compression flag, meaningful only in the first index byte.
pub(crate) const COMPRESSED_DATA_BIT: u8 = 0x20;
/// Data bits carried by the first index byte.
const FIRST_BYTE_BITS: usize = 5;
/// Data bits carried by every subsequent index byte.
const LATER_BYTE_BITS: usize = 7;

/// Value kind of one encoded column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Fixed-width signed integer.
    Scalar,
    /// Single-precision float.
    Float,
    /// Double-precision float.
    Double,
    /// Length-prefixed opaque bytes.
    Other,
}

impl FieldKind {
    fn code(self) -> u8 {
        match self {
            FieldKind::Scalar => 0,
            FieldKind::Float => 1,
            FieldKind::Double => 2,
            FieldKind::Other => 3,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0 => FieldKind::Scalar,
            1 => FieldKind::Float,
            2 => FieldKind::Double,
            _ => FieldKind::Other,
        }
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            FieldKind::Scalar => "scalar",
            FieldKind::Float => "float",
            FieldKind::Double => "double",
            FieldKind::Other => "other",
        }
    }
}

/// Which of a row's declared columns are present, and their kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    n_cols: usize,
    kinds: Vec<Option<FieldKind>>,
}

impl RowLayout {
    /// An empty layout over `n_cols` declared columns.
    pub fn new(n_cols: usize) -> Self {
        Self {
            n_cols,
            kinds: vec![None; n_cols],
        }
    }

    /// Mark a column present with the given kind. Panics if `col` is out
    /// of the declared range.
    pub fn set(mut self, col: usize, kind: FieldKind) -> Self {
        assert!(col < self.n_cols, "column {} out of range", col);
        self.kinds[col] = Some(kind);
        self
    }

    /// Declared column count.
    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    /// Number of present columns.
    pub fn cardinality(&self) -> usize {
        self.kinds.iter().filter(|k| k.is_some()).count()
    }

    /// Kind of a column, if present.
    pub fn kind(&self, col: usize) -> Option<FieldKind> {
        self.kinds.get(col).copied().flatten()
    }

    /// Present columns in order, with their kinds.
    pub fn iter_present(&self) -> impl Iterator<Item = (usize, FieldKind)> + '_ {
        self.kinds
            .iter()
            .enumerate()
            .filter_map(|(col, kind)| kind.map(|k| (col, k)))
    }
}

/// A [`RowLayout`] plus its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitIndex {
    layout: RowLayout,
}

impl BitIndex {
    pub fn new(layout: RowLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn cardinality(&self) -> usize {
        self.layout.cardinality()
    }

    /// Encode the index. The compression flag is left clear; the row
    /// encoder sets it after deciding whether to compress the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut bits = Vec::with_capacity(self.layout.n_cols + 2 * self.cardinality());
        for col in 0..self.layout.n_cols {
            bits.push(self.layout.kind(col).is_some());
        }
        for (_, kind) in self.layout.iter_present() {
            let code = kind.code();
            bits.push(code & 0b10 != 0);
            bits.push(code & 0b01 != 0);
        }

        let n_bytes = if bits.len() <= FIRST_BYTE_BITS {
            1
        } else {
            1 + (bits.len() - FIRST_BYTE_BITS + LATER_BYTE_BITS - 1) / LATER_BYTE_BITS
        };
        let mut out = vec![CONTINUATION_BIT; n_bytes];
        for (pos, bit) in bits.iter().enumerate() {
            if !bit {
                continue;
            }
            if pos < FIRST_BYTE_BITS {
                out[0] |= 1 << (FIRST_BYTE_BITS - 1 - pos);
            } else {
                let rest = pos - FIRST_BYTE_BITS;
                let byte = 1 + rest / LATER_BYTE_BITS;
                out[byte] |= 1 << (LATER_BYTE_BITS - 1 - rest % LATER_BYTE_BITS);
            }
        }
        out
    }

    /// Decode index bytes (everything before the separator) against a
    /// declared column count. Returns the index and whether the payload
    /// that follows is compressed.
    pub fn decode(index: &[u8], n_cols: usize) -> Result<(Self, bool), EncodingError> {
        if index.is_empty() {
            return Err(EncodingError::Truncated("empty bit index"));
        }
        let compressed = index[0] & COMPRESSED_DATA_BIT != 0;
        let available = FIRST_BYTE_BITS + LATER_BYTE_BITS * (index.len() - 1);

        let bit_at = |pos: usize| -> bool {
            if pos < FIRST_BYTE_BITS {
                index[0] & (1 << (FIRST_BYTE_BITS - 1 - pos)) != 0
            } else {
                let rest = pos - FIRST_BYTE_BITS;
                let byte = 1 + rest / LATER_BYTE_BITS;
                index[byte] & (1 << (LATER_BYTE_BITS - 1 - rest % LATER_BYTE_BITS)) != 0
            }
        };

        if n_cols > available {
            return Err(EncodingError::Truncated("bit index shorter than column count"));
        }

        let mut layout = RowLayout::new(n_cols);
        let mut present = Vec::new();
        for col in 0..n_cols {
            if bit_at(col) {
                present.push(col);
            }
        }
        if n_cols + 2 * present.len() > available {
            return Err(EncodingError::Truncated("bit index missing kind codes"));
        }
        let mut pos = n_cols;
        for col in present {
            let code = ((bit_at(pos) as u8) << 1) | bit_at(pos + 1) as u8;
            pos += 2;
            layout = layout.set(col, FieldKind::from_code(code));
        }
        Ok((Self::new(layout), compressed))
    }
}
