//! Tensor descriptor table.

use serde::{Serialize, Serializer};
use std::fmt;

/// Block layout of a GGML element type: how many elements share one block and
/// how many bytes that block occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_elements: u64,
    pub block_bytes: u64,
}

const fn layout(block_elements: u64, block_bytes: u64) -> BlockLayout {
    BlockLayout { block_elements, block_bytes }
}

/// Raw GGML tensor type id.
///
/// The id is kept verbatim so archives carrying types this crate does not
/// know about still round-trip; their byte length is taken from the offset
/// table instead of being computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorType(pub u32);

impl TensorType {
    pub const F32: Self = Self(0);
    pub const F16: Self = Self(1);
    pub const Q4_0: Self = Self(2);
    pub const Q8_0: Self = Self(8);
    pub const BF16: Self = Self(30);

    fn describe(self) -> Option<(&'static str, BlockLayout)> {
        Some(match self.0 {
            0 => ("F32", layout(1, 4)),
            1 => ("F16", layout(1, 2)),
            2 => ("Q4_0", layout(32, 18)),
            3 => ("Q4_1", layout(32, 20)),
            6 => ("Q5_0", layout(32, 22)),
            7 => ("Q5_1", layout(32, 24)),
            8 => ("Q8_0", layout(32, 34)),
            9 => ("Q8_1", layout(32, 36)),
            10 => ("Q2_K", layout(256, 84)),
            11 => ("Q3_K", layout(256, 110)),
            12 => ("Q4_K", layout(256, 144)),
            13 => ("Q5_K", layout(256, 176)),
            14 => ("Q6_K", layout(256, 210)),
            15 => ("Q8_K", layout(256, 292)),
            16 => ("IQ2_XXS", layout(256, 66)),
            17 => ("IQ2_XS", layout(256, 74)),
            18 => ("IQ3_XXS", layout(256, 98)),
            19 => ("IQ1_S", layout(256, 50)),
            20 => ("IQ4_NL", layout(32, 18)),
            21 => ("IQ3_S", layout(256, 110)),
            22 => ("IQ2_S", layout(256, 82)),
            23 => ("IQ4_XS", layout(256, 136)),
            24 => ("I8", layout(1, 1)),
            25 => ("I16", layout(1, 2)),
            26 => ("I32", layout(1, 4)),
            27 => ("I64", layout(1, 8)),
            28 => ("F64", layout(1, 8)),
            29 => ("IQ1_M", layout(256, 56)),
            30 => ("BF16", layout(1, 2)),
            34 => ("TQ1_0", layout(256, 54)),
            35 => ("TQ2_0", layout(256, 66)),
            _ => return None,
        })
    }

    /// Block layout for known types, `None` for opaque ids.
    pub fn block_layout(self) -> Option<BlockLayout> {
        self.describe().map(|(_, l)| l)
    }

    pub fn is_known(self) -> bool {
        self.describe().is_some()
    }

    pub fn is_quantized(self) -> bool {
        self.block_layout().is_some_and(|l| l.block_elements > 1)
    }

    /// Byte length of a tensor of this type with the given dims.
    ///
    /// `None` for unknown types or when the element count overflows.
    pub fn byte_len(self, dims: &[u64]) -> Option<u64> {
        let l = self.block_layout()?;
        let elements = dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))?;
        let blocks = elements.div_ceil(l.block_elements);
        blocks.checked_mul(l.block_bytes)
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.describe() {
            Some((name, _)) => f.write_str(name),
            None => write!(f, "UNKNOWN({})", self.0),
        }
    }
}

impl Serialize for TensorType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Descriptor for one tensor in the archive's index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub dims: Vec<u64>,
    pub tensor_type: TensorType,
    /// Byte offset of the tensor's data relative to the payload start, as
    /// found in the source archive. The writer recomputes it.
    pub offset: u64,
    /// Declared byte length; preserved verbatim across edits.
    pub byte_len: u64,
}

impl TensorDescriptor {
    pub fn end(&self) -> u64 {
        self.offset + self.byte_len
    }
}
