//! Extent model
//!
//! Extents describe half-open byte ranges of an image with uniform
//! allocation or dirty-bitmap properties. Producers yield extents in
//! non-decreasing start order with no gaps inside the requested range,
//! and coalesce consecutive extents with identical flags.

use serde::{Deserialize, Serialize};

/// An extent of an image described by the "zero" context.
///
/// `zero` means the range reads as zeroes. `hole` means the range is
/// not present in the top image and reads through the backing chain;
/// a hole always reads as zero when there is no backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroExtent {
    pub start: u64,
    pub length: u64,
    pub zero: bool,
    pub hole: bool,
}

impl ZeroExtent {
    #[must_use]
    pub const fn new(start: u64, length: u64, zero: bool, hole: bool) -> Self {
        Self {
            start,
            length,
            zero,
            hole,
        }
    }

    /// True if the extent contains data that must be copied.
    #[must_use]
    pub const fn data(&self) -> bool {
        !self.zero
    }
}

/// An extent of an image described by the "dirty" context.
///
/// `dirty` means the range is included in the active dirty bitmap.
/// `zero` additionally describes the content of the range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyExtent {
    pub start: u64,
    pub length: u64,
    pub dirty: bool,
    pub zero: bool,
}

impl DirtyExtent {
    #[must_use]
    pub const fn new(start: u64, length: u64, dirty: bool, zero: bool) -> Self {
        Self {
            start,
            length,
            dirty,
            zero,
        }
    }

    /// True if the extent contains data that must be copied.
    #[must_use]
    pub const fn data(&self) -> bool {
        !self.zero
    }
}

/// Extent context selector used by backends and the /extents resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtentContext {
    Zero,
    Dirty,
}

impl ExtentContext {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Zero => "zero",
            Self::Dirty => "dirty",
        }
    }
}

impl std::str::FromStr for ExtentContext {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zero" => Ok(Self::Zero),
            "dirty" => Ok(Self::Dirty),
            other => Err(crate::Error::invalid_argument(format!(
                "invalid extents context: {other:?}"
            ))),
        }
    }
}

/// A block-aligned segment produced by [`split`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub start: u64,
    pub length: u64,
    pub zero: bool,
}

/// Split zero extents into checksum blocks.
///
/// Yields one [`Block`] per `block_size` bytes of the image (the last
/// block may be shorter). A block is zero only if every extent covering
/// it is zero. Input extents must be contiguous and start at offset 0,
/// which is what backends produce for the whole image.
pub fn split(extents: &[ZeroExtent], block_size: u64) -> Vec<Block> {
    assert!(block_size > 0);

    let mut blocks = Vec::new();
    let mut start = 0;
    let mut pending = 0;
    let mut zero = true;

    for ext in extents {
        let mut todo = ext.length;
        while todo > 0 {
            let step = todo.min(block_size - pending);
            zero = zero && ext.zero;
            pending += step;
            todo -= step;

            if pending == block_size {
                blocks.push(Block {
                    start,
                    length: block_size,
                    zero,
                });
                start += block_size;
                pending = 0;
                zero = true;
            }
        }
    }

    if pending > 0 {
        blocks.push(Block {
            start,
            length: pending,
            zero,
        });
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_extent_data() {
        let ext = ZeroExtent::new(0, 100, false, false);
        assert!(ext.data());
        let ext = ZeroExtent::new(0, 100, true, false);
        assert!(!ext.data());
    }

    #[test]
    fn test_extent_json_fields() {
        let ext = ZeroExtent::new(0, 4096, true, true);
        let value = serde_json::to_value(ext).unwrap();
        assert_eq!(
            value,
            serde_json::json!(
                {"start": 0, "length": 4096, "zero": true, "hole": true})
        );

        let ext = DirtyExtent::new(4096, 8192, true, false);
        let value = serde_json::to_value(ext).unwrap();
        assert_eq!(
            value,
            serde_json::json!(
                {"start": 4096, "length": 8192, "dirty": true, "zero": false})
        );
    }

    #[test]
    fn test_split_aligned() {
        let extents = [
            ZeroExtent::new(0, 8192, false, false),
            ZeroExtent::new(8192, 8192, true, false),
        ];
        let blocks = split(&extents, 4096);
        assert_eq!(
            blocks,
            vec![
                Block {
                    start: 0,
                    length: 4096,
                    zero: false
                },
                Block {
                    start: 4096,
                    length: 4096,
                    zero: false
                },
                Block {
                    start: 8192,
                    length: 4096,
                    zero: true
                },
                Block {
                    start: 12288,
                    length: 4096,
                    zero: true
                },
            ]
        );
    }

    #[test]
    fn test_split_mixed_block() {
        // A data extent smaller than the block makes the whole block a
        // data block.
        let extents = [
            ZeroExtent::new(0, 1024, false, false),
            ZeroExtent::new(1024, 7168, true, false),
        ];
        let blocks = split(&extents, 4096);
        assert_eq!(
            blocks,
            vec![
                Block {
                    start: 0,
                    length: 4096,
                    zero: false
                },
                Block {
                    start: 4096,
                    length: 4096,
                    zero: true
                },
            ]
        );
    }

    #[test]
    fn test_split_short_tail() {
        let extents = [ZeroExtent::new(0, 5000, true, false)];
        let blocks = split(&extents, 4096);
        assert_eq!(
            blocks,
            vec![
                Block {
                    start: 0,
                    length: 4096,
                    zero: true
                },
                Block {
                    start: 4096,
                    length: 904,
                    zero: true
                },
            ]
        );
    }

    #[test]
    fn test_split_partition() {
        let extents = [
            ZeroExtent::new(0, 70000, false, false),
            ZeroExtent::new(70000, 30000, true, true),
        ];
        let blocks = split(&extents, 4096);
        let total: u64 = blocks.iter().map(|b| b.length).sum();
        assert_eq!(total, 100_000);
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].start + pair[0].length, pair[1].start);
        }
    }
}
