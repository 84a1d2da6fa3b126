//! Sparse firmware images.

use crate::protocol::constants::{FLASH_APP_ORIGIN, FLASH_ERASED};

/// Contiguous run of bytes placed at an absolute flash address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlock {
    pub offset: u32,
    pub data: Vec<u8>,
}

impl FirmwareBlock {
    pub fn new(offset: u32, data: Vec<u8>) -> Self {
        Self { offset, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last address covered by this block.
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.data.len() as u64
    }
}

/// Firmware binary as an ordered list of blocks.
///
/// Blocks are written in the order they are listed. `limit` bounds how many
/// bytes a download reads back; it is ignored by uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImage {
    blocks: Vec<FirmwareBlock>,
    limit: Option<u32>,
}

impl FirmwareImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Image holding `data` as a single block at `offset`.
    pub fn from_binary(offset: u32, data: Vec<u8>) -> Self {
        let mut image = Self::new();
        image.append_block(offset, data);
        image
    }

    /// Empty image for downloading at most `limit` bytes of the application.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            blocks: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn append_block(&mut self, offset: u32, data: Vec<u8>) {
        self.blocks.push(FirmwareBlock::new(offset, data));
    }

    pub fn blocks(&self) -> &[FirmwareBlock] {
        &self.blocks
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<u32>) {
        self.limit = limit;
    }

    /// Total number of data bytes across all blocks.
    pub fn total_len(&self) -> usize {
        self.blocks.iter().map(FirmwareBlock::len).sum()
    }

    /// Lowest address covered by the image, or the application origin when empty.
    pub fn base_address(&self) -> u32 {
        self.blocks
            .iter()
            .map(|b| b.offset)
            .min()
            .unwrap_or(FLASH_APP_ORIGIN)
    }

    /// Flatten the image into one buffer starting at [`base_address`].
    ///
    /// Gaps between blocks are filled with erased flash bytes; later blocks
    /// overwrite earlier ones where they overlap.
    ///
    /// [`base_address`]: FirmwareImage::base_address
    pub fn contiguous_bytes(&self) -> Vec<u8> {
        let base = self.base_address();
        let end = self
            .blocks
            .iter()
            .map(FirmwareBlock::end)
            .max()
            .unwrap_or(base as u64);
        let mut out = vec![FLASH_ERASED; (end - base as u64) as usize];
        for block in &self.blocks {
            let start = (block.offset - base) as usize;
            out[start..start + block.len()].copy_from_slice(&block.data);
        }
        out
    }
}
