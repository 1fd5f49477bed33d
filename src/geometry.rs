//! The physical layout of a NAND chip, as determined by chip detection.

use crate::ecc::EccConfig;
use crate::error::{Error, Result};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Byte offset, within the OOB area, of the bad block marker
pub const OOB_BAD_BLOCK_MARKER: usize = 0;

/// Byte offset, within the OOB area, of the page-used marker
pub const OOB_PAGE_USED_MARKER: usize = 2;

/// Length of either marker
pub const OOB_MARKER_LEN: usize = 2;

/// A pub-fields struct describing the physical layout and timing of a NAND chip
///
/// Filled in by chip detection, then frozen: nothing modifies a device's geometry afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipGeometry {
    pub log2_page_size: u8,
    /// Base-2 log of the pages per block
    pub log2_ppb: u8,
    pub page_size: u32,
    pub block_size: u32,
    pub oob_size: u32,
    pub num_blocks: u32,
    pub num_planes: u32,

    pub read_page_delay_us: u32,
    pub program_page_delay_us: u32,
    pub erase_block_delay_us: u32,

    pub has_quad_enable_bit: bool,
    pub quad_enable_bit_pos: u8,

    pub ecc: EccConfig,
}

impl Default for ChipGeometry {
    /// 2048-byte pages and 64 pages per block are by far the most common, so detection starts
    /// from there and vendor code only overrides what differs.
    fn default() -> Self {
        let mut geometry = Self {
            log2_page_size: 11,
            log2_ppb: 6,
            page_size: 0,
            block_size: 0,
            oob_size: 64,
            num_blocks: 0,
            num_planes: 1,
            read_page_delay_us: 0,
            program_page_delay_us: 0,
            erase_block_delay_us: 0,
            has_quad_enable_bit: false,
            quad_enable_bit_pos: 0,
            ecc: EccConfig::default(),
        };
        geometry.update_sizes();
        geometry
    }
}

impl ChipGeometry {
    /// Recompute `page_size` and `block_size` from their log2 fields
    pub fn update_sizes(&mut self) {
        self.page_size = 1 << self.log2_page_size;
        self.block_size = self.pages_per_block() * self.page_size;
    }

    pub fn pages_per_block(&self) -> u32 {
        1 << self.log2_ppb
    }

    /// Total number of pages on the chip
    pub fn num_pages(&self) -> u32 {
        self.num_blocks << self.log2_ppb
    }

    /// Size of the data area of the chip, excluding OOB
    pub fn capacity(&self) -> u64 {
        u64::from(self.num_blocks) * u64::from(self.block_size)
    }

    /// The block containing `page`
    pub fn block_of(&self, page: u32) -> u32 {
        page >> self.log2_ppb
    }

    /// The first page of `block`
    pub fn first_page(&self, block: u32) -> u32 {
        block << self.log2_ppb
    }

    /// Column address of the OOB byte at `oob_offset`
    pub fn oob_column(&self, oob_offset: usize) -> usize {
        self.page_size as usize + oob_offset
    }

    pub fn check_page(&self, page: u32) -> Result<()> {
        let pages = self.num_pages();
        if page >= pages {
            return Err(Error::PageOutOfRange { page, pages });
        }
        Ok(())
    }

    pub fn check_block(&self, block: u32) -> Result<()> {
        if block >= self.num_blocks {
            return Err(Error::BlockOutOfRange {
                block,
                blocks: self.num_blocks,
            });
        }
        Ok(())
    }

    /// Ensure `offset..offset + len` lies within one page
    pub fn check_span(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.page_size as usize => Ok(()),
            _ => Err(Error::CrossesPage {
                offset,
                len,
                page_size: self.page_size,
            }),
        }
    }
}

#[cfg(test)]
fn test_geometry() -> ChipGeometry {
    ChipGeometry {
        num_blocks: 1024,
        ..Default::default()
    }
}

#[test]
fn test_default_sizes() {
    let geometry = test_geometry();
    assert_eq!(geometry.page_size, 2048);
    assert_eq!(geometry.pages_per_block(), 64);
    assert_eq!(geometry.block_size, 131072);
    assert_eq!(geometry.num_pages(), 65536);
    assert_eq!(geometry.capacity(), 128 * 1024 * 1024);
}

#[test]
fn test_page_block_math() {
    let geometry = test_geometry();
    assert_eq!(geometry.block_of(63), 0);
    assert_eq!(geometry.block_of(64), 1);
    assert_eq!(geometry.first_page(3), 192);
    assert_eq!(geometry.oob_column(OOB_PAGE_USED_MARKER), 2050);
}

#[test]
fn test_range_checks() {
    let geometry = test_geometry();
    assert!(geometry.check_page(65535).is_ok());
    assert!(geometry.check_page(65536).is_err());
    assert!(geometry.check_block(1023).is_ok());
    assert!(geometry.check_block(1024).is_err());
    assert!(geometry.check_span(0, 2048).is_ok());
    assert!(geometry.check_span(2047, 1).is_ok());
    assert!(geometry.check_span(2047, 2).is_err());
    assert!(geometry.check_span(usize::MAX, 2).is_err());
}

#[test]
fn test_is_erased() {
    assert!([0xFFu8; 16][..].is_erased());
    assert!(![0xFF, 0xFF, 0x7F][..].is_erased());
}
