//! Bad block management
//!
//! A block is bad when the marker in the OOB area of its first page is anything other than
//! `FF FF`. Factory-bad blocks come that way; runtime failures get marked with `00 00`.

use super::NandDevice;
use crate::error::Result;
use crate::geometry::{PageUtil, OOB_BAD_BLOCK_MARKER, OOB_MARKER_LEN};

const BAD_BLOCK: [u8; OOB_MARKER_LEN] = [0x00, 0x00];

impl NandDevice {
    pub fn is_bad(&self, block: u32) -> Result<bool> {
        self.geometry.check_block(block)?;
        let page = self.geometry.first_page(block);

        let (_, marker) = self
            .lock()
            .read_marker(&self.geometry, page, OOB_BAD_BLOCK_MARKER)?;
        Ok(!marker[..].is_erased())
    }

    /// Erase `block` and write the bad block marker into its first page
    ///
    /// The erase is best-effort, since the block is likely failing already.
    pub fn mark_bad(&self, block: u32) -> Result<()> {
        self.geometry.check_block(block)?;
        let page = self.geometry.first_page(block);

        let mut state = self.lock();
        if let Err(e) = state.chip.erase_block(block) {
            log::warn!("erase before marking block {block} bad failed: {e}");
        }

        let column = self.geometry.oob_column(OOB_BAD_BLOCK_MARKER);
        state.chip.program_load(page, column, &BAD_BLOCK, false)?;
        state.chip.program_execute(page)?;

        log::info!("marked block {block} bad");
        Ok(())
    }

    /// Count the bad blocks on the device
    ///
    /// The device is locked one block at a time; the first error aborts the scan.
    pub fn bad_block_stats(&self) -> Result<u32> {
        let blocks = self.geometry.num_blocks;
        let rpt = howudoin::new()
            .label("Scanning for bad blocks")
            .set_len(u64::from(blocks));

        let mut bad = 0;
        for block in 0..blocks {
            let is_bad = self.is_bad(block).map_err(|e| {
                log::error!("bad block scan aborted at block {block}: {e}");
                e
            })?;
            if is_bad {
                log::debug!("block {block} is bad");
                bad += 1;
            }
            rpt.inc();
        }

        rpt.close();
        Ok(bad)
    }
}

#[cfg(test)]
use super::test_device;

#[test]
fn test_fresh_blocks_good() -> Result<()> {
    let nand = test_device(8);
    for block in 0..8 {
        assert!(!nand.is_bad(block)?);
    }
    assert_eq!(nand.bad_block_stats()?, 0);
    Ok(())
}

#[test]
fn test_mark_bad() -> Result<()> {
    let nand = test_device(16);
    nand.program(15 * 64, &vec![0x11; 2048])?;

    nand.mark_bad(15)?;
    assert!(nand.is_bad(15)?);
    assert!(!nand.is_bad(14)?);
    assert_eq!(nand.bad_block_stats()?, 1);

    // Marking erased the block's data, and leaves its pages free
    assert!(nand.is_free(15 * 64 + 1)?);
    Ok(())
}

#[test]
fn test_mark_bad_despite_erase_failure() -> Result<()> {
    use crate::emul::{EmulLayout, EmulatedNand};

    let mut chip = EmulatedNand::in_memory(EmulLayout::default(), 8)?;
    chip.fail_erase(5);
    let nand = NandDevice::new(Box::new(chip))?;

    assert!(nand.erase_block(5).is_err());
    nand.mark_bad(5)?;
    assert!(nand.is_bad(5)?);
    assert_eq!(nand.bad_block_stats()?, 1);
    Ok(())
}

#[test]
fn test_bad_block_range() {
    let nand = test_device(8);
    assert!(nand.is_bad(8).is_err());
    assert!(nand.mark_bad(8).is_err());
}
