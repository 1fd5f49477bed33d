//! The device handle and its page/block primitives
//!
//! A [NandDevice] owns one chip backend behind a mutex. Every primitive locks it for its whole
//! duration, so a device can be shared between threads by reference.

pub mod bbm;

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::chip::{DeviceInfo, NandChip};
use crate::ecc::{EccStats, EccStatus};
use crate::error::{Error, Result};
use crate::geometry::{ChipGeometry, PageUtil, OOB_MARKER_LEN, OOB_PAGE_USED_MARKER};

/// Written into the OOB of every programmed page
const PAGE_USED: [u8; OOB_MARKER_LEN] = [0x00, 0x00];

/// Allocate an erased buffer, reporting failure instead of aborting
fn scratch(len: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::NoMemory(what))?;
    buf.resize(len, 0xFF);
    Ok(buf)
}

#[derive(Debug)]
struct ScratchBuffers {
    /// Small reads out of the OOB area
    work: Vec<u8>,

    /// Staging for page reads
    read: Vec<u8>,

    /// Holds the source page while copying
    temp: Vec<u8>,
}

impl ScratchBuffers {
    fn new(page_size: usize) -> Result<Self> {
        Ok(Self {
            work: scratch(page_size, "work buffer")?,
            read: scratch(page_size, "read buffer")?,
            temp: scratch(page_size + 1, "temp buffer")?,
        })
    }
}

/// Everything behind the device mutex
struct ChipState {
    chip: Box<dyn NandChip>,
    buffers: ScratchBuffers,

    /// Result of the most recent page load
    ecc_status: EccStatus,
}

/// Load `data` into the cache, then program it to `page` along with the page-used marker
fn program_page(
    chip: &mut dyn NandChip,
    geometry: &ChipGeometry,
    page: u32,
    data: &[u8],
) -> Result<()> {
    chip.program_load(page, 0, data, false)?;
    chip.program_load(
        page,
        geometry.oob_column(OOB_PAGE_USED_MARKER),
        &PAGE_USED,
        true,
    )?;
    chip.program_execute(page)
}

impl ChipState {
    /// Bring a page into the chip's cache, recording how ECC fared
    fn load(&mut self, page: u32) -> Result<EccStatus> {
        let status = self.chip.page_read(page)?;
        if status.is_error() {
            log::warn!("page {page}: ECC {status:?}");
        }
        self.ecc_status = status;
        Ok(status)
    }

    /// Load a page and read one of its OOB markers
    fn read_marker(
        &mut self,
        geometry: &ChipGeometry,
        page: u32,
        oob_offset: usize,
    ) -> Result<(EccStatus, [u8; OOB_MARKER_LEN])> {
        let status = self.load(page)?;

        let marker = &mut self.buffers.work[..OOB_MARKER_LEN];
        self.chip
            .read_cache(page, geometry.oob_column(oob_offset), marker)?;

        let mut out = [0; OOB_MARKER_LEN];
        out.copy_from_slice(marker);
        Ok((status, out))
    }

    fn is_free(&mut self, geometry: &ChipGeometry, page: u32) -> Result<(EccStatus, bool)> {
        let (status, marker) = self.read_marker(geometry, page, OOB_PAGE_USED_MARKER)?;
        Ok((status, marker[..].is_erased()))
    }
}

/// A detected NAND chip, ready for page and block I/O
pub struct NandDevice {
    state: Mutex<ChipState>,
    geometry: ChipGeometry,
    info: DeviceInfo,
}

impl std::fmt::Debug for NandDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NandDevice")
            .field("info", &self.info)
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl NandDevice {
    /// Detect the chip behind `chip` and set up a device for it
    pub fn new(mut chip: Box<dyn NandChip>) -> Result<Self> {
        let (info, geometry) = chip.detect()?;
        if geometry.page_size == 0 || geometry.block_size == 0 {
            return Err(Error::InvalidSize("chip reports zero page or block size"));
        }
        if geometry.num_blocks == 0 {
            return Err(Error::InvalidSize("chip reports no blocks"));
        }

        let buffers = ScratchBuffers::new(geometry.page_size as usize)?;
        log::debug!(
            "{}: {} blocks, {} bytes/page, {} OOB bytes",
            info.chip_name,
            geometry.num_blocks,
            geometry.page_size,
            geometry.oob_size
        );

        Ok(Self {
            state: Mutex::new(ChipState {
                chip,
                buffers,
                ecc_status: EccStatus::Ok,
            }),
            geometry,
            info,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChipState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Number of sectors (pages) on the device
    pub fn capacity_sectors(&self) -> u32 {
        self.geometry.num_pages()
    }

    pub fn sector_size(&self) -> u32 {
        self.geometry.page_size
    }

    pub fn block_size(&self) -> u32 {
        self.geometry.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.geometry.num_blocks
    }

    /// Program one full page, marking it used
    pub fn program(&self, page: u32, data: &[u8]) -> Result<()> {
        self.geometry.check_page(page)?;
        if data.len() != self.geometry.page_size as usize {
            return Err(Error::InvalidSize("program data must be exactly one page"));
        }

        let mut state = self.lock();
        program_page(&mut *state.chip, &self.geometry, page, data)
    }

    /// Read `len` bytes at `offset` within `page` into the start of `dst`
    ///
    /// An uncorrectable page is not an error: the data is still delivered, and the returned status
    /// says what it is worth.
    pub fn read(&self, page: u32, offset: usize, len: usize, dst: &mut [u8]) -> Result<EccStatus> {
        self.geometry.check_page(page)?;
        self.geometry.check_span(offset, len)?;
        let dst = dst
            .get_mut(..len)
            .ok_or(Error::InvalidArgument("destination shorter than read"))?;

        let mut guard = self.lock();
        let state = &mut *guard;
        let status = state.load(page)?;

        let staged = &mut state.buffers.read[..len];
        state.chip.read_cache(page, offset, staged)?;
        dst.copy_from_slice(staged);

        Ok(status)
    }

    pub fn erase_block(&self, block: u32) -> Result<()> {
        self.geometry.check_block(block)?;
        self.lock().chip.erase_block(block)
    }

    /// Copy the data area of page `src` into page `dst`, which must be free
    pub fn copy(&self, src: u32, dst: u32) -> Result<()> {
        self.geometry.check_page(src)?;
        self.geometry.check_page(dst)?;

        let page_size = self.geometry.page_size as usize;
        let mut guard = self.lock();
        let state = &mut *guard;

        let status = state.load(src)?;
        if status == EccStatus::NotCorrected {
            log::warn!("copying uncorrectable page {src} to {dst}");
        }

        let temp = &mut state.buffers.temp[..page_size];
        state.chip.read_cache(src, 0, temp)?;
        program_page(&mut *state.chip, &self.geometry, dst, temp)
    }

    /// Has `page` not been programmed since its block was last erased?
    pub fn is_free(&self, page: u32) -> Result<bool> {
        self.geometry.check_page(page)?;
        let (_, free) = self.lock().is_free(&self.geometry, page)?;
        Ok(free)
    }

    /// Load `page` and report its ECC status
    pub fn get_ecc_status(&self, page: u32) -> Result<EccStatus> {
        self.geometry.check_page(page)?;
        self.lock().load(page)
    }

    /// ECC status of the most recently loaded page
    pub fn ecc_status(&self) -> EccStatus {
        self.lock().ecc_status
    }

    /// Did the most recently loaded page need enough correction to warrant refreshing its data?
    pub fn is_ecc_exceed_threshold(&self) -> bool {
        self.ecc_status()
            .exceeds_threshold(self.geometry.ecc.refresh_threshold)
    }

    /// Gather ECC results over every programmed page
    ///
    /// The device is locked one page at a time, so concurrent writers may make the result stale.
    pub fn ecc_stats(&self) -> Result<EccStats> {
        let pages = self.geometry.num_pages();
        let rpt = howudoin::new()
            .label("Scanning ECC")
            .set_len(u64::from(pages));

        let mut stats = EccStats::new(self.geometry.ecc.refresh_threshold);
        for page in 0..pages {
            let (status, free) = self.lock().is_free(&self.geometry, page).map_err(|e| {
                log::error!("ECC scan aborted at page {page}: {e}");
                e
            })?;
            if !free {
                stats.record(status);
            }
            rpt.inc();
        }

        rpt.close();
        Ok(stats)
    }

    /// Flush whatever the backend holds outside the chip
    pub fn sync(&self) -> Result<()> {
        self.lock().chip.sync()
    }
}

/// A device on an in-memory emulated chip with 2048-byte pages and 64 pages per block
#[cfg(test)]
pub(crate) fn test_device(num_blocks: u32) -> NandDevice {
    use crate::emul::{EmulLayout, EmulatedNand};

    let chip = EmulatedNand::in_memory(EmulLayout::default(), num_blocks).unwrap();
    NandDevice::new(Box::new(chip)).unwrap()
}

#[cfg(test)]
fn test_pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

#[test]
fn test_device_accessors() {
    let nand = test_device(16);
    assert_eq!(nand.capacity_sectors(), 1024);
    assert_eq!(nand.sector_size(), 2048);
    assert_eq!(nand.block_size(), 131072);
    assert_eq!(nand.block_count(), 16);
    assert_eq!(nand.info().chip_name, "emulated");
}

#[test]
fn test_program_read_erase() -> Result<()> {
    let nand = test_device(16);
    let data = test_pattern(0x5A, 2048);

    assert!(nand.is_free(10)?);
    nand.program(10, &data)?;
    assert!(!nand.is_free(10)?);

    let mut out = vec![0; 2048];
    assert_eq!(nand.read(10, 0, 2048, &mut out)?, EccStatus::Ok);
    assert_eq!(out, data);

    // Sub-page reads land at the start of the destination
    let mut part = [0; 16];
    nand.read(10, 100, 16, &mut part)?;
    assert_eq!(part[..], data[100..116]);

    nand.erase_block(0)?;
    assert!(nand.is_free(10)?);
    nand.read(10, 0, 2048, &mut out)?;
    assert!(out.is_erased());
    Ok(())
}

#[test]
fn test_erase_frees_whole_block() -> Result<()> {
    let nand = test_device(4);
    let data = test_pattern(1, 2048);
    for page in 64..128 {
        nand.program(page, &data)?;
    }

    nand.erase_block(1)?;
    for page in 64..128 {
        assert!(nand.is_free(page)?);
    }
    Ok(())
}

#[test]
fn test_argument_checks() {
    use crate::error::ErrorKind;

    let nand = test_device(4);
    let pages = nand.capacity_sectors();
    let page = vec![0; 2048];
    let mut out = vec![0; 2048];

    assert_eq!(nand.program(pages, &page).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(nand.program(0, &page[1..]).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(nand.erase_block(4).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(nand.copy(0, pages).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(nand.copy(pages, 0).unwrap_err().kind(), ErrorKind::InvalidArgument);

    for (offset, len) in [(0, 2049), (2048, 1), (1, 2048), (2000, 100)] {
        assert_eq!(
            nand.read(0, offset, len, &mut out).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
    assert!(nand.read(0, 2047, 1, &mut out).is_ok());
}

#[test]
fn test_copy() -> Result<()> {
    let nand = test_device(4);
    let data = test_pattern(0x20, 2048);
    nand.program(20, &data)?;
    nand.copy(20, 21)?;

    let mut src = vec![0; 2048];
    let mut dst = vec![0; 2048];
    nand.read(20, 0, 2048, &mut src)?;
    nand.read(21, 0, 2048, &mut dst)?;
    assert_eq!(src, dst);
    assert!(!nand.is_free(21)?);
    Ok(())
}

#[test]
fn test_ecc_tracking() -> Result<()> {
    use crate::emul::{EmulLayout, EmulatedNand};

    let mut chip = EmulatedNand::in_memory(EmulLayout::default(), 4)?;
    chip.inject_ecc_status(3, EccStatus::Corrected4To6);
    chip.inject_ecc_status(4, EccStatus::Corrected1To3);
    chip.inject_ecc_status(5, EccStatus::NotCorrected);
    // Never programmed, so left out of the stats
    chip.inject_ecc_status(10, EccStatus::NotCorrected);
    let nand = NandDevice::new(Box::new(chip))?;

    let data = test_pattern(7, 2048);
    for page in 2..6 {
        nand.program(page, &data)?;
    }

    assert_eq!(nand.get_ecc_status(2)?, EccStatus::Ok);
    assert!(!nand.is_ecc_exceed_threshold());
    assert_eq!(nand.get_ecc_status(3)?, EccStatus::Corrected4To6);
    assert!(nand.is_ecc_exceed_threshold());
    assert_eq!(nand.get_ecc_status(4)?, EccStatus::Corrected1To3);
    assert!(!nand.is_ecc_exceed_threshold());

    // Uncorrectable data is still delivered
    let mut out = vec![0; 2048];
    assert_eq!(nand.read(5, 0, 2048, &mut out)?, EccStatus::NotCorrected);
    assert_eq!(nand.ecc_status(), EccStatus::NotCorrected);
    assert!(!nand.is_ecc_exceed_threshold());

    let stats = nand.ecc_stats()?;
    assert_eq!(
        stats,
        EccStats {
            threshold: 4,
            total_err_count: 3,
            uncorrected_count: 1,
            exceeding_threshold_count: 1,
        }
    );
    Ok(())
}

#[test]
fn test_ecc_stats_skip_free_pages() -> Result<()> {
    use crate::emul::{EmulLayout, EmulatedNand};

    let mut chip = EmulatedNand::in_memory(EmulLayout::default(), 4)?;
    chip.inject_ecc_status(10, EccStatus::NotCorrected);
    chip.inject_ecc_status(70, EccStatus::Corrected7To8);
    let nand = NandDevice::new(Box::new(chip))?;

    assert_eq!(nand.get_ecc_status(10)?, EccStatus::NotCorrected);
    assert_eq!(nand.ecc_stats()?.total_err_count, 0);

    nand.program(70, &test_pattern(3, 2048))?;
    let stats = nand.ecc_stats()?;
    assert_eq!(stats.total_err_count, 1);
    assert_eq!(stats.uncorrected_count, 0);
    assert_eq!(stats.exceeding_threshold_count, 1);
    Ok(())
}

/// Wraps a chip, failing every load of one page
#[cfg(test)]
struct FailingRead<C> {
    inner: C,
    page: u32,
}

#[cfg(test)]
impl<C: NandChip> NandChip for FailingRead<C> {
    fn detect(&mut self) -> Result<(DeviceInfo, ChipGeometry)> {
        self.inner.detect()
    }

    fn page_read(&mut self, page: u32) -> Result<EccStatus> {
        if page == self.page {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "bus fault").into());
        }
        self.inner.page_read(page)
    }

    fn read_cache(&mut self, page: u32, column: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.read_cache(page, column, buf)
    }

    fn program_load(&mut self, page: u32, column: usize, data: &[u8], random: bool) -> Result<()> {
        self.inner.program_load(page, column, data, random)
    }

    fn program_execute(&mut self, page: u32) -> Result<()> {
        self.inner.program_execute(page)
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.inner.erase_block(block)
    }
}

#[test]
fn test_scans_abort_on_read_error() -> Result<()> {
    use crate::emul::{EmulLayout, EmulatedNand};
    use crate::error::ErrorKind;

    let chip = FailingRead {
        inner: EmulatedNand::in_memory(EmulLayout::default(), 8)?,
        page: 3 * 64,
    };
    let nand = NandDevice::new(Box::new(chip))?;
    nand.mark_bad(1)?;
    nand.program(2 * 64, &test_pattern(9, 2048))?;

    assert!(nand.is_bad(1)?);
    assert_eq!(nand.bad_block_stats().unwrap_err().kind(), ErrorKind::Io);
    assert_eq!(nand.ecc_stats().unwrap_err().kind(), ErrorKind::Io);

    // Only the one page is affected
    assert!(!nand.is_bad(2)?);
    assert_eq!(nand.is_bad(3).unwrap_err().kind(), ErrorKind::Io);
    Ok(())
}

#[test]
fn test_ecc_stats_all_free() -> Result<()> {
    let nand = test_device(4);
    let stats = nand.ecc_stats()?;
    assert_eq!(stats.total_err_count, 0);
    assert_eq!(stats.uncorrected_count, 0);
    Ok(())
}

#[test]
fn test_shared_between_threads() -> Result<()> {
    let nand = test_device(4);

    std::thread::scope(|s| {
        for t in 0..4u8 {
            let nand = &nand;
            s.spawn(move || {
                let data = test_pattern(t, 2048);
                let page = u32::from(t) * 64;
                nand.program(page, &data).unwrap();
                let mut out = vec![0; 2048];
                nand.read(page, 0, 2048, &mut out).unwrap();
                assert_eq!(out, data);
            });
        }
    });

    for t in 0..4 {
        assert!(!nand.is_free(t * 64)?);
    }
    Ok(())
}
