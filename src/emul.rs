//! A NAND chip emulated in host memory, either on the heap or in a memory-mapped file.
//!
//! The emulated array stores every page with its OOB area, `page_size + oob_size` bytes per page,
//! pages back to back. Programming only clears bits, like real NAND; erasing sets a whole block
//! back to 0xFF.
//!
//! In place of a real ECC engine, each program stores a CRC-32 of the data area in OOB bytes
//! `4..8`. A page whose data no longer matches reads back as [EccStatus::NotCorrected]. Lesser ECC
//! outcomes can be injected per page with [EmulatedNand::inject_ecc_status].

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::fs::{self, File};
use std::num::NonZeroUsize;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::str::FromStr;

use anyhow::ensure;
use crc::{Crc, CRC_32_ISO_HDLC};
use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};

use crate::chip::{DeviceInfo, NandChip};
use crate::ecc::EccStatus;
use crate::error::{Error, Result};
use crate::geometry::{ChipGeometry, PageUtil};

const ECC_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Where the emulated ECC engine keeps its checksum within the OOB area
const OOB_CRC: std::ops::Range<usize> = 4..8;

pub const DEFAULT_EMULATED_SIZE: u64 = 32 * 1024 * 1024;

const MAX_LOG2_PAGE_SIZE: u8 = 16;
const MAX_LOG2_PPB: u8 = 10;

/// OOB size the emulator gives each page size
fn emulated_oob_size(page_size: u32) -> u32 {
    match page_size {
        512 => 16,
        2048 => 64,
        4096 => 128,
        _ => 64,
    }
}

/// Page and block shape of the emulated chip
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EmulLayout {
    pub log2_ppb: u8,
    pub log2_page_size: u8,
}

impl Default for EmulLayout {
    fn default() -> Self {
        Self {
            log2_ppb: 6,
            log2_page_size: 11,
        }
    }
}

/// Parse strings like "PAGESxBYTES", e.g. "64x2048"
impl FromStr for EmulLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [pages_per_block, bytes_per_page]: [&str; 2] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#"))?;
        let pages_per_block: u32 = pages_per_block.parse()?;
        let bytes_per_page: u32 = bytes_per_page.parse()?;

        ensure!(
            pages_per_block.is_power_of_two(),
            "pages per block must be a power of two"
        );
        ensure!(
            bytes_per_page.is_power_of_two() && bytes_per_page >= 512,
            "page size must be a power of two, at least 512"
        );

        Ok(Self {
            log2_ppb: pages_per_block.trailing_zeros() as u8,
            log2_page_size: bytes_per_page.trailing_zeros() as u8,
        })
    }
}

/// How to set up an emulated chip
#[derive(Debug, Clone)]
pub struct EmulConfig {
    /// Backing file; `None` creates a fresh temporary file
    pub path: Option<PathBuf>,

    /// Size of the backing file, OOB included
    pub size: u64,

    /// Keep the backing file when the chip is dropped
    pub keep_dump: bool,

    pub layout: EmulLayout,
}

impl Default for EmulConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: DEFAULT_EMULATED_SIZE,
            keep_dump: false,
            layout: EmulLayout::default(),
        }
    }
}

/// A file mapped read/write into memory
#[derive(Debug)]
struct MappedFile {
    ptr: NonNull<c_void>,
    len: usize,
    path: PathBuf,
    keep: bool,

    /// Held so the mapping's file stays open for its whole life
    _file: File,
}

// SAFETY: the mapping is owned exclusively, like a Vec's buffer
unsafe impl Send for MappedFile {}

impl MappedFile {
    fn open(config: &EmulConfig) -> Result<Self> {
        let (file, path) = match &config.path {
            Some(path) => {
                let file = File::options()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                (file, path.clone())
            }
            None => {
                let template = std::env::temp_dir().join("nand-emul-XXXXXX");
                let (fd, path) = nix::unistd::mkstemp(&template).map_err(std::io::Error::from)?;
                (unsafe { File::from_raw_fd(fd) }, path)
            }
        };

        let len = usize::try_from(config.size)
            .map_err(|_| Error::InvalidSize("emulated flash too large to map"))?;

        let map = || -> Result<(NonNull<c_void>, bool)> {
            let length =
                NonZeroUsize::new(len).ok_or(Error::InvalidSize("emulated flash size 0"))?;

            // A file of any other size is not a dump of this flash; start over from erased
            let existing = file.metadata()?.len();
            let fresh = existing != config.size;
            if fresh {
                if existing > 0 {
                    log::warn!(
                        "{} is {existing} bytes, not {}; erasing it",
                        path.display(),
                        config.size
                    );
                }
                file.set_len(0)?;
                file.set_len(config.size)?;
            }

            let ptr = unsafe {
                mmap(
                    None,
                    length,
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED,
                    &file,
                    0,
                )
            }
            .map_err(std::io::Error::from)?;
            Ok((ptr, fresh))
        };
        let (ptr, fresh) = match map() {
            Ok(x) => x,
            Err(e) => {
                if !config.keep_dump {
                    let _ = fs::remove_file(&path);
                }
                return Err(e);
            }
        };

        let mut mapped = Self {
            ptr,
            len,
            path,
            keep: config.keep_dump,
            _file: file,
        };
        if fresh {
            mapped.as_mut_slice().fill(0xFF);
        }

        log::debug!(
            "mapped {} bytes of {} (fresh: {fresh})",
            mapped.len,
            mapped.path.display()
        );
        Ok(mapped)
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn flush(&self) -> Result<()> {
        unsafe { msync(self.ptr, self.len, MsFlags::MS_SYNC) }.map_err(std::io::Error::from)?;
        Ok(())
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("failed to unmap {}: {e}", self.path.display());
        }
        if !self.keep {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("failed to remove {}: {e}", self.path.display());
            }
        }
    }
}

#[derive(Debug)]
enum Backing {
    Memory(Vec<u8>),
    Mapped(MappedFile),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Memory(vec) => vec.as_slice(),
            Self::Mapped(map) => map.as_slice(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Memory(vec) => vec.as_mut_slice(),
            Self::Mapped(map) => map.as_mut_slice(),
        }
    }
}

/// An emulated NAND chip
#[derive(Debug)]
pub struct EmulatedNand {
    backing: Backing,
    geometry: ChipGeometry,

    /// The cache register: one page plus OOB
    cache: Vec<u8>,

    ecc_faults: HashMap<u32, EccStatus>,
    failing_blocks: HashSet<u32>,
}

impl EmulatedNand {
    /// Geometry for `layout`, still without any blocks
    fn layout_geometry(layout: EmulLayout) -> Result<ChipGeometry> {
        if layout.log2_page_size > MAX_LOG2_PAGE_SIZE || layout.log2_ppb > MAX_LOG2_PPB {
            return Err(Error::InvalidSize("emulated layout too large"));
        }

        let mut geometry = ChipGeometry {
            log2_page_size: layout.log2_page_size,
            log2_ppb: layout.log2_ppb,
            read_page_delay_us: 60,
            program_page_delay_us: 630,
            erase_block_delay_us: 3000,
            ..Default::default()
        };
        geometry.update_sizes();
        geometry.oob_size = emulated_oob_size(geometry.page_size);
        if geometry.block_size == 0 {
            return Err(Error::InvalidSize("block size 0"));
        }

        Ok(geometry)
    }

    /// Bytes one block occupies in the backing storage, OOB included
    fn raw_block_size(geometry: &ChipGeometry) -> u64 {
        u64::from(geometry.pages_per_block()) * u64::from(geometry.page_size + geometry.oob_size)
    }

    /// Work out the geometry of an emulated chip occupying `size` bytes
    fn emulated_geometry(layout: EmulLayout, size: u64) -> Result<ChipGeometry> {
        let mut geometry = Self::layout_geometry(layout)?;
        geometry.num_blocks = u32::try_from(size / Self::raw_block_size(&geometry))
            .map_err(|_| Error::InvalidSize("too many blocks"))?;
        if geometry.num_blocks == 0 {
            return Err(Error::InvalidSize("emulated flash smaller than one block"));
        }

        Ok(geometry)
    }

    fn with_backing(backing: Backing, geometry: ChipGeometry) -> Self {
        let cache = vec![0xFF; (geometry.page_size + geometry.oob_size) as usize];
        Self {
            backing,
            geometry,
            cache,
            ecc_faults: HashMap::new(),
            failing_blocks: HashSet::new(),
        }
    }

    /// Create an erased chip on the heap with `num_blocks` blocks
    pub fn in_memory(layout: EmulLayout, num_blocks: u32) -> Result<Self> {
        let mut geometry = Self::layout_geometry(layout)?;
        if num_blocks == 0 {
            return Err(Error::InvalidSize("emulated flash with no blocks"));
        }
        geometry.num_blocks = num_blocks;

        let size = usize::try_from(Self::raw_block_size(&geometry) * u64::from(num_blocks))
            .map_err(|_| Error::NoMemory("emulated flash"))?;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|_| Error::NoMemory("emulated flash"))?;
        storage.resize(size, 0xFF);

        Ok(Self::with_backing(Backing::Memory(storage), geometry))
    }

    /// Create (or reopen) a chip backed by a memory-mapped file
    pub fn open(config: &EmulConfig) -> Result<Self> {
        let geometry = Self::emulated_geometry(config.layout, config.size)?;
        let mapped = MappedFile::open(config)?;
        Ok(Self::with_backing(Backing::Mapped(mapped), geometry))
    }

    /// Path of the backing file, if there is one
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::Mapped(map) => Some(&map.path),
        }
    }

    /// Make every later read of `page` report `status`, until its block is erased
    pub fn inject_ecc_status(&mut self, page: u32, status: EccStatus) {
        self.ecc_faults.insert(page, status);
    }

    /// Make every later erase of `block` fail
    pub fn fail_erase(&mut self, block: u32) {
        self.failing_blocks.insert(block);
    }

    fn raw_page_size(&self) -> usize {
        self.cache.len()
    }

    fn page_range(&self, page: u32) -> std::ops::Range<usize> {
        let start = page as usize * self.raw_page_size();
        start..start + self.raw_page_size()
    }

    fn check_column(&self, column: usize, len: usize) -> Result<()> {
        match column.checked_add(len) {
            Some(end) if end <= self.raw_page_size() => Ok(()),
            _ => Err(Error::InvalidArgument("column out of range")),
        }
    }

    /// What the emulated ECC engine makes of the page now in the cache
    fn check_cache_ecc(&self) -> EccStatus {
        let (data, oob) = self.cache.split_at(self.geometry.page_size as usize);
        let stored = &oob[OOB_CRC];
        if stored.is_erased() || stored == ECC_CRC.checksum(data).to_le_bytes() {
            EccStatus::Ok
        } else {
            EccStatus::NotCorrected
        }
    }
}

impl NandChip for EmulatedNand {
    fn detect(&mut self) -> Result<(DeviceInfo, ChipGeometry)> {
        let info = DeviceInfo {
            manufacturer_id: 0,
            device_id: 0,
            chip_name: "emulated".to_owned(),
        };
        Ok((info, self.geometry.clone()))
    }

    fn page_read(&mut self, page: u32) -> Result<EccStatus> {
        self.geometry.check_page(page)?;

        let range = self.page_range(page);
        self.cache.copy_from_slice(&self.backing.bytes()[range]);

        let status = self.check_cache_ecc();
        Ok(match self.ecc_faults.get(&page) {
            Some(&injected) => injected.max(status),
            None => status,
        })
    }

    fn read_cache(&mut self, _page: u32, column: usize, buf: &mut [u8]) -> Result<()> {
        self.check_column(column, buf.len())?;
        buf.copy_from_slice(&self.cache[column..column + buf.len()]);
        Ok(())
    }

    fn program_load(&mut self, _page: u32, column: usize, data: &[u8], random: bool) -> Result<()> {
        self.check_column(column, data.len())?;
        if !random {
            self.cache.fill(0xFF);
        }
        self.cache[column..column + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn program_execute(&mut self, page: u32) -> Result<()> {
        self.geometry.check_page(page)?;

        let page_size = self.geometry.page_size as usize;
        let crc = ECC_CRC.checksum(&self.cache[..page_size]);
        self.cache[page_size..][OOB_CRC].copy_from_slice(&crc.to_le_bytes());

        let range = self.page_range(page);
        let cache = &self.cache;
        for (stored, new) in self.backing.bytes_mut()[range].iter_mut().zip(cache) {
            *stored &= new;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.geometry.check_block(block)?;
        if self.failing_blocks.contains(&block) {
            return Err(Error::EraseFailed(block));
        }

        let first = self.geometry.first_page(block);
        let last = first + self.geometry.pages_per_block();
        let start = self.page_range(first).start;
        let end = self.page_range(last - 1).end;
        self.backing.bytes_mut()[start..end].fill(0xFF);

        self.ecc_faults.retain(|&page, _| !(first..last).contains(&page));
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        match &self.backing {
            Backing::Memory(_) => Ok(()),
            Backing::Mapped(map) => map.flush(),
        }
    }
}

#[cfg(test)]
const TEST_LAYOUT: EmulLayout = EmulLayout {
    log2_ppb: 4,
    log2_page_size: 9,
};

#[cfg(test)]
fn unique_temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}-{}", std::process::id()))
}

#[test]
fn test_layout_parse() {
    let layout: EmulLayout = "64x2048".parse().unwrap();
    assert_eq!(layout, EmulLayout::default());
    assert!("64x2000".parse::<EmulLayout>().is_err());
    assert!("63x2048".parse::<EmulLayout>().is_err());
    assert!("64".parse::<EmulLayout>().is_err());
    assert!("64x2048x1".parse::<EmulLayout>().is_err());
}

#[test]
fn test_emulated_geometry() {
    // The default layout in 32 MiB: 64 * (2048 + 64) bytes per block
    let geometry =
        EmulatedNand::emulated_geometry(EmulLayout::default(), DEFAULT_EMULATED_SIZE).unwrap();
    assert_eq!(geometry.page_size, 2048);
    assert_eq!(geometry.oob_size, 64);
    assert_eq!(geometry.block_size, 131072);
    assert_eq!(geometry.num_blocks, 248);

    let small = EmulatedNand::emulated_geometry(TEST_LAYOUT, 16 * 528 * 10).unwrap();
    assert_eq!(small.oob_size, 16);
    assert_eq!(small.num_blocks, 10);

    assert!(EmulatedNand::emulated_geometry(TEST_LAYOUT, 100).is_err());
}

#[test]
fn test_program_only_clears_bits() -> Result<()> {
    let mut nand = EmulatedNand::in_memory(TEST_LAYOUT, 4)?;

    nand.program_load(3, 0, &[0xF0; 512], false)?;
    nand.program_execute(3)?;
    nand.program_load(3, 0, &[0x3C; 512], false)?;
    nand.program_execute(3)?;

    // Data is ANDed, and the stale checksum no longer matches
    assert_eq!(nand.page_read(3)?, EccStatus::NotCorrected);
    let mut buf = [0; 4];
    nand.read_cache(3, 0, &mut buf)?;
    assert_eq!(buf, [0x30; 4]);

    nand.erase_block(0)?;
    assert_eq!(nand.page_read(3)?, EccStatus::Ok);
    nand.read_cache(3, 0, &mut buf)?;
    assert!(buf.is_erased());
    Ok(())
}

#[test]
fn test_injected_ecc_cleared_by_erase() -> Result<()> {
    let mut nand = EmulatedNand::in_memory(TEST_LAYOUT, 4)?;
    nand.inject_ecc_status(17, EccStatus::Corrected4To6);

    assert_eq!(nand.page_read(17)?, EccStatus::Corrected4To6);
    assert_eq!(nand.page_read(16)?, EccStatus::Ok);

    nand.erase_block(1)?;
    assert_eq!(nand.page_read(17)?, EccStatus::Ok);
    Ok(())
}

#[test]
fn test_bounds() -> Result<()> {
    let mut nand = EmulatedNand::in_memory(TEST_LAYOUT, 4)?;
    assert!(nand.page_read(64).is_err());
    assert!(nand.erase_block(4).is_err());
    assert!(nand.program_load(0, 520, &[0; 9], false).is_err());
    assert!(nand.program_load(0, 520, &[0; 8], false).is_ok());

    nand.fail_erase(2);
    assert!(matches!(nand.erase_block(2), Err(Error::EraseFailed(2))));
    Ok(())
}

#[test]
fn test_mapped_file_persists() -> Result<()> {
    let path = unique_temp_path("nand-emul-persist");
    let config = EmulConfig {
        path: Some(path.clone()),
        size: 16 * 528 * 8,
        keep_dump: true,
        layout: TEST_LAYOUT,
    };

    {
        let mut nand = EmulatedNand::open(&config)?;
        assert_eq!(nand.page_read(5)?, EccStatus::Ok);
        let mut buf = [0; 512];
        nand.read_cache(5, 0, &mut buf)?;
        assert!(buf.is_erased());

        nand.program_load(5, 0, &[0xA5; 512], false)?;
        nand.program_execute(5)?;
        nand.sync()?;
    }

    {
        let mut nand = EmulatedNand::open(&config)?;
        assert_eq!(nand.page_read(5)?, EccStatus::Ok);
        let mut buf = [0; 512];
        nand.read_cache(5, 0, &mut buf)?;
        assert_eq!(buf, [0xA5; 512]);
    }

    fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_mismatched_file_erased() -> Result<()> {
    let path = unique_temp_path("nand-emul-mismatch");
    fs::write(&path, [0x5A; 1000])?;
    let config = EmulConfig {
        path: Some(path.clone()),
        size: 16 * 528 * 8,
        keep_dump: true,
        layout: TEST_LAYOUT,
    };

    {
        let mut nand = EmulatedNand::open(&config)?;
        assert_eq!(nand.page_read(0)?, EccStatus::Ok);
        let mut buf = [0; 512];
        nand.read_cache(0, 0, &mut buf)?;
        assert!(buf.is_erased());
    }

    let content = fs::read(&path)?;
    assert_eq!(content.len() as u64, config.size);
    assert!(content.is_erased());
    fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_temp_file_removed() -> Result<()> {
    let config = EmulConfig {
        size: 16 * 528 * 8,
        layout: TEST_LAYOUT,
        ..Default::default()
    };

    let nand = EmulatedNand::open(&config)?;
    let path = nand.path().unwrap().to_owned();
    assert!(path.exists());
    drop(nand);
    assert!(!path.exists());
    Ok(())
}
