//! A generic block-device view of a NAND device, addressed in bytes
//!
//! Reads may start anywhere but never cross a page; writes are whole pages at page-aligned
//! addresses; erases are whole blocks at block-aligned addresses. Everything else NAND-specific
//! (bad blocks, ECC) goes through [BlockDevice::ioctl].

use crate::chip::{DeviceInfo, NandChip};
use crate::ecc::{EccStats, EccStatus};
use crate::emul::{EmulConfig, EmulatedNand};
use crate::error::{Error, Result};
use crate::geometry::ChipGeometry;
use crate::nand::NandDevice;
use crate::spi::{IoMode, SpiNandChip, SpiTransport};

/// Sizes and alignment requirements of a block device
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BlockDevGeometry {
    pub disk_size: u64,
    pub read_size: u32,
    pub write_size: u32,
    pub erase_size: u32,
    pub recommended_read_size: u32,
    pub recommended_write_size: u32,
    pub recommended_erase_size: u32,
}

/// NAND-specific requests that don't fit read/write/erase
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoctlCmd {
    IsBadBlock(u32),
    MarkBadBlock(u32),
    IsFreePage(u32),
    GetPageEccStatus(u32),
    GetNandFlashInfo,
    GetBadBlocksCount,
    GetEccStats,
}

impl IoctlCmd {
    /// Decode a numeric command code; `arg` is the block or page number where the command takes one
    pub fn from_raw(code: u8, arg: u32) -> Result<Self> {
        Ok(match code {
            0x00 => Self::IsBadBlock(arg),
            0x01 => Self::MarkBadBlock(arg),
            0x02 => Self::IsFreePage(arg),
            0x03 => Self::GetPageEccStatus(arg),
            0x04 => Self::GetNandFlashInfo,
            0x05 => Self::GetBadBlocksCount,
            0x06 => Self::GetEccStats,
            _ => return Err(Error::NotSupported),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IoctlReply {
    BadBlock(bool),
    FreePage(bool),
    EccStatus(EccStatus),
    FlashInfo {
        device_info: DeviceInfo,
        geometry: ChipGeometry,
    },
    BadBlockCount(u32),
    EccStats(EccStats),

    /// The command had nothing to report
    Done,
}

/// A byte-addressed storage device
pub trait BlockDevice: Send + Sync {
    fn geometry(&self) -> &BlockDevGeometry;

    /// Read `len` bytes at `addr` into the start of `dst`, returning the ECC outcome
    fn read(&self, dst: &mut [u8], addr: u64, len: usize) -> Result<EccStatus>;

    /// Write the first `len` bytes of `src` at `addr`
    fn write(&self, src: &[u8], addr: u64, len: usize) -> Result<()>;

    fn erase(&self, addr: u64, len: usize) -> Result<()>;

    fn ioctl(&self, cmd: IoctlCmd) -> Result<IoctlReply>;

    /// Make everything written so far durable
    fn sync(&self) -> Result<()>;

    /// Tear the device down; the handle is gone afterwards.
    fn release(self: Box<Self>) -> Result<()>;
}

/// [BlockDevice] over a [NandDevice]: one sector per page, one erase unit per block
#[derive(Debug)]
pub struct NandBlockDev {
    device: NandDevice,
    geometry: BlockDevGeometry,
}

impl NandBlockDev {
    pub fn new(device: NandDevice) -> Self {
        let chip = device.geometry();
        let geometry = BlockDevGeometry {
            disk_size: chip.capacity(),
            read_size: chip.page_size,
            write_size: chip.page_size,
            erase_size: chip.block_size,
            recommended_read_size: chip.page_size,
            recommended_write_size: chip.page_size,
            recommended_erase_size: chip.block_size,
        };

        Self { device, geometry }
    }

    /// The device underneath, for page-level access
    pub fn device(&self) -> &NandDevice {
        &self.device
    }

    /// Check that `addr..addr + len` lies on the device and convert `addr` into a unit index
    fn unit_index(&self, addr: u64, len: usize, unit_size: u32) -> Result<u32> {
        match addr.checked_add(len as u64) {
            Some(end) if end <= self.geometry.disk_size => {}
            _ => return Err(Error::InvalidArgument("range beyond end of device")),
        }
        u32::try_from(addr / u64::from(unit_size))
            .map_err(|_| Error::InvalidArgument("range beyond end of device"))
    }
}

impl BlockDevice for NandBlockDev {
    fn geometry(&self) -> &BlockDevGeometry {
        &self.geometry
    }

    fn read(&self, dst: &mut [u8], addr: u64, len: usize) -> Result<EccStatus> {
        let read_size = self.geometry.read_size;
        if read_size == 0 {
            return Err(Error::InvalidSize("read size 0"));
        }
        if len > read_size as usize {
            return Err(Error::InvalidSize("read longer than a page"));
        }
        if len > dst.len() {
            return Err(Error::InvalidArgument("destination shorter than read"));
        }

        let offset = (addr % u64::from(read_size)) as usize;
        if offset + len > read_size as usize {
            return Err(Error::CrossesPage {
                offset,
                len,
                page_size: read_size,
            });
        }

        let page = self.unit_index(addr, len, read_size)?;
        self.device.read(page, offset, len, dst)
    }

    fn write(&self, src: &[u8], addr: u64, len: usize) -> Result<()> {
        let write_size = self.geometry.write_size;
        if write_size == 0 {
            return Err(Error::InvalidSize("write size 0"));
        }
        if addr % u64::from(write_size) != 0 {
            return Err(Error::Misaligned {
                addr,
                align: write_size,
            });
        }
        if len == 0 || len % write_size as usize != 0 || len > src.len() {
            return Err(Error::InvalidSize(
                "write length must be a whole number of pages within the source",
            ));
        }

        let first = self.unit_index(addr, len, write_size)?;
        for (page, data) in (first..).zip(src[..len].chunks_exact(write_size as usize)) {
            self.device.program(page, data)?;
        }
        Ok(())
    }

    fn erase(&self, addr: u64, len: usize) -> Result<()> {
        let erase_size = self.geometry.erase_size;
        if erase_size == 0 {
            return Err(Error::InvalidSize("erase size 0"));
        }
        if addr % u64::from(erase_size) != 0 {
            return Err(Error::Misaligned {
                addr,
                align: erase_size,
            });
        }
        if len == 0 || len % erase_size as usize != 0 {
            return Err(Error::InvalidSize(
                "erase length must be a whole number of blocks",
            ));
        }

        let first = self.unit_index(addr, len, erase_size)?;
        let count = (len / erase_size as usize) as u32;
        for block in first..first + count {
            self.device.erase_block(block)?;
        }
        Ok(())
    }

    fn ioctl(&self, cmd: IoctlCmd) -> Result<IoctlReply> {
        log::trace!("ioctl {cmd:?}");

        Ok(match cmd {
            IoctlCmd::IsBadBlock(block) => IoctlReply::BadBlock(self.device.is_bad(block)?),
            IoctlCmd::MarkBadBlock(block) => {
                self.device.mark_bad(block)?;
                IoctlReply::Done
            }
            IoctlCmd::IsFreePage(page) => IoctlReply::FreePage(self.device.is_free(page)?),
            IoctlCmd::GetPageEccStatus(page) => {
                IoctlReply::EccStatus(self.device.get_ecc_status(page)?)
            }
            IoctlCmd::GetNandFlashInfo => IoctlReply::FlashInfo {
                device_info: self.device.info().clone(),
                geometry: self.device.geometry().clone(),
            },
            IoctlCmd::GetBadBlocksCount => {
                IoctlReply::BadBlockCount(self.device.bad_block_stats()?)
            }
            IoctlCmd::GetEccStats => IoctlReply::EccStats(self.device.ecc_stats()?),
        })
    }

    fn sync(&self) -> Result<()> {
        self.device.sync()
    }

    fn release(self: Box<Self>) -> Result<()> {
        log::debug!("releasing {}", self.device.info().chip_name);
        Ok(())
    }
}

/// Which chip backend to bring up
pub enum FlashConfig {
    /// A real chip on a SPI bus
    Spi {
        transport: Box<dyn SpiTransport>,
        io_mode: IoMode,
    },

    Emulated(EmulConfig),
}

/// Detect the chip described by `config` and wrap it as a block device
pub fn get_blockdev(config: FlashConfig) -> Result<Box<dyn BlockDevice>> {
    let chip: Box<dyn NandChip> = match config {
        FlashConfig::Spi { transport, io_mode } => Box::new(SpiNandChip::new(transport, io_mode)),
        FlashConfig::Emulated(emul) => Box::new(EmulatedNand::open(&emul)?),
    };

    let device = NandDevice::new(chip)?;
    Ok(Box::new(NandBlockDev::new(device)))
}

#[cfg(test)]
fn test_blockdev(num_blocks: u32) -> NandBlockDev {
    NandBlockDev::new(crate::nand::test_device(num_blocks))
}

#[test]
fn test_geometry_from_device() {
    let dev = test_blockdev(16);
    assert_eq!(
        *dev.geometry(),
        BlockDevGeometry {
            disk_size: 16 * 131072,
            read_size: 2048,
            write_size: 2048,
            erase_size: 131072,
            recommended_read_size: 2048,
            recommended_write_size: 2048,
            recommended_erase_size: 131072,
        }
    );
}

#[test]
fn test_write_read_erase() -> Result<()> {
    let dev = test_blockdev(16);
    let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();

    dev.write(&data, 10 * 2048, 2048)?;
    let mut out = vec![0; 2048];
    assert_eq!(dev.read(&mut out, 10 * 2048, 2048)?, EccStatus::Ok);
    assert_eq!(out, data);

    // Unaligned read within the page
    let mut part = [0; 8];
    dev.read(&mut part, 10 * 2048 + 1000, 8)?;
    assert_eq!(part[..], data[1000..1008]);

    dev.erase(0, 131072)?;
    assert_eq!(dev.ioctl(IoctlCmd::IsFreePage(10))?, IoctlReply::FreePage(true));
    Ok(())
}

#[test]
fn test_multi_page_write_and_erase() -> Result<()> {
    let dev = test_blockdev(4);
    let data: Vec<u8> = (0..3 * 2048).map(|i| (i / 2048) as u8).collect();

    dev.write(&data, 62 * 2048, data.len())?;
    let mut out = vec![0; 2048];
    for (i, page) in (62..65).enumerate() {
        dev.read(&mut out, page * 2048, 2048)?;
        assert!(out.iter().all(|&b| b == i as u8));
    }

    dev.erase(0, 2 * 131072)?;
    for page in 62..65 {
        assert_eq!(dev.ioctl(IoctlCmd::IsFreePage(page))?, IoctlReply::FreePage(true));
    }
    Ok(())
}

#[test]
fn test_write_unaligned() {
    use crate::error::ErrorKind;

    let dev = test_blockdev(4);
    let data = vec![0; 2048];
    for addr in 1..2048 {
        assert_eq!(
            dev.write(&data, addr, 2048).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    assert_eq!(dev.write(&data, 0, 0).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(dev.write(&data, 0, 1024).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(dev.write(&data, 0, 4096).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(
        dev.write(&data, 4 * 131072, 2048).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_erase_unaligned() {
    use crate::error::ErrorKind;

    let dev = test_blockdev(4);
    for addr in [1, 2048, 65536, 131071, 131073] {
        assert_eq!(dev.erase(addr, 131072).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
    assert_eq!(dev.erase(0, 0).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(dev.erase(0, 2048).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(
        dev.erase(3 * 131072, 2 * 131072).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_read_bounds() {
    use crate::error::ErrorKind;

    let dev = test_blockdev(4);
    let mut big = vec![0; 4096];
    let mut small = [0; 16];

    assert_eq!(dev.read(&mut big, 0, 2049).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(dev.read(&mut small, 0, 17).unwrap_err().kind(), ErrorKind::InvalidArgument);
    for (addr, len) in [(1, 2048), (2047, 2), (2048 + 1024, 1025)] {
        assert_eq!(
            dev.read(&mut big, addr, len).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
    assert_eq!(
        dev.read(&mut small, 4 * 131072, 16).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_zero_sizes() {
    use crate::error::ErrorKind;

    let dev = NandBlockDev {
        device: crate::nand::test_device(1),
        geometry: BlockDevGeometry::default(),
    };
    let mut buf = [0; 4];
    assert_eq!(dev.read(&mut buf, 0, 4).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(dev.write(&buf, 0, 4).unwrap_err().kind(), ErrorKind::InvalidSize);
    assert_eq!(dev.erase(0, 4).unwrap_err().kind(), ErrorKind::InvalidSize);
}

#[test]
fn test_ioctls() -> Result<()> {
    let dev = test_blockdev(16);

    assert_eq!(dev.ioctl(IoctlCmd::IsBadBlock(15))?, IoctlReply::BadBlock(false));
    assert_eq!(dev.ioctl(IoctlCmd::MarkBadBlock(15))?, IoctlReply::Done);
    assert_eq!(dev.ioctl(IoctlCmd::IsBadBlock(15))?, IoctlReply::BadBlock(true));
    assert_eq!(dev.ioctl(IoctlCmd::GetBadBlocksCount)?, IoctlReply::BadBlockCount(1));

    assert_eq!(
        dev.ioctl(IoctlCmd::GetPageEccStatus(3))?,
        IoctlReply::EccStatus(EccStatus::Ok)
    );

    match dev.ioctl(IoctlCmd::GetNandFlashInfo)? {
        IoctlReply::FlashInfo {
            device_info,
            geometry,
        } => {
            assert_eq!(device_info.chip_name, "emulated");
            assert_eq!(geometry.num_blocks, 16);
            assert_eq!(geometry.page_size, 2048);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    match dev.ioctl(IoctlCmd::GetEccStats)? {
        IoctlReply::EccStats(stats) => {
            assert_eq!(stats.threshold, 4);
            assert_eq!(stats.total_err_count, 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    Ok(())
}

#[test]
fn test_raw_ioctl_codes() {
    use crate::error::ErrorKind;

    assert_eq!(IoctlCmd::from_raw(0x00, 7).unwrap(), IoctlCmd::IsBadBlock(7));
    assert_eq!(IoctlCmd::from_raw(0x03, 9).unwrap(), IoctlCmd::GetPageEccStatus(9));
    assert_eq!(IoctlCmd::from_raw(0x06, 0).unwrap(), IoctlCmd::GetEccStats);
    for code in [0x07, 0x42, 0xFF] {
        assert_eq!(
            IoctlCmd::from_raw(code, 0).unwrap_err().kind(),
            ErrorKind::NotSupported
        );
    }
}

#[test]
fn test_emulated_blockdev_lifecycle() -> Result<()> {
    use crate::emul::EmulLayout;

    let config = EmulConfig {
        size: 16 * 64 * (2048 + 64),
        layout: EmulLayout::default(),
        ..Default::default()
    };
    let dev = get_blockdev(FlashConfig::Emulated(config))?;
    assert_eq!(dev.geometry().disk_size, 16 * 131072);

    dev.write(&[0x42; 2048], 0, 2048)?;
    dev.sync()?;
    dev.release()
}

#[test]
fn test_spi_blockdev() -> Result<()> {
    use crate::spi::fake::FakeChip;

    let config = FlashConfig::Spi {
        transport: Box::new(FakeChip::new([0xEF, 0xAA, 0x21])),
        io_mode: IoMode::Dio,
    };
    let dev = get_blockdev(config)?;
    assert_eq!(dev.geometry().disk_size, 128 * 1024 * 1024);

    let data = vec![0x3C; 4096];
    dev.write(&data, 5 * 131072, data.len())?;
    let mut out = vec![0; 2048];
    dev.read(&mut out, 5 * 131072 + 2048, 2048)?;
    assert_eq!(out, data[2048..]);
    assert_eq!(dev.ioctl(IoctlCmd::IsFreePage(5 * 64))?, IoctlReply::FreePage(false));

    dev.sync()?;
    dev.release()
}
