//! The SPI NAND command set, spoken over an abstract SPI transport.
//!
//! The command set here is the one shared by all supported vendors; per-vendor differences are
//! limited to geometry, the quad-enable bit, and the ECC status encoding, all of which are
//! captured in [ChipGeometry] by chip detection.

#[cfg(target_os = "linux")]
pub mod spidev;

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::chip::{self, DeviceInfo, NandChip};
use crate::ecc::EccStatus;
use crate::error::{Error, Result};
use crate::geometry::ChipGeometry;

const CMD_SET_FEATURE: u8 = 0x1F;
const CMD_GET_FEATURE: u8 = 0x0F;
const CMD_READ_ID: u8 = 0x9F;
const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_PAGE_READ: u8 = 0x13;
const CMD_PROGRAM_EXECUTE: u8 = 0x10;
const CMD_BLOCK_ERASE: u8 = 0xD8;

const CMD_READ_FAST: u8 = 0x0B;
const CMD_READ_X2: u8 = 0x3B;
const CMD_READ_X4: u8 = 0x6B;
const CMD_READ_DIO: u8 = 0xBB;
const CMD_READ_QIO: u8 = 0xEB;

const CMD_PROGRAM_LOAD: u8 = 0x02;
const CMD_PROGRAM_LOAD_X4: u8 = 0x32;
const CMD_PROGRAM_LOAD_RANDOM: u8 = 0x84;
const CMD_PROGRAM_LOAD_RANDOM_X4: u8 = 0x34;

const REG_PROTECT: u8 = 0xA0;
const REG_CONFIG: u8 = 0xB0;
const REG_STATUS: u8 = 0xC0;

const STAT_BUSY: u8 = 1 << 0;
const STAT_ERASE_FAILED: u8 = 1 << 2;
const STAT_PROGRAM_FAILED: u8 = 1 << 3;

/// Column address bit selecting the plane on multi-plane chips
const COLUMN_PLANE_SELECT: u16 = 1 << 12;

/// How many bytes READ ID returns, manufacturer byte included
const ID_LEN: usize = 3;

/// Which data lines carry what during a transaction
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum IoMode {
    /// Everything on one line
    #[default]
    Sio,
    /// Data out on two lines
    Dout,
    /// Address and data on two lines
    Dio,
    /// Data out on four lines
    Qout,
    /// Address and data on four lines
    Qio,
}

impl IoMode {
    pub fn is_quad(self) -> bool {
        matches!(self, Self::Qout | Self::Qio)
    }

    /// Opcode, address lines, dummy bytes and data lines of the read-from-cache variant
    fn read_command(self) -> (u8, u8, usize, u8) {
        match self {
            Self::Sio => (CMD_READ_FAST, 1, 1, 1),
            Self::Dout => (CMD_READ_X2, 1, 1, 2),
            Self::Dio => (CMD_READ_DIO, 2, 1, 2),
            Self::Qout => (CMD_READ_X4, 1, 1, 4),
            Self::Qio => (CMD_READ_QIO, 4, 2, 4),
        }
    }

    /// Opcode and data lines of the program-load variant
    fn program_command(self, random: bool) -> (u8, u8) {
        match (self.is_quad(), random) {
            (false, false) => (CMD_PROGRAM_LOAD, 1),
            (false, true) => (CMD_PROGRAM_LOAD_RANDOM, 1),
            (true, false) => (CMD_PROGRAM_LOAD_X4, 4),
            (true, true) => (CMD_PROGRAM_LOAD_RANDOM_X4, 4),
        }
    }
}

/// Parse "sio", "dout", "dio", "qout" or "qio"
impl FromStr for IoMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "sio" => Self::Sio,
            "dout" => Self::Dout,
            "dio" => Self::Dio,
            "qout" => Self::Qout,
            "qio" => Self::Qio,
            _ => anyhow::bail!("unknown IO mode {s:?}"),
        })
    }
}

/// One chip-select-framed SPI transaction
///
/// The opcode always goes out on a single line. The address phase (which includes any dummy
/// bytes) follows on `address_lines`, then `write` is clocked out and `read` is clocked in on
/// `data_lines`. Any of the phases after the opcode may be empty.
#[derive(Debug)]
pub struct Transfer<'a> {
    pub opcode: u8,
    pub address: &'a [u8],
    pub address_lines: u8,
    pub write: &'a [u8],
    pub read: &'a mut [u8],
    pub data_lines: u8,
}

/// Represents a SPI bus with a NAND chip on it
pub trait SpiTransport: Send {
    /// Assert CS, perform the transaction, then de-assert CS.
    fn transfer(&mut self, xfer: Transfer<'_>) -> anyhow::Result<()>;
}

impl<T: SpiTransport + ?Sized> SpiTransport for Box<T> {
    fn transfer(&mut self, xfer: Transfer<'_>) -> anyhow::Result<()> {
        (**self).transfer(xfer)
    }
}

/// A live NAND chip on a SPI transport
pub struct SpiNandChip<T: SpiTransport> {
    transport: T,
    io_mode: IoMode,

    /// Defaults until `detect()` runs
    geometry: ChipGeometry,
}

impl<T: SpiTransport> SpiNandChip<T> {
    pub fn new(transport: T, io_mode: IoMode) -> Self {
        Self {
            transport,
            io_mode,
            geometry: ChipGeometry::default(),
        }
    }

    /// Give back the transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Single-line transaction: opcode, address, then either direction of data
    fn command(&mut self, opcode: u8, address: &[u8], write: &[u8], read: &mut [u8]) -> Result<()> {
        self.transport.transfer(Transfer {
            opcode,
            address,
            address_lines: 1,
            write,
            read,
            data_lines: 1,
        })?;
        Ok(())
    }

    pub fn read_id(&mut self) -> Result<[u8; ID_LEN]> {
        let mut id = [0; ID_LEN];
        self.command(CMD_READ_ID, &[0], &[], &mut id)?;
        log::debug!("READ ID: {id:02x?}");
        Ok(id)
    }

    pub fn get_feature(&mut self, register: u8) -> Result<u8> {
        let mut value = [0];
        self.command(CMD_GET_FEATURE, &[register], &[], &mut value)?;
        Ok(value[0])
    }

    pub fn set_feature(&mut self, register: u8, value: u8) -> Result<()> {
        self.command(CMD_SET_FEATURE, &[register], &[value], &mut [])
    }

    fn write_enable(&mut self) -> Result<()> {
        self.command(CMD_WRITE_ENABLE, &[], &[], &mut [])
    }

    /// Issue a command taking a 24-bit row (page) address
    fn row_command(&mut self, opcode: u8, page: u32) -> Result<()> {
        let mut row = BytesMut::with_capacity(3);
        row.put_uint(u64::from(page), 3);
        self.command(opcode, &row, &[], &mut [])
    }

    /// Column address of `column` within `page`, including the plane select bit if needed
    fn column_address(&self, page: u32, column: usize) -> Result<u16> {
        let mut address =
            u16::try_from(column).map_err(|_| Error::InvalidArgument("column out of range"))?;
        if self.geometry.num_planes > 1 && self.geometry.block_of(page) & 1 == 1 {
            address |= COLUMN_PLANE_SELECT;
        }
        Ok(address)
    }

    /// Sleep for the operation's expected duration, then poll until the chip is no longer busy.
    ///
    /// Returns the final status register value.
    fn wait_for_ready(&mut self, expected_us: u32) -> Result<u8> {
        if expected_us > 0 {
            thread::sleep(Duration::from_micros(expected_us.into()));
        }

        loop {
            let status = self.get_feature(REG_STATUS)?;
            if status & STAT_BUSY == 0 {
                return Ok(status);
            }
        }
    }

    /// Clear block protection so every block can be programmed and erased
    fn unprotect(&mut self) -> Result<()> {
        let protect = self.get_feature(REG_PROTECT)?;
        if protect != 0 {
            log::debug!("clearing protection register (was {protect:#04x})");
            self.set_feature(REG_PROTECT, 0)?;
        }
        Ok(())
    }

    fn enable_quad_io(&mut self) -> Result<()> {
        let current = self.get_feature(REG_CONFIG)?;
        let config = current | (1 << self.geometry.quad_enable_bit_pos);
        if config == current {
            return Ok(());
        }
        log::debug!("quad config register value: {config:#04x}");
        self.set_feature(REG_CONFIG, config)
    }
}

impl<T: SpiTransport> NandChip for SpiNandChip<T> {
    fn detect(&mut self) -> Result<(DeviceInfo, ChipGeometry)> {
        let id = self.read_id()?;
        let (info, geometry) = chip::identify(&id)?;
        self.geometry = geometry;

        self.unprotect()?;
        if self.io_mode.is_quad() && self.geometry.has_quad_enable_bit {
            self.enable_quad_io()?;
        }

        Ok((info, self.geometry.clone()))
    }

    fn page_read(&mut self, page: u32) -> Result<EccStatus> {
        self.row_command(CMD_PAGE_READ, page)?;
        let status = self.wait_for_ready(self.geometry.read_page_delay_us)?;
        Ok(self.geometry.ecc.decode(status))
    }

    fn read_cache(&mut self, page: u32, column: usize, buf: &mut [u8]) -> Result<()> {
        let (opcode, address_lines, dummy, data_lines) = self.io_mode.read_command();

        let mut address = BytesMut::with_capacity(2 + dummy);
        address.put_u16(self.column_address(page, column)?);
        address.put_bytes(0, dummy);

        self.transport.transfer(Transfer {
            opcode,
            address: &address,
            address_lines,
            write: &[],
            read: buf,
            data_lines,
        })?;
        Ok(())
    }

    fn program_load(&mut self, page: u32, column: usize, data: &[u8], random: bool) -> Result<()> {
        if !random {
            self.write_enable()?;
        }

        let (opcode, data_lines) = self.io_mode.program_command(random);
        let mut address = BytesMut::with_capacity(2);
        address.put_u16(self.column_address(page, column)?);

        self.transport.transfer(Transfer {
            opcode,
            address: &address,
            address_lines: 1,
            write: data,
            read: &mut [],
            data_lines,
        })?;
        Ok(())
    }

    fn program_execute(&mut self, page: u32) -> Result<()> {
        self.row_command(CMD_PROGRAM_EXECUTE, page)?;
        let status = self.wait_for_ready(self.geometry.program_page_delay_us)?;
        if status & STAT_PROGRAM_FAILED != 0 {
            return Err(Error::ProgramFailed(page));
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        self.write_enable()?;
        self.row_command(CMD_BLOCK_ERASE, self.geometry.first_page(block))?;
        let status = self.wait_for_ready(self.geometry.erase_block_delay_us)?;
        if status & STAT_ERASE_FAILED != 0 {
            return Err(Error::EraseFailed(block));
        }
        Ok(())
    }
}

/// A sparse in-memory chip that understands the command set above, for testing
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Everything a test may want to inspect after handing the transport to a device
    #[derive(Debug, Default)]
    pub struct FakeState {
        pub opcodes: Vec<u8>,
        pub protect: u8,
        pub config: u8,
        pub failing_blocks: Vec<u32>,
        pub failing_pages: Vec<u32>,

        /// Status register value reported after PAGE READ of a page, ECC bits included
        pub read_status: HashMap<u32, u8>,
    }

    pub struct FakeChip {
        pub id: [u8; ID_LEN],
        pub state: Arc<Mutex<FakeState>>,
        geometry: ChipGeometry,
        pages: HashMap<u32, Vec<u8>>,
        cache: Vec<u8>,
        status: u8,
        write_enabled: bool,
    }

    impl FakeChip {
        /// A chip answering READ ID with `id`, laid out like the part it claims to be
        pub fn new(id: [u8; ID_LEN]) -> Self {
            let geometry = chip::identify(&id).map_or_else(|_| ChipGeometry::default(), |x| x.1);
            let page_len = (geometry.page_size + geometry.oob_size) as usize;
            let state = FakeState {
                protect: 0x38,
                config: 0x10,
                ..Default::default()
            };
            Self {
                id,
                state: Arc::new(Mutex::new(state)),
                geometry,
                pages: HashMap::new(),
                cache: vec![0xFF; page_len],
                status: 0,
                write_enabled: false,
            }
        }

        fn row(address: &[u8]) -> u32 {
            address.iter().fold(0, |row, &b| (row << 8) | u32::from(b))
        }

        fn column(address: &[u8]) -> usize {
            usize::from(u16::from_be_bytes([address[0], address[1]]) & !COLUMN_PLANE_SELECT)
        }

        fn page_len(&self) -> usize {
            self.cache.len()
        }
    }

    impl SpiTransport for FakeChip {
        fn transfer(&mut self, xfer: Transfer<'_>) -> anyhow::Result<()> {
            let mut state = self.state.lock().unwrap();
            state.opcodes.push(xfer.opcode);

            match xfer.opcode {
                CMD_READ_ID => xfer.read.copy_from_slice(&self.id[..xfer.read.len()]),
                CMD_GET_FEATURE => {
                    xfer.read[0] = match xfer.address[0] {
                        REG_PROTECT => state.protect,
                        REG_CONFIG => state.config,
                        REG_STATUS => self.status,
                        r => anyhow::bail!("bad register {r:#x}"),
                    }
                }
                CMD_SET_FEATURE => match xfer.address[0] {
                    REG_PROTECT => state.protect = xfer.write[0],
                    REG_CONFIG => state.config = xfer.write[0],
                    r => anyhow::bail!("register {r:#x} is read-only"),
                },
                CMD_WRITE_ENABLE => self.write_enabled = true,
                CMD_PAGE_READ => {
                    let page = Self::row(xfer.address);
                    let len = self.page_len();
                    self.cache = self
                        .pages
                        .get(&page)
                        .cloned()
                        .unwrap_or_else(|| vec![0xFF; len]);
                    self.status = state.read_status.get(&page).copied().unwrap_or(0);
                }
                CMD_READ_FAST | CMD_READ_X2 | CMD_READ_X4 | CMD_READ_DIO | CMD_READ_QIO => {
                    let column = Self::column(xfer.address);
                    let len = xfer.read.len();
                    xfer.read.copy_from_slice(&self.cache[column..column + len]);
                }
                CMD_PROGRAM_LOAD | CMD_PROGRAM_LOAD_X4 | CMD_PROGRAM_LOAD_RANDOM
                | CMD_PROGRAM_LOAD_RANDOM_X4 => {
                    anyhow::ensure!(self.write_enabled, "program load without WEL");
                    if matches!(xfer.opcode, CMD_PROGRAM_LOAD | CMD_PROGRAM_LOAD_X4) {
                        self.cache.fill(0xFF);
                    }
                    let column = Self::column(xfer.address);
                    self.cache[column..column + xfer.write.len()].copy_from_slice(xfer.write);
                }
                CMD_PROGRAM_EXECUTE => {
                    anyhow::ensure!(self.write_enabled, "program execute without WEL");
                    let page = Self::row(xfer.address);
                    self.write_enabled = false;
                    if state.failing_pages.contains(&page) {
                        self.status = STAT_PROGRAM_FAILED;
                    } else {
                        let len = self.page_len();
                        let stored = self.pages.entry(page).or_insert_with(|| vec![0xFF; len]);
                        for (s, c) in stored.iter_mut().zip(&self.cache) {
                            *s &= c;
                        }
                        self.status = 0;
                    }
                }
                CMD_BLOCK_ERASE => {
                    anyhow::ensure!(self.write_enabled, "erase without WEL");
                    let block = self.geometry.block_of(Self::row(xfer.address));
                    self.write_enabled = false;
                    if state.failing_blocks.contains(&block) {
                        self.status = STAT_ERASE_FAILED;
                    } else {
                        let geometry = &self.geometry;
                        self.pages.retain(|&p, _| geometry.block_of(p) != block);
                        self.status = 0;
                    }
                }
                op => anyhow::bail!("unknown opcode {op:#x}"),
            }

            Ok(())
        }
    }
}

#[cfg(test)]
use fake::FakeChip;

#[test]
fn test_io_mode_parse() {
    assert_eq!("QIO".parse::<IoMode>().unwrap(), IoMode::Qio);
    assert_eq!("dout".parse::<IoMode>().unwrap(), IoMode::Dout);
    assert!("octal".parse::<IoMode>().is_err());
    assert!(IoMode::Qout.is_quad());
    assert!(!IoMode::Dio.is_quad());
}

#[test]
fn test_detect_unprotects() {
    let fake = FakeChip::new([0xEF, 0xAA, 0x21]);
    let state = fake.state.clone();
    let mut chip = SpiNandChip::new(fake, IoMode::Sio);

    let (info, geometry) = chip.detect().unwrap();
    assert_eq!(info.chip_name, "Winbond W25N01GV");
    assert_eq!(geometry.num_blocks, 1024);

    let state = state.lock().unwrap();
    assert_eq!(state.protect, 0);
    // Single IO leaves the configuration register alone
    assert_eq!(state.config, 0x10);
}

#[test]
fn test_detect_quad_enable() {
    let fake = FakeChip::new([0xC8, 0x31, 0x00]);
    let state = fake.state.clone();
    let mut chip = SpiNandChip::new(fake, IoMode::Qio);

    chip.detect().unwrap();
    assert_eq!(state.lock().unwrap().config, 0x11);
}

#[test]
fn test_quad_enable_already_set() {
    let fake = FakeChip::new([0xC8, 0x31, 0x00]);
    let state = fake.state.clone();
    {
        let mut state = state.lock().unwrap();
        state.protect = 0;
        state.config = 0x11;
    }
    let mut chip = SpiNandChip::new(fake, IoMode::Qio);

    chip.detect().unwrap();
    let state = state.lock().unwrap();
    assert_eq!(state.config, 0x11);
    assert!(!state.opcodes.contains(&CMD_SET_FEATURE));
}

#[test]
fn test_detect_unknown_manufacturer() {
    use crate::error::ErrorKind;

    let mut chip = SpiNandChip::new(FakeChip::new([0x42, 0x00, 0x00]), IoMode::Sio);
    assert_eq!(chip.detect().unwrap_err().kind(), ErrorKind::UnsupportedChip);
}

#[test]
fn test_program_read_erase() {
    let mut chip = SpiNandChip::new(FakeChip::new([0xEF, 0xAA, 0x21]), IoMode::Qout);
    chip.detect().unwrap();

    let data: Vec<u8> = (0..2048).map(|i| (i * 7) as u8).collect();
    chip.program_load(70, 0, &data, false).unwrap();
    chip.program_load(70, 2050, &[0, 0], true).unwrap();
    chip.program_execute(70).unwrap();

    assert_eq!(chip.page_read(70).unwrap(), EccStatus::Ok);
    let mut out = vec![0; 2048];
    chip.read_cache(70, 0, &mut out).unwrap();
    assert_eq!(out, data);
    let mut marker = [0xAA; 2];
    chip.read_cache(70, 2050, &mut marker).unwrap();
    assert_eq!(marker, [0, 0]);

    chip.erase_block(1).unwrap();
    chip.page_read(70).unwrap();
    chip.read_cache(70, 0, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0xFF));
}

#[test]
fn test_erase_failure_reported() {
    let fake = FakeChip::new([0xEF, 0xAA, 0x21]);
    fake.state.lock().unwrap().failing_blocks.push(3);
    let mut chip = SpiNandChip::new(fake, IoMode::Sio);
    chip.detect().unwrap();

    assert!(matches!(chip.erase_block(3), Err(Error::EraseFailed(3))));
    assert!(chip.erase_block(4).is_ok());
}

#[test]
fn test_plane_select() {
    let mut chip = SpiNandChip::new(FakeChip::new([0x2C, 0x24, 0x00]), IoMode::Sio);
    chip.detect().unwrap();

    // Block 0 is on plane 0, block 1 on plane 1
    assert_eq!(chip.column_address(0, 2048).unwrap(), 2048);
    assert_eq!(chip.column_address(64, 2048).unwrap(), 2048 | COLUMN_PLANE_SELECT);
}

#[test]
fn test_page_read_ecc_status() {
    // Winbond: 2-bit category field
    let fake = FakeChip::new([0xEF, 0xAA, 0x21]);
    fake.state.lock().unwrap().read_status.insert(7, 0x30);
    let mut chip = SpiNandChip::new(fake, IoMode::Sio);
    chip.detect().unwrap();
    assert_eq!(chip.page_read(7).unwrap(), EccStatus::Corrected4To6);
    assert_eq!(chip.page_read(8).unwrap(), EccStatus::Ok);

    // XTX: 4-bit corrected-bit count, all ones meaning uncorrectable
    let fake = FakeChip::new([0x0B, 0x11, 0x00]);
    {
        let mut state = fake.state.lock().unwrap();
        state.read_status.insert(7, 0xF0);
        state.read_status.insert(9, 0x20);
    }
    let mut chip = SpiNandChip::new(fake, IoMode::Sio);
    chip.detect().unwrap();
    assert_eq!(chip.page_read(7).unwrap(), EccStatus::NotCorrected);
    assert_eq!(chip.page_read(9).unwrap(), EccStatus::Corrected1To3);
}

#[test]
fn test_program_failure_reported() {
    use crate::error::ErrorKind;
    use crate::nand::NandDevice;

    let fake = FakeChip::new([0xEF, 0xAA, 0x21]);
    fake.state.lock().unwrap().failing_pages.push(12);
    let nand = NandDevice::new(Box::new(SpiNandChip::new(fake, IoMode::Sio))).unwrap();

    let data = vec![0x42; 2048];
    let err = nand.program(12, &data).unwrap_err();
    assert!(matches!(err, Error::ProgramFailed(12)));
    assert_eq!(err.kind(), ErrorKind::Io);
    assert!(nand.is_free(12).unwrap());

    nand.program(13, &data).unwrap();
    assert!(!nand.is_free(13).unwrap());
}
