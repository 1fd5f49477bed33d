//! The backend seam of the driver: how a device talks to a chip (real or emulated), and how a
//! real chip is identified.
//!
//! Every backend exposes the same small command set modeled on the SPI NAND cache register:
//!
//! ```text
//!            page_read              read_cache
//!   array  ------------>  cache  ------------>  host
//!          <------------        <------------
//!          program_execute       program_load
//! ```
//!
//! The page/block primitives in [crate::nand] are written once against this trait.

mod vendors;

use crate::ecc::EccStatus;
use crate::error::{Error, Result};
use crate::geometry::ChipGeometry;

/// Identification strings and numbers, as read from the chip during detection
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer_id: u8,
    pub device_id: u16,
    pub chip_name: String,
}

/// Represents the command interface of one NAND chip
///
/// Implementations are not expected to be safe for concurrent use; the owning
/// [crate::nand::NandDevice] serializes every call.
pub trait NandChip: Send {
    /// Identify the chip and determine its geometry, applying any setup the chip needs first.
    fn detect(&mut self) -> Result<(DeviceInfo, ChipGeometry)>;

    /// Load a page from the array into the cache, returning the result of on-chip ECC
    fn page_read(&mut self, page: u32) -> Result<EccStatus>;

    /// Copy bytes out of the cache, starting at `column` (the OOB area follows the data area)
    ///
    /// `page` must be the page most recently loaded with `page_read`; some chips derive the plane
    /// from it.
    fn read_cache(&mut self, page: u32, column: usize, buf: &mut [u8]) -> Result<()>;

    /// Copy bytes into the cache, starting at `column`
    ///
    /// Unless `random` is set, every other byte of the cache is first reset to 0xFF.
    fn program_load(&mut self, page: u32, column: usize, data: &[u8], random: bool) -> Result<()>;

    /// Program the cache into a page of the array
    fn program_execute(&mut self, page: u32) -> Result<()>;

    /// Erase a block, making all its pages programmable again
    fn erase_block(&mut self, block: u32) -> Result<()>;

    /// Flush anything the backend holds outside the chip
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Signature of a vendor-specific initializer: fills in `geometry` for the given device ID and
/// returns the part name, or `None` if the device ID is not one of the vendor's known parts.
type VendorInit = fn(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str>;

/// One entry of the manufacturer registration table
struct Vendor {
    manufacturer_id: u8,
    name: &'static str,

    /// How many bytes of device ID follow the manufacturer ID
    device_id_len: usize,

    init: VendorInit,
}

const VENDORS: &[Vendor] = &[
    Vendor {
        manufacturer_id: 0x52,
        name: "Alliance",
        device_id_len: 1,
        init: vendors::alliance,
    },
    Vendor {
        manufacturer_id: 0xEF,
        name: "Winbond",
        device_id_len: 2,
        init: vendors::winbond,
    },
    Vendor {
        manufacturer_id: 0xC8,
        name: "GigaDevice",
        device_id_len: 1,
        init: vendors::gigadevice,
    },
    Vendor {
        manufacturer_id: 0x2C,
        name: "Micron",
        device_id_len: 1,
        init: vendors::micron,
    },
    Vendor {
        manufacturer_id: 0xBA,
        name: "Zetta",
        device_id_len: 1,
        init: vendors::zetta,
    },
    Vendor {
        manufacturer_id: 0x0B,
        name: "XTX",
        device_id_len: 1,
        init: vendors::xtx,
    },
];

fn find_vendor(manufacturer_id: u8) -> Option<&'static Vendor> {
    VENDORS.iter().find(|v| v.manufacturer_id == manufacturer_id)
}

/// Name of a known manufacturer
pub fn manufacturer_name(manufacturer_id: u8) -> Option<&'static str> {
    find_vendor(manufacturer_id).map(|v| v.name)
}

/// Identify a chip from the bytes returned by READ ID (manufacturer byte first), and produce
/// its info and geometry.
pub fn identify(id: &[u8]) -> Result<(DeviceInfo, ChipGeometry)> {
    let (&manufacturer_id, device_bytes) = id
        .split_first()
        .ok_or(Error::InvalidArgument("empty chip ID"))?;
    log::debug!("manufacturer ID {manufacturer_id:#04x}");

    let unsupported = |device_id| Error::UnsupportedChip {
        manufacturer_id,
        device_id,
    };
    let vendor = find_vendor(manufacturer_id).ok_or(unsupported(0))?;

    let device_bytes = device_bytes
        .get(..vendor.device_id_len)
        .ok_or(Error::InvalidArgument("chip ID too short"))?;
    let device_id = device_bytes
        .iter()
        .fold(0u16, |id, &b| (id << 8) | u16::from(b));

    let mut geometry = ChipGeometry::default();
    let part = (vendor.init)(device_id, &mut geometry).ok_or(unsupported(device_id))?;
    geometry.update_sizes();

    log::info!(
        "detected {} {part}: {} blocks of {}x{} bytes",
        vendor.name,
        geometry.num_blocks,
        geometry.pages_per_block(),
        geometry.page_size
    );

    let info = DeviceInfo {
        manufacturer_id,
        device_id,
        chip_name: format!("{} {part}", vendor.name),
    };
    Ok((info, geometry))
}

#[test]
fn test_identify_winbond() {
    let (info, geometry) = identify(&[0xEF, 0xAA, 0x21]).unwrap();
    assert_eq!(info.manufacturer_id, 0xEF);
    assert_eq!(info.device_id, 0xAA21);
    assert_eq!(info.chip_name, "Winbond W25N01GV");
    assert_eq!(geometry.num_blocks, 1024);
    assert_eq!(geometry.page_size, 2048);
    assert_eq!(geometry.block_size, 131072);
}

#[test]
fn test_identify_one_byte_device_id() {
    // Trailing ID bytes beyond the vendor's device ID length are ignored
    let (info, geometry) = identify(&[0x2C, 0x24, 0x00]).unwrap();
    assert_eq!(info.device_id, 0x24);
    assert_eq!(geometry.num_blocks, 2048);
    assert_eq!(geometry.num_planes, 2);
    assert_eq!(geometry.ecc.status_reg_len_in_bits, 3);
}

#[test]
fn test_identify_unsupported() {
    use crate::error::ErrorKind;

    let err = identify(&[0x42, 0x11, 0x00]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedChip);

    // Known vendor, unknown part
    let err = identify(&[0xEF, 0x12, 0x34]).unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedChip {
            manufacturer_id: 0xEF,
            device_id: 0x1234
        }
    ));

    assert_eq!(identify(&[]).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(
        identify(&[0xEF, 0xAA]).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_vendor_table_unique() {
    for (i, a) in VENDORS.iter().enumerate() {
        assert!(VENDORS[i + 1..]
            .iter()
            .all(|b| b.manufacturer_id != a.manufacturer_id));
    }
    assert_eq!(manufacturer_name(0xC8), Some("GigaDevice"));
    assert_eq!(manufacturer_name(0x00), None);
}
