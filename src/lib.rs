//! Driver core for SPI NAND flash chips
//!
//! The layers, from the bottom:
//! - [spi]: the SPI NAND command set over a [spi::SpiTransport] (Linux spidev included)
//! - [emul]: a chip emulated in RAM or a memory-mapped file
//! - [chip]: the [chip::NandChip] seam both of the above implement, and vendor identification
//! - [nand]: the [nand::NandDevice] handle with page/block primitives and bad block management
//! - [blockdev]: a byte-addressed [blockdev::BlockDevice] on top of it all

pub mod blockdev;
pub mod chip;
pub mod ecc;
pub mod emul;
pub mod error;
pub mod geometry;
pub mod nand;
pub mod spi;

pub use blockdev::{get_blockdev, BlockDevice, FlashConfig};
pub use error::{Error, ErrorKind, Result};
