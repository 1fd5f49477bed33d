//! SPI transport implementation over the Linux spidev interface

use super::{IoMode, SpiTransport, Transfer};

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

/// A SPI bus with chip select, wrapping an open /dev/spidevB.C file
#[derive(Debug)]
pub struct SpidevTransport {
    file: File,
    speed_hz: u32,
}

impl SpidevTransport {
    /// Open a `spidev` device by path (e.g. "/dev/spidev1.0"), configuring SPI mode 0 and the
    /// multi-line capabilities `io_mode` needs.
    pub fn open<P: AsRef<Path>>(path: P, speed_hz: u32, io_mode: IoMode) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;

        let mode = ioctl::SPI_MODE_0
            | match io_mode {
                IoMode::Sio => 0,
                IoMode::Dout => ioctl::SPI_RX_DUAL,
                IoMode::Dio => ioctl::SPI_TX_DUAL | ioctl::SPI_RX_DUAL,
                IoMode::Qout => ioctl::SPI_TX_QUAD | ioctl::SPI_RX_QUAD,
                IoMode::Qio => ioctl::SPI_TX_QUAD | ioctl::SPI_RX_QUAD,
            };
        unsafe {
            ioctl::spi_ioc_wr_mode32(file.as_raw_fd(), &mode)?;
            ioctl::spi_ioc_wr_max_speed_hz(file.as_raw_fd(), &speed_hz)?;
        }
        log::debug!("spidev configured: mode {mode:#x}, {speed_hz} Hz");

        Ok(Self { file, speed_hz })
    }
}

impl SpiTransport for SpidevTransport {
    fn transfer(&mut self, xfer: Transfer<'_>) -> anyhow::Result<()> {
        let opcode = [xfer.opcode];

        // Each phase becomes one segment of a single message, so CS stays asserted throughout
        let mut segments = Vec::with_capacity(4);
        segments.push(ioctl::spi_ioc_transfer::tx(&opcode, 1, self.speed_hz));
        if !xfer.address.is_empty() {
            segments.push(ioctl::spi_ioc_transfer::tx(
                xfer.address,
                xfer.address_lines,
                self.speed_hz,
            ));
        }
        if !xfer.write.is_empty() {
            segments.push(ioctl::spi_ioc_transfer::tx(
                xfer.write,
                xfer.data_lines,
                self.speed_hz,
            ));
        }
        if !xfer.read.is_empty() {
            segments.push(ioctl::spi_ioc_transfer::rx(
                xfer.read,
                xfer.data_lines,
                self.speed_hz,
            ));
        }

        unsafe {
            ioctl::spi_ioc_message(self.file.as_raw_fd(), &segments)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with spidev devices

    use nix::{ioctl_write_buf, ioctl_write_ptr};

    const SPI_IOC_MAGIC: u8 = b'k';

    pub const SPI_MODE_0: u32 = 0;
    pub const SPI_TX_DUAL: u32 = 0x100;
    pub const SPI_TX_QUAD: u32 = 0x200;
    pub const SPI_RX_DUAL: u32 = 0x400;
    pub const SPI_RX_QUAD: u32 = 0x800;

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct spi_ioc_transfer {
        pub tx_buf: u64,
        pub rx_buf: u64,
        pub len: u32,
        pub speed_hz: u32,
        pub delay_usecs: u16,
        pub bits_per_word: u8,
        pub cs_change: u8,
        pub tx_nbits: u8,
        pub rx_nbits: u8,
        pub word_delay_usecs: u8,
        pub pad: u8,
    }

    impl spi_ioc_transfer {
        /// A segment clocking out `buf`; the buffer must outlive the ioctl
        pub fn tx(buf: &[u8], lines: u8, speed_hz: u32) -> Self {
            Self {
                tx_buf: buf.as_ptr() as u64,
                len: buf.len() as u32,
                speed_hz,
                bits_per_word: 8,
                tx_nbits: lines,
                ..Default::default()
            }
        }

        /// A segment clocking into `buf`; the buffer must outlive the ioctl
        pub fn rx(buf: &mut [u8], lines: u8, speed_hz: u32) -> Self {
            Self {
                rx_buf: buf.as_mut_ptr() as u64,
                len: buf.len() as u32,
                speed_hz,
                bits_per_word: 8,
                rx_nbits: lines,
                ..Default::default()
            }
        }
    }

    // SPI_IOC_MESSAGE(n) encodes n * sizeof(spi_ioc_transfer) as the size, which is exactly what
    // a buffer ioctl computes from the slice length.
    ioctl_write_buf!(spi_ioc_message, SPI_IOC_MAGIC, 0, spi_ioc_transfer);
    ioctl_write_ptr!(spi_ioc_wr_max_speed_hz, SPI_IOC_MAGIC, 4, u32);
    ioctl_write_ptr!(spi_ioc_wr_mode32, SPI_IOC_MAGIC, 5, u32);
}

#[test]
fn test_transfer_layout() {
    // The kernel ABI fixes this struct at 32 bytes
    assert_eq!(std::mem::size_of::<ioctl::spi_ioc_transfer>(), 32);
}
