//! The error type shared by every layer of the driver.

/// Coarse classification of an [Error], for callers that only care about the category
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum ErrorKind {
    /// Bad, misaligned, or out-of-range address or argument
    InvalidArgument,

    /// Zero or inconsistent geometry, or a length the operation cannot accept
    InvalidSize,

    /// A scratch buffer or handle could not be allocated
    NoMemory,

    /// The chip did not identify as anything in the vendor table
    UnsupportedChip,

    /// The requested (ioctl) command does not exist
    NotSupported,

    /// The transport or the chip itself reported a failure
    Io,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("page {page} out of range (device has {pages} pages)")]
    PageOutOfRange { page: u32, pages: u32 },

    #[error("block {block} out of range (device has {blocks} blocks)")]
    BlockOutOfRange { block: u32, blocks: u32 },

    #[error("{len} bytes at page offset {offset} exceeds page size {page_size}")]
    CrossesPage {
        offset: usize,
        len: usize,
        page_size: u32,
    },

    #[error("address {addr:#x} not aligned to {align} bytes")]
    Misaligned { addr: u64, align: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid size: {0}")]
    InvalidSize(&'static str),

    #[error("out of memory allocating {0}")]
    NoMemory(&'static str),

    #[error("unsupported chip (manufacturer {manufacturer_id:#04x}, device {device_id:#06x})")]
    UnsupportedChip { manufacturer_id: u8, device_id: u16 },

    #[error("command not supported")]
    NotSupported,

    #[error("program failed on page {0}")]
    ProgramFailed(u32),

    #[error("erase failed on block {0}")]
    EraseFailed(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PageOutOfRange { .. }
            | Self::BlockOutOfRange { .. }
            | Self::CrossesPage { .. }
            | Self::Misaligned { .. }
            | Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidSize(_) => ErrorKind::InvalidSize,
            Self::NoMemory(_) => ErrorKind::NoMemory,
            Self::UnsupportedChip { .. } => ErrorKind::UnsupportedChip,
            Self::NotSupported => ErrorKind::NotSupported,
            Self::ProgramFailed(_) | Self::EraseFailed(_) | Self::Io(_) | Self::Transport(_) => {
                ErrorKind::Io
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[test]
fn test_error_kinds() {
    assert_eq!(
        Error::PageOutOfRange { page: 9, pages: 8 }.kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        Error::Misaligned { addr: 1, align: 2048 }.kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(Error::EraseFailed(3).kind(), ErrorKind::Io);
    assert_eq!(
        Error::from(anyhow::anyhow!("bus fault")).kind(),
        ErrorKind::Io
    );
    assert_eq!(
        Error::UnsupportedChip {
            manufacturer_id: 0x42,
            device_id: 0
        }
        .kind(),
        ErrorKind::UnsupportedChip
    );
}
