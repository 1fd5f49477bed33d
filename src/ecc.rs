//! Interpretation of the on-chip ECC engine's status reports, and the statistics built from them.

/// The outcome of on-chip ECC for one page read, in order of increasing severity
#[derive(Debug, Default, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash)]
pub enum EccStatus {
    /// No bit errors
    #[default]
    Ok,

    /// 1 to 3 bit errors were found and corrected
    Corrected1To3,

    /// 4 to 6 bit errors were found and corrected
    Corrected4To6,

    /// 7 or 8 bit errors were found and corrected
    Corrected7To8,

    /// More errors than ECC can correct; the data is not trustworthy
    NotCorrected,
}

impl EccStatus {
    /// The fewest corrected bits this status could stand for.
    ///
    /// The status register only reports a category, so this is as precise as it gets.
    pub fn min_corrected_bits(self) -> u8 {
        match self {
            Self::Corrected1To3 => 1,
            Self::Corrected4To6 => 4,
            Self::Corrected7To8 => 7,
            Self::Ok | Self::NotCorrected => 0,
        }
    }

    /// Did ECC have to do anything (or fail to)?
    pub fn is_error(self) -> bool {
        self != Self::Ok
    }

    /// Should the page's data be relocated before it degrades further?
    pub fn exceeds_threshold(self, refresh_threshold: u8) -> bool {
        self.min_corrected_bits() >= refresh_threshold
    }

    /// Bucket a count of corrected bits (`None` for uncorrectable)
    pub fn from_corrected_bits(bits: Option<u8>) -> Self {
        match bits {
            Some(0) => Self::Ok,
            Some(1..=3) => Self::Corrected1To3,
            Some(4..=6) => Self::Corrected4To6,
            Some(7..=8) => Self::Corrected7To8,
            _ => Self::NotCorrected,
        }
    }
}

/// How a vendor encodes ECC results in the status register
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum EccEncoding {
    /// `0`: ok, `1`: 1-3 corrected, `2`: uncorrectable, `3`: 4-6 corrected, `5`: 7-8 corrected
    #[default]
    Standard,

    /// The field holds the number of corrected bits; all-ones means uncorrectable
    BitCount,
}

/// Per-chip ECC parameters
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct EccConfig {
    /// Width of the ECC field in the status register
    pub status_reg_len_in_bits: u8,

    /// Minimum corrected bit count at which data should be refreshed
    pub refresh_threshold: u8,

    pub encoding: EccEncoding,
}

impl Default for EccConfig {
    fn default() -> Self {
        Self {
            status_reg_len_in_bits: 2,
            refresh_threshold: 4,
            encoding: EccEncoding::Standard,
        }
    }
}

/// Bit position of the ECC field within the status register
const STATUS_ECC_SHIFT: u8 = 4;

impl EccConfig {
    /// Decode the ECC field of a raw status register value
    pub fn decode(&self, status: u8) -> EccStatus {
        let mask = (1u16 << self.status_reg_len_in_bits) - 1;
        let field = (u16::from(status) >> STATUS_ECC_SHIFT) & mask;

        match self.encoding {
            EccEncoding::Standard => match field {
                0 => EccStatus::Ok,
                1 => EccStatus::Corrected1To3,
                3 => EccStatus::Corrected4To6,
                5 => EccStatus::Corrected7To8,
                _ => EccStatus::NotCorrected,
            },
            EccEncoding::BitCount if field == mask => EccStatus::NotCorrected,
            EccEncoding::BitCount => EccStatus::from_corrected_bits(Some(field as u8)),
        }
    }

    /// Inverse of [EccConfig::decode], producing the status register bits for `status`
    pub fn encode(&self, status: EccStatus) -> u8 {
        let mask = ((1u16 << self.status_reg_len_in_bits) - 1) as u8;
        let field = match (self.encoding, status) {
            (_, EccStatus::Ok) => 0,
            (EccEncoding::Standard, EccStatus::Corrected1To3) => 1,
            (EccEncoding::Standard, EccStatus::NotCorrected) => 2,
            (EccEncoding::Standard, EccStatus::Corrected4To6) => 3,
            (EccEncoding::Standard, EccStatus::Corrected7To8) => 5,
            (EccEncoding::BitCount, EccStatus::NotCorrected) => mask,
            (EccEncoding::BitCount, other) => other.min_corrected_bits(),
        };
        (field & mask) << STATUS_ECC_SHIFT
    }
}

/// Aggregate ECC results over every programmed page of a device
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct EccStats {
    pub threshold: u8,

    /// Pages that reported any ECC event, corrected or not
    pub total_err_count: u32,

    pub uncorrected_count: u32,

    /// Corrected pages at or above the refresh threshold
    pub exceeding_threshold_count: u32,
}

impl EccStats {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    /// Account for one page read
    pub fn record(&mut self, status: EccStatus) {
        if !status.is_error() {
            return;
        }

        self.total_err_count += 1;
        if status == EccStatus::NotCorrected {
            self.uncorrected_count += 1;
        } else if status.exceeds_threshold(self.threshold) {
            self.exceeding_threshold_count += 1;
        }
    }
}

#[test]
fn test_severity_order() {
    use EccStatus::*;
    assert!(Ok < Corrected1To3);
    assert!(Corrected1To3 < Corrected4To6);
    assert!(Corrected4To6 < Corrected7To8);
    assert!(Corrected7To8 < NotCorrected);
}

#[test]
fn test_standard_decode() {
    let two_bit = EccConfig::default();
    assert_eq!(two_bit.decode(0x00), EccStatus::Ok);
    assert_eq!(two_bit.decode(0x10), EccStatus::Corrected1To3);
    assert_eq!(two_bit.decode(0x20), EccStatus::NotCorrected);
    assert_eq!(two_bit.decode(0x30), EccStatus::Corrected4To6);
    // Bit 6 is outside a 2-bit field and busy/fail bits never leak in
    assert_eq!(two_bit.decode(0x4D), EccStatus::Ok);

    let three_bit = EccConfig {
        status_reg_len_in_bits: 3,
        ..Default::default()
    };
    assert_eq!(three_bit.decode(0x50), EccStatus::Corrected7To8);
    assert_eq!(three_bit.decode(0x40), EccStatus::NotCorrected);
    assert_eq!(three_bit.decode(0x70), EccStatus::NotCorrected);
}

#[test]
fn test_bit_count_decode() {
    let xtx = EccConfig {
        status_reg_len_in_bits: 4,
        refresh_threshold: 4,
        encoding: EccEncoding::BitCount,
    };
    assert_eq!(xtx.decode(0x00), EccStatus::Ok);
    assert_eq!(xtx.decode(0x20), EccStatus::Corrected1To3);
    assert_eq!(xtx.decode(0x60), EccStatus::Corrected4To6);
    assert_eq!(xtx.decode(0x80), EccStatus::Corrected7To8);
    assert_eq!(xtx.decode(0x90), EccStatus::NotCorrected);
    assert_eq!(xtx.decode(0xF0), EccStatus::NotCorrected);
}

#[test]
fn test_encode_inverts_decode() {
    for config in [
        EccConfig::default(),
        EccConfig {
            status_reg_len_in_bits: 3,
            ..Default::default()
        },
        EccConfig {
            status_reg_len_in_bits: 4,
            refresh_threshold: 4,
            encoding: EccEncoding::BitCount,
        },
    ] {
        for status in [
            EccStatus::Ok,
            EccStatus::Corrected1To3,
            EccStatus::Corrected4To6,
            EccStatus::NotCorrected,
        ] {
            assert_eq!(config.decode(config.encode(status)), status);
        }
    }
}

#[test]
fn test_threshold() {
    assert!(!EccStatus::Ok.exceeds_threshold(4));
    assert!(!EccStatus::Corrected1To3.exceeds_threshold(4));
    assert!(EccStatus::Corrected4To6.exceeds_threshold(4));
    assert!(EccStatus::Corrected7To8.exceeds_threshold(4));
    assert!(!EccStatus::NotCorrected.exceeds_threshold(4));
    assert!(EccStatus::Corrected1To3.exceeds_threshold(1));
}

#[test]
fn test_stats_record() {
    let mut stats = EccStats::new(4);
    for status in [
        EccStatus::Ok,
        EccStatus::Corrected1To3,
        EccStatus::Corrected4To6,
        EccStatus::Corrected7To8,
        EccStatus::NotCorrected,
    ] {
        stats.record(status);
    }

    assert_eq!(
        stats,
        EccStats {
            threshold: 4,
            total_err_count: 4,
            uncorrected_count: 1,
            exceeding_threshold_count: 2,
        }
    );
}
