//! Per-manufacturer part tables.
//!
//! Each initializer starts from [ChipGeometry::default] (2048-byte pages, 64 pages per block)
//! and only sets what differs for the part.

use crate::ecc::EccEncoding;
use crate::geometry::ChipGeometry;

pub(super) fn alliance(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str> {
    geometry.has_quad_enable_bit = true;
    geometry.quad_enable_bit_pos = 0;
    geometry.erase_block_delay_us = 3000;
    geometry.program_page_delay_us = 630;

    let name = match device_id {
        0x25 => {
            geometry.num_blocks = 1024;
            geometry.read_page_delay_us = 60;
            "AS5F31G04SND-08LIN"
        }
        0x2E | 0x8E => {
            geometry.num_blocks = 2048;
            geometry.read_page_delay_us = 60;
            "AS5F32G04SND-08LIN"
        }
        0x2F | 0x8F => {
            geometry.log2_page_size = 12;
            geometry.oob_size = 256;
            geometry.num_blocks = 2048;
            geometry.read_page_delay_us = 115;
            "AS5F34G04SND-08LIN"
        }
        _ => return None,
    };
    Some(name)
}

pub(super) fn winbond(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str> {
    // Winbond parts are always quad-capable; there is no QE bit to set
    geometry.read_page_delay_us = 10;
    geometry.erase_block_delay_us = 2500;
    geometry.program_page_delay_us = 320;

    let name = match device_id {
        0xAA20 => {
            geometry.num_blocks = 512;
            "W25N512GV"
        }
        0xBA20 => {
            geometry.num_blocks = 512;
            "W25N512GW"
        }
        0xAA21 => {
            geometry.num_blocks = 1024;
            "W25N01GV"
        }
        0xBA21 | 0xBC21 => {
            geometry.num_blocks = 1024;
            "W25N01GW"
        }
        0xAA22 => {
            geometry.num_blocks = 2048;
            geometry.oob_size = 128;
            geometry.ecc.status_reg_len_in_bits = 3;
            "W25N02KV"
        }
        0xAA23 => {
            geometry.num_blocks = 4096;
            geometry.oob_size = 128;
            geometry.ecc.status_reg_len_in_bits = 3;
            "W25N04KV"
        }
        _ => return None,
    };
    Some(name)
}

pub(super) fn gigadevice(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str> {
    geometry.has_quad_enable_bit = true;
    geometry.quad_enable_bit_pos = 0;
    geometry.read_page_delay_us = 25;
    geometry.erase_block_delay_us = 3200;
    geometry.program_page_delay_us = 380;

    let name = match device_id {
        0x31 => {
            geometry.num_blocks = 1024;
            geometry.oob_size = 128;
            "GD5F1GQ5UE"
        }
        0x32 => {
            geometry.num_blocks = 2048;
            geometry.oob_size = 128;
            "GD5F2GQ5UE"
        }
        0x51 => {
            geometry.num_blocks = 1024;
            geometry.oob_size = 128;
            "GD5F1GQ5RE"
        }
        0x91 => {
            geometry.num_blocks = 1024;
            geometry.read_page_delay_us = 40;
            "GD5F1GM7UE"
        }
        0x92 => {
            geometry.num_blocks = 2048;
            geometry.read_page_delay_us = 40;
            "GD5F2GM7UE"
        }
        _ => return None,
    };
    Some(name)
}

pub(super) fn micron(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str> {
    geometry.ecc.status_reg_len_in_bits = 3;
    geometry.oob_size = 128;
    geometry.read_page_delay_us = 115;
    geometry.erase_block_delay_us = 2000;
    geometry.program_page_delay_us = 600;

    let name = match device_id {
        0x14 => {
            geometry.num_blocks = 1024;
            "MT29F1G01ABAFDxx"
        }
        0x15 => {
            geometry.num_blocks = 1024;
            "MT29F1G01ABBFDxx"
        }
        0x24 => {
            geometry.num_blocks = 2048;
            geometry.num_planes = 2;
            "MT29F2G01ABAGDxx"
        }
        0x36 => {
            geometry.num_blocks = 4096;
            geometry.num_planes = 2;
            "MT29F4G01ADAGDxx"
        }
        _ => return None,
    };
    Some(name)
}

pub(super) fn zetta(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str> {
    geometry.has_quad_enable_bit = true;
    geometry.quad_enable_bit_pos = 0;
    geometry.read_page_delay_us = 100;
    geometry.erase_block_delay_us = 2000;
    geometry.program_page_delay_us = 400;

    let name = match device_id {
        0x71 => {
            geometry.num_blocks = 1024;
            "ZD35Q1GA"
        }
        0x72 => {
            geometry.num_blocks = 2048;
            "ZD35Q2GA"
        }
        _ => return None,
    };
    Some(name)
}

pub(super) fn xtx(device_id: u16, geometry: &mut ChipGeometry) -> Option<&'static str> {
    // XTX reports the number of corrected bits rather than a category
    geometry.ecc.status_reg_len_in_bits = 4;
    geometry.ecc.encoding = EccEncoding::BitCount;
    geometry.has_quad_enable_bit = true;
    geometry.quad_enable_bit_pos = 0;
    geometry.oob_size = 128;
    geometry.read_page_delay_us = 50;
    geometry.erase_block_delay_us = 3500;
    geometry.program_page_delay_us = 650;

    let name = match device_id {
        0x11 => {
            geometry.num_blocks = 1024;
            "XT26G01C"
        }
        0x12 => {
            geometry.num_blocks = 2048;
            "XT26G02C"
        }
        _ => return None,
    };
    Some(name)
}

#[test]
fn test_alliance_large_page() {
    let mut geometry = ChipGeometry::default();
    assert_eq!(alliance(0x8F, &mut geometry), Some("AS5F34G04SND-08LIN"));
    geometry.update_sizes();
    assert_eq!(geometry.page_size, 4096);
    assert_eq!(geometry.block_size, 64 * 4096);
    assert!(geometry.has_quad_enable_bit);
}

#[test]
fn test_xtx_bit_count_ecc() {
    let mut geometry = ChipGeometry::default();
    assert!(xtx(0x11, &mut geometry).is_some());
    assert_eq!(geometry.ecc.encoding, EccEncoding::BitCount);
    assert_eq!(geometry.ecc.status_reg_len_in_bits, 4);
}

#[test]
fn test_unknown_parts() {
    let inits: [super::VendorInit; 6] = [alliance, winbond, gigadevice, micron, zetta, xtx];
    for init in inits {
        assert_eq!(init(0xFFFF, &mut ChipGeometry::default()), None);
    }
}
