//! Bus and flash constants for the node bootloader protocol.

use std::time::Duration;

use crc::{CRC_32_ISO_HDLC, Crc};

// ============================================================================
// Bus
// ============================================================================

/// Size of the address table. Slot 0 is reserved, leaving 127 usable addresses.
pub const MAX_NODES: usize = 128;

/// Largest payload carried by a single bus message.
pub const BUS_CHUNK_SIZE: usize = 8;

/// How long to wait for an acknowledgement before giving up on a request.
pub const DEFAULT_EXPECT_TIMEOUT: Duration = Duration::from_secs(3);

// ============================================================================
// Flash layout
// ============================================================================

pub const FLASH_ORIGIN: u32 = 0;
pub const FLASH_LENGTH: u32 = 0x40000;

/// First 8K of flash hold the bootloader.
pub const FLASH_BOOTLOADER_LENGTH: u32 = 0x2000;

pub const FLASH_APP_ORIGIN: u32 = FLASH_ORIGIN + FLASH_BOOTLOADER_LENGTH;
pub const FLASH_APP_LENGTH: u32 = FLASH_LENGTH - FLASH_BOOTLOADER_LENGTH;

/// Unit addressed by a single SET_ADDRESS.
pub const FLASH_PAGE_SIZE: u32 = 64;

/// Value of erased flash.
pub const FLASH_ERASED: u8 = 0xFF;

/// Page checksum: CRC-32 with the IEEE polynomial.
pub static PAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// ============================================================================
// Command parameters
// ============================================================================

/// SET_ADDRESS parameter selecting the flash address space.
pub const PARAM_SPACE_FLASH: u8 = b'F';

/// WRITE parameter for a data chunk.
pub const PARAM_WRITE_DATA: u8 = 0;

/// WRITE parameter for the page checksum terminator.
pub const PARAM_WRITE_CHECKSUM: u8 = 1;

/// Status byte of an acknowledgement reporting success.
pub const ACK_STATUS_OK: u8 = 0;

/// Status byte of a WRITE acknowledgement whose page checksum did not match.
pub const ACK_STATUS_CRC_MISMATCH: u8 = 1;

/// Status byte of an acknowledgement for a request outside the application region.
pub const ACK_STATUS_OUT_OF_RANGE: u8 = 2;
