//! System function codes of the bootloader command set.
//!
//! Every command has a matching acknowledgement code which the node sends
//! back once the command has been carried out.

use std::fmt;

/// Bootloader system functions (host -> node commands and node -> host acks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemFunction {
    BootloaderSetAddress = 23,
    BootloaderSetAddressAck = 24,
    BootloaderWrite = 25,
    BootloaderWriteAck = 26,
    BootloaderRead = 27,
    BootloaderReadAck = 28,
    BootloaderErase = 31,
    BootloaderEraseAck = 32,
}

impl SystemFunction {
    /// Wire code of this function.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Acknowledgement expected in reply to this command.
    ///
    /// Returns `None` for functions that are themselves acknowledgements.
    pub const fn ack(self) -> Option<SystemFunction> {
        match self {
            SystemFunction::BootloaderSetAddress => Some(SystemFunction::BootloaderSetAddressAck),
            SystemFunction::BootloaderWrite => Some(SystemFunction::BootloaderWriteAck),
            SystemFunction::BootloaderRead => Some(SystemFunction::BootloaderReadAck),
            SystemFunction::BootloaderErase => Some(SystemFunction::BootloaderEraseAck),
            _ => None,
        }
    }

    /// Check if this is an acknowledgement code.
    pub const fn is_ack(self) -> bool {
        self.ack().is_none()
    }

    pub const fn name(self) -> &'static str {
        match self {
            SystemFunction::BootloaderSetAddress => "SYS_BOOTLOADER_SET_ADDRESS",
            SystemFunction::BootloaderSetAddressAck => "SYS_BOOTLOADER_SET_ADDRESS_ACK",
            SystemFunction::BootloaderWrite => "SYS_BOOTLOADER_WRITE",
            SystemFunction::BootloaderWriteAck => "SYS_BOOTLOADER_WRITE_ACK",
            SystemFunction::BootloaderRead => "SYS_BOOTLOADER_READ",
            SystemFunction::BootloaderReadAck => "SYS_BOOTLOADER_READ_ACK",
            SystemFunction::BootloaderErase => "SYS_BOOTLOADER_ERASE",
            SystemFunction::BootloaderEraseAck => "SYS_BOOTLOADER_ERASE_ACK",
        }
    }
}

impl TryFrom<u8> for SystemFunction {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            23 => SystemFunction::BootloaderSetAddress,
            24 => SystemFunction::BootloaderSetAddressAck,
            25 => SystemFunction::BootloaderWrite,
            26 => SystemFunction::BootloaderWriteAck,
            27 => SystemFunction::BootloaderRead,
            28 => SystemFunction::BootloaderReadAck,
            31 => SystemFunction::BootloaderErase,
            32 => SystemFunction::BootloaderEraseAck,
            other => return Err(other),
        })
    }
}

impl fmt::Display for SystemFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
