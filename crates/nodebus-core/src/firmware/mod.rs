//! Firmware images and the transfer engine.

pub mod image;
pub mod transfer;

pub use image::{FirmwareBlock, FirmwareImage};
pub use transfer::{
    FirmwareEngine, FirmwareOperation, OperationKind, TransferError, TransferStep, download_length,
};
