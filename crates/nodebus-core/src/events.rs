//! Firmware job events and the client sinks that receive them.
//!
//! A firmware job pushes progress updates, a terminal success/failure event
//! and, for downloads, the retrieved image to the sink of the client that
//! requested it. A sink that refuses an event aborts the job.

use std::fmt;
use std::sync::mpsc::Sender;

use thiserror::Error;

use crate::firmware::FirmwareImage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Client is no longer listening")]
    Disconnected,
    #[error("Client rejected event: {0}")]
    Rejected(String),
}

/// Terminal flag of a firmware job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressStatus {
    #[default]
    Running,
    Success,
    Failed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressStatus::Running => write!(f, "running"),
            ProgressStatus::Success => write!(f, "success"),
            ProgressStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Progress record of one firmware job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FirmwareProgress {
    /// Percent complete, 0..=100.
    ///
    /// Uploads report the percentage of the block being written, so it
    /// starts over for every block of a multi-block image. Use `bytes` for
    /// overall progress.
    pub percent: u8,
    /// Bytes written or read so far, across the whole image.
    pub bytes: u32,
    pub status: ProgressStatus,
}

impl FirmwareProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intermediate step and return the updated record.
    pub fn update(&mut self, percent: u8, bytes: u32) -> Self {
        self.percent = percent.min(100);
        self.bytes = bytes;
        self.status = ProgressStatus::Running;
        *self
    }

    pub fn success(&mut self) -> Self {
        self.percent = 100;
        self.status = ProgressStatus::Success;
        *self
    }

    pub fn failed(&mut self) -> Self {
        self.status = ProgressStatus::Failed;
        *self
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ProgressStatus::Running
    }
}

/// Events emitted by a firmware job.
#[derive(Debug, Clone)]
pub enum FirmwareEvent {
    /// Progress update or terminal status.
    Progress(FirmwareProgress),
    /// Image retrieved by a completed download.
    Download(FirmwareImage),
}

/// Receiver of firmware job events.
pub trait EventSink: Send + Sync {
    /// Push an event to the client. Must not wait for the client to process it.
    fn deliver(&self, event: FirmwareEvent) -> Result<(), SinkError>;
}

/// Sink that discards all events.
pub struct NullSink;

impl EventSink for NullSink {
    fn deliver(&self, _event: FirmwareEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that logs events using tracing.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn deliver(&self, event: FirmwareEvent) -> Result<(), SinkError> {
        match event {
            FirmwareEvent::Progress(progress) => match progress.status {
                ProgressStatus::Running => {
                    tracing::info!(
                        progress = %format!("{}%", progress.percent),
                        bytes = progress.bytes,
                        "Firmware progress"
                    );
                }
                ProgressStatus::Success => tracing::info!("Firmware operation complete"),
                ProgressStatus::Failed => tracing::error!("Firmware operation failed"),
            },
            FirmwareEvent::Download(image) => {
                tracing::info!(
                    blocks = image.blocks().len(),
                    bytes = image.total_len(),
                    "Firmware image downloaded"
                );
            }
        }
        Ok(())
    }
}

/// Sink forwarding events over a channel to another thread.
pub struct ChannelSink {
    sender: Sender<FirmwareEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<FirmwareEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: FirmwareEvent) -> Result<(), SinkError> {
        self.sender
            .send(event)
            .map_err(|_| SinkError::Disconnected)
    }
}
