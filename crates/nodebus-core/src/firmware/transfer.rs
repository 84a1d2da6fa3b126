//! Firmware upload and download over the bootloader protocol.
//!
//! Every command is followed by a wait for its acknowledgement from the same
//! node before the next one goes out. The first failed acknowledgement
//! aborts the whole job: there is no retry and no resume.
//!
//! Uploads erase the application region, then write each block page by
//! page: SET_ADDRESS, up to eight WRITE chunks, and a final WRITE carrying
//! the CRC-32 of the page. Downloads read the application region back in
//! 8-byte READ chunks.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::image::FirmwareImage;
use crate::events::{EventSink, FirmwareEvent, FirmwareProgress, SinkError};
use crate::id::{NodeId, Udid};
use crate::node::Node;
use crate::protocol::SystemFunction;
use crate::protocol::constants::*;
use crate::transport::{BusTransport, TransportError};

/// Protocol step of a firmware job, used to report failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    SetAddress,
    Erase,
    Write,
    /// Final WRITE of a page, carrying its checksum.
    WriteChecksum,
    Read,
}

impl TransferStep {
    fn command(self) -> SystemFunction {
        match self {
            TransferStep::SetAddress => SystemFunction::BootloaderSetAddress,
            TransferStep::Erase => SystemFunction::BootloaderErase,
            TransferStep::Write | TransferStep::WriteChecksum => SystemFunction::BootloaderWrite,
            TransferStep::Read => SystemFunction::BootloaderRead,
        }
    }

    fn ack(self) -> SystemFunction {
        match self {
            TransferStep::SetAddress => SystemFunction::BootloaderSetAddressAck,
            TransferStep::Erase => SystemFunction::BootloaderEraseAck,
            TransferStep::Write | TransferStep::WriteChecksum => SystemFunction::BootloaderWriteAck,
            TransferStep::Read => SystemFunction::BootloaderReadAck,
        }
    }
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStep::WriteChecksum => write!(f, "Final {}", self.command()),
            _ => write!(f, "{}", self.command()),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{step} timed out for node N{node} ({udid}) at address=0x{address:x}")]
    ProtocolTimeout {
        node: NodeId,
        udid: Udid,
        step: TransferStep,
        address: u32,
    },

    #[error(
        "{step} failed for node N{node} ({udid}) at address=0x{address:x}: expected {expected}, got {actual}"
    )]
    ProtocolMismatch {
        node: NodeId,
        udid: Udid,
        step: TransferStep,
        address: u32,
        expected: SystemFunction,
        actual: SystemFunction,
    },

    #[error("{step} failed for node N{node} ({udid}) at address=0x{address:x}: {source}")]
    Transport {
        node: NodeId,
        udid: Udid,
        step: TransferStep,
        address: u32,
        source: TransportError,
    },

    #[error("Block at 0x{offset:x} ({len} bytes) lies outside the application region")]
    OutOfRange { offset: u32, len: usize },

    #[error("Failed to deliver firmware event: {0}")]
    SinkDelivery(#[from] SinkError),
}

impl TransferError {
    /// Protocol step that failed, if the failure happened on the bus.
    pub fn step(&self) -> Option<TransferStep> {
        match self {
            TransferError::ProtocolTimeout { step, .. }
            | TransferError::ProtocolMismatch { step, .. }
            | TransferError::Transport { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Flash address of the failed step.
    pub fn address(&self) -> Option<u32> {
        match self {
            TransferError::ProtocolTimeout { address, .. }
            | TransferError::ProtocolMismatch { address, .. }
            | TransferError::Transport { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Direction of a firmware job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Upload,
    Download,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Upload => write!(f, "upload"),
            OperationKind::Download => write!(f, "download"),
        }
    }
}

/// One firmware job requested by a client.
pub struct FirmwareOperation<'a> {
    pub kind: OperationKind,
    pub progress: FirmwareProgress,
    pub image: FirmwareImage,
    sink: &'a dyn EventSink,
}

impl<'a> FirmwareOperation<'a> {
    pub fn new(kind: OperationKind, image: FirmwareImage, sink: &'a dyn EventSink) -> Self {
        Self {
            kind,
            progress: FirmwareProgress::new(),
            image,
            sink,
        }
    }

    /// Write `image` to a node.
    pub fn upload(image: FirmwareImage, sink: &'a dyn EventSink) -> Self {
        Self::new(OperationKind::Upload, image, sink)
    }

    /// Read a node's application into `image`, bounded by the image limit.
    pub fn download(image: FirmwareImage, sink: &'a dyn EventSink) -> Self {
        Self::new(OperationKind::Download, image, sink)
    }
}

/// Number of bytes a download reads: the image limit, capped to the
/// application region.
pub fn download_length(limit: Option<u32>) -> u32 {
    limit.map_or(FLASH_APP_LENGTH, |l| l.min(FLASH_APP_LENGTH))
}

fn encode_u32(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        ((done * 100) / total).min(100) as u8
    }
}

/// Runs firmware jobs over a bus transport.
pub struct FirmwareEngine<T: BusTransport> {
    transport: T,
}

impl<T: BusTransport> FirmwareEngine<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Run `op` against `node`.
    pub fn execute(&self, node: &Node, op: &mut FirmwareOperation<'_>) -> Result<(), TransferError> {
        match op.kind {
            OperationKind::Upload => self.upload(node, op),
            OperationKind::Download => self.download(node, op),
        }
    }

    /// Send one command and wait for its acknowledgement.
    fn request(
        &self,
        node: &Node,
        step: TransferStep,
        param: u8,
        payload: &[u8],
        address: u32,
    ) -> Result<Vec<u8>, TransferError> {
        let context = |source: TransportError| match source {
            TransportError::Timeout { .. } => TransferError::ProtocolTimeout {
                node: node.id(),
                udid: node.udid(),
                step,
                address,
            },
            TransportError::UnexpectedReply { expected, actual } => {
                TransferError::ProtocolMismatch {
                    node: node.id(),
                    udid: node.udid(),
                    step,
                    address,
                    expected,
                    actual,
                }
            }
            source => TransferError::Transport {
                node: node.id(),
                udid: node.udid(),
                step,
                address,
                source,
            },
        };

        self.transport
            .send_command(node.id(), step.command(), param, payload)
            .map_err(context)?;
        let reply = self
            .transport
            .await_reply(node.id(), step.ack())
            .map_err(context)?;
        node.touch();
        Ok(reply)
    }

    fn set_address(&self, node: &Node, address: u32) -> Result<(), TransferError> {
        self.request(
            node,
            TransferStep::SetAddress,
            PARAM_SPACE_FLASH,
            &encode_u32(address),
            address,
        )?;
        Ok(())
    }

    /// Report a failed job to the client, once, and hand back the error.
    fn abort(&self, node: &Node, op: &mut FirmwareOperation<'_>, err: TransferError) -> TransferError {
        warn!(node = %node, kind = %op.kind, error = %err, "Firmware operation aborted");
        // A sink that already refused an event will not take the failure either.
        if !matches!(err, TransferError::SinkDelivery(_))
            && let Err(e) = op
                .sink
                .deliver(FirmwareEvent::Progress(op.progress.failed()))
        {
            warn!(node = %node, error = %e, "Could not report failure to client");
        }
        err
    }

    /// Erase the node's application region and write `op.image` to it.
    #[instrument(skip(self, node, op), fields(node = %node))]
    pub fn upload(&self, node: &Node, op: &mut FirmwareOperation<'_>) -> Result<(), TransferError> {
        info!(
            blocks = op.image.blocks().len(),
            bytes = op.image.total_len(),
            "Starting firmware upload"
        );
        if let Err(e) = self.write_image(node, op) {
            return Err(self.abort(node, op, e));
        }
        op.sink
            .deliver(FirmwareEvent::Progress(op.progress.success()))?;
        info!("Firmware upload complete");
        Ok(())
    }

    fn write_image(&self, node: &Node, op: &mut FirmwareOperation<'_>) -> Result<(), TransferError> {
        if let Some(block) = op.image.blocks().iter().find(|b| {
            b.offset < FLASH_APP_ORIGIN || b.end() > FLASH_LENGTH as u64
        }) {
            return Err(TransferError::OutOfRange {
                offset: block.offset,
                len: block.len(),
            });
        }

        self.set_address(node, FLASH_APP_ORIGIN)?;
        self.request(node, TransferStep::Erase, 0, &[], FLASH_APP_ORIGIN)?;
        debug!("Application region erased");

        let mut written: u32 = 0;
        for block in op.image.blocks() {
            let block_len = block.len();

            for (index, page) in block.data.chunks(FLASH_PAGE_SIZE as usize).enumerate() {
                let page_offset = index * FLASH_PAGE_SIZE as usize;
                let page_address = block.offset + page_offset as u32;
                self.set_address(node, page_address)?;

                let mut digest = PAGE_CRC.digest();
                for (pos, chunk) in page.chunks(BUS_CHUNK_SIZE).enumerate() {
                    digest.update(chunk);
                    let address = page_address + (pos * BUS_CHUNK_SIZE) as u32;
                    self.request(node, TransferStep::Write, PARAM_WRITE_DATA, chunk, address)?;
                }
                let crc = digest.finalize();
                self.request(
                    node,
                    TransferStep::WriteChecksum,
                    PARAM_WRITE_CHECKSUM,
                    &encode_u32(crc),
                    page_address,
                )?;

                written += page.len() as u32;
                let done = page_offset + page.len();
                debug!(
                    address = %format!("0x{:x}", page_address),
                    crc = %format!("0x{:08x}", crc),
                    "Page written"
                );
                op.sink.deliver(FirmwareEvent::Progress(
                    op.progress
                        .update(percent(done as u64, block_len as u64), written),
                ))?;
            }
        }
        Ok(())
    }

    /// Read the node's application region into `op.image`.
    ///
    /// Reads whole pages only: a limit that is not a multiple of the page
    /// size is truncated.
    #[instrument(skip(self, node, op), fields(node = %node))]
    pub fn download(&self, node: &Node, op: &mut FirmwareOperation<'_>) -> Result<(), TransferError> {
        let length = download_length(op.image.limit());
        info!(length, "Starting firmware download");

        let data = match self.read_pages(node, op, length) {
            Ok(data) => data,
            Err(e) => return Err(self.abort(node, op, e)),
        };

        op.sink
            .deliver(FirmwareEvent::Progress(op.progress.success()))?;
        info!(bytes = data.len(), "Firmware download complete");

        op.image.append_block(FLASH_APP_ORIGIN, data);
        op.sink.deliver(FirmwareEvent::Download(op.image.clone()))?;
        Ok(())
    }

    fn read_pages(
        &self,
        node: &Node,
        op: &mut FirmwareOperation<'_>,
        length: u32,
    ) -> Result<Vec<u8>, TransferError> {
        let pages = length / FLASH_PAGE_SIZE;
        let mut data = Vec::with_capacity((pages * FLASH_PAGE_SIZE) as usize);

        for page in 0..pages {
            let page_address = FLASH_APP_ORIGIN + page * FLASH_PAGE_SIZE;
            self.set_address(node, page_address)?;

            for pos in (0..FLASH_PAGE_SIZE).step_by(BUS_CHUNK_SIZE) {
                let address = page_address + pos;
                let reply = self.request(
                    node,
                    TransferStep::Read,
                    BUS_CHUNK_SIZE as u8,
                    &[],
                    address,
                )?;
                // Never keep more than was asked for, whatever the node sends.
                let room = (length as usize - data.len()).min(BUS_CHUNK_SIZE);
                data.extend_from_slice(&reply[..reply.len().min(room)]);
            }

            debug!(address = %format!("0x{:x}", page_address), "Page read");
            let done = (page + 1) * FLASH_PAGE_SIZE;
            op.sink.deliver(FirmwareEvent::Progress(
                op.progress
                    .update(percent(done as u64, length as u64), data.len() as u32),
            ))?;
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, ProgressStatus};
    use crate::transport::{Fault, SimulatedBus};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    const NODE: NodeId = NodeId::new(5);
    const UDID: Udid = Udid::from_bytes([0xCA, 0xFE, 0, 0, 0, 0, 0, 5]);

    fn setup() -> (Arc<SimulatedBus>, Node, FirmwareEngine<Arc<SimulatedBus>>) {
        let bus = Arc::new(SimulatedBus::with_timeout(Duration::from_millis(30)));
        bus.attach(NODE, UDID);
        let engine = FirmwareEngine::new(Arc::clone(&bus));
        (bus, Node::new(NODE, UDID), engine)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn progress_events(events: &[FirmwareEvent]) -> Vec<FirmwareProgress> {
        events
            .iter()
            .filter_map(|e| match e {
                FirmwareEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Sink that refuses every event after the first `accept`.
    struct RefusingSink {
        accept: usize,
        seen: AtomicUsize,
    }

    impl EventSink for RefusingSink {
        fn deliver(&self, _event: FirmwareEvent) -> Result<(), SinkError> {
            if self.seen.fetch_add(1, Ordering::SeqCst) < self.accept {
                Ok(())
            } else {
                Err(SinkError::Rejected("client closed the job".into()))
            }
        }
    }

    #[test]
    fn test_upload_writes_flash() {
        let (bus, node, engine) = setup();
        let data = pattern(200, 1);
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2000, data.clone()), &sink);
        engine.execute(&node, &mut op).unwrap();

        assert_eq!(bus.read_flash(NODE, 0x2000, data.len()).unwrap(), data);
        assert_eq!(bus.crc_errors(NODE), 0);
        // 200 bytes -> 4 pages, the last one partial
        assert_eq!(bus.checksums(NODE).len(), 4);

        let events: Vec<_> = rx.try_iter().collect();
        let progress = progress_events(&events);
        assert_eq!(progress.len(), 5);
        assert_eq!(progress[3].percent, 100);
        assert_eq!(progress[3].bytes, 200);
        assert_eq!(progress[4].status, ProgressStatus::Success);
        assert_eq!(op.progress.status, ProgressStatus::Success);
    }

    #[test]
    fn test_upload_command_sequence() {
        let (bus, node, engine) = setup();
        let data = pattern(64, 3);
        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2040, data.clone()), &crate::events::NullSink);
        engine.upload(&node, &mut op).unwrap();

        let sent = bus.sent_to(NODE);
        let functions: Vec<_> = sent.iter().map(|c| (c.function, c.param)).collect();
        let mut expected = vec![
            (SystemFunction::BootloaderSetAddress, PARAM_SPACE_FLASH),
            (SystemFunction::BootloaderErase, 0),
            (SystemFunction::BootloaderSetAddress, PARAM_SPACE_FLASH),
        ];
        expected.extend([(SystemFunction::BootloaderWrite, PARAM_WRITE_DATA); 8]);
        expected.push((SystemFunction::BootloaderWrite, PARAM_WRITE_CHECKSUM));
        assert_eq!(functions, expected);

        assert_eq!(sent[0].payload, vec![0x00, 0x00, 0x20, 0x00]);
        assert_eq!(sent[2].payload, vec![0x00, 0x00, 0x20, 0x40]);
        assert_eq!(sent[3].payload, data[..8].to_vec());
        assert_eq!(
            sent[11].payload,
            PAGE_CRC.checksum(&data).to_be_bytes().to_vec()
        );
    }

    #[test]
    fn test_page_checksums_match_independent_crc() {
        let (bus, node, engine) = setup();
        let data = pattern(256, 7);
        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x3000, data.clone()), &crate::events::NullSink);
        engine.upload(&node, &mut op).unwrap();

        let independent = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let expected: Vec<_> = data
            .chunks(64)
            .enumerate()
            .map(|(i, page)| (0x3000 + i as u32 * 64, independent.checksum(page)))
            .collect();
        assert_eq!(bus.checksums(NODE), expected);
    }

    #[test]
    fn test_upload_download_roundtrip() {
        let (_bus, node, engine) = setup();
        let mut image = FirmwareImage::new();
        image.append_block(0x2000, pattern(128, 11));
        image.append_block(0x2080, pattern(192, 42));
        let original = image.contiguous_bytes();

        let mut op = FirmwareOperation::upload(image, &crate::events::NullSink);
        engine.upload(&node, &mut op).unwrap();

        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        let mut op = FirmwareOperation::download(FirmwareImage::with_limit(original.len() as u32), &sink);
        engine.download(&node, &mut op).unwrap();

        assert_eq!(op.image.blocks().len(), 1);
        assert_eq!(op.image.blocks()[0].offset, FLASH_APP_ORIGIN);
        assert_eq!(op.image.blocks()[0].data, original);

        let events: Vec<_> = rx.try_iter().collect();
        match events.last() {
            Some(FirmwareEvent::Download(image)) => assert_eq!(image.contiguous_bytes(), original),
            other => panic!("expected download event, got {:?}", other),
        }
    }

    #[test]
    fn test_download_truncates_partial_page() {
        let (bus, node, engine) = setup();
        bus.load_flash(NODE, 0x2000, &pattern(256, 9));

        let mut op = FirmwareOperation::download(FirmwareImage::with_limit(150), &crate::events::NullSink);
        engine.download(&node, &mut op).unwrap();

        assert_eq!(op.image.blocks()[0].data, pattern(128, 9));
        let reads = bus
            .sent_to(NODE)
            .iter()
            .filter(|c| c.function == SystemFunction::BootloaderRead)
            .count();
        assert_eq!(reads, 16);
    }

    #[test]
    fn test_download_length_is_capped() {
        assert_eq!(download_length(None), FLASH_APP_LENGTH);
        assert_eq!(download_length(Some(0x100)), 0x100);
        assert_eq!(download_length(Some(0x100000)), FLASH_APP_LENGTH);
    }

    #[test]
    fn test_upload_aborts_on_missing_write_ack() {
        let (bus, node, engine) = setup();
        bus.inject_fault(NODE, SystemFunction::BootloaderWrite, 11, Fault::Silent);
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2000, pattern(256, 0)), &sink);
        let err = engine.upload(&node, &mut op).unwrap_err();

        // 9 writes per page: the 11th is the second data chunk of page 2.
        assert!(matches!(err, TransferError::ProtocolTimeout { .. }));
        assert_eq!(err.step(), Some(TransferStep::Write));
        assert_eq!(err.address(), Some(0x2048));
        assert!(err.to_string().contains("SYS_BOOTLOADER_WRITE"));
        assert!(err.to_string().contains("N5"));

        let sent = bus.sent_to(NODE);
        let last = sent.last().unwrap();
        assert_eq!(last.function, SystemFunction::BootloaderWrite);
        assert_eq!(
            sent.iter()
                .filter(|c| c.function == SystemFunction::BootloaderWrite)
                .count(),
            11
        );

        let progress = progress_events(&rx.try_iter().collect::<Vec<_>>());
        let failed = progress
            .iter()
            .filter(|p| p.status == ProgressStatus::Failed)
            .count();
        assert_eq!(failed, 1);
        assert_eq!(progress.last().unwrap().status, ProgressStatus::Failed);
        assert!(progress.iter().all(|p| p.status != ProgressStatus::Success));
    }

    #[test]
    fn test_upload_aborts_on_erase_failure() {
        let (bus, node, engine) = setup();
        bus.inject_fault(NODE, SystemFunction::BootloaderErase, 1, Fault::Silent);
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2000, pattern(64, 0)), &sink);
        let err = engine.upload(&node, &mut op).unwrap_err();
        assert_eq!(err.step(), Some(TransferStep::Erase));
        assert_eq!(bus.sent_to(NODE).len(), 2);

        let progress = progress_events(&rx.try_iter().collect::<Vec<_>>());
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].status, ProgressStatus::Failed);
    }

    #[test]
    fn test_mismatched_reply_aborts() {
        let (bus, node, engine) = setup();
        bus.inject_fault(
            NODE,
            SystemFunction::BootloaderRead,
            3,
            Fault::WrongReply(SystemFunction::BootloaderWriteAck),
        );

        let mut op = FirmwareOperation::download(FirmwareImage::with_limit(128), &crate::events::NullSink);
        let err = engine.download(&node, &mut op).unwrap_err();
        match err {
            TransferError::ProtocolMismatch {
                step,
                address,
                expected,
                actual,
                ..
            } => {
                assert_eq!(step, TransferStep::Read);
                assert_eq!(address, 0x2010);
                assert_eq!(expected, SystemFunction::BootloaderReadAck);
                assert_eq!(actual, SystemFunction::BootloaderWriteAck);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(op.progress.status, ProgressStatus::Failed);
        assert!(op.image.blocks().is_empty());
    }

    #[test]
    fn test_refusing_sink_aborts_job() {
        let (bus, node, engine) = setup();
        let sink = RefusingSink {
            accept: 1,
            seen: AtomicUsize::new(0),
        };

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2000, pattern(256, 0)), &sink);
        let err = engine.upload(&node, &mut op).unwrap_err();
        assert!(matches!(err, TransferError::SinkDelivery(SinkError::Rejected(_))));

        // Stopped right after the second page.
        let checksum_writes = bus
            .sent_to(NODE)
            .iter()
            .filter(|c| c.param == PARAM_WRITE_CHECKSUM && c.function == SystemFunction::BootloaderWrite)
            .count();
        assert_eq!(checksum_writes, 2);
        assert_eq!(sink.seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_detached_node_fails_job() {
        let (bus, node, engine) = setup();
        bus.detach(NODE);

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2000, pattern(64, 0)), &crate::events::NullSink);
        let err = engine.upload(&node, &mut op).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport {
                step: TransferStep::SetAddress,
                address: 0x2000,
                source: TransportError::Disconnected,
                ..
            }
        ));
        assert_eq!(op.progress.status, ProgressStatus::Failed);
        assert_eq!(bus.sent_to(NODE).len(), 1);
    }

    #[test]
    fn test_out_of_range_block_is_rejected() {
        let (bus, node, engine) = setup();
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x1000, pattern(64, 0)), &sink);
        let err = engine.upload(&node, &mut op).unwrap_err();
        assert!(matches!(err, TransferError::OutOfRange { offset: 0x1000, len: 64 }));
        assert!(bus.sent().is_empty());

        let progress = progress_events(&rx.try_iter().collect::<Vec<_>>());
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].status, ProgressStatus::Failed);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let (_bus, node, engine) = setup();
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        let mut op = FirmwareOperation::upload(FirmwareImage::from_binary(0x2000, pattern(640, 5)), &sink);
        engine.upload(&node, &mut op).unwrap();
        let mut op = FirmwareOperation::download(FirmwareImage::with_limit(640), &sink);
        engine.download(&node, &mut op).unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        let progress = progress_events(&events);
        // upload: 10 pages + success, download: 10 pages + success
        assert_eq!(progress.len(), 22);

        for job in progress.split(|p| p.status == ProgressStatus::Success) {
            if job.is_empty() {
                continue;
            }
            assert!(job.windows(2).all(|w| w[0].percent <= w[1].percent));
            assert!(job.windows(2).all(|w| w[0].bytes <= w[1].bytes));
            assert_eq!(job.last().unwrap().percent, 100);
        }
    }

    #[test]
    fn test_upload_percent_restarts_per_block() {
        let (_bus, node, engine) = setup();
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        let mut image = FirmwareImage::new();
        image.append_block(0x2000, pattern(128, 1));
        image.append_block(0x3000, pattern(128, 2));
        let mut op = FirmwareOperation::upload(image, &sink);
        engine.upload(&node, &mut op).unwrap();

        let progress = progress_events(&rx.try_iter().collect::<Vec<_>>());
        let percents: Vec<_> = progress.iter().map(|p| p.percent).collect();
        let bytes: Vec<_> = progress.iter().map(|p| p.bytes).collect();
        assert_eq!(percents, vec![50, 100, 50, 100, 100]);
        assert_eq!(bytes, vec![64, 128, 192, 256, 256]);
        assert_eq!(progress[4].status, ProgressStatus::Success);
    }

    #[test]
    fn test_concurrent_jobs_on_different_nodes() {
        let bus = Arc::new(SimulatedBus::with_timeout(Duration::from_millis(500)));
        let nodes: Vec<_> = (1..=3u8)
            .map(|n| {
                let udid = Udid::from_bytes([0xBE, 0xEF, 0, 0, 0, 0, 0, n]);
                bus.attach(NodeId::new(n), udid);
                Node::new(NodeId::new(n), udid)
            })
            .collect();
        let engine = FirmwareEngine::new(Arc::clone(&bus));

        std::thread::scope(|s| {
            for node in &nodes {
                let engine = &engine;
                s.spawn(move || {
                    let data = pattern(320, node.id().get());
                    let mut op = FirmwareOperation::upload(
                        FirmwareImage::from_binary(0x2000, data),
                        &crate::events::NullSink,
                    );
                    engine.upload(node, &mut op).unwrap();
                });
            }
        });

        for node in &nodes {
            assert_eq!(
                bus.read_flash(node.id(), 0x2000, 320).unwrap(),
                pattern(320, node.id().get())
            );
        }
    }
}
