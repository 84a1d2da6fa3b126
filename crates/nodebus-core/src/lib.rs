//! Nodebus-Core: node registry and bootloader firmware engine for a node bus daemon.
//!
//! Nodes on the bus are identified by a 64-bit hardware id and addressed by
//! a 7-bit bus address assigned by the daemon. This crate keeps track of the
//! connected nodes and drives the bootloader protocol used to upload and
//! download their application firmware.
//!
//! # Architecture
//!
//! - **Id**: Hardware ids and bus addresses
//! - **Node**: Per-node state, attributes and `$(name)` expansion
//! - **Cache**: Persistent hardware id -> address bindings
//! - **Registry**: Concurrent node table and address allocation
//! - **Protocol**: Bootloader function codes and flash geometry
//! - **Transport**: Bus abstraction, reply routing and a simulated bus
//! - **Firmware**: Firmware images and the upload/download engine
//! - **Events**: Progress and result delivery to clients
//! - **Config**: Daemon configuration file
//!
//! # Example
//!
//! ```no_run
//! use nodebus_core::{FirmwareEngine, FirmwareImage, FirmwareOperation, NodeRegistry};
//! use nodebus_core::{SimulatedBus, TracingSink, Udid};
//!
//! let registry = NodeRegistry::new();
//! let udid: Udid = "00:11:22:33:44:55:66:77".parse().expect("valid udid");
//! let node = registry.register(udid).expect("registry full");
//!
//! let bus = SimulatedBus::new();
//! bus.attach(node.id(), node.udid());
//!
//! let engine = FirmwareEngine::new(bus);
//! let image = FirmwareImage::from_binary(0x2000, vec![0u8; 256]);
//! let mut op = FirmwareOperation::upload(image, &TracingSink);
//! engine.execute(&node, &mut op).expect("upload failed");
//! ```

pub mod cache;
pub mod config;
pub mod events;
pub mod firmware;
pub mod id;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-exports for convenience
pub use cache::{CacheError, FileNodeCache, MemoryNodeCache, NodeCache};
pub use config::DaemonConfig;
pub use events::{
    ChannelSink, EventSink, FirmwareEvent, FirmwareProgress, NullSink, ProgressStatus, SinkError,
    TracingSink,
};
pub use firmware::{
    FirmwareBlock, FirmwareEngine, FirmwareImage, FirmwareOperation, OperationKind,
    TransferError, TransferStep,
};
pub use id::{IdError, NodeId, Udid};
pub use node::{Node, NodeState};
pub use protocol::SystemFunction;
pub use registry::{NodeRegistry, RegistryError};
pub use transport::{BusTransport, SimulatedBus, TransportError};
