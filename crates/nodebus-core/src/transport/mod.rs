//! Transport layer module.

pub mod router;
pub mod sim;
pub mod traits;

pub use router::{Reply, ReplyRouter};
pub use sim::{Fault, SentCommand, SimulatedBus};
pub use traits::{BusTransport, TransportError};
