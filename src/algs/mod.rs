//! Transport-level building blocks: the communicator façade and the wire format.

pub mod communicator;
pub mod wire;

pub use communicator::{CommTag, Communicator, LocalComm, LocalWorld, NoComm, ReduceOp, Wait};
