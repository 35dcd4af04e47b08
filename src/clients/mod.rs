//! Client side of the mux: the bounded registry and the wire protocol.

pub mod protocol;
pub mod registry;

pub use registry::{ClientId, ClientRegistry, Verdict};
