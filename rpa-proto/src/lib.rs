//! Generated protobuf & gRPC service types for the bootstrap convenience RPC.
//! The robot control channel itself is `rpa_core::transport`, not gRPC; see
//! that crate's module docs.

pub mod bootstrap {
    include!(concat!(env!("OUT_DIR"), "/rpa.bootstrap.v1.rs"));
}

pub use bootstrap::*;
