//! Harvest gRPC API
//!
//! This crate defines the gRPC protocol for agent ↔ server communication.
//! The protobuf definitions are in `proto/metrics.proto` and code-generated
//! via `tonic-build`.

// Include the generated code
pub mod metrics {
    pub mod v1 {
        tonic::include_proto!("metrics.v1");
    }
}
