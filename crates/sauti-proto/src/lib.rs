//! Generated protobuf types and gRPC stubs for the sauti gateway.

pub mod inference {
    pub mod v1 {
        tonic::include_proto!("sauti.inference.v1");
    }
}
