pub mod config;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod node;
pub mod proxy;
pub mod scheduler;
pub mod shutdown;
pub mod transfer;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("builder");
}
