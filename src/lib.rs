// src/lib.rs

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod foreman;
pub mod keygen;
pub mod manager;
pub mod order;
pub mod partition;
pub mod phase;
pub mod report;
pub mod size_parser;
pub mod stats;
pub mod wire;
pub mod worker;

/// Generated gRPC types for the manager/foreman protocol.
pub mod pb {
    tonic::include_proto!("fleetbench");
}

pub use error::{BenchError, Result};
pub use manager::{Job, Manager, ManagerSettings};
pub use order::{ConnectionType, Order, PhaseTiming};
pub use report::Report;
