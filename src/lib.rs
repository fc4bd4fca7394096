// Library modules
pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod node;
pub mod protocol;

// Re-export commonly used types
pub use broker::state::{AlgorithmId, BrokerState, NodeId, SubtaskId, TaskId};
pub use broker::Broker;
pub use client::{run_job, Job};
pub use config::Config;
pub use protocol::wire::{Connection, WireError};
pub use protocol::{Command, Packet, Response};
