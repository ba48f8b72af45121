pub mod config;
pub mod core;
pub mod equalize;
pub mod error;
pub mod graph;
pub mod matches;
pub mod network;
pub mod node_id;
pub mod quantization;

pub use error::{Error, Result};
pub use network::Network;
