pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod peer_registry;
pub mod signaling;
pub mod transfer;
