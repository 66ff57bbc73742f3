// Minepool Daemon Library
// Exposes internal modules for integration tests and embedding

extern crate log;

pub mod config;
pub mod core;
pub mod events;
pub mod stratum;
pub mod validator;
