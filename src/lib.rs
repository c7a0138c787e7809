#![deny(clippy::unwrap_used)]

pub mod assembler;
pub mod config;
pub mod control;
pub mod mapping;
pub mod mapping_sync;
pub mod orchestrator;
pub mod service;
pub mod transaction;
