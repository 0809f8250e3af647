//! logferry - container log shipping agent and collector
//!
//! The agent tails Docker json-file logs, batches their payloads and forwards
//! them over a length-framed TCP protocol. The collector appends each stream
//! to a per-container file, rotates full files and expires old backups.

pub mod agent;
pub mod collector;
pub mod config;
pub mod logs;
pub mod metrics;
pub mod protocol;
