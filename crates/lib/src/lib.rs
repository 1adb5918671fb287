//! Hark core library: event ingestion for a push-based chat platform.
//!
//! Inbound envelopes arrive over one persistent connection, pass admission and
//! deduplication, and are routed to downstream collaborators on their own tasks.

pub mod clock;
pub mod config;
pub mod connection;
pub mod event;
pub mod gateway;
pub mod handoff;
pub mod ingest;
pub mod init;
pub mod routing;
