//! Gateway: wires the ingestion pipeline and serves the status endpoint.
//!
//! One process holds one platform connection. `GET /` reports runtime and
//! connection health for probes.

mod server;

pub use server::{forwarding_handlers, run_gateway, serve, Pipeline};
