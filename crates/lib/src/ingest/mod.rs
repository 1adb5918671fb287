//! Ingestion gate: the admission filter and the deduplication cache every
//! inbound event passes before it is classified.

mod admission;
mod dedup;

pub use admission::{admit, normalize_epoch_ms, Admission, AdmissionPolicy};
pub use dedup::{dedup_key, DedupCache, DedupSettings};
