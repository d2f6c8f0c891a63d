//! Block-extent allocator and epoch aggregation/discard core for a
//! versioned object store.
//!
//! This crate implements the allocator (component C3/C4/C5: the
//! compound free-extent index, the reservation engine, and the
//! quarantine/unmap pipeline) and the epoch garbage collector
//! (component C6/C7: aggregation and discard) against a small set of
//! external collaborator traits (`external` module) rather than against
//! any particular storage engine. Production use supplies real
//! implementations of those traits; this crate's own tests and its
//! `maintenance` binary use the in-memory reference implementations in
//! `memstore`.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod error;
pub mod extent;
pub mod external;
pub mod memstore;
pub mod vea;

pub use clock::{Clock, SystemClock, TestClock};
pub use config::VeaConfig;
pub use error::{CoreError, CoreResult};
pub use vea::Vea;
