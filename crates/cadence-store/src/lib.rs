//! # Cadence Store
//!
//! SQLite-backed persistence for the sequence engine. Survives restarts,
//! supports concurrent worker access (WAL + busy timeout).
//!
//! The enrollment row is the engine's only shared mutable state; every
//! cross-worker coordination reduces to one conditional UPDATE on it:
//! - `claim_due` leases due enrollments to a worker (the claim race is closed
//!   here, at the storage layer, never by read-then-write in the engine).
//! - `update_if_unleased` lets the event ingestor apply external signals
//!   without clobbering a concurrently processing worker.

pub mod db;
pub mod definitions;
pub mod enrollments;

pub use db::SequenceDb;
