//! # Cadence Engine
//!
//! The sequence engine: advances per-recipient enrollments through ordered
//! email/sms/delay/condition steps under business-hour constraints, with
//! engagement-based branching and early termination on reply, bounce, or
//! unsubscribe.
//!
//! ## Architecture
//! ```text
//! Dispatcher workers (tokio interval)
//!   ├── claim_due → lease a batch of due enrollments (cadence-store)
//!   ├── drain buffered events (reply/bounce may pre-empt the step)
//!   ├── StepProcessor.process_step per enrollment
//!   │     ├── email/sms → render variables → DeliveryTransport.send
//!   │     ├── delay     → window::next_permitted / business-day arithmetic
//!   │     └── condition → condition::evaluate → branch
//!   └── persist + release lease (success or failure)
//!
//! EventIngestor (independent)
//!   └── open/click/reply/bounce/unsubscribe → apply or buffer
//! ```

pub mod backoff;
pub mod condition;
pub mod dispatcher;
pub mod enroll;
pub mod ingest;
pub mod machine;
pub mod render;
pub mod transport;
pub mod window;

pub use dispatcher::{spawn_workers, Dispatcher, WorkerStats};
pub use enroll::{enroll, pause_enrollment, resume_enrollment};
pub use ingest::{EventIngestor, IngestOutcome};
pub use machine::{apply_engagement, pause, resume, ProcessOutcome, StepProcessor};
pub use transport::{DryRunTransport, NoopTaskSink, StaticVariables};
