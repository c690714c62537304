//! # Cadence Core
//!
//! Shared foundation for the Cadence sequence engine: the sequence/enrollment
//! data model, unified error types, TOML configuration, and the traits that
//! the engine's external collaborators implement (delivery transport,
//! variable source, follow-up task sink).

pub mod config;
pub mod error;
pub mod model;
pub mod traits;

pub use config::{CadenceConfig, RetryConfig};
pub use error::{CadenceError, Result};
pub use model::{
    Channel, ConditionKind, DelayUnit, DeliveryReceipt, EngagementEvent, EngagementLedger,
    Enrollment, EnrollmentStatus, EventKind, EventTarget, OutboundMessage, Sequence,
    SequenceDefinition, SequenceSettings, SequenceStatus, Step, StepCondition, StepEngagement,
    StepKind, Variables,
};
pub use traits::{DeliveryTransport, TaskSink, VariableSource};
