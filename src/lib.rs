//! Experiment assignment and analytics engine.
//!
//! Decides which variant of an experiment a session sees, records behavioral
//! events against that assignment, and derives descriptive metrics from the
//! raw event log. The HTTP surface lives in `compass-http`.

pub mod error;
pub mod experiments;

pub use error::{ExperimentError, Result};
pub use experiments::service::{
    AssignOutcome, Bucketing, ExperimentService, ServiceConfig, TrackPolicy,
};
