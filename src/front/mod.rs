//! # Front Orchestrator
//!
//! The ingress edge: accepts submissions, persists payloads, emits ingress
//! envelopes, consumes them under the shared gateway group, and offers
//! synchronous waiting layered over the asynchronous pipeline.

pub mod ingress;
pub mod submission;
pub mod sync_waiter;

pub use ingress::IngressConsumer;
pub use submission::{
    ResultsOutcome, StatusView, SubmissionMode, SubmissionOutcome, SubmissionService,
};
pub use sync_waiter::SyncWaiter;
