//! # Messaging
//!
//! The shared-datastore contract: stream records exchanged between the
//! gateway, the request orchestrator, and task workers, plus the Redis
//! adapter they all ride on.

pub mod events;
pub mod redis_client;

pub use events::{
    IngressEnvelope, LifecycleEvent, LifecycleStatus, TaskDispatch, TaskUpdate, TaskUpdateStatus,
};
pub use redis_client::{DedicatedConnection, RedisStore, StreamEntry};
