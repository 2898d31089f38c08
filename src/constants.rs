//! # System Constants
//!
//! Stream names, consumer group names, and datastore key templates that define
//! the wire contract shared by the gateway, the request orchestrator, and the
//! task workers. Every key a request touches lives under `cache:*` or
//! `state:*` so terminal cleanup can expire them by pattern.

/// Shared stream names
pub mod streams {
    /// Ingress envelopes handed from the HTTP edge to the background pipeline
    pub const REQUEST_INGEST: &str = "stream:request:ingest";
    /// Broadcast lifecycle transitions, read without a consumer group
    pub const REQUEST_LIFECYCLE: &str = "stream:request:lifecycle";
    /// Task fan-out, consumed by the shared worker group
    pub const TASK_DISPATCH: &str = "stream:task:dispatch";
    /// Task fan-in, consumed by per-request orchestrator groups
    pub const TASK_UPDATES: &str = "stream:task:updates";
}

/// Consumer group names
pub mod groups {
    /// Shared group load-balancing ingress envelopes across gateway instances
    pub const INGRESS_CONSUMERS: &str = "front-orchestrators";
    /// Shared group load-balancing dispatches across worker instances
    pub const TASK_WORKERS: &str = "task-workers";

    /// Request-scoped group on the task-update stream, one per orchestrator
    pub fn request_updates(request_id: &str) -> String {
        format!("req::{request_id}")
    }
}

/// Datastore key templates
pub mod keys {
    pub fn request_state(request_id: &str) -> String {
        format!("state:request:{request_id}")
    }

    pub fn group_state(request_id: &str, group_idx: usize) -> String {
        format!("state:request:{request_id}:group:{group_idx}")
    }

    pub fn request_xml(request_id: &str) -> String {
        format!("cache:request:{request_id}:xml")
    }

    pub fn request_response(request_id: &str) -> String {
        format!("cache:request:{request_id}:response")
    }

    pub fn request_metadata(request_id: &str) -> String {
        format!("cache:request:{request_id}:metadata")
    }

    pub fn request_failure(request_id: &str) -> String {
        format!("cache:request:{request_id}:failure")
    }

    pub fn task_xml(request_id: &str, group_idx: usize, task_id: &str) -> String {
        format!("cache:task:{request_id}:{group_idx}:{task_id}:xml")
    }

    pub fn task_result(request_id: &str, group_idx: usize, task_id: &str) -> String {
        format!("cache:task:{request_id}:{group_idx}:{task_id}:result")
    }

    /// Attempt-suffixed result key. Workers write here first so that a stale
    /// retry can never clobber the canonical result of a newer attempt.
    pub fn task_attempt_result(
        request_id: &str,
        group_idx: usize,
        task_id: &str,
        attempt: u32,
    ) -> String {
        format!("cache:task:{request_id}:{group_idx}:{task_id}:result:{attempt}")
    }

    /// Records the highest attempt whose result was promoted to the canonical key
    pub fn task_result_attempt(request_id: &str, group_idx: usize, task_id: &str) -> String {
        format!("cache:task:{request_id}:{group_idx}:{task_id}:result-attempt")
    }

    pub fn idempotency(submitter_key: &str) -> String {
        format!("idempotency:{submitter_key}")
    }

    /// Pattern matching every cache entry a request owns
    pub fn request_cache_pattern(request_id: &str) -> String {
        format!("cache:request:{request_id}:*")
    }

    /// Pattern matching every task-scoped cache entry a request owns
    pub fn task_cache_pattern(request_id: &str) -> String {
        format!("cache:task:{request_id}:*")
    }

    /// Pattern matching every state hash a request owns
    pub fn request_state_pattern(request_id: &str) -> String {
        format!("state:request:{request_id}*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_templates_embed_identifiers() {
        assert_eq!(keys::request_state("abc"), "state:request:abc");
        assert_eq!(keys::group_state("abc", 2), "state:request:abc:group:2");
        assert_eq!(
            keys::task_result("abc", 1, "g2-t1-px"),
            "cache:task:abc:1:g2-t1-px:result"
        );
        assert_eq!(
            keys::task_attempt_result("abc", 1, "g2-t1-px", 3),
            "cache:task:abc:1:g2-t1-px:result:3"
        );
    }

    #[test]
    fn request_group_name_is_scoped() {
        assert_eq!(groups::request_updates("abc"), "req::abc");
    }
}
