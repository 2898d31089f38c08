//! # Web Application State
//!
//! Shared state cloned into every handler: the datastore handle, the
//! configuration, and the submission service.

use crate::config::Config;
use crate::front::SubmissionService;
use crate::messaging::RedisStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: RedisStore,
    pub config: Arc<Config>,
    pub submission: Arc<SubmissionService>,
}

impl AppState {
    pub fn new(store: RedisStore, config: Arc<Config>) -> Self {
        let submission = Arc::new(SubmissionService::new(store.clone(), config.clone()));
        Self {
            store,
            config,
            submission,
        }
    }
}
