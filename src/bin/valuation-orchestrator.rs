//! # Valuation Orchestrator Runner
//!
//! Runs one request orchestrator from a JSON invocation payload. Used for
//! operational replays and local development; in normal operation the
//! gateway invokes orchestrators directly.
//!
//! ```bash
//! valuation-orchestrator '{"requestId":"…","xmlKey":"…","responseKey":"…"}'
//! ```

use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use valuation_core::logging;
use valuation_core::messaging::RedisStore;
use valuation_core::orchestrator::{OrchestratorInvocation, RequestOrchestrator};
use valuation_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let payload = std::env::args()
        .nth(1)
        .context("usage: valuation-orchestrator <invocation-json>")?;
    let invocation: OrchestratorInvocation =
        serde_json::from_str(&payload).context("invalid invocation payload")?;

    let config = Arc::new(Config::from_env()?);
    let store = RedisStore::connect(&config.redis_url).await?;

    if store.get(&invocation.xml_key).await?.is_none() {
        anyhow::bail!(
            "request XML {} is missing before invocation",
            invocation.xml_key
        );
    }

    info!(
        request_id = %invocation.request_id,
        execution_token = %invocation.execution_token,
        "Running request orchestrator"
    );

    let orchestrator = RequestOrchestrator::new(store, config);
    let outcome = orchestrator.run(invocation).await?;

    info!(
        response_key = %outcome.response_key,
        groups = outcome.group_count,
        "Orchestration complete"
    );
    Ok(())
}
