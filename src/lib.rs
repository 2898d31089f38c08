pub mod config;
pub mod constants;
pub mod error;
pub mod front;
pub mod hydration;
pub mod logging;
pub mod messaging;
pub mod orchestrator;
pub mod state;
pub mod web;
pub mod worker;
pub mod xml;

pub use config::Config;
pub use error::{Result, ValuationError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_load() {
        let config = Config::default();
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.http_port, 8080);
    }
}
