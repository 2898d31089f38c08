//! # Valuation Engine Seam
//!
//! The worker treats the valuation computation as a black box behind a trait.
//! The default engine shells out to an external pricing command and writes
//! the produced amount into the task document.

use crate::config::Config;
use crate::error::{Result, ValuationError};
use crate::xml::{child_elements, element_to_string, parse_document, set_text};
use async_trait::async_trait;
use std::path::PathBuf;
use xmltree::{Element, XMLNode};

#[async_trait]
pub trait ValuationEngine: Send + Sync {
    /// Execute one valuation over a task document, returning the serialized
    /// result. Failures surface as task failures, never as panics.
    async fn evaluate(&self, task_xml: &str) -> Result<String>;
}

/// Default engine: prices via an external command whose stdout is the amount
pub struct PricingCommandEngine {
    command: PathBuf,
}

impl PricingCommandEngine {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let command = config.pricing_command.clone().ok_or_else(|| {
            ValuationError::Configuration(
                "VALUATION_PRICING_COMMAND must be set for the pricing engine".to_string(),
            )
        })?;
        Ok(Self::new(command))
    }

    async fn generate_amount(&self) -> Result<String> {
        let output = tokio::process::Command::new(&self.command)
            .output()
            .await
            .map_err(|e| {
                ValuationError::Internal(format!(
                    "failed to invoke pricing command {:?}: {e}",
                    self.command
                ))
            })?;

        if !output.status.success() {
            return Err(ValuationError::Internal(format!(
                "pricing command {:?} exited with {}",
                self.command, output.status
            )));
        }

        let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let amount: f64 = raw.parse().map_err(|_| {
            ValuationError::Internal(format!("pricing command returned invalid output {raw:?}"))
        })?;
        if amount <= 0.0 {
            return Err(ValuationError::Internal(
                "pricing command returned a non-positive value".to_string(),
            ));
        }
        Ok(format!("{amount:.2}"))
    }
}

#[async_trait]
impl ValuationEngine for PricingCommandEngine {
    async fn evaluate(&self, task_xml: &str) -> Result<String> {
        let mut document = parse_document(task_xml)
            .map_err(|e| ValuationError::Internal(format!("task payload: {e}")))?;

        if has_amount_node(&document) {
            let amount = self.generate_amount().await?;
            write_amount(&mut document, &amount);
        }
        element_to_string(&document)
    }
}

/// Whether the document contains an `analytics/price/amount` chain.
fn has_amount_node(element: &Element) -> bool {
    if element.name == "analytics" {
        if let Some(price) = element.get_child("price") {
            if price.get_child("amount").is_some() {
                return true;
            }
        }
    }
    child_elements(element).any(has_amount_node)
}

/// Write `value` into the first `analytics/price/amount` node found.
fn write_amount(element: &mut Element, value: &str) -> bool {
    if element.name == "analytics" {
        if let Some(price) = element.get_mut_child("price") {
            if let Some(amount) = price.get_mut_child("amount") {
                set_text(amount, value);
                return true;
            }
        }
    }
    for node in &mut element.children {
        if let XMLNode::Element(child) = node {
            if write_amount(child, value) {
                return true;
            }
        }
    }
    false
}
