//! # Hydration
//!
//! Pre-dispatch materialization of task XML. Given a fragment and a context
//! (the request document root, an optional context node, resource fetchers),
//! hydration resolves `href` inclusions, `vn:*` expansion functions, and
//! `select` references, preserving local attributes and children that the
//! reference does not displace.
//!
//! Strategies run as a fixed, composable sequence over deep copies; each
//! strategy sees the previous strategy's output. The default order runs the
//! href pass twice so inclusions pulled in by expansion get resolved too.

pub mod fetchers;
pub mod strategies;

pub use fetchers::{CompositeFetcher, FileFetcher, ResourceFetcher};
pub use strategies::{HrefStrategy, LinkStrategy, SelectStrategy};

use crate::error::{Result, ValuationError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use xmltree::Element;

/// A fragment undergoing hydration, with the context node expansion gave it
#[derive(Debug, Clone)]
pub struct HydrationItem {
    pub element: Element,
    pub context: Option<Element>,
}

/// One pass over the in-flight fragments
pub trait HydrationStrategy: Send {
    fn name(&self) -> &'static str;

    fn apply(
        &mut self,
        items: Vec<HydrationItem>,
        document_root: &Element,
    ) -> Result<Vec<HydrationItem>>;
}

/// Coordinates the registered strategies over an element
pub struct HydrationEngine {
    strategies: Vec<Box<dyn HydrationStrategy>>,
}

impl HydrationEngine {
    /// Engine with the standard strategy sequence: href, link, select, href.
    /// Both href passes share one remote-document cache.
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        let document_cache = Arc::new(Mutex::new(HashMap::new()));
        Self {
            strategies: vec![
                Box::new(HrefStrategy::with_cache(fetcher.clone(), document_cache.clone())),
                Box::new(LinkStrategy),
                Box::new(SelectStrategy::new()),
                Box::new(HrefStrategy::with_cache(fetcher, document_cache)),
            ],
        }
    }

    /// Engine resolving file references beneath `root`.
    pub fn for_root(root: &Path) -> Self {
        let fetcher: Arc<dyn ResourceFetcher> =
            Arc::new(CompositeFetcher::new(vec![Arc::new(FileFetcher::new(root))]));
        Self::new(fetcher)
    }

    pub fn with_strategies(strategies: Vec<Box<dyn HydrationStrategy>>) -> Self {
        Self { strategies }
    }

    /// Return fully hydrated copies of `element`. Strategies may multiply the
    /// fragment (expansion functions), so the result is a list.
    pub fn hydrate_element(
        &mut self,
        element: &Element,
        document_root: &Element,
        context: Option<&Element>,
    ) -> Result<Vec<HydrationItem>> {
        let initial = HydrationItem {
            element: element.clone(),
            context: context.cloned(),
        };

        let mut items = vec![initial];
        for strategy in &mut self.strategies {
            items = strategy.apply(items, document_root).map_err(|e| match e {
                ValuationError::Hydration(msg) => {
                    ValuationError::Hydration(format!("{} strategy: {msg}", strategy.name()))
                }
                other => other,
            })?;
        }
        Ok(items)
    }
}
