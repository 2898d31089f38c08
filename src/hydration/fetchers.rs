//! # Resource Fetchers
//!
//! Resolve `href` URIs to raw document bytes. The file fetcher is confined to
//! a configured root so a reference can never escape into the wider
//! filesystem; the composite fetcher tries each delegate in order.

use crate::error::{Result, ValuationError};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

/// Reads `file://` URIs and bare paths beneath a fixed root directory
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let raw = uri.strip_prefix("file://").unwrap_or(uri);
        let relative = Path::new(raw);
        let candidate = if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.root.join(relative)
        };

        let root = self
            .root
            .canonicalize()
            .map_err(|e| ValuationError::Hydration(format!("hydration root unavailable: {e}")))?;
        let resolved = candidate
            .canonicalize()
            .map_err(|e| ValuationError::Hydration(format!("cannot resolve '{uri}': {e}")))?;

        if !resolved.starts_with(&root) {
            return Err(ValuationError::Hydration(format!(
                "reference '{uri}' resolves outside the hydration root"
            )));
        }
        Ok(resolved)
    }
}

impl ResourceFetcher for FileFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        std::fs::read(&path)
            .map_err(|e| ValuationError::Hydration(format!("cannot read '{uri}': {e}")))
    }
}

/// Tries each delegate in order, returning the first success
pub struct CompositeFetcher {
    fetchers: Vec<Arc<dyn ResourceFetcher>>,
}

impl CompositeFetcher {
    pub fn new(fetchers: Vec<Arc<dyn ResourceFetcher>>) -> Self {
        Self { fetchers }
    }
}

impl ResourceFetcher for CompositeFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let mut last_error = None;
        for fetcher in &self.fetchers {
            match fetcher.fetch(uri) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ValuationError::Hydration(format!("no fetcher available for '{uri}'"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_fetcher_reads_beneath_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("market.xml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"<market name=\"LIBOR\"/>").unwrap();

        let fetcher = FileFetcher::new(dir.path());
        let bytes = fetcher.fetch("market.xml").unwrap();
        assert_eq!(bytes, b"<market name=\"LIBOR\"/>");

        let bytes = fetcher.fetch("file://market.xml").unwrap();
        assert_eq!(bytes, b"<market name=\"LIBOR\"/>");
    }

    #[test]
    fn file_fetcher_rejects_escapes_from_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let sibling = tempfile::tempdir().unwrap();
        let outside = sibling.path().join("secret.xml");
        std::fs::write(&outside, "<secret/>").unwrap();

        let fetcher = FileFetcher::new(dir.path());
        let uri = format!("../{}/secret.xml", sibling.path().file_name().unwrap().to_str().unwrap());
        assert!(fetcher.fetch(&uri).is_err());
        assert!(fetcher.fetch("missing.xml").is_err());
    }

    #[test]
    fn composite_fetcher_falls_through_to_later_delegates() {
        let empty = tempfile::tempdir().unwrap();
        let populated = tempfile::tempdir().unwrap();
        std::fs::write(populated.path().join("doc.xml"), "<doc/>").unwrap();

        let composite = CompositeFetcher::new(vec![
            Arc::new(FileFetcher::new(empty.path())),
            Arc::new(FileFetcher::new(populated.path())),
        ]);
        assert_eq!(composite.fetch("doc.xml").unwrap(), b"<doc/>");
        assert!(composite.fetch("absent.xml").is_err());
    }
}
