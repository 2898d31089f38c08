//! # XML Handling
//!
//! Document parsing, the project/group/task model extracted from submissions,
//! task payload composition, response assembly, and the path subset used to
//! resolve references inside documents.

pub mod paths;
pub mod project;

pub use project::{GroupPlan, ProjectPlan, ValuationPlan};

use crate::error::{Result, ValuationError};
use xmltree::{Element, EmitterConfig, XMLNode};

/// Parse a well-formed XML document. The error is an input-class error; the
/// HTTP edge maps it to 400.
pub fn parse_document(xml: &str) -> Result<Element> {
    Element::parse(xml.as_bytes()).map_err(|e| ValuationError::InvalidInput(format!("bad XML: {e}")))
}

/// Serialize an element without an XML declaration.
pub fn element_to_string(element: &Element) -> Result<String> {
    let mut buffer = Vec::new();
    let config = EmitterConfig::new().write_document_declaration(false);
    element
        .write_with_config(&mut buffer, config)
        .map_err(|e| ValuationError::Xml(format!("serialization failed: {e}")))?;
    String::from_utf8(buffer).map_err(|e| ValuationError::Xml(format!("non-UTF-8 output: {e}")))
}

/// Child elements of `element`, in document order.
pub fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(XMLNode::as_element)
}

/// Replace the text content of `element`, leaving child elements in place.
pub fn set_text(element: &mut Element, text: &str) {
    element
        .children
        .retain(|node| !matches!(node, XMLNode::Text(_)));
    element.children.push(XMLNode::Text(text.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_malformed_documents() {
        assert!(parse_document("<open>").is_err());
        assert!(parse_document("not xml at all").is_err());
        assert!(parse_document("<ok/>").is_ok());
    }

    #[test]
    fn serialization_omits_the_declaration() {
        let element = parse_document("<a><b x=\"1\"/></a>").unwrap();
        let rendered = element_to_string(&element).unwrap();
        assert!(!rendered.contains("<?xml"));
        assert!(rendered.contains("<b"));
    }

    #[test]
    fn set_text_replaces_existing_text_only() {
        let mut element = parse_document("<amount>old<unit>USD</unit></amount>").unwrap();
        set_text(&mut element, "42.00");
        let rendered = element_to_string(&element).unwrap();
        assert!(rendered.contains("42.00"));
        assert!(!rendered.contains("old"));
        assert!(rendered.contains("USD"));
    }
}
