//! # Path Resolution
//!
//! The slice of path syntax valuation documents actually use: absolute steps
//! (`/project/market`), relative steps (`./curve`), self (`.`), descendant
//! search (`.//leg` or `//leg`), and attribute-equality predicates
//! (`market[@name='LIBOR']`).

use crate::error::{Result, ValuationError};
use crate::xml::child_elements;
use xmltree::Element;

#[derive(Debug, Clone, PartialEq)]
struct Step {
    name: String,
    predicate: Option<(String, String)>,
}

fn parse_step(raw: &str) -> Result<Step> {
    if raw.is_empty() {
        return Err(ValuationError::Xml("empty path step".to_string()));
    }
    match raw.find('[') {
        None => Ok(Step {
            name: raw.to_string(),
            predicate: None,
        }),
        Some(open) => {
            let name = raw[..open].to_string();
            let body = raw[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| ValuationError::Xml(format!("unterminated predicate in {raw:?}")))?;
            let body = body.strip_prefix('@').ok_or_else(|| {
                ValuationError::Xml(format!("unsupported predicate in {raw:?}; expected [@attr='v']"))
            })?;
            let (attr, value) = body.split_once('=').ok_or_else(|| {
                ValuationError::Xml(format!("predicate in {raw:?} is not an equality test"))
            })?;
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .ok_or_else(|| {
                    ValuationError::Xml(format!("predicate value in {raw:?} must be quoted"))
                })?;
            Ok(Step {
                name,
                predicate: Some((attr.to_string(), value.to_string())),
            })
        }
    }
}

fn matches(element: &Element, step: &Step) -> bool {
    if element.name != step.name {
        return false;
    }
    match &step.predicate {
        None => true,
        Some((attr, value)) => element.attributes.get(attr).map(String::as_str) == Some(value.as_str()),
    }
}

/// All element descendants of `root`, depth-first, excluding `root` itself.
pub fn descendants(root: &Element) -> Vec<&Element> {
    let mut found = Vec::new();
    let mut stack: Vec<&Element> = child_elements(root).collect();
    stack.reverse();
    while let Some(element) = stack.pop() {
        found.push(element);
        let mut children: Vec<&Element> = child_elements(element).collect();
        children.reverse();
        stack.extend(children);
    }
    found
}

/// Evaluate a path expression against `root`, returning matches in document
/// order. Absolute expressions treat `root` as the document root; relative
/// expressions (`.`, `./…`, `.//…`) resolve against `root` directly.
pub fn find_all<'a>(root: &'a Element, expr: &str) -> Result<Vec<&'a Element>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ValuationError::Xml("empty path expression".to_string()));
    }

    if expr == "." {
        return Ok(vec![root]);
    }

    if let Some(rest) = expr.strip_prefix(".//").or_else(|| expr.strip_prefix("//")) {
        let step = parse_step(rest)?;
        return Ok(descendants(root)
            .into_iter()
            .filter(|&element| matches(element, &step))
            .collect());
    }

    if let Some(rest) = expr.strip_prefix("./") {
        return walk(vec![root], rest);
    }

    if let Some(rest) = expr.strip_prefix('/') {
        // The first absolute step may name the document root itself, or a
        // child of it when callers hand us an enclosing envelope element.
        let mut steps = rest.split('/');
        let first_raw = steps
            .next()
            .ok_or_else(|| ValuationError::Xml(format!("empty absolute path {expr:?}")))?;
        let first = parse_step(first_raw)?;
        let cursor: Vec<&Element> = if matches(root, &first) {
            vec![root]
        } else {
            child_elements(root)
                .filter(|&element| matches(element, &first))
                .collect()
        };
        let remainder: Vec<&str> = steps.collect();
        return walk(cursor, &remainder.join("/"));
    }

    Err(ValuationError::Xml(format!(
        "path {expr:?} must be absolute or relative"
    )))
}

/// Evaluate a path and require exactly one element match.
pub fn find_one<'a>(root: &'a Element, expr: &str) -> Result<&'a Element> {
    let found = find_all(root, expr)?;
    if found.len() != 1 {
        return Err(ValuationError::Hydration(format!(
            "path {expr:?} resolved to {} elements; expected exactly one",
            found.len()
        )));
    }
    Ok(found[0])
}

fn walk<'a>(mut cursor: Vec<&'a Element>, rest: &str) -> Result<Vec<&'a Element>> {
    if rest.is_empty() {
        return Ok(cursor);
    }
    for raw in rest.split('/') {
        let step = parse_step(raw)?;
        let mut next = Vec::new();
        for element in cursor {
            next.extend(child_elements(element).filter(|&child| matches(child, &step)));
        }
        cursor = next;
    }
    Ok(cursor)
}
