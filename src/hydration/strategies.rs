//! # Hydration Strategies
//!
//! Three passes compose the hydration pipeline:
//! - href inclusion: fetch a remote document and merge the referenced node
//!   under local precedence,
//! - expansion functions: `use="vn:link(path, child)"` clones the annotated
//!   element once per matched child node,
//! - select references: replace a node with a copy of the element its
//!   `select` path resolves to.

use crate::error::{Result, ValuationError};
use crate::hydration::fetchers::ResourceFetcher;
use crate::hydration::{HydrationItem, HydrationStrategy};
use crate::xml::paths::{descendants, find_all, find_one};
use crate::xml::{child_elements, parse_document};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use xmltree::{Element, XMLNode};

/// Merge identity of a child element: keyed by name/id when present, by
/// position otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChildKey {
    tag: String,
    attr: Option<(String, String)>,
    position: usize,
}

fn child_key(element: &Element, position: usize) -> ChildKey {
    for attr in ["name", "id"] {
        if let Some(value) = element.attributes.get(attr) {
            return ChildKey {
                tag: element.name.clone(),
                attr: Some((attr.to_string(), value.clone())),
                position: 0,
            };
        }
    }
    ChildKey {
        tag: element.name.clone(),
        attr: None,
        position,
    }
}

fn child_signature(element: &Element) -> (String, Option<(String, String)>) {
    let key = child_key(element, 0);
    (key.tag, key.attr)
}

fn trimmed_text(element: &Element) -> Option<String> {
    element
        .get_text()
        .map(|text| text.into_owned())
        .filter(|text| !text.trim().is_empty())
}

/// Resolves `href` attributes by merging in externally fetched XML
pub struct HrefStrategy {
    fetcher: Arc<dyn ResourceFetcher>,
    document_cache: Arc<Mutex<HashMap<String, Element>>>,
}

impl HrefStrategy {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>) -> Self {
        Self::with_cache(fetcher, Arc::new(Mutex::new(HashMap::new())))
    }

    pub fn with_cache(
        fetcher: Arc<dyn ResourceFetcher>,
        document_cache: Arc<Mutex<HashMap<String, Element>>>,
    ) -> Self {
        Self {
            fetcher,
            document_cache,
        }
    }

    fn remote_document(&self, uri: &str) -> Result<Element> {
        let mut cache = self
            .document_cache
            .lock()
            .map_err(|_| ValuationError::Internal("hydration cache poisoned".to_string()))?;
        if let Some(document) = cache.get(uri) {
            return Ok(document.clone());
        }
        let bytes = self.fetcher.fetch(uri)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ValuationError::Hydration(format!("'{uri}' is not UTF-8: {e}")))?;
        let document = parse_document(&text)
            .map_err(|_| ValuationError::Hydration(format!("unable to parse XML from '{uri}'")))?;
        cache.insert(uri.to_string(), document.clone());
        Ok(document)
    }

    fn resolve_node(&self, local: &Element, path: &str) -> Result<Element> {
        let uri = local
            .attributes
            .get("href")
            .cloned()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                ValuationError::Hydration(format!(
                    "element <{}> has an empty href attribute",
                    local.name
                ))
            })?;

        let remote_root = self.remote_document(&uri)?;
        let remote = locate_remote_node(local, &remote_root, path, &uri)?;
        let mut merged = merge_nodes(local, &remote);
        merged.attributes.remove("href");
        Ok(merged)
    }

    fn hydrate_tree(&self, element: &mut Element) -> Result<()> {
        while element.attributes.contains_key("href") {
            let merged = self.resolve_node(element, &format!("/{}", element.name))?;
            *element = merged;
        }
        // Merged content may carry further references, so run to fixpoint.
        loop {
            let ancestors = vec![element.name.clone()];
            if !self.resolve_first_descendant(element, &ancestors)? {
                break;
            }
        }
        Ok(())
    }

    fn resolve_first_descendant(&self, parent: &mut Element, ancestors: &[String]) -> Result<bool> {
        for index in 0..parent.children.len() {
            let (has_href, child_name) = match parent.children[index].as_element() {
                Some(child) => (child.attributes.contains_key("href"), child.name.clone()),
                None => continue,
            };

            if has_href {
                let merged = match parent.children[index].as_element() {
                    Some(child) => {
                        let mut path = String::new();
                        for name in ancestors {
                            path.push('/');
                            path.push_str(name);
                        }
                        path.push('/');
                        path.push_str(&child_name);
                        self.resolve_node(child, &path)?
                    }
                    None => continue,
                };
                parent.children[index] = XMLNode::Element(merged);
                return Ok(true);
            }

            let mut next = ancestors.to_vec();
            next.push(child_name);
            if let Some(child) = parent.children[index].as_mut_element() {
                if self.resolve_first_descendant(child, &next)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

impl HydrationStrategy for HrefStrategy {
    fn name(&self) -> &'static str {
        "href"
    }

    fn apply(
        &mut self,
        mut items: Vec<HydrationItem>,
        _document_root: &Element,
    ) -> Result<Vec<HydrationItem>> {
        for item in &mut items {
            self.hydrate_tree(&mut item.element)?;
        }
        Ok(items)
    }
}

fn locate_remote_node(
    local: &Element,
    remote_root: &Element,
    path: &str,
    uri: &str,
) -> Result<Element> {
    let path_matches = find_all(remote_root, path)?;
    if path_matches.len() == 1 {
        return Ok(path_matches[0].clone());
    }

    for attr in ["name", "id"] {
        let Some(value) = local.attributes.get(attr) else {
            continue;
        };
        let mut candidates: Vec<&Element> = Vec::new();
        if remote_root.name == local.name
            && remote_root.attributes.get(attr).map(String::as_str) == Some(value.as_str())
        {
            candidates.push(remote_root);
        }
        candidates.extend(descendants(remote_root).into_iter().filter(|element| {
            element.name == local.name
                && element.attributes.get(attr).map(String::as_str) == Some(value.as_str())
        }));
        if candidates.len() == 1 {
            return Ok(candidates[0].clone());
        }
    }

    let mut tag_matches: Vec<&Element> = Vec::new();
    if remote_root.name == local.name {
        tag_matches.push(remote_root);
    }
    tag_matches.extend(
        descendants(remote_root)
            .into_iter()
            .filter(|element| element.name == local.name),
    );
    if tag_matches.len() == 1 {
        return Ok(tag_matches[0].clone());
    }

    Err(ValuationError::Hydration(format!(
        "document at '{uri}' does not contain a single match for path '{path}'"
    )))
}

/// Merge `remote` into `local` under local precedence: local attributes win
/// (except `href`), local text wins when non-blank, children merge by
/// (tag, name/id) key with unmatched remote children appended.
fn merge_nodes(local: &Element, remote: &Element) -> Element {
    let mut merged = Element::new(&remote.name);

    for (name, value) in &remote.attributes {
        merged.attributes.insert(name.clone(), value.clone());
    }
    for (name, value) in &local.attributes {
        if name == "href" {
            continue;
        }
        merged.attributes.insert(name.clone(), value.clone());
    }

    let text = trimmed_text(local).or_else(|| trimmed_text(remote));

    let remote_children: Vec<&Element> = child_elements(remote).collect();
    let mut remote_lookup: HashMap<ChildKey, usize> = HashMap::new();
    for (position, &child) in remote_children.iter().enumerate() {
        remote_lookup.entry(child_key(child, position)).or_insert(position);
    }

    let mut consumed: HashSet<ChildKey> = HashSet::new();
    let mut merged_children: Vec<Element> = Vec::new();

    for (position, local_child) in child_elements(local).enumerate() {
        let key = child_key(local_child, position);
        match remote_lookup.get(&key) {
            Some(&remote_position) => {
                merged_children.push(merge_nodes(local_child, remote_children[remote_position]));
                consumed.insert(key);
            }
            None => merged_children.push(local_child.clone()),
        }
    }

    let local_signatures: HashSet<_> = child_elements(local).map(child_signature).collect();
    for (position, &remote_child) in remote_children.iter().enumerate() {
        let key = child_key(remote_child, position);
        if consumed.contains(&key) {
            continue;
        }
        if local_signatures.contains(&child_signature(remote_child)) {
            continue;
        }
        merged_children.push(remote_child.clone());
    }

    if let Some(text) = text {
        merged.children.push(XMLNode::Text(text));
    }
    for child in merged_children {
        merged.children.push(XMLNode::Element(child));
    }
    merged
}

/// Expands elements annotated with `use="vn:<function>(…)"` attributes
pub struct LinkStrategy;

const SUPPORTED_NAMESPACE: &str = "vn";

impl HydrationStrategy for LinkStrategy {
    fn name(&self) -> &'static str {
        "expansion"
    }

    fn apply(
        &mut self,
        items: Vec<HydrationItem>,
        document_root: &Element,
    ) -> Result<Vec<HydrationItem>> {
        let mut output = Vec::new();
        let mut queue: VecDeque<HydrationItem> = items.into();

        while let Some(item) = queue.pop_front() {
            let Some(use_attr) = item.element.attributes.get("use").cloned() else {
                output.push(item);
                continue;
            };

            let clones = expand_use(&item, &use_attr, document_root)?;
            if clones.is_empty() {
                return Err(ValuationError::Hydration(format!(
                    "function '{use_attr}' did not resolve to any target nodes"
                )));
            }
            // Clones re-enter the queue so nested annotations expand too.
            queue.extend(clones);
        }
        Ok(output)
    }
}

fn expand_use(
    item: &HydrationItem,
    use_attr: &str,
    document_root: &Element,
) -> Result<Vec<HydrationItem>> {
    let (prefix, function, args) = parse_use_expression(use_attr)?;
    if prefix != SUPPORTED_NAMESPACE {
        return Err(ValuationError::Hydration(format!(
            "unsupported function namespace '{prefix}' in '{use_attr}'"
        )));
    }
    match function.as_str() {
        "link" => {
            if args.len() != 2 {
                return Err(ValuationError::Hydration(format!(
                    "vn:link expects exactly two arguments; received {}",
                    args.len()
                )));
            }
            execute_link(item, &args[0], &args[1], document_root)
        }
        other => Err(ValuationError::Hydration(format!(
            "unsupported function 'vn:{other}'"
        ))),
    }
}

fn parse_use_expression(expr: &str) -> Result<(String, String, Vec<String>)> {
    let body = expr.strip_suffix(')').ok_or_else(|| {
        ValuationError::Hydration(format!("invalid use attribute '{expr}'; expected parentheses"))
    })?;
    let (qualified, args_raw) = body.split_once('(').ok_or_else(|| {
        ValuationError::Hydration(format!("invalid use attribute '{expr}'; expected parentheses"))
    })?;
    let (prefix, function) = qualified.split_once(':').ok_or_else(|| {
        ValuationError::Hydration(format!(
            "invalid use attribute '{expr}'; expected prefix:function format"
        ))
    })?;
    let args = args_raw
        .split(',')
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(str::to_string)
        .collect();
    Ok((prefix.to_string(), function.to_string(), args))
}

fn execute_link(
    item: &HydrationItem,
    source_path: &str,
    child_name: &str,
    document_root: &Element,
) -> Result<Vec<HydrationItem>> {
    let sources = find_all(document_root, source_path)?;
    if sources.is_empty() {
        return Err(ValuationError::Hydration(format!(
            "vn:link source path '{source_path}' did not resolve to any elements"
        )));
    }

    let mut produced = Vec::new();
    for source in sources {
        for child in child_elements(source).filter(|child| child.name == child_name) {
            let mut clone = item.element.clone();
            clone.attributes.remove("use");
            produced.push(HydrationItem {
                element: clone,
                context: Some(child.clone()),
            });
        }
    }
    Ok(produced)
}

/// Replaces `select`-annotated nodes with copies of the referenced element
pub struct SelectStrategy {
    reference_cache: HashMap<String, Element>,
}

impl SelectStrategy {
    pub fn new() -> Self {
        Self {
            reference_cache: HashMap::new(),
        }
    }
}

impl Default for SelectStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl HydrationStrategy for SelectStrategy {
    fn name(&self) -> &'static str {
        "select"
    }

    fn apply(
        &mut self,
        mut items: Vec<HydrationItem>,
        document_root: &Element,
    ) -> Result<Vec<HydrationItem>> {
        for item in &mut items {
            if item.element.attributes.contains_key("select") {
                return Err(ValuationError::Hydration(format!(
                    "cannot hydrate element <{}> without a parent",
                    item.element.name
                )));
            }
            let under_use = item.element.attributes.contains_key("use");
            apply_select(
                &mut item.element,
                document_root,
                item.context.as_ref(),
                under_use,
                &mut self.reference_cache,
            )?;
        }
        Ok(items)
    }
}

fn apply_select(
    parent: &mut Element,
    document_root: &Element,
    context: Option<&Element>,
    under_use: bool,
    cache: &mut HashMap<String, Element>,
) -> Result<()> {
    for index in 0..parent.children.len() {
        let (has_select, has_use, select_expr) = match parent.children[index].as_element() {
            Some(child) => (
                child.attributes.contains_key("select"),
                child.attributes.contains_key("use"),
                child.attributes.get("select").cloned(),
            ),
            None => continue,
        };

        // Nodes beneath an unexpanded annotation keep their reference; the
        // expansion pass owns them.
        if has_select && !under_use {
            let expr = select_expr.unwrap_or_default();
            if expr.is_empty() {
                return Err(ValuationError::Hydration(
                    "encountered select attribute without a value".to_string(),
                ));
            }
            let replacement = resolve_reference(&expr, document_root, context, cache)?;
            parent.children[index] = XMLNode::Element(replacement);
            continue;
        }

        if let Some(child) = parent.children[index].as_mut_element() {
            apply_select(child, document_root, context, under_use || has_use, cache)?;
        }
    }
    Ok(())
}

fn resolve_reference(
    expr: &str,
    document_root: &Element,
    context: Option<&Element>,
    cache: &mut HashMap<String, Element>,
) -> Result<Element> {
    if expr.starts_with('/') {
        if let Some(cached) = cache.get(expr) {
            return Ok(cached.clone());
        }
        let resolved = find_one(document_root, expr)?.clone();
        cache.insert(expr.to_string(), resolved.clone());
        return Ok(resolved);
    }

    if !expr.starts_with('.') {
        return Err(ValuationError::Hydration(format!(
            "select expression '{expr}' must be absolute or relative to an expansion context"
        )));
    }

    let context = context.ok_or_else(|| {
        ValuationError::Hydration(format!(
            "select expression '{expr}' requires a context node provided by an expansion function"
        ))
    })?;

    if expr == "." {
        return Ok(context.clone());
    }
    Ok(find_one(context, expr)?.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydration::fetchers::FileFetcher;
    use crate::xml::element_to_string;

    fn item(xml: &str) -> HydrationItem {
        HydrationItem {
            element: parse_document(xml).unwrap(),
            context: None,
        }
    }

    #[test]
    fn select_resolves_absolute_references() {
        let document = parse_document(
            r#"<project><model name="hw1f"><param a="1"/></model></project>"#,
        )
        .unwrap();
        let mut strategy = SelectStrategy::new();
        let items = strategy
            .apply(
                vec![item(r#"<valuation><calibration select="/project/model[@name='hw1f']"/></valuation>"#)],
                &document,
            )
            .unwrap();

        let rendered = element_to_string(&items[0].element).unwrap();
        assert!(rendered.contains("<model name=\"hw1f\""));
        assert!(rendered.contains("<param a=\"1\""));
        assert!(!rendered.contains("select="));
    }

    #[test]
    fn select_requires_exactly_one_match() {
        let document =
            parse_document(r#"<project><model name="a"/><model name="b"/></project>"#).unwrap();
        let mut strategy = SelectStrategy::new();
        let result = strategy.apply(
            vec![item(r#"<valuation><m select="/project/model"/></valuation>"#)],
            &document,
        );
        assert!(matches!(result, Err(ValuationError::Hydration(_))));
    }

    #[test]
    fn relative_select_without_context_fails() {
        let document = parse_document("<project/>").unwrap();
        let mut strategy = SelectStrategy::new();
        let result = strategy.apply(
            vec![item(r#"<valuation><s select="./leg"/></valuation>"#)],
            &document,
        );
        assert!(matches!(result, Err(ValuationError::Hydration(_))));
    }

    #[test]
    fn select_beneath_unexpanded_annotation_is_left_alone() {
        let document = parse_document(r#"<project><model name="m"/></project>"#).unwrap();
        let mut strategy = SelectStrategy::new();
        let items = strategy
            .apply(
                vec![item(
                    r#"<valuation><inner use="vn:link(/project, model)"><s select="."/></inner></valuation>"#,
                )],
                &document,
            )
            .unwrap();
        let rendered = element_to_string(&items[0].element).unwrap();
        assert!(rendered.contains("select=\".\""));
    }

    #[test]
    fn link_clones_once_per_matched_child() {
        let document = parse_document(
            r#"<project><portfolio><trade id="t1"/><trade id="t2"/><other/></portfolio></project>"#,
        )
        .unwrap();
        let mut strategy = LinkStrategy;
        let items = strategy
            .apply(
                vec![item(r#"<valuation use="vn:link(/project/portfolio, trade)"/>"#)],
                &document,
            )
            .unwrap();

        assert_eq!(items.len(), 2);
        for produced in &items {
            assert!(!produced.element.attributes.contains_key("use"));
        }
        assert_eq!(
            items[0].context.as_ref().unwrap().attributes.get("id").unwrap(),
            "t1"
        );
        assert_eq!(
            items[1].context.as_ref().unwrap().attributes.get("id").unwrap(),
            "t2"
        );
    }

    #[test]
    fn link_with_no_targets_is_an_error() {
        let document = parse_document("<project><portfolio/></project>").unwrap();
        let mut strategy = LinkStrategy;
        let result = strategy.apply(
            vec![item(r#"<v use="vn:link(/project/portfolio, trade)"/>"#)],
            &document,
        );
        assert!(matches!(result, Err(ValuationError::Hydration(_))));
    }

    #[test]
    fn unsupported_namespaces_and_functions_are_rejected() {
        let document = parse_document("<project/>").unwrap();
        let mut strategy = LinkStrategy;
        assert!(strategy
            .apply(vec![item(r#"<v use="xx:link(/a, b)"/>"#)], &document)
            .is_err());
        assert!(strategy
            .apply(vec![item(r#"<v use="vn:explode(/a, b)"/>"#)], &document)
            .is_err());
        assert!(strategy
            .apply(vec![item(r#"<v use="vn:link"/>"#)], &document)
            .is_err());
    }

    #[test]
    fn href_merges_remote_content_under_local_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("markets.xml"),
            r#"<valuation>
                 <market name="LIBOR" source="remote" currency="USD">
                   <curve tenor="3M"/>
                   <holidays cal="NY"/>
                 </market>
               </valuation>"#,
        )
        .unwrap();

        let mut strategy = HrefStrategy::new(Arc::new(FileFetcher::new(dir.path())));
        let document = parse_document("<project/>").unwrap();
        let items = strategy
            .apply(
                vec![item(
                    r#"<valuation>
                         <market name="LIBOR" href="markets.xml" source="local">
                           <curve tenor="6M"/>
                         </market>
                       </valuation>"#,
                )],
                &document,
            )
            .unwrap();

        let rendered = element_to_string(&items[0].element).unwrap();
        // Local attribute wins, remote-only attribute survives, href is gone.
        assert!(rendered.contains("source=\"local\""));
        assert!(rendered.contains("currency=\"USD\""));
        assert!(!rendered.contains("href="));
        // Keyed child merged under local precedence; unmatched remote child appended.
        assert!(rendered.contains("tenor=\"6M\""));
        assert!(!rendered.contains("tenor=\"3M\""));
        assert!(rendered.contains("cal=\"NY\""));
    }

    #[test]
    fn href_to_a_missing_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = HrefStrategy::new(Arc::new(FileFetcher::new(dir.path())));
        let document = parse_document("<project/>").unwrap();
        let result = strategy.apply(
            vec![item(r#"<valuation><market href="absent.xml"/></valuation>"#)],
            &document,
        );
        assert!(matches!(result, Err(ValuationError::Hydration(_))));
    }

    #[test]
    fn merge_prefers_local_text_when_present() {
        let local = parse_document(r#"<note>local text</note>"#).unwrap();
        let remote = parse_document(r#"<note>remote text</note>"#).unwrap();
        let merged = merge_nodes(&local, &remote);
        assert_eq!(merged.get_text().unwrap(), "local text");

        let blank_local = parse_document(r#"<note> </note>"#).unwrap();
        let merged = merge_nodes(&blank_local, &remote);
        assert_eq!(merged.get_text().unwrap(), "remote text");
    }
}
