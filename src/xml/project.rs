//! # Project Model
//!
//! Turns a submitted valuation document into the ordered group/task plan the
//! orchestrator executes, composes per-task payload documents, and assembles
//! the final response document.

use crate::error::{Result, ValuationError};
use crate::xml::{child_elements, element_to_string};
use xmltree::{Element, XMLNode};

/// Parsed submission: shared context elements plus ordered task groups
#[derive(Debug, Clone)]
pub struct ProjectPlan {
    /// Non-group project children (markets, models, calculators, portfolio…)
    /// carried into every task's context header, in document order
    pub context: Vec<Element>,
    pub groups: Vec<GroupPlan>,
}

#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub name: String,
    pub valuations: Vec<ValuationPlan>,
}

#[derive(Debug, Clone)]
pub struct ValuationPlan {
    pub name: String,
    pub element: Element,
}

impl ProjectPlan {
    /// Extract the plan from a parsed submission. The document root is either
    /// `<project>` itself or an envelope containing one.
    pub fn parse(document: &Element) -> Result<Self> {
        let project = if document.name == "project" {
            document
        } else {
            document.get_child("project").ok_or_else(|| {
                ValuationError::InvalidInput("missing <project> root".to_string())
            })?
        };

        let mut context = Vec::new();
        let mut groups = Vec::new();

        for child in child_elements(project) {
            if child.name == "group" {
                let group_index = groups.len();
                let name = child
                    .attributes
                    .get("name")
                    .cloned()
                    .unwrap_or_else(|| format!("Group{}", group_index + 1));

                let mut valuations = Vec::new();
                for (position, task_element) in child_elements(child).enumerate() {
                    let valuation_name = task_element
                        .attributes
                        .get("name")
                        .or_else(|| task_element.attributes.get("id"))
                        .cloned()
                        .unwrap_or_else(|| format!("{}-{}", task_element.name, position + 1));
                    valuations.push(ValuationPlan {
                        name: valuation_name,
                        element: task_element.clone(),
                    });
                }
                groups.push(GroupPlan { name, valuations });
            } else {
                context.push(child.clone());
            }
        }

        Ok(Self { context, groups })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Identifier for a task within its request, stable across retries.
pub fn task_id(group_idx: usize, position: usize, valuation_name: &str) -> String {
    format!("g{}-t{}-{}", group_idx + 1, position + 1, valuation_name)
}

/// Compose one task's payload document: the shared context, the accumulated
/// prior-group results, and the (already hydrated) valuation element.
pub fn compose_task_document(
    context: &[Element],
    prior_results: &[(String, String)],
    valuation: &Element,
) -> Element {
    let mut task_root = Element::new("taskRequest");

    let mut header = Element::new("context");
    for element in context {
        header.children.push(XMLNode::Element(element.clone()));
    }
    task_root.children.push(XMLNode::Element(header));

    if !prior_results.is_empty() {
        let mut container = Element::new("priorResults");
        for (task_id, payload) in prior_results {
            let mut result_node = Element::new("result");
            result_node
                .attributes
                .insert("taskId".to_string(), task_id.clone());
            result_node.children.push(XMLNode::Text(payload.clone()));
            container.children.push(XMLNode::Element(result_node));
        }
        task_root.children.push(XMLNode::Element(container));
    }

    task_root.children.push(XMLNode::Element(valuation.clone()));
    task_root
}

/// One finished task as it appears in the response document
#[derive(Debug, Clone)]
pub struct ResponseTask {
    pub task_id: String,
    pub result_key: String,
    pub attempt: u32,
    pub stored: Option<String>,
}

/// One finished group, in completion order
#[derive(Debug, Clone)]
pub struct ResponseGroup {
    pub index: usize,
    pub tasks: Vec<ResponseTask>,
}

/// Assemble the response document in group, then task order.
pub fn build_response_document(request_id: &str, groups: &[ResponseGroup]) -> Result<String> {
    let mut root = Element::new("response");
    root.attributes
        .insert("requestId".to_string(), request_id.to_string());

    for group in groups {
        let mut group_node = Element::new("group");
        group_node
            .attributes
            .insert("index".to_string(), group.index.to_string());

        for task in &group.tasks {
            let mut task_node = Element::new("task");
            task_node
                .attributes
                .insert("id".to_string(), task.task_id.clone());

            let mut result_key_node = Element::new("resultKey");
            result_key_node
                .children
                .push(XMLNode::Text(task.result_key.clone()));
            task_node.children.push(XMLNode::Element(result_key_node));

            let mut attempt_node = Element::new("attempt");
            attempt_node
                .children
                .push(XMLNode::Text(task.attempt.to_string()));
            task_node.children.push(XMLNode::Element(attempt_node));

            if let Some(stored) = &task.stored {
                let mut result_node = Element::new("result");
                result_node.children.push(XMLNode::Text(stored.clone()));
                task_node.children.push(XMLNode::Element(result_node));
            }

            group_node.children.push(XMLNode::Element(task_node));
        }
        root.children.push(XMLNode::Element(group_node));
    }

    element_to_string(&root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_document;

    #[test]
    fn parses_groups_and_context_in_document_order() {
        let document = parse_document(
            r#"<vnml><project>
                 <market name="LIBOR"/>
                 <model name="hw1f"/>
                 <group name="curves">
                   <valuation name="discount"/>
                   <valuation name="forward"/>
                 </group>
                 <portfolio/>
                 <group name="trades">
                   <valuation name="swap"/>
                 </group>
               </project></vnml>"#,
        )
        .unwrap();

        let plan = ProjectPlan::parse(&document).unwrap();
        assert_eq!(plan.group_count(), 2);
        assert_eq!(plan.groups[0].name, "curves");
        assert_eq!(plan.groups[0].valuations.len(), 2);
        assert_eq!(plan.groups[1].valuations[0].name, "swap");
        let context_names: Vec<&str> = plan.context.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(context_names, vec!["market", "model", "portfolio"]);
    }

    #[test]
    fn parses_minimal_submission_with_id_attributes() {
        let document =
            parse_document(r#"<vnml><project><group name="G0"><t id="a"/></group></project></vnml>"#)
                .unwrap();
        let plan = ProjectPlan::parse(&document).unwrap();
        assert_eq!(plan.group_count(), 1);
        assert_eq!(plan.groups[0].valuations.len(), 1);
        assert_eq!(plan.groups[0].valuations[0].name, "a");
        assert_eq!(task_id(0, 0, "a"), "g1-t1-a");
    }

    #[test]
    fn missing_project_element_is_invalid_input() {
        let document = parse_document("<vnml><other/></vnml>").unwrap();
        assert!(matches!(
            ProjectPlan::parse(&document),
            Err(ValuationError::InvalidInput(_))
        ));
    }

    #[test]
    fn unnamed_groups_and_tasks_get_positional_names() {
        let document = parse_document(
            r#"<project><group><valuation/><valuation/></group></project>"#,
        )
        .unwrap();
        let plan = ProjectPlan::parse(&document).unwrap();
        assert_eq!(plan.groups[0].name, "Group1");
        assert_eq!(plan.groups[0].valuations[0].name, "valuation-1");
        assert_eq!(plan.groups[0].valuations[1].name, "valuation-2");
    }

    #[test]
    fn composed_task_carries_context_priors_and_valuation() {
        let document = parse_document(
            r#"<project>
                 <market name="LIBOR"/>
                 <group name="g"><valuation name="v"/></group>
               </project>"#,
        )
        .unwrap();
        let plan = ProjectPlan::parse(&document).unwrap();
        let priors = vec![("g1-t1-v".to_string(), "<priced/>".to_string())];

        let task = compose_task_document(
            &plan.context,
            &priors,
            &plan.groups[0].valuations[0].element,
        );
        let rendered = element_to_string(&task).unwrap();

        assert!(rendered.starts_with("<taskRequest>"));
        assert!(rendered.contains("<context><market name=\"LIBOR\""));
        assert!(rendered.contains("taskId=\"g1-t1-v\""));
        assert!(rendered.contains("<valuation name=\"v\""));
    }

    #[test]
    fn composed_task_omits_empty_prior_results() {
        let valuation = parse_document("<valuation name=\"v\"/>").unwrap();
        let task = compose_task_document(&[], &[], &valuation);
        let rendered = element_to_string(&task).unwrap();
        assert!(!rendered.contains("priorResults"));
    }

    #[test]
    fn response_document_orders_groups_and_tasks() {
        let groups = vec![
            ResponseGroup {
                index: 0,
                tasks: vec![ResponseTask {
                    task_id: "g1-t1-a".to_string(),
                    result_key: "cache:task:req:0:g1-t1-a:result".to_string(),
                    attempt: 1,
                    stored: Some("<priced amount=\"1.00\"/>".to_string()),
                }],
            },
            ResponseGroup {
                index: 1,
                tasks: vec![ResponseTask {
                    task_id: "g2-t1-b".to_string(),
                    result_key: "cache:task:req:1:g2-t1-b:result".to_string(),
                    attempt: 3,
                    stored: None,
                }],
            },
        ];

        let rendered = build_response_document("req-1", &groups).unwrap();
        assert!(rendered.contains("requestId=\"req-1\""));
        let first = rendered.find("g1-t1-a").unwrap();
        let second = rendered.find("g2-t1-b").unwrap();
        assert!(first < second);
        assert!(rendered.contains("<attempt>3</attempt>"));
    }
}
