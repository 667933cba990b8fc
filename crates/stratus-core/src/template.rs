//! Application template model.
//!
//! A template is a JSON document describing the units of work to deploy:
//! one node per batch job, container app, HPC job or compute host. The
//! full grammar of the source templating language is out of scope here;
//! this model carries exactly the structure the dispatch engine needs
//! (node types, properties, dependencies, instance counts).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Well-known node type names recognized in templates.
pub mod node_types {
    /// A plain virtual machine, deployed through an infrastructure manager.
    pub const COMPUTE: &str = "stratus.nodes.Compute";
    /// A (possibly dependent) batch job.
    pub const BATCH_JOB: &str = "stratus.nodes.BatchJob";
    /// A long-running containerized application.
    pub const CONTAINER_APP: &str = "stratus.nodes.ContainerApp";
    /// An HPC-style job submitted to a job scheduler.
    pub const HPC_JOB: &str = "stratus.nodes.HpcJob";
}

/// Errors raised while parsing or validating a template.
///
/// Template errors are always fatal for the whole deployment: retrying
/// on another provider cannot fix a malformed template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("malformed template: {0}")]
    Parse(String),

    #[error("template has no nodes")]
    Empty,

    #[error("node <{node}> depends on unknown node <{dependency}>")]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle involving node <{0}>")]
    DependencyCycle(String),

    #[error("missing input parameter <{0}>")]
    MissingInput(String),

    #[error("invalid property <{property}> of node <{node}>: {reason}")]
    InvalidProperty {
        node: String,
        property: String,
        reason: String,
    },
}

/// One node of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Node type name, e.g. `stratus.nodes.BatchJob`.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Free-form node properties (command, image, mem_size, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Names of nodes this node depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Number of instances to create for this node.
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

impl NodeTemplate {
    /// A string-valued property, if present and a string.
    pub fn string_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }
}

/// A parsed and input-resolved template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTemplate {
    #[serde(default)]
    pub name: Option<String>,
    /// Nodes keyed by name. BTreeMap keeps iteration deterministic.
    pub nodes: BTreeMap<String, NodeTemplate>,
}

impl ParsedTemplate {
    /// Nodes of the given type, in name order.
    pub fn nodes_of_type<'a>(
        &'a self,
        node_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a NodeTemplate)> {
        self.nodes
            .iter()
            .filter(move |(_, node)| node.node_type == node_type)
    }

    pub fn has_node_of_type(&self, node_type: &str) -> bool {
        self.nodes_of_type(node_type).next().is_some()
    }
}

/// Parse a template document and resolve its input references.
///
/// String property values of the form `get_input:NAME` are replaced with
/// the corresponding entry of `parameters`; a reference without a
/// matching parameter is a template error. Dependency references are
/// checked against the declared nodes.
pub fn parse_and_validate(
    text: &str,
    parameters: &BTreeMap<String, Value>,
) -> Result<ParsedTemplate, TemplateError> {
    let mut template: ParsedTemplate =
        serde_json::from_str(text).map_err(|e| TemplateError::Parse(e.to_string()))?;

    if template.nodes.is_empty() {
        return Err(TemplateError::Empty);
    }

    let node_names: Vec<String> = template.nodes.keys().cloned().collect();
    for (name, node) in &template.nodes {
        for dep in &node.depends_on {
            if !node_names.contains(dep) {
                return Err(TemplateError::UnknownDependency {
                    node: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    for node in template.nodes.values_mut() {
        for value in node.properties.values_mut() {
            if let Some(input) = value.as_str().and_then(|s| s.strip_prefix("get_input:")) {
                let resolved = parameters
                    .get(input)
                    .ok_or_else(|| TemplateError::MissingInput(input.to_string()))?;
                *value = resolved.clone();
            }
        }
    }

    Ok(template)
}
