//! Topological work-unit builder shared by all drivers.
//!
//! One `WorkUnit` per deployable template node, emitted in dependency
//! order. Numeric normalization happens here: memory sizes become
//! megabytes whatever unit the template declared, CPU counts are f64.
//! Generated platform names are validated against the platform naming
//! grammar before anything is submitted — an invalid name is a fatal
//! template error, never silently truncated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stratus_core::template::{NodeTemplate, ParsedTemplate};
use stratus_core::DependencyGraph;
use stratus_state::{ResourceRecord, StateStore};

use crate::error::DriverError;

/// Naming grammar shared by the scheduler platforms: DNS-label style,
/// max 63 characters.
static UNIT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap()
});

const DEFAULT_CPUS: f64 = 1.0;
const DEFAULT_MEM_MB: f64 = 128.0;

/// One unit of deployable work (one job, one app, one VM).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Template node this unit was built from.
    pub node_name: String,
    /// Platform-facing name, validated against the naming grammar.
    pub name: String,
    pub command: Option<String>,
    pub image: Option<String>,
    pub cpus: f64,
    /// Memory per instance in megabytes.
    pub mem_mb: f64,
    pub env: BTreeMap<String, String>,
    /// Platform names of the units this unit depends on.
    pub parents: Vec<String>,
    pub schedule: Option<String>,
    pub retries: u32,
    pub instances: u32,
}

/// Build the work units for every node of `node_type`, in topological
/// order of the full template graph.
pub fn build_work_units(
    deployment_id: &str,
    template: &ParsedTemplate,
    node_type: &str,
) -> Result<Vec<WorkUnit>, DriverError> {
    let graph = DependencyGraph::build(template);
    let order = graph.topological_order()?;

    let mut names: BTreeMap<String, String> = BTreeMap::new();
    let mut units = Vec::new();
    for node_name in &order {
        let Some(node) = template.nodes.get(node_name) else {
            continue;
        };
        if node.node_type != node_type {
            continue;
        }
        let name = unit_name(deployment_id, node_name)?;
        names.insert(node_name.clone(), name.clone());

        let parents = node
            .depends_on
            .iter()
            .filter_map(|dep| names.get(dep).cloned())
            .collect();

        units.push(WorkUnit {
            node_name: node_name.clone(),
            name,
            command: node.string_property("command").map(str::to_string),
            image: node.string_property("image").map(str::to_string),
            cpus: number_property(node, node_name, "num_cpus")?.unwrap_or(DEFAULT_CPUS),
            mem_mb: memory_property(node, node_name)?.unwrap_or(DEFAULT_MEM_MB),
            env: env_property(node),
            parents,
            schedule: node.string_property("schedule").map(str::to_string),
            retries: node
                .properties
                .get("retries")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            instances: node.count.max(1),
        });
    }
    Ok(units)
}

/// Derive and validate the platform name for one node.
///
/// The name carries a short deployment prefix so units of different
/// deployments never collide on the shared platform.
pub fn unit_name(deployment_id: &str, node_name: &str) -> Result<String, DriverError> {
    let prefix: String = deployment_id.chars().take(8).collect();
    let name = format!("{prefix}-{node_name}");
    if !UNIT_NAME.is_match(&name) {
        return Err(DriverError::Template(format!(
            "generated name <{name}> for node <{node_name}> violates the platform naming grammar"
        )));
    }
    Ok(name)
}

/// Make sure one resource record exists per unit instance, creating the
/// missing ones in Initial state.
pub fn ensure_resources(
    store: &StateStore,
    deployment_id: &str,
    units: &[WorkUnit],
    node_type: &str,
) -> Result<Vec<ResourceRecord>, DriverError> {
    let existing = store.resources_for_deployment(deployment_id)?;
    let mut all = existing.clone();
    for unit in units {
        let present = existing
            .iter()
            .filter(|r| r.node_name == unit.node_name)
            .count() as u32;
        for index in present..unit.instances {
            let resource = ResourceRecord::new(
                format!("{}-{index}", unit.node_name),
                deployment_id,
                &unit.node_name,
                node_type,
            );
            store.put_resource(&resource)?;
            all.push(resource);
        }
    }
    Ok(all)
}

fn number_property(
    node: &NodeTemplate,
    node_name: &str,
    property: &str,
) -> Result<Option<f64>, DriverError> {
    match node.properties.get(property) {
        None => Ok(None),
        Some(value) => match value {
            Value::Number(n) => Ok(n.as_f64()),
            Value::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| {
                invalid_property(node_name, property, format!("not a number: {s}"))
            }),
            other => Err(invalid_property(
                node_name,
                property,
                format!("unexpected value {other}"),
            )),
        },
    }
}

fn memory_property(node: &NodeTemplate, node_name: &str) -> Result<Option<f64>, DriverError> {
    match node.properties.get("mem_size") {
        None => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => parse_mem_mb(s)
            .map(Some)
            .map_err(|reason| invalid_property(node_name, "mem_size", reason)),
        Some(other) => Err(invalid_property(
            node_name,
            "mem_size",
            format!("unexpected value {other}"),
        )),
    }
}

/// Parse a declared size like "512 MB", "2 GB" or "1 GiB" into
/// megabytes.
fn parse_mem_mb(raw: &str) -> Result<f64, String> {
    let trimmed = raw.trim();
    let split_at = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("missing unit in <{trimmed}>"))?;
    let (number, unit) = trimmed.split_at(split_at);
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("not a number: <{number}>"))?;
    let bytes = match unit.trim().to_ascii_uppercase().as_str() {
        "B" => value,
        "KB" => value * 1e3,
        "KIB" => value * 1024.0,
        "MB" => value * 1e6,
        "MIB" => value * 1024.0 * 1024.0,
        "GB" => value * 1e9,
        "GIB" => value * 1024.0 * 1024.0 * 1024.0,
        "TB" => value * 1e12,
        "TIB" => value * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => return Err(format!("unknown memory unit <{other}>")),
    };
    Ok(bytes / 1e6)
}

fn env_property(node: &NodeTemplate) -> BTreeMap<String, String> {
    node.properties
        .get("environment_variables")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn invalid_property(node: &str, property: &str, reason: impl Into<String>) -> DriverError {
    DriverError::Template(format!(
        "invalid property <{property}> of node <{node}>: {}",
        reason.into()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use stratus_core::template::parse_and_validate;

    fn template(text: &str) -> ParsedTemplate {
        parse_and_validate(text, &Map::new()).unwrap()
    }

    #[test]
    fn units_come_out_in_dependency_order() {
        let t = template(
            r#"{ "nodes": {
                "analyze": { "type": "stratus.nodes.BatchJob", "depends_on": ["fetch"],
                             "properties": { "command": "analyze" } },
                "fetch": { "type": "stratus.nodes.BatchJob",
                           "properties": { "command": "fetch" } }
            } }"#,
        );
        let units = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].node_name, "fetch");
        assert_eq!(units[1].node_name, "analyze");
        assert_eq!(units[1].parents, vec!["d0000000-fetch"]);
    }

    #[test]
    fn cycle_surfaces_as_template_error() {
        let t = template(
            r#"{ "nodes": {
                "a": { "type": "stratus.nodes.BatchJob", "depends_on": ["b"] },
                "b": { "type": "stratus.nodes.BatchJob", "depends_on": ["a"] }
            } }"#,
        );
        let err = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn memory_normalized_to_megabytes() {
        let t = template(
            r#"{ "nodes": {
                "a": { "type": "stratus.nodes.BatchJob",
                       "properties": { "mem_size": "2 GB" } },
                "b": { "type": "stratus.nodes.BatchJob",
                       "properties": { "mem_size": "512 MiB" } },
                "c": { "type": "stratus.nodes.BatchJob",
                       "properties": { "mem_size": 256 } }
            } }"#,
        );
        let units = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap();
        let by_node: Map<_, _> = units.iter().map(|u| (u.node_name.as_str(), u)).collect();
        assert_eq!(by_node["a"].mem_mb, 2000.0);
        assert!((by_node["b"].mem_mb - 536.870912).abs() < 1e-9);
        assert_eq!(by_node["c"].mem_mb, 256.0);
    }

    #[test]
    fn unknown_memory_unit_rejected() {
        let t = template(
            r#"{ "nodes": {
                "a": { "type": "stratus.nodes.BatchJob",
                       "properties": { "mem_size": "2 parsecs" } }
            } }"#,
        );
        let err = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap_err();
        assert!(matches!(err, DriverError::Template(_)));
    }

    #[test]
    fn cpus_are_floating_point() {
        let t = template(
            r#"{ "nodes": {
                "a": { "type": "stratus.nodes.BatchJob",
                       "properties": { "num_cpus": 0.5 } }
            } }"#,
        );
        let units = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap();
        assert_eq!(units[0].cpus, 0.5);
    }

    #[test]
    fn invalid_generated_name_is_fatal() {
        // Uppercase node names violate the platform grammar.
        let t = template(
            r#"{ "nodes": {
                "Fetch_Data": { "type": "stratus.nodes.BatchJob" }
            } }"#,
        );
        let err = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap_err();
        match err {
            DriverError::Template(msg) => assert!(msg.contains("naming grammar"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn name_carries_deployment_prefix() {
        assert_eq!(
            unit_name("abcdef1234567890", "job").unwrap(),
            "abcdef12-job"
        );
    }

    #[test]
    fn env_parsed_as_string_map() {
        let t = template(
            r#"{ "nodes": {
                "a": { "type": "stratus.nodes.BatchJob",
                       "properties": { "environment_variables": { "MODE": "fast" } } }
            } }"#,
        );
        let units = build_work_units("d0000000", &t, "stratus.nodes.BatchJob").unwrap();
        assert_eq!(units[0].env.get("MODE").map(String::as_str), Some("fast"));
    }

    #[test]
    fn ensure_resources_creates_one_per_instance() {
        let store = StateStore::open_in_memory().unwrap();
        let t = template(
            r#"{ "nodes": {
                "workers": { "type": "stratus.nodes.ContainerApp", "count": 3 }
            } }"#,
        );
        let units = build_work_units("d0000000", &t, "stratus.nodes.ContainerApp").unwrap();

        let resources =
            ensure_resources(&store, "d-1", &units, "stratus.nodes.ContainerApp").unwrap();
        assert_eq!(resources.len(), 3);

        // Idempotent: a second call creates nothing new.
        let again =
            ensure_resources(&store, "d-1", &units, "stratus.nodes.ContainerApp").unwrap();
        assert_eq!(again.len(), 3);
    }
}
