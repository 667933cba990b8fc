//! Infrastructure-kind compatibility and service-type classification.

use stratus_core::template::{node_types, ParsedTemplate, TemplateError};
use stratus_core::InfraKind;

use crate::error::SelectionError;

/// Whether a provider offering `offered` can host a deployment that
/// requires `required`.
///
/// Exact match is compatible. The single non-symmetric rule: a
/// requirement for the legacy Onedock variant is satisfied by a plain
/// OpenNebula offering, but not the other way around. This asymmetry is
/// a domain rule, not an accident.
pub fn is_compatible(required: InfraKind, offered: InfraKind) -> bool {
    required == offered
        || matches!(
            (required, offered),
            (InfraKind::VmOnedock, InfraKind::VmOpenNebula)
        )
}

/// Map a catalog service-type string to the infrastructure kind it
/// offers.
///
/// Catalog entries carry vendor-flavored type strings like
/// `eu.cloud.vm-management.openstack`; classification is by well-known
/// substring. An unrecognized string is an explicit error — defaulting
/// silently would send a deployment to a platform we cannot drive.
pub fn classify_service_type(service_type: &str) -> Result<InfraKind, SelectionError> {
    let lowered = service_type.to_ascii_lowercase();
    // "onedock" before "opennebula": onedock sites advertise both markers.
    let kind = if lowered.contains("onedock") {
        InfraKind::VmOnedock
    } else if lowered.contains("openstack") {
        InfraKind::VmOpenStack
    } else if lowered.contains("opennebula") {
        InfraKind::VmOpenNebula
    } else if lowered.contains("occi") {
        InfraKind::VmBrokered
    } else if lowered.contains("chronos") {
        InfraKind::BatchScheduler
    } else if lowered.contains("marathon") {
        InfraKind::ContainerGroup
    } else if lowered.contains("qcg") {
        InfraKind::JobScheduler
    } else {
        return Err(SelectionError::UnknownServiceType(
            service_type.to_string(),
        ));
    };
    Ok(kind)
}

/// Derive the infrastructure kind a template requires.
///
/// Inspected once per deployment: a batch-job node forces a batch
/// scheduler, a container-app node a container orchestrator, an HPC-job
/// node a job scheduler. Pure compute templates default to brokered VM
/// access unless a node pins a direct platform via the
/// `pinned_platform` property.
pub fn derive_requirement(template: &ParsedTemplate) -> Result<InfraKind, TemplateError> {
    if template.has_node_of_type(node_types::BATCH_JOB) {
        return Ok(InfraKind::BatchScheduler);
    }
    if template.has_node_of_type(node_types::CONTAINER_APP) {
        return Ok(InfraKind::ContainerGroup);
    }
    if template.has_node_of_type(node_types::HPC_JOB) {
        return Ok(InfraKind::JobScheduler);
    }
    for (name, node) in template.nodes_of_type(node_types::COMPUTE) {
        if let Some(pin) = node.string_property("pinned_platform") {
            return match pin {
                "openstack" => Ok(InfraKind::VmOpenStack),
                "opennebula" => Ok(InfraKind::VmOpenNebula),
                "onedock" => Ok(InfraKind::VmOnedock),
                other => Err(TemplateError::InvalidProperty {
                    node: name.clone(),
                    property: "pinned_platform".to_string(),
                    reason: format!("unsupported platform <{other}>"),
                }),
            };
        }
    }
    Ok(InfraKind::VmBrokered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stratus_core::template::parse_and_validate;

    const ALL_KINDS: [InfraKind; 7] = [
        InfraKind::VmBrokered,
        InfraKind::VmOpenStack,
        InfraKind::VmOpenNebula,
        InfraKind::VmOnedock,
        InfraKind::BatchScheduler,
        InfraKind::ContainerGroup,
        InfraKind::JobScheduler,
    ];

    #[test]
    fn every_kind_is_self_compatible() {
        for kind in ALL_KINDS {
            assert!(is_compatible(kind, kind), "{kind} should match itself");
        }
    }

    #[test]
    fn onedock_requirement_accepts_opennebula() {
        assert!(is_compatible(InfraKind::VmOnedock, InfraKind::VmOpenNebula));
    }

    #[test]
    fn opennebula_requirement_rejects_onedock() {
        assert!(!is_compatible(
            InfraKind::VmOpenNebula,
            InfraKind::VmOnedock
        ));
    }

    #[test]
    fn cross_kind_combinations_rejected() {
        assert!(!is_compatible(
            InfraKind::BatchScheduler,
            InfraKind::ContainerGroup
        ));
        assert!(!is_compatible(
            InfraKind::VmOpenStack,
            InfraKind::VmOpenNebula
        ));
        assert!(!is_compatible(
            InfraKind::VmBrokered,
            InfraKind::VmOpenStack
        ));
    }

    #[test]
    fn classifies_known_service_types() {
        let cases = [
            ("eu.cloud.vm-management.openstack", InfraKind::VmOpenStack),
            ("eu.cloud.vm-management.opennebula", InfraKind::VmOpenNebula),
            ("eu.cloud.vm-management.onedock", InfraKind::VmOnedock),
            ("eu.cloud.vm-management.occi", InfraKind::VmBrokered),
            ("eu.mesos.chronos", InfraKind::BatchScheduler),
            ("eu.mesos.marathon", InfraKind::ContainerGroup),
            ("eu.hpc.qcg", InfraKind::JobScheduler),
        ];
        for (raw, expected) in cases {
            assert_eq!(classify_service_type(raw).unwrap(), expected, "{raw}");
        }
    }

    #[test]
    fn unknown_service_type_is_explicit_error() {
        let err = classify_service_type("com.example.quantum-mainframe").unwrap_err();
        assert!(matches!(err, SelectionError::UnknownServiceType(s)
            if s == "com.example.quantum-mainframe"));
    }

    fn template(text: &str) -> ParsedTemplate {
        parse_and_validate(text, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn batch_nodes_force_batch_scheduler() {
        let t = template(
            r#"{ "nodes": {
                "vm": { "type": "stratus.nodes.Compute" },
                "job": { "type": "stratus.nodes.BatchJob" }
            } }"#,
        );
        assert_eq!(derive_requirement(&t).unwrap(), InfraKind::BatchScheduler);
    }

    #[test]
    fn container_nodes_force_container_group() {
        let t = template(r#"{ "nodes": { "app": { "type": "stratus.nodes.ContainerApp" } } }"#);
        assert_eq!(derive_requirement(&t).unwrap(), InfraKind::ContainerGroup);
    }

    #[test]
    fn hpc_nodes_force_job_scheduler() {
        let t = template(r#"{ "nodes": { "sim": { "type": "stratus.nodes.HpcJob" } } }"#);
        assert_eq!(derive_requirement(&t).unwrap(), InfraKind::JobScheduler);
    }

    #[test]
    fn compute_defaults_to_brokered() {
        let t = template(r#"{ "nodes": { "vm": { "type": "stratus.nodes.Compute" } } }"#);
        assert_eq!(derive_requirement(&t).unwrap(), InfraKind::VmBrokered);
    }

    #[test]
    fn pinned_platform_honored() {
        let t = template(
            r#"{ "nodes": {
                "vm": {
                    "type": "stratus.nodes.Compute",
                    "properties": { "pinned_platform": "onedock" }
                }
            } }"#,
        );
        assert_eq!(derive_requirement(&t).unwrap(), InfraKind::VmOnedock);
    }

    #[test]
    fn unsupported_pin_is_template_error() {
        let t = template(
            r#"{ "nodes": {
                "vm": {
                    "type": "stratus.nodes.Compute",
                    "properties": { "pinned_platform": "mainframe" }
                }
            } }"#,
        );
        let err = derive_requirement(&t).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidProperty { .. }));
    }
}
