//! Sidecar injection into driver workloads
//!
//! A sidecar template is a patch adding one container to
//! `spec.template.spec.containers` of a Deployment or DaemonSet. Injection
//! merges that patch, appends the sidecar's extra arguments, adds the
//! kube-rbac-proxy container when the sidecar exposes metrics and finally
//! applies the sidecar's flavor-gated patches.
//!
//! Port numbers are chosen by the caller and arrive as placeholders in
//! `replacements`; the injector keeps no state between calls.

use assetgen_core::{ClusterFlavor, ConditionalPatch, PlaceholderTable};
use serde_yaml::Value;

use crate::document::AnnotatedDocument;
use crate::error::{EngineError, Result};
use crate::merge::NodeKind;
use crate::patch::PatchEngine;

/// One sidecar to inject
#[derive(Debug, Clone)]
pub struct SidecarInjection<'s> {
    /// Patch template adding the sidecar container
    pub template: &'s str,
    /// Extra placeholders (ports, port name, probe ports)
    pub replacements: PlaceholderTable,
    /// Arguments appended to the sidecar container
    pub extra_args: &'s [String],
    /// kube-rbac-proxy patch, when the sidecar exposes metrics
    pub metrics_proxy: Option<&'s str>,
    pub flavor: ClusterFlavor,
    pub patches: &'s [ConditionalPatch],
}

/// Inject a sidecar into `workload`
pub fn add_sidecar(
    engine: &PatchEngine<'_>,
    workload: &mut AnnotatedDocument,
    sidecar: &SidecarInjection<'_>,
) -> Result<()> {
    let template = sidecar.template;
    let patch = engine
        .load_patch(template, &sidecar.replacements)
        .map_err(|e| e.in_patch(template))?;
    let container = patch
        .as_document()
        .and_then(|doc| pod_containers(doc.value()))
        .and_then(|containers| containers.iter().find_map(container_name))
        .map(str::to_string);

    engine
        .apply_loaded(workload, &patch, &sidecar.replacements)
        .map_err(|e| e.in_patch(template))?;

    if !sidecar.extra_args.is_empty() {
        let container = container.ok_or_else(|| EngineError::SidecarWithoutContainer {
            template: template.to_string(),
        })?;
        append_args(workload, template, &container, sidecar.extra_args)?;
    }

    if let Some(proxy) = sidecar.metrics_proxy {
        engine.apply_patch(workload, proxy, &sidecar.replacements)?;
    }

    for patch in sidecar
        .patches
        .iter()
        .filter(|p| p.cluster_flavors.has(sidecar.flavor))
    {
        engine.apply_patch(workload, &patch.patch, &sidecar.replacements)?;
    }

    Ok(())
}

/// Containers of the pod template of a Deployment / DaemonSet
pub fn pod_containers(workload: &Value) -> Option<&Vec<Value>> {
    workload
        .get("spec")?
        .get("template")?
        .get("spec")?
        .get("containers")?
        .as_sequence()
}

fn pod_containers_mut(workload: &mut Value) -> Option<&mut Vec<Value>> {
    workload
        .get_mut("spec")?
        .get_mut("template")?
        .get_mut("spec")?
        .get_mut("containers")?
        .as_sequence_mut()
}

fn container_name(container: &Value) -> Option<&str> {
    container.get("name")?.as_str()
}

/// Append `args` to the container's argument list, skipping ones it has
fn append_args(
    workload: &mut AnnotatedDocument,
    template: &str,
    container: &str,
    args: &[String],
) -> Result<()> {
    let entry = pod_containers_mut(workload.value_mut())
        .and_then(|containers| {
            containers
                .iter_mut()
                .find(|c| container_name(c) == Some(container))
        })
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| EngineError::SidecarWithoutContainer {
            template: template.to_string(),
        })?;

    let list = entry
        .entry(Value::from("args"))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let kind = NodeKind::of(list);
    let Some(list) = list.as_sequence_mut() else {
        return Err(EngineError::MergeTypeMismatch {
            path: format!("spec.template.spec.containers[name={}].args", container),
            base: kind,
            patch: NodeKind::Sequence,
        });
    };

    for arg in args {
        let arg = Value::from(arg.as_str());
        if !list.contains(&arg) {
            list.push(arg);
        }
    }

    workload.record(format!(
        "Added arguments to container {}: {}",
        container,
        args.join(" ")
    ));
    Ok(())
}
