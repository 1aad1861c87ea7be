//! Driver generator configuration
//!
//! A [`DriverConfig`] describes everything the asset generator needs to know
//! about one CSI driver: its naming, the workload templates for both sides,
//! the sidecars to inject, the static assets to ship and the final patches.
//! It is built once per generation run and passed explicitly; nothing here
//! is read from the environment.
//!
//! ```yaml
//! assetPrefix: aws-efs-csi-driver
//! assetShortPrefix: efs
//! driverName: efs.csi.aws.com
//! controller:
//!   deploymentTemplate: overlays/aws-efs/controller_add_driver.yaml
//!   localMetricsPort: 8211
//!   exposedMetricsPort: 9211
//!   sidecarLocalMetricsPortStart: 8212
//!   sidecarExposedMetricsPortStart: 9212
//!   sidecars:
//!     - template: common/sidecars/provisioner.yaml
//!       hasMetricsPort: true
//!       metricPortName: provisioner-m
//!       guestAssets: [common/rbac/provisioner_role.yaml]
//! guest:
//!   daemonSetTemplate: overlays/aws-efs/node_add_driver.yaml
//!   sidecars:
//!     - template: common/sidecars/node_driver_registrar.yaml
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::flavor::FlavorSet;
use crate::placeholder::PlaceholderTable;

/// Complete configuration of one driver's generated assets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    /// Long prefix of generated object names, e.g. `aws-efs-csi-driver`
    pub asset_prefix: String,

    /// Short prefix for names with length limits, e.g. `efs`
    pub asset_short_prefix: String,

    /// CSI driver name, e.g. `efs.csi.aws.com`
    pub driver_name: String,

    /// Assets for the management (controller) cluster
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Assets for the guest cluster
    #[serde(default)]
    pub guest: GuestConfig,

    /// Names of the fixed templates the generator builds upon
    #[serde(default)]
    pub layout: TemplateLayout,
}

impl DriverConfig {
    /// Load a configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse a configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The substitutions applied to every template of this driver
    pub fn global_replacements(&self) -> PlaceholderTable {
        PlaceholderTable::new()
            .with("${ASSET_PREFIX}", &self.asset_prefix)
            .with("${ASSET_SHORT_PREFIX}", &self.asset_short_prefix)
            .with("${DRIVER_NAME}", &self.driver_name)
    }
}

/// Controller-side configuration (Deployment + metrics Service)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Patch applied on top of the base controller Deployment
    pub deployment_template: String,

    /// Sidecars injected into the Deployment, in order
    #[serde(default)]
    pub sidecars: Vec<SidecarSpec>,

    /// Static assets shipped next to the Deployment
    #[serde(default)]
    pub assets: Vec<StaticAsset>,

    /// Patches applied after everything else has been generated
    #[serde(default)]
    pub asset_patches: Vec<AssetPatchSpec>,

    /// Port the driver serves metrics on, on localhost (0 = no metrics)
    #[serde(default)]
    pub local_metrics_port: u16,

    /// Port the driver metrics are exposed on through kube-rbac-proxy
    #[serde(default)]
    pub exposed_metrics_port: u16,

    /// First localhost port handed out to metrics-enabled sidecars
    #[serde(default)]
    pub sidecar_local_metrics_port_start: u16,

    /// First exposed port handed out to metrics-enabled sidecars
    #[serde(default)]
    pub sidecar_exposed_metrics_port_start: u16,

    /// Port of the liveness probe sidecar (0 = none)
    #[serde(default)]
    pub liveness_probe_port: u16,
}

impl ControllerConfig {
    pub fn new(deployment_template: impl Into<String>) -> Self {
        Self {
            deployment_template: deployment_template.into(),
            ..Default::default()
        }
    }
}

/// Guest-side configuration (DaemonSet + node metrics Service)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestConfig {
    /// Patch applied on top of the base node DaemonSet
    #[serde(rename = "daemonSetTemplate")]
    pub daemonset_template: String,

    /// Sidecars injected into the DaemonSet, in order
    #[serde(default)]
    pub sidecars: Vec<SidecarSpec>,

    /// Static assets shipped to the guest cluster
    #[serde(default)]
    pub assets: Vec<StaticAsset>,

    /// Patches applied after everything else has been generated
    #[serde(default)]
    pub asset_patches: Vec<AssetPatchSpec>,

    /// Port the node driver serves metrics on, on localhost (0 = no metrics)
    #[serde(default)]
    pub local_metrics_port: u16,

    /// Port the node driver metrics are exposed on through kube-rbac-proxy
    #[serde(default)]
    pub exposed_metrics_port: u16,

    /// Port of the liveness probe sidecar (0 = none)
    #[serde(default)]
    pub liveness_probe_port: u16,

    /// Health port of the node-driver-registrar sidecar (0 = none)
    #[serde(default)]
    pub node_registrar_health_port: u16,
}

impl GuestConfig {
    pub fn new(daemonset_template: impl Into<String>) -> Self {
        Self {
            daemonset_template: daemonset_template.into(),
            ..Default::default()
        }
    }
}

/// A sidecar container injected into a driver workload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSpec {
    /// Patch adding the sidecar container
    pub template: String,

    /// Arguments appended to the sidecar container
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// The sidecar serves metrics and needs a kube-rbac-proxy in front of it
    #[serde(default)]
    pub has_metrics_port: bool,

    /// Name of the metrics port in the Service, e.g. `provisioner-m`
    #[serde(default)]
    pub metric_port_name: String,

    /// Extra patches applied to the workload together with this sidecar
    #[serde(default)]
    pub patches: Vec<ConditionalPatch>,

    /// Assets the sidecar needs in the guest cluster, e.g. its RBAC
    #[serde(default)]
    pub guest_assets: Vec<String>,
}

impl SidecarSpec {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, port_name: impl Into<String>) -> Self {
        self.has_metrics_port = true;
        self.metric_port_name = port_name.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_patch(mut self, patch: impl Into<String>, cluster_flavors: FlavorSet) -> Self {
        self.patches.push(ConditionalPatch {
            patch: patch.into(),
            cluster_flavors,
        });
        self
    }

    pub fn with_guest_asset(mut self, asset: impl Into<String>) -> Self {
        self.guest_assets.push(asset.into());
        self
    }
}

/// A patch applied only for some flavors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalPatch {
    pub patch: String,
    pub cluster_flavors: FlavorSet,
}

/// A template copied into the generated assets as-is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticAsset {
    /// Template name; the generated asset is named after its file name
    pub name: String,
    pub cluster_flavors: FlavorSet,
}

impl StaticAsset {
    pub fn new(name: impl Into<String>, cluster_flavors: FlavorSet) -> Self {
        Self {
            name: name.into(),
            cluster_flavors,
        }
    }

    /// Name of the generated asset (the template's file name)
    pub fn asset_name(&self) -> &str {
        asset_base_name(&self.name)
    }
}

/// A patch applied to an already generated asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPatchSpec {
    /// Generated asset to patch, e.g. `controller.yaml`
    pub asset: String,
    /// Patch template
    pub patch: String,
    pub cluster_flavors: FlavorSet,
}

impl AssetPatchSpec {
    pub fn new(
        asset: impl Into<String>,
        patch: impl Into<String>,
        cluster_flavors: FlavorSet,
    ) -> Self {
        Self {
            asset: asset.into(),
            patch: patch.into(),
            cluster_flavors,
        }
    }
}

/// Names of the fixed templates used by the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateLayout {
    pub controller_base: String,
    pub node_base: String,
    pub controller_driver_proxy: String,
    pub node_driver_proxy: String,
    pub sidecar_proxy: String,
    pub controller_metrics_service: String,
    pub controller_metrics_service_monitor: String,
    pub node_metrics_service: String,
    pub node_metrics_service_monitor: String,
    pub service_port_patch: String,
    pub service_monitor_port_patch: String,
    pub node_rbac_proxy_role: String,
    pub node_rbac_proxy_binding: String,
}

impl Default for TemplateLayout {
    fn default() -> Self {
        Self {
            controller_base: "base/controller.yaml".into(),
            node_base: "base/node.yaml".into(),
            controller_driver_proxy: "common/sidecars/controller_driver_kube_rbac_proxy.yaml"
                .into(),
            node_driver_proxy: "common/sidecars/node_driver_kube_rbac_proxy.yaml".into(),
            sidecar_proxy: "common/sidecars/sidecar_kube_rbac_proxy.yaml".into(),
            controller_metrics_service: "base/controller_metrics_service.yaml".into(),
            controller_metrics_service_monitor: "base/controller_metrics_servicemonitor.yaml"
                .into(),
            node_metrics_service: "base/node_metrics_service.yaml".into(),
            node_metrics_service_monitor: "base/node_metrics_servicemonitor.yaml".into(),
            service_port_patch: "common/metrics/service_add_port.yaml".into(),
            service_monitor_port_patch: "common/metrics/service_monitor_add_port.yaml.patch"
                .into(),
            node_rbac_proxy_role: "base/rbac/node_kube_rbac_proxy_role.yaml".into(),
            node_rbac_proxy_binding: "base/rbac/node_kube_rbac_proxy_binding.yaml".into(),
        }
    }
}

/// File name of a template path, used as the generated asset name
pub fn asset_base_name(template: &str) -> &str {
    template.rsplit('/').next().unwrap_or(template)
}
