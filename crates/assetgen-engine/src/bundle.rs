//! The generated assets of one driver

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/// Name of the controller Deployment asset
pub const CONTROLLER_DEPLOYMENT_ASSET: &str = "controller.yaml";
/// Name of the controller metrics Service asset
pub const CONTROLLER_METRICS_SERVICE_ASSET: &str = "controller_metrics_service.yaml";
/// Name of the controller metrics ServiceMonitor asset
pub const CONTROLLER_METRICS_SERVICE_MONITOR_ASSET: &str =
    "controller_metrics_servicemonitor.yaml";
/// Name of the node DaemonSet asset
pub const NODE_DAEMONSET_ASSET: &str = "node.yaml";
/// Name of the node metrics Service asset
pub const NODE_METRICS_SERVICE_ASSET: &str = "node_metrics_service.yaml";
/// Name of the node metrics ServiceMonitor asset
pub const NODE_METRICS_SERVICE_MONITOR_ASSET: &str = "node_metrics_servicemonitor.yaml";
/// Name of the Role letting kube-rbac-proxy on nodes authorize scrapes
pub const NODE_RBAC_PROXY_ROLE_ASSET: &str = "node_kube_rbac_proxy_role.yaml";
/// Name of the RoleBinding of [`NODE_RBAC_PROXY_ROLE_ASSET`]
pub const NODE_RBAC_PROXY_BINDING_ASSET: &str = "node_kube_rbac_proxy_binding.yaml";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{[A-Za-z0-9_]+\}").expect("placeholder pattern is valid")
});

/// Which cluster an asset is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Controller,
    Guest,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Guest => "guest",
        })
    }
}

/// A `${...}` token left in a generated asset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPlaceholder {
    pub side: Side,
    pub asset: String,
    pub token: String,
}

/// Rendered manifests for both sides, keyed by asset name
///
/// Maps are sorted by name, so iterating a bundle is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedAssetBundle {
    pub controller: BTreeMap<String, Vec<u8>>,
    pub guest: BTreeMap<String, Vec<u8>>,
}

impl GeneratedAssetBundle {
    pub fn side(&self, side: Side) -> &BTreeMap<String, Vec<u8>> {
        match side {
            Side::Controller => &self.controller,
            Side::Guest => &self.guest,
        }
    }

    /// Bytes of one asset
    pub fn asset(&self, side: Side, name: &str) -> Option<&[u8]> {
        self.side(side).get(name).map(Vec::as_slice)
    }

    /// Asset names of one side, sorted
    pub fn names(&self, side: Side) -> impl Iterator<Item = &str> {
        self.side(side).keys().map(String::as_str)
    }

    /// Every `${...}` token still present in any asset
    pub fn unresolved_placeholders(&self) -> Vec<UnresolvedPlaceholder> {
        let mut found = Vec::new();
        for side in [Side::Controller, Side::Guest] {
            for (asset, bytes) in self.side(side) {
                let text = String::from_utf8_lossy(bytes);
                for token in PLACEHOLDER.find_iter(&text) {
                    found.push(UnresolvedPlaceholder {
                        side,
                        asset: asset.clone(),
                        token: token.as_str().to_string(),
                    });
                }
            }
        }
        found
    }
}
