//! Cluster flavors and flavor-gated selection

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A target deployment topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterFlavor {
    /// Driver controller and nodes run in the same, self-managed cluster
    Standalone,
    /// Controller runs in a management cluster, nodes in a hosted guest cluster
    HyperShift,
}

impl ClusterFlavor {
    /// Every known flavor, in declaration order
    pub const ALL: [ClusterFlavor; 2] = [ClusterFlavor::Standalone, ClusterFlavor::HyperShift];

    /// Whether the operator may create ServiceMonitor objects for this flavor
    pub fn has_monitoring_rbac(self) -> bool {
        match self {
            Self::Standalone => true,
            // TODO: drop once the HyperShift operator gets RBAC for ServiceMonitors
            Self::HyperShift => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standalone => "standalone",
            Self::HyperShift => "hypershift",
        }
    }
}

impl fmt::Display for ClusterFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of flavors an asset or patch applies to
///
/// The default is the empty set, which matches no flavor. Use
/// [`FlavorSet::all`] to opt into every flavor explicitly.
///
/// In configuration files a set is either a list of flavors or the
/// keyword `all`:
///
/// ```yaml
/// clusterFlavors: [standalone]
/// clusterFlavors: all
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FlavorSetRepr", into = "FlavorSetRepr")]
pub struct FlavorSet(BTreeSet<ClusterFlavor>);

impl FlavorSet {
    /// A set matching every flavor
    pub fn all() -> Self {
        Self(ClusterFlavor::ALL.into_iter().collect())
    }

    /// A set matching no flavor
    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    /// A set matching exactly one flavor
    pub fn only(flavor: ClusterFlavor) -> Self {
        Self(BTreeSet::from([flavor]))
    }

    pub fn has(&self, flavor: ClusterFlavor) -> bool {
        self.0.contains(&flavor)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for FlavorSet {
    fn default() -> Self {
        Self::none()
    }
}

impl<const N: usize> From<[ClusterFlavor; N]> for FlavorSet {
    fn from(flavors: [ClusterFlavor; N]) -> Self {
        Self(flavors.into_iter().collect())
    }
}

impl FromIterator<ClusterFlavor> for FlavorSet {
    fn from_iter<I: IntoIterator<Item = ClusterFlavor>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FlavorSetRepr {
    Keyword(String),
    List(Vec<ClusterFlavor>),
}

impl TryFrom<FlavorSetRepr> for FlavorSet {
    type Error = String;

    fn try_from(repr: FlavorSetRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            FlavorSetRepr::Keyword(k) if k == "all" => Ok(FlavorSet::all()),
            FlavorSetRepr::Keyword(k) => Err(format!(
                "invalid flavor set '{}': expected 'all' or a list of flavors",
                k
            )),
            FlavorSetRepr::List(flavors) => Ok(flavors.into_iter().collect()),
        }
    }
}

impl From<FlavorSet> for FlavorSetRepr {
    fn from(set: FlavorSet) -> Self {
        if set == FlavorSet::all() {
            FlavorSetRepr::Keyword("all".to_string())
        } else {
            FlavorSetRepr::List(set.0.into_iter().collect())
        }
    }
}
