//! assetgen Engine - patch engine and asset generator for CSI driver manifests
//!
//! This crate turns a [`DriverConfig`](assetgen_core::DriverConfig) plus a
//! template tree into the final manifests of a CSI driver:
//! - `AnnotatedDocument`: a YAML document with a provenance log
//! - `PatchEngine`: placeholder substitution + structural merge / JSON patch
//! - `add_sidecar`: sidecar (and kube-rbac-proxy) injection
//! - `AssetGenerator`: the controller-side and guest-side pipelines
//!
//! Generation is a pure function of its inputs: the same flavor, config and
//! templates always produce byte-identical output.

pub mod bundle;
pub mod document;
pub mod error;
pub mod generator;
pub mod merge;
pub mod patch;
pub mod sidecar;

pub use bundle::{GeneratedAssetBundle, Side, UnresolvedPlaceholder};
pub use document::{AnnotatedDocument, RenderOptions};
pub use error::{EngineError, Result};
pub use generator::{AssetGenerator, generate};
pub use merge::{MergeOptions, NodeKind};
pub use patch::PatchEngine;
pub use sidecar::{SidecarInjection, add_sidecar};
