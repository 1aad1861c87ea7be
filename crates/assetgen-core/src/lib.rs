//! assetgen Core - Core types for the CSI driver asset generator
//!
//! This crate provides the foundational types used by the generator:
//! - `ClusterFlavor` / `FlavorSet`: deployment topologies and flavor gating
//! - `PlaceholderTable`: ordered `${TOKEN}` substitution tables
//! - `DriverConfig`: controller-side and guest-side driver configuration
//! - `TemplateStore`: where template bytes come from (directory, memory, closure)

pub mod config;
pub mod error;
pub mod flavor;
pub mod placeholder;
pub mod store;

pub use config::{
    AssetPatchSpec, ConditionalPatch, ControllerConfig, DriverConfig, GuestConfig, SidecarSpec,
    StaticAsset, TemplateLayout, asset_base_name,
};
pub use error::{CoreError, Result};
pub use flavor::{ClusterFlavor, FlavorSet};
pub use placeholder::PlaceholderTable;
pub use store::{DirTemplateStore, MemoryTemplateStore, TemplateStore};
