//! Engine error types

use assetgen_core::CoreError;
use miette::Diagnostic;
use thiserror::Error;

use crate::bundle::Side;
use crate::merge::NodeKind;

/// Main engine error type
///
/// Errors raised deep inside a patch are wrapped on the way out with the
/// patch name ([`EngineError::Patch`]) and the side and asset being built
/// ([`EngineError::Context`]). Use [`EngineError::root`] to get at the
/// original failure.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),

    #[error("failed to parse '{name}': {source}")]
    #[diagnostic(code(assetgen::document::parse))]
    Parse {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("'{name}' is not valid UTF-8")]
    #[diagnostic(code(assetgen::document::encoding))]
    NotUtf8 { name: String },

    #[error("cannot merge {patch} into {base} at '{path}'")]
    #[diagnostic(
        code(assetgen::merge::type_mismatch),
        help("the patch and the base document disagree on the shape of this node")
    )]
    MergeTypeMismatch {
        path: String,
        base: NodeKind,
        patch: NodeKind,
    },

    #[error("asset '{asset}' not found to apply patch '{patch}'")]
    #[diagnostic(
        code(assetgen::generator::asset_not_found),
        help("asset patches can only target assets generated for the same side and flavor")
    )]
    AssetNotFoundForPatch { asset: String, patch: String },

    #[error("JSON patch '{name}' failed: {message}")]
    #[diagnostic(code(assetgen::patch::json))]
    JsonPatch { name: String, message: String },

    #[error("sidecar template '{template}' does not add any container")]
    #[diagnostic(code(assetgen::sidecar::no_container))]
    SidecarWithoutContainer { template: String },

    #[error("guest sidecar '{template}' declares a metrics port")]
    #[diagnostic(
        code(assetgen::sidecar::guest_metrics),
        help("metrics proxies are only injected for controller sidecars")
    )]
    GuestSidecarMetrics { template: String },

    #[error("metrics port {port} is out of range")]
    #[diagnostic(
        code(assetgen::generator::port_range),
        help("lower the sidecar metrics port start values")
    )]
    PortOutOfRange { port: u32 },

    #[error("failed to render '{name}': {source}")]
    #[diagnostic(code(assetgen::document::render))]
    Render {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{side} asset '{asset}': {source}")]
    #[diagnostic(code(assetgen::generator::asset))]
    Context {
        side: Side,
        asset: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("patch '{patch}': {source}")]
    #[diagnostic(code(assetgen::patch::apply))]
    Patch {
        patch: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Wrap this error with the side and asset it was raised for
    pub fn in_asset(self, side: Side, asset: impl Into<String>) -> Self {
        Self::Context {
            side,
            asset: asset.into(),
            source: Box::new(self),
        }
    }

    /// Wrap this error with the patch it was raised for
    pub fn in_patch(self, patch: impl Into<String>) -> Self {
        Self::Patch {
            patch: patch.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, with all context wrappers removed
    pub fn root(&self) -> &EngineError {
        let mut current = self;
        while let Self::Context { source, .. } | Self::Patch { source, .. } = current {
            current = source.as_ref();
        }
        current
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
