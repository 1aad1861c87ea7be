//! Core error types

use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CoreError {
    #[error("template not found: {name}")]
    #[diagnostic(
        code(assetgen::store::not_found),
        help("check the template name against the asset tree")
    )]
    TemplateNotFound { name: String },

    #[error("cannot read template '{name}': {message}")]
    #[diagnostic(code(assetgen::store::access))]
    TemplateAccess { name: String, message: String },

    #[error("invalid driver configuration: {0}")]
    #[diagnostic(code(assetgen::config::invalid))]
    InvalidConfig(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(assetgen::io))]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
