//! Loading templates and applying patches
//!
//! A patch template is read from the template store, its placeholders are
//! substituted as plain text and the result is merged into the target.
//! Two kinds of patches exist:
//! - `*.yaml`: a partial document, deep merged (see [`crate::merge`])
//! - `*.patch`: an RFC 6902 JSON patch written in YAML, for objects whose
//!   lists cannot be merged by name (ServiceMonitor endpoints). It applies
//!   to the primary document of the target.
//!
//! ```yaml
//! # common/metrics/service_monitor_add_port.yaml.patch
//! - op: add
//!   path: /spec/endpoints/-
//!   value:
//!     port: ${PORT_NAME}
//!     scheme: https
//! ```

use assetgen_core::{PlaceholderTable, TemplateStore};

use crate::document::{AnnotatedDocument, describe_table, parse_documents};
use crate::error::{EngineError, Result};
use crate::merge::MergeOptions;

/// A patch template, loaded and substituted but not yet applied
#[derive(Debug, Clone)]
pub enum LoadedPatch {
    Merge(AnnotatedDocument),
    Json {
        name: String,
        operations: json_patch::Patch,
    },
}

impl LoadedPatch {
    pub fn name(&self) -> &str {
        match self {
            Self::Merge(doc) => doc.name(),
            Self::Json { name, .. } => name,
        }
    }

    /// The patch as a document, if it is a merge patch
    pub fn as_document(&self) -> Option<&AnnotatedDocument> {
        match self {
            Self::Merge(doc) => Some(doc),
            Self::Json { .. } => None,
        }
    }
}

/// Applies named patches from a template store
///
/// The engine carries the global placeholder table; every load and patch
/// call may add extra replacements, which win over the global ones.
pub struct PatchEngine<'a> {
    store: &'a dyn TemplateStore,
    replacements: PlaceholderTable,
    merge: MergeOptions,
}

impl<'a> PatchEngine<'a> {
    pub fn new(store: &'a dyn TemplateStore, replacements: PlaceholderTable) -> Self {
        Self {
            store,
            replacements,
            merge: MergeOptions::default(),
        }
    }

    pub fn with_merge_options(mut self, merge: MergeOptions) -> Self {
        self.merge = merge;
        self
    }

    /// The global placeholder table
    pub fn replacements(&self) -> &PlaceholderTable {
        &self.replacements
    }

    fn effective(&self, extra: &PlaceholderTable) -> PlaceholderTable {
        self.replacements.extend(extra)
    }

    /// Load a template as a new document, placeholders substituted
    pub fn load(&self, name: &str, extra: &PlaceholderTable) -> Result<AnnotatedDocument> {
        let bytes = self.store.resolve(name)?;
        let mut doc = AnnotatedDocument::load_substituted(name, &bytes, &self.effective(extra))?;
        doc.record(format!("Loaded from {}", name));
        tracing::debug!(template = name, "loaded template");
        Ok(doc)
    }

    /// Load a patch template without applying it
    pub fn load_patch(&self, name: &str, extra: &PlaceholderTable) -> Result<LoadedPatch> {
        let bytes = self.store.resolve(name)?;
        let table = self.effective(extra);

        if is_json_patch(name) {
            let text = std::str::from_utf8(&bytes).map_err(|_| EngineError::NotUtf8 {
                name: name.to_string(),
            })?;
            let mut operations = Vec::new();
            for doc in parse_documents(name, &table.apply(text))? {
                if doc.is_null() {
                    continue;
                }
                let json_patch::Patch(ops) =
                    serde_yaml::from_value(doc).map_err(|source| EngineError::Parse {
                        name: name.to_string(),
                        source,
                    })?;
                operations.extend(ops);
            }
            return Ok(LoadedPatch::Json {
                name: name.to_string(),
                operations: json_patch::Patch(operations),
            });
        }

        Ok(LoadedPatch::Merge(AnnotatedDocument::load_substituted(
            name, &bytes, &table,
        )?))
    }

    /// Apply an already loaded patch to `target`
    pub fn apply_loaded(
        &self,
        target: &mut AnnotatedDocument,
        patch: &LoadedPatch,
        extra: &PlaceholderTable,
    ) -> Result<()> {
        match patch {
            LoadedPatch::Merge(doc) => target.merge_from_with(doc, &self.merge)?,
            LoadedPatch::Json { name, operations } => {
                json_patch_document(target, name, operations)?;
                target.record(format!("Applied JSON patch {}", name));
            }
        }
        if !extra.is_empty() {
            target.record(format!("  with {}", describe_table(extra)));
        }
        tracing::debug!(asset = target.name(), patch = patch.name(), "applied patch");
        Ok(())
    }

    /// Resolve, substitute and apply the patch template `name` to `target`
    ///
    /// The first error aborts; the target may then be partially patched
    /// and should be discarded.
    pub fn apply_patch(
        &self,
        target: &mut AnnotatedDocument,
        name: &str,
        extra: &PlaceholderTable,
    ) -> Result<()> {
        let patch = self.load_patch(name, extra).map_err(|e| e.in_patch(name))?;
        self.apply_loaded(target, &patch, extra)
            .map_err(|e| e.in_patch(name))
    }
}

fn is_json_patch(name: &str) -> bool {
    name.ends_with(".patch")
}

fn json_patch_document(
    target: &mut AnnotatedDocument,
    name: &str,
    operations: &json_patch::Patch,
) -> Result<()> {
    let json_error = |message: String| EngineError::JsonPatch {
        name: name.to_string(),
        message,
    };

    let mut doc = serde_json::to_value(target.value()).map_err(|e| json_error(e.to_string()))?;
    json_patch::patch(&mut doc, &operations.0).map_err(|e| json_error(e.to_string()))?;
    *target.value_mut() = serde_yaml::to_value(&doc).map_err(|e| json_error(e.to_string()))?;
    Ok(())
}
