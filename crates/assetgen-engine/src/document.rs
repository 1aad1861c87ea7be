//! YAML documents that remember how they were built

use assetgen_core::PlaceholderTable;
use serde::Deserialize;
use serde_yaml::Value;

use crate::error::{EngineError, Result};
use crate::merge::{MergeOptions, merge_values};

const GENERATED_HEADER: &str = "Generated file. Do not edit. Update using \"make update\".";

/// Rendering options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Prefix the document with its provenance log as YAML comments
    pub provenance: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { provenance: true }
    }
}

/// A YAML document stream paired with an append-only provenance log
///
/// Most templates hold one document. A template may bundle several
/// (`---` separated, e.g. a Role and its RoleBinding); the first one is
/// the primary document that sidecar injection and JSON patches work on,
/// the others ride along and are merged index by index.
///
/// Every mutation through this type appends a log entry, so an empty log
/// means the document is exactly what was loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedDocument {
    name: String,
    value: Value,
    trailing: Vec<Value>,
    log: Vec<String>,
}

impl AnnotatedDocument {
    /// Parse a document from raw bytes
    pub fn load(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        Self::load_substituted(name, bytes, &PlaceholderTable::new())
    }

    /// Substitute placeholders in the raw bytes, then parse
    pub fn load_substituted(
        name: impl Into<String>,
        bytes: &[u8],
        table: &PlaceholderTable,
    ) -> Result<Self> {
        let name = name.into();
        let text = std::str::from_utf8(bytes).map_err(|_| EngineError::NotUtf8 {
            name: name.clone(),
        })?;
        let (value, trailing) = split_primary(parse_documents(&name, &table.apply(text))?);
        Ok(Self {
            name,
            value,
            trailing,
            log: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The primary (first) document
    pub fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Every document of the stream, primary first
    pub fn documents(&self) -> impl Iterator<Item = &Value> {
        std::iter::once(&self.value).chain(&self.trailing)
    }

    /// The provenance log, oldest entry first
    pub fn provenance(&self) -> &[String] {
        &self.log
    }

    /// True if nothing was ever done to this document since it was loaded
    pub fn is_pristine(&self) -> bool {
        self.log.is_empty()
    }

    /// Append a provenance entry without touching the document
    pub fn record(&mut self, message: impl Into<String>) {
        self.log.push(message.into());
    }

    /// Replace placeholders anywhere in the document text
    ///
    /// The document is serialized, substituted as plain text and parsed
    /// again, so placeholders in keys are replaced as well as in values.
    pub fn substitute(&mut self, table: &PlaceholderTable) -> Result<()> {
        let text = self.to_yaml()?;
        let substituted = table.apply(&text);
        if substituted != text {
            let docs = parse_documents(&self.name, &substituted)?;
            (self.value, self.trailing) = split_primary(docs);
            self.record(format!("Substituted {}", describe_table(table)));
        }
        Ok(())
    }

    /// Deep merge another document into this one
    pub fn merge_from(&mut self, patch: &AnnotatedDocument) -> Result<()> {
        self.merge_from_with(patch, &MergeOptions::default())
    }

    /// Deep merge with explicit merge options
    ///
    /// Documents are paired by position. Patch documents past the end of
    /// this stream are appended.
    pub fn merge_from_with(
        &mut self,
        patch: &AnnotatedDocument,
        options: &MergeOptions,
    ) -> Result<()> {
        merge_values(&mut self.value, &patch.value, options)?;
        for (index, doc) in patch.trailing.iter().enumerate() {
            match self.trailing.get_mut(index) {
                Some(target) => merge_values(target, doc, options)?,
                None => self.trailing.push(doc.clone()),
            }
        }
        self.record(format!("Merged {}", patch.name));
        Ok(())
    }

    /// Render with the default options
    pub fn render(&self) -> Result<Vec<u8>> {
        self.render_with(&RenderOptions::default())
    }

    /// Render to canonical YAML
    ///
    /// Keys keep their first-seen order and documents are separated by
    /// `---`. With `provenance` enabled the stream is preceded by a
    /// comment block listing its log.
    pub fn render_with(&self, options: &RenderOptions) -> Result<Vec<u8>> {
        let body = self.to_yaml()?;
        if !options.provenance {
            return Ok(body.into_bytes());
        }

        let mut out = String::with_capacity(body.len() + 64 * (self.log.len() + 2));
        out.push_str("# ");
        out.push_str(GENERATED_HEADER);
        out.push_str("\n#\n");
        for entry in &self.log {
            for line in entry.lines() {
                out.push_str("# ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push_str("#\n\n");
        out.push_str(&body);
        Ok(out.into_bytes())
    }

    fn to_yaml(&self) -> Result<String> {
        let docs = self
            .documents()
            .map(serde_yaml::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|source| EngineError::Render {
                name: self.name.clone(),
                source,
            })?;
        Ok(docs.join("---\n"))
    }
}

/// Parse every document of a YAML stream
///
/// Empty documents are dropped. A stream without any content (empty or
/// comments only) yields a single null document.
pub(crate) fn parse_documents(name: &str, text: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let doc = Value::deserialize(de).map_err(|source| EngineError::Parse {
            name: name.to_string(),
            source,
        })?;
        if !doc.is_null() {
            docs.push(doc);
        }
    }
    if docs.is_empty() {
        docs.push(Value::Null);
    }
    Ok(docs)
}

fn split_primary(mut docs: Vec<Value>) -> (Value, Vec<Value>) {
    if docs.is_empty() {
        return (Value::Null, docs);
    }
    let primary = docs.remove(0);
    (primary, docs)
}

/// `TOKEN=value, ...` without the `${}` markers, so provenance comments
/// never look like unresolved placeholders
pub(crate) fn describe_table(table: &PlaceholderTable) -> String {
    table
        .resolved()
        .into_iter()
        .map(|(token, value)| {
            let bare = token
                .strip_prefix("${")
                .and_then(|t| t.strip_suffix('}'))
                .unwrap_or(token);
            format!("{}={}", bare, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}
