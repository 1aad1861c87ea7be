//! Placeholder tables for textual `${TOKEN}` substitution

use indexmap::IndexMap;

/// An ordered list of `(token, value)` substitutions
///
/// Tables are values: [`with`](Self::with) and [`extend`](Self::extend)
/// return a new table and leave the receiver untouched, so a table handed
/// out to several callers can never be changed behind their back.
///
/// A token may appear more than once. The last entry for a token wins,
/// which lets callers layer overrides on top of a shared base table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderTable {
    entries: Vec<(String, String)>,
}

impl PlaceholderTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy of this table with one more entry appended
    pub fn with(&self, token: impl Into<String>, value: impl ToString) -> Self {
        let mut next = self.clone();
        next.entries.push((token.into(), value.to_string()));
        next
    }

    /// Return a copy of this table with every entry of `other` appended
    pub fn extend(&self, other: &PlaceholderTable) -> Self {
        let mut next = self.clone();
        next.entries.extend(other.entries.iter().cloned());
        next
    }

    /// The effective value of a token (last entry wins)
    pub fn get(&self, token: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(t, _)| t == token)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct tokens in first-seen order, each with its effective value
    pub fn resolved(&self) -> IndexMap<&str, &str> {
        let mut resolved = IndexMap::new();
        for (token, value) in &self.entries {
            if !token.is_empty() {
                resolved.insert(token.as_str(), value.as_str());
            }
        }
        resolved
    }

    /// Replace every token occurrence in `text`
    ///
    /// The text is scanned once from left to right. At each position the
    /// first matching token (in first-seen order) is replaced by its
    /// effective value. Replacement values are never scanned again, so a
    /// value containing another token is emitted verbatim.
    pub fn apply(&self, text: &str) -> String {
        let resolved = self.resolved();
        if resolved.is_empty() {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        'scan: while !rest.is_empty() {
            for (token, value) in &resolved {
                if let Some(tail) = rest.strip_prefix(*token) {
                    out.push_str(value);
                    rest = tail;
                    continue 'scan;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for PlaceholderTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        }
    }
}
