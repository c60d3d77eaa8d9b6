//! Index definitions.

use super::ident::normalize_ident;
use serde::{Deserialize, Serialize};

/// A secondary index that is not backing a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index.
    pub fn new(name: impl Into<String>, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Create a unique index.
    pub fn unique(name: impl Into<String>, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            unique: true,
            ..Self::new(name, columns)
        }
    }

    /// Normalised name.
    pub fn key(&self) -> String {
        normalize_ident(&self.name)
    }

    /// Name plus structure; two indexes are the same only if both match.
    pub fn same_shape(&self, other: &IndexDef) -> bool {
        self.key() == other.key()
            && self.unique == other.unique
            && self.columns.len() == other.columns.len()
            && self
                .columns
                .iter()
                .zip(&other.columns)
                .all(|(a, b)| normalize_ident(a) == normalize_ident(b))
    }

    /// Whether the index leads with the given columns.
    pub fn covers_prefix(&self, columns: &[String]) -> bool {
        columns.len() <= self.columns.len()
            && columns
                .iter()
                .zip(&self.columns)
                .all(|(a, b)| normalize_ident(a) == normalize_ident(b))
    }
}
