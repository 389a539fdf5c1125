//! Content catalog loading and identity hashing.
//!
//! The catalog is a plain UTF-8 text file with items separated by the
//! literal delimiter `***`. It is loaded once at startup and treated as
//! immutable for the process lifetime. Each item gets a stable content
//! identity (truncated hex digest of its exact bytes) so dispatch history
//! keys survive process restarts and catalog edits.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Literal delimiter between catalog items
pub const ITEM_DELIMITER: &str = "***";

/// Length of a content identity in hex characters
pub const IDENTITY_LEN: usize = 32;

/// Errors raised while loading the content catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog file is missing or unreadable
    #[error("Failed to read content catalog {path}: {source}")]
    Read {
        /// Path that was attempted
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The catalog file contained no items
    #[error("Content catalog {0} has no items")]
    Empty(String),
}

/// Immutable set of content items keyed by their identity hash
#[derive(Debug, Clone)]
pub struct ContentCatalog {
    items: HashMap<String, String>,
}

impl ContentCatalog {
    /// Load the catalog from a text file
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Read`] if the file is missing or unreadable
    /// and [`CatalogError::Empty`] if it contains no items.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_text(&content);
        if catalog.is_empty() {
            return Err(CatalogError::Empty(path.display().to_string()));
        }
        Ok(catalog)
    }

    /// Build a catalog from raw delimited text, trimming each item and
    /// dropping empty fragments
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        let items = text
            .split(ITEM_DELIMITER)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| (Self::identity_of(item), item.to_string()))
            .collect();
        Self { items }
    }

    /// Deterministic content identity: truncated hex SHA-256 of the item's
    /// exact byte content. Byte-identical items always yield the same
    /// identity, across process restarts.
    #[must_use]
    pub fn identity_of(item: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(item.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..IDENTITY_LEN].to_string()
    }

    /// Items whose identity is absent from `used`, as (identity, content) pairs
    #[must_use]
    pub fn unused_for(&self, used: &HashSet<String>) -> Vec<(&str, &str)> {
        self.items
            .iter()
            .filter(|(identity, _)| !used.contains(*identity))
            .map(|(identity, item)| (identity.as_str(), item.as_str()))
            .collect()
    }

    /// Content for a given identity, if present
    #[must_use]
    pub fn content_of(&self, identity: &str) -> Option<&str> {
        self.items.get(identity).map(String::as_str)
    }

    /// Number of items in the catalog
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the catalog has no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_text_splits_and_trims() {
        let catalog = ContentCatalog::from_text("  first item \n***\nsecond item\n***\n\n***third");
        assert_eq!(catalog.len(), 3);
        let identity = ContentCatalog::identity_of("first item");
        assert_eq!(catalog.content_of(&identity), Some("first item"));
    }

    #[test]
    fn test_identity_is_stable_and_truncated() {
        let a = ContentCatalog::identity_of("same content");
        let b = ContentCatalog::identity_of("same content");
        assert_eq!(a, b);
        assert_eq!(a.len(), IDENTITY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, ContentCatalog::identity_of("other content"));
    }

    #[test]
    fn test_unused_for_excludes_used_identities() {
        let catalog = ContentCatalog::from_text("one***two***three");
        let mut used = HashSet::new();
        used.insert(ContentCatalog::identity_of("two"));

        let unused = catalog.unused_for(&used);
        assert_eq!(unused.len(), 2);
        assert!(unused.iter().all(|(_, item)| *item != "two"));

        let all: HashSet<String> = ["one", "two", "three"]
            .iter()
            .map(|item| ContentCatalog::identity_of(item))
            .collect();
        assert!(catalog.unused_for(&all).is_empty());
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = ContentCatalog::load(Path::new("/nonexistent/catalog.txt"));
        assert!(matches!(result, Err(CatalogError::Read { .. })));
    }

    #[test]
    fn test_blank_catalog_has_no_items() {
        let catalog = ContentCatalog::from_text("   \n*** \n ***  ");
        assert!(catalog.is_empty());
    }
}
