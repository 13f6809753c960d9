//! Annotation identifiers and their canonical form.
//!
//! The same logical annotation shows up across the dataset as a bare slug
//! (`abc123`), a container-relative path (`container/abc123`) or an absolute
//! store URL (`https://store/w3c/container/abc123`). Every id entering the
//! engine passes through [`IdCanonicalizer`] once, so all later comparisons
//! are plain equality on the absolute URL form.
//!
//! # Example
//!
//! ```
//! use annolink_core::ids::IdCanonicalizer;
//!
//! let ids = IdCanonicalizer::new("https://store.example/w3c", "maps");
//! let a = ids.canonicalize("abc123").unwrap();
//! let b = ids.canonicalize("https://store.example/w3c/maps/abc123/").unwrap();
//! assert_eq!(a, b);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an annotation in its canonical (absolute URL) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationId(String);

impl AnnotationId {
    /// Wrap an id that is already canonical.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, the store-assigned slug.
    pub fn slug(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.0)
    }

    pub fn is_absolute(&self) -> bool {
        is_absolute_url(&self.0)
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AnnotationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AnnotationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Maps every accepted id representation onto the absolute store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdCanonicalizer {
    base_url: String,
    container: String,
}

impl IdCanonicalizer {
    pub fn new(base_url: impl Into<String>, container: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let container = container.into().trim_matches('/').to_string();
        Self {
            base_url,
            container,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Canonicalize a raw id. Returns `None` for blank input.
    pub fn canonicalize(&self, raw: &str) -> Option<AnnotationId> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if is_absolute_url(raw) {
            return Some(AnnotationId(raw.trim_end_matches('/').to_string()));
        }

        let relative = raw.trim_matches('/');
        if relative.is_empty() {
            return None;
        }
        let container_prefix = format!("{}/", self.container);
        let url = if relative.starts_with(&container_prefix) {
            format!("{}/{}", self.base_url, relative)
        } else {
            format!("{}/{}/{}", self.base_url, self.container, relative)
        };
        Some(AnnotationId(url))
    }

    /// Canonicalize a list, dropping blanks and repeated ids while keeping
    /// first-occurrence order.
    pub fn canonicalize_all<I, S>(&self, raw: I) -> Vec<AnnotationId>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<AnnotationId> = Vec::new();
        for id in raw {
            if let Some(id) = self.canonicalize(id.as_ref()) {
                if !out.contains(&id) {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Whether an id lives in this store's container.
    pub fn is_local(&self, id: &AnnotationId) -> bool {
        id.as_str()
            .starts_with(&format!("{}/{}/", self.base_url, self.container))
    }
}

fn is_absolute_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon() -> IdCanonicalizer {
        IdCanonicalizer::new("https://store.example/w3c/", "/maps/")
    }

    #[test]
    fn test_bare_slug_becomes_absolute() {
        let id = canon().canonicalize("abc").unwrap();
        assert_eq!(id.as_str(), "https://store.example/w3c/maps/abc");
    }

    #[test]
    fn test_container_relative_path() {
        let id = canon().canonicalize("maps/abc").unwrap();
        assert_eq!(id.as_str(), "https://store.example/w3c/maps/abc");
    }

    #[test]
    fn test_absolute_url_kept_without_trailing_slash() {
        let id = canon()
            .canonicalize("  https://other.example/anno/xyz/ ")
            .unwrap();
        assert_eq!(id.as_str(), "https://other.example/anno/xyz");
    }

    #[test]
    fn test_three_forms_agree() {
        let c = canon();
        let bare = c.canonicalize("abc");
        let rel = c.canonicalize("/maps/abc");
        let full = c.canonicalize("https://store.example/w3c/maps/abc");
        assert_eq!(bare, rel);
        assert_eq!(rel, full);
    }

    #[test]
    fn test_blank_is_none() {
        assert!(canon().canonicalize("   ").is_none());
        assert!(canon().canonicalize("/").is_none());
    }

    #[test]
    fn test_canonicalize_all_dedupes_in_order() {
        let ids = canon().canonicalize_all(["b", "a", "https://store.example/w3c/maps/b", ""]);
        let slugs: Vec<&str> = ids.iter().map(|id| id.slug()).collect();
        assert_eq!(slugs, vec!["b", "a"]);
    }

    #[test]
    fn test_slug_and_locality() {
        let c = canon();
        let local = c.canonicalize("abc").unwrap();
        let foreign = AnnotationId::new("https://elsewhere.example/x/def");
        assert_eq!(local.slug(), "abc");
        assert_eq!(foreign.slug(), "def");
        assert!(c.is_local(&local));
        assert!(!c.is_local(&foreign));
    }
}
