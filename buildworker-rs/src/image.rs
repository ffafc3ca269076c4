//! Container image references.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageRefError {
    #[error("container image reference is empty")]
    Empty,
    #[error("container image reference {0:?} contains whitespace")]
    Whitespace(String),
}

/// A container image reference, such as `ghcr.io/org/img:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference(String);

impl ImageReference {
    pub fn parse(reference: impl Into<String>) -> Result<Self, ImageRefError> {
        let reference = reference.into();
        let reference = reference.trim();

        if reference.is_empty() {
            return Err(ImageRefError::Empty);
        }

        if reference.chars().any(char::is_whitespace) {
            return Err(ImageRefError::Whitespace(reference.to_string()));
        }

        Ok(ImageReference(reference.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Registry host to log in to before pulling this image.
    pub fn registry_host(&self) -> &str {
        registry_host(&self.0)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything before the first path separator of an image reference, or the
/// empty string for references without one.
pub fn registry_host(reference: &str) -> &str {
    match reference.split_once('/') {
        Some((host, _)) => host,
        None => "",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extracts_registry_host() {
        assert_eq!(registry_host("ghcr.io/org/img:tag"), "ghcr.io");
        assert_eq!(registry_host("registry.example.com:5000/img"), "registry.example.com:5000");
        assert_eq!(registry_host("img:tag"), "");
        assert_eq!(registry_host(""), "");
    }

    #[test]
    fn parses_references() {
        let image = ImageReference::parse("  ghcr.io/org/img:tag\n").unwrap();
        assert_eq!(image.as_str(), "ghcr.io/org/img:tag");
        assert_eq!(image.registry_host(), "ghcr.io");

        assert_eq!(ImageReference::parse(""), Err(ImageRefError::Empty));
        assert!(matches!(
            ImageReference::parse("ghcr.io/org/img tag"),
            Err(ImageRefError::Whitespace(_))
        ));
    }
}
