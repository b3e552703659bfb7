//! Deterministic cache keys for image requests.

use sha2::{Digest, Sha256};

use super::request::LoadRequest;

/// Unique identifier for a cached image.
/// Generated from a hash of the source identity and transformations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a new `CacheKey` from an already computed identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the key for a request.
    ///
    /// A custom cache key replaces the source identity, transformations are
    /// always mixed in, in order.
    #[must_use]
    pub fn for_request(request: &LoadRequest) -> Self {
        let identity = request
            .custom_key()
            .map_or_else(|| request.source().identity(), |key| format!("custom:{key}"));

        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        for transformation in request.transformations() {
            hasher.update([0x1f]);
            hasher.update(transformation.key().as_bytes());
        }
        let result = hasher.finalize();
        Self(hex::encode(&result[..16]))
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{LoadRequest, Transformation};
    use test_case::test_case;

    #[test_case(LoadRequest::url("https://example.com/a.png") ; "url")]
    #[test_case(LoadRequest::file("/tmp/a.png") ; "file")]
    #[test_case(LoadRequest::bundle("icons/a.png") ; "bundle")]
    fn test_key_is_stable(request: LoadRequest) {
        let first = CacheKey::for_request(&request);
        let second = CacheKey::for_request(&request.clone());
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 32);
    }

    #[test]
    fn test_source_kinds_do_not_collide() {
        let url = CacheKey::for_request(&LoadRequest::url("a.png"));
        let file = CacheKey::for_request(&LoadRequest::file("a.png"));
        let bundle = CacheKey::for_request(&LoadRequest::bundle("a.png"));
        assert_ne!(url, file);
        assert_ne!(file, bundle);
        assert_ne!(url, bundle);
    }

    #[test]
    fn test_transformations_change_key() {
        let plain = LoadRequest::url("https://example.com/a.png");
        let gray = plain.clone().with_transformation(Transformation::Grayscale);
        let gray_small = gray.clone().with_downsample(64, 64);

        let keys = [
            CacheKey::for_request(&plain),
            CacheKey::for_request(&gray),
            CacheKey::for_request(&gray_small),
        ];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
    }

    #[test]
    fn test_transformation_order_matters() {
        let base = LoadRequest::url("https://example.com/a.png");
        let a = base
            .clone()
            .with_transformation(Transformation::Rotate90)
            .with_transformation(Transformation::FlipHorizontal);
        let b = base
            .with_transformation(Transformation::FlipHorizontal)
            .with_transformation(Transformation::Rotate90);
        assert_ne!(CacheKey::for_request(&a), CacheKey::for_request(&b));
    }

    #[test]
    fn test_custom_key_overrides_source() {
        let a = LoadRequest::url("https://example.com/a.png?sig=1").with_cache_key("avatar-42");
        let b = LoadRequest::url("https://example.com/a.png?sig=2").with_cache_key("avatar-42");
        assert_eq!(CacheKey::for_request(&a), CacheKey::for_request(&b));
    }
}
