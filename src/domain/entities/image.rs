//! Loaded image types.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use super::cache_key::CacheKey;
use super::request::SourceKind;

/// Image data delivered to observers and targets.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    /// Decoded and transformed bitmap.
    Decoded(Arc<image::DynamicImage>),
    /// Raw encoded bytes, produced by download-only loads.
    Encoded(Bytes),
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageOrigin {
    /// Loaded from in-memory LRU cache.
    MemoryCache,
    /// Loaded from disk cache.
    DiskCache,
    /// Downloaded from network.
    Network,
    /// Read from a local file or bundle.
    Local,
    /// Read from a caller stream.
    Stream,
}

impl ImageOrigin {
    /// Returns the origin of a fresh fetch from the given source kind.
    #[must_use]
    pub const fn for_source(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Url => Self::Network,
            SourceKind::File | SourceKind::Bundle => Self::Local,
            SourceKind::Stream => Self::Stream,
        }
    }

    /// Returns true if the image was served from a cache tier.
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::MemoryCache | Self::DiskCache)
    }
}

impl std::fmt::Display for ImageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
            Self::Local => write!(f, "local"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Cache key of the request.
    pub key: CacheKey,
    /// Image data.
    pub payload: ImagePayload,
    /// Where the data came from.
    pub origin: ImageOrigin,
}

impl LoadedImage {
    /// Returns the decoded bitmap, if this load decoded one.
    #[must_use]
    pub const fn decoded(&self) -> Option<&Arc<image::DynamicImage>> {
        match &self.payload {
            ImagePayload::Decoded(image) => Some(image),
            ImagePayload::Encoded(_) => None,
        }
    }

    /// Returns the bitmap dimensions, if decoded.
    #[must_use]
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.decoded().map(|image| (image.width(), image.height()))
    }

    /// Returns true if the payload is still encoded.
    #[must_use]
    pub const fn is_encoded(&self) -> bool {
        matches!(self.payload, ImagePayload::Encoded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_for_source() {
        assert_eq!(ImageOrigin::for_source(SourceKind::Url), ImageOrigin::Network);
        assert_eq!(ImageOrigin::for_source(SourceKind::Bundle), ImageOrigin::Local);
        assert_eq!(ImageOrigin::for_source(SourceKind::Stream), ImageOrigin::Stream);
        assert!(ImageOrigin::DiskCache.is_cached());
        assert!(!ImageOrigin::Network.is_cached());
    }

    #[test]
    fn test_dimensions() {
        let loaded = LoadedImage {
            key: CacheKey::new("k"),
            payload: ImagePayload::Decoded(Arc::new(image::DynamicImage::new_rgb8(3, 7))),
            origin: ImageOrigin::Local,
        };
        assert_eq!(loaded.dimensions(), Some((3, 7)));

        let encoded = LoadedImage {
            payload: ImagePayload::Encoded(Bytes::from_static(b"raw")),
            ..loaded
        };
        assert!(encoded.is_encoded());
        assert_eq!(encoded.dimensions(), None);
    }
}
