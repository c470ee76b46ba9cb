//! Format tags and the opaque payload handle.
//!
//! The cache core never inspects payload contents. A [`Payload`] is a handle
//! over immutable bytes plus nothing else; the conversion registry is the only
//! component that knows what the bytes mean for a given [`DataFormat`].

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// Tag naming a payload representation.
///
/// Tags are drawn from the string alphabet the conversion registry defines
/// (e.g. `"raw"`, `"rgba"`, `"texture"`). The core treats them as opaque
/// identity: equal tags mean the same representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataFormat(Arc<str>);

impl DataFormat {
    /// Create a format tag.
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref()))
    }

    /// The tag string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataFormat {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for DataFormat {
    fn from(tag: String) -> Self {
        Self(Arc::from(tag))
    }
}

/// Opaque payload handle: immutable bytes in some registry-defined format.
///
/// Cloning shares the underlying buffer. A deep copy goes through
/// [`Payload::deep_copy`] (or the registry's `copy`, which may do better for
/// formats with out-of-band resources).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    /// Wrap existing bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// An empty payload.
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Borrow the bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy into a freshly allocated buffer.
    pub fn deep_copy(&self) -> Self {
        Self(Bytes::copy_from_slice(&self.0))
    }

    /// Whether two handles share the same underlying buffer.
    ///
    /// Used by tests to assert that copying actually copied.
    pub fn shares_buffer(&self, other: &Payload) -> bool {
        self.0.as_ptr() == other.0.as_ptr() && self.0.len() == other.0.len()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}
