//! Bucket identities and the store keys derived from them.

/// The identity of a rate limit bucket.
///
/// Identities are opaque bytes supplied by callers; they are rendered as
/// (lossy) UTF-8 for logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketId(Vec<u8>);

impl BucketId {
    /// Create a new bucket identity.
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self(id.into())
    }

    /// The raw identity bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the identity, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The key under which this bucket's configuration is stored.
    pub fn info_key(&self) -> Vec<u8> {
        KeyType::Info.make(self)
    }

    /// The key under which this bucket's pending counter is stored.
    pub fn pending_key(&self) -> Vec<u8> {
        KeyType::Pending.make(self)
    }
}

impl From<&str> for BucketId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<Vec<u8>> for BucketId {
    fn from(id: Vec<u8>) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BucketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// The disjoint key namespaces a bucket persists under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Info,
    Pending,
}

impl KeyType {
    fn prefix(self) -> &'static [u8] {
        match self {
            KeyType::Info => b"info.",
            KeyType::Pending => b"pending.",
        }
    }

    fn make(self, id: &BucketId) -> Vec<u8> {
        let prefix = self.prefix();
        let mut key = Vec::with_capacity(prefix.len() + id.0.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(&id.0);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        let id = BucketId::from("testing");
        assert_eq!(id.info_key(), b"info.testing".to_vec());
        assert_eq!(id.pending_key(), b"pending.testing".to_vec());
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        // An id that looks like another namespace still lands in its own
        let tricky = BucketId::from("pending.x");
        let plain = BucketId::from("x");
        assert_ne!(tricky.info_key(), plain.pending_key());
        assert!(tricky.info_key().starts_with(b"info."));
    }

    #[test]
    fn test_display_is_lossy_utf8() {
        assert_eq!(BucketId::from("user:42").to_string(), "user:42");
        assert_eq!(BucketId::new(vec![0xff, b'a']).to_string(), "\u{fffd}a");
    }
}
