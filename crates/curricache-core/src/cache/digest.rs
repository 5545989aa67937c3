use sha2::{Digest, Sha256};

use crate::models::CacheRecord;

/// SHA-256 over the `{id, title, updatedAt}` of each record, in order.
///
/// Two result sets with equal digests render the same, even when the
/// records are fresh instances from a new network response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityDigest([u8; 32]);

impl IdentityDigest {
    pub fn of<'a, R, I>(records: I) -> Self
    where
        R: CacheRecord,
        I: IntoIterator<Item = &'a R>,
    {
        let mut hasher = Sha256::new();
        for record in records {
            let identity = record.identity();
            hasher.update(identity.id.as_bytes());
            hasher.update([0x1f]);
            hasher.update(identity.title.as_bytes());
            hasher.update([0x1f]);
            hasher.update(identity.updated_at.timestamp_micros().to_be_bytes());
            hasher.update([0x1e]);
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Curriculum, EntityKey, OwnerKey};
    use chrono::{Duration, Utc};

    fn curriculum(id: &str, title: &str) -> Curriculum {
        Curriculum {
            id: EntityKey::from(id),
            owner_id: OwnerKey::from("u1"),
            title: title.to_string(),
            description: Some("ignored by the digest".to_string()),
            resources: vec![],
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_equal_identities_equal_digest() {
        let a = vec![curriculum("C1", "Rust")];
        let mut b = a.clone();
        b[0].description = Some("changed".to_string());
        assert_eq!(IdentityDigest::of(&a), IdentityDigest::of(&b));
    }

    #[test]
    fn test_title_or_timestamp_change_alters_digest() {
        let a = vec![curriculum("C1", "Rust")];
        let mut retitled = a.clone();
        retitled[0].title = "Rust 2".to_string();
        let mut touched = a.clone();
        touched[0].updated_at += Duration::seconds(1);
        assert_ne!(IdentityDigest::of(&a), IdentityDigest::of(&retitled));
        assert_ne!(IdentityDigest::of(&a), IdentityDigest::of(&touched));
    }

    #[test]
    fn test_order_matters() {
        let a = curriculum("C1", "A");
        let b = curriculum("C2", "B");
        let forward = IdentityDigest::of([&a, &b]);
        let reverse = IdentityDigest::of([&b, &a]);
        assert_ne!(forward, reverse);
        assert_eq!(forward.to_hex().len(), 64);
    }
}
