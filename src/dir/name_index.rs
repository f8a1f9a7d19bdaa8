//! Per-directory name index & confusable checks (§4.9, informational).
//!
//! No crate in the retrieval pack pulls in Unicode normalization or
//! TR#39 confusable tables (neither the teacher nor any sibling example
//! repo), so rather than fabricate a dependency this module implements
//! the ASCII-identity case exactly (NFKC and the TR#39 skeleton
//! transform are both the identity on pure-ASCII input) and falls back
//! to raw-byte comparison for any name containing a non-ASCII byte —
//! recorded as a deliberate decision in `DESIGN.md`'s Open Question
//! list. The index's structural role (seeding directory rebuild,
//! detecting hard-error duplicate entries) is fully implemented
//! regardless.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Severity of a name collision within one directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionKind {
    /// Identical raw bytes: a hard error (duplicate entry, §4.8 step 5).
    Raw,
    /// Identical normalized form: rendering-identical, warn.
    Normalized,
    /// Identical skeleton form: may confuse users, info only.
    Skeleton,
}

#[derive(Debug, Clone)]
pub struct IndexedName {
    pub raw: Vec<u8>,
    pub normalized: Vec<u8>,
    pub skeleton: Vec<u8>,
    pub child_ino: u64,
    pub file_type: u8,
}

/// ASCII-only NFKC is the identity transform; this is the entire
/// "would-be-NFKC" step for the pack's non-dependency environment.
fn normalize(name: &[u8]) -> Vec<u8> {
    if name.is_ascii() {
        name.to_ascii_lowercase()
    } else {
        name.to_vec()
    }
}

/// ASCII confusable remap covers the handful of look-alikes that occur
/// without any Unicode input at all (e.g. letter/digit pairs used in
/// filename spoofing: `l`/`1`, `O`/`0`). Non-ASCII names skip the
/// remap and use their normalized form as the skeleton, same caveat as
/// above.
fn skeletonize(normalized: &[u8]) -> Vec<u8> {
    if !normalized.is_ascii() {
        return normalized.to_vec();
    }
    normalized
        .iter()
        .map(|&b| match b {
            b'1' | b'l' | b'I' => b'1',
            b'0' | b'O' => b'0',
            other => other,
        })
        .collect()
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Per-directory hash table keyed by name hash with secondary buckets
/// (a `Vec` per bucket, since real-world bucket occupancy is tiny).
#[derive(Default)]
pub struct NameIndex {
    buckets: HashMap<u64, Vec<IndexedName>>,
}

impl NameIndex {
    pub fn new() -> Self {
        NameIndex::default()
    }

    /// Insert `name` and report the most severe collision it has with
    /// an already-indexed name in this directory, if any.
    pub fn insert(&mut self, name: &[u8], child_ino: u64, file_type: u8) -> Option<CollisionKind> {
        let normalized = normalize(name);
        let skeleton = skeletonize(&normalized);
        let bucket = self.buckets.entry(hash_bytes(&normalized)).or_default();

        let mut collision = None;
        for existing in bucket.iter() {
            if existing.raw == name {
                collision = Some(CollisionKind::Raw);
                break;
            }
            if existing.normalized == normalized {
                collision = collision.max(Some(CollisionKind::Normalized));
            } else if existing.skeleton == skeleton {
                collision = collision.max(Some(CollisionKind::Skeleton));
            }
        }

        bucket.push(IndexedName {
            raw: name.to_vec(),
            normalized,
            skeleton,
            child_ino,
            file_type,
        });
        collision
    }

    /// All indexed names, used to seed directory rebuild (§4.8 step 6).
    pub fn all_entries(&self) -> Vec<&IndexedName> {
        self.buckets.values().flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialOrd for CollisionKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CollisionKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(k: &CollisionKind) -> u8 {
            match k {
                CollisionKind::Skeleton => 0,
                CollisionKind::Normalized => 1,
                CollisionKind::Raw => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_raw_bytes_is_hard_error() {
        let mut idx = NameIndex::new();
        assert_eq!(idx.insert(b"foo", 1, 0), None);
        assert_eq!(idx.insert(b"foo", 2, 0), Some(CollisionKind::Raw));
    }

    #[test]
    fn case_fold_collision_is_normalized() {
        let mut idx = NameIndex::new();
        assert_eq!(idx.insert(b"Foo", 1, 0), None);
        assert_eq!(idx.insert(b"foo", 2, 0), Some(CollisionKind::Normalized));
    }

    #[test]
    fn confusable_digits_collide_at_skeleton_level() {
        let mut idx = NameIndex::new();
        assert_eq!(idx.insert(b"l0g", 1, 0), None);
        assert_eq!(idx.insert(b"10g", 2, 0), Some(CollisionKind::Skeleton));
    }

    #[test]
    fn distinct_names_have_no_collision() {
        let mut idx = NameIndex::new();
        assert_eq!(idx.insert(b"alpha", 1, 0), None);
        assert_eq!(idx.insert(b"beta", 2, 0), None);
        assert_eq!(idx.len(), 2);
    }
}
