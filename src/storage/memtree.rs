use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use anyhow::{Error, Result};

use super::btree::DeleteOutcome;
use crate::common::CompareOp;
use crate::types::DataType;

/// Key wrapper that routes ordering through the type's comparator, so raw
/// little-endian key bytes sort numerically inside the map.
#[derive(Clone, Debug)]
struct MemKey {
    ty: DataType,
    bytes: Vec<u8>,
}

impl PartialEq for MemKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MemKey {}

impl PartialOrd for MemKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ty.compare(&self.bytes, &other.bytes)
    }
}

/// In-memory ordered tree with the same cursor contract as the on-disk
/// B+Tree. ORDER BY and GROUP BY materialize through one of these; unlike
/// the B+Tree it may carry duplicate keys, which keep insertion order
/// within their bucket.
pub struct MemTree {
    key_type: DataType,
    allow_duplicates: bool,
    map: BTreeMap<MemKey, Vec<Vec<u8>>>,
    len: usize,
}

impl MemTree {
    pub fn new(key_type: DataType, allow_duplicates: bool) -> Self {
        Self {
            key_type,
            allow_duplicates,
            map: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mem_key(&self, bytes: &[u8]) -> MemKey {
        MemKey {
            ty: self.key_type,
            bytes: bytes.to_vec(),
        }
    }

    pub fn insert(&mut self, key: &[u8], record: &[u8]) -> Result<()> {
        let key = self.mem_key(key);
        let bucket = self.map.entry(key).or_default();
        if !bucket.is_empty() && !self.allow_duplicates {
            return Err(Error::msg("duplicate key"));
        }
        bucket.push(record.to_vec());
        self.len += 1;
        Ok(())
    }
}

/// Position inside a `MemTree`: the current key plus an index into its
/// duplicate bucket. Steps re-enter the map through range queries, so the
/// cursor stays coherent across mutations of other entries.
#[derive(Clone, Debug, Default)]
pub struct MemTreeCursor {
    position: Option<(Vec<u8>, usize)>,
}

impl MemTreeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.position.is_some()
    }

    pub fn first(&mut self, tree: &MemTree) -> bool {
        self.position = tree
            .map
            .iter()
            .next()
            .map(|(key, _)| (key.bytes.clone(), 0));
        self.is_valid()
    }

    pub fn last(&mut self, tree: &MemTree) -> bool {
        self.position = tree
            .map
            .iter()
            .next_back()
            .map(|(key, bucket)| (key.bytes.clone(), bucket.len() - 1));
        self.is_valid()
    }

    pub fn next(&mut self, tree: &MemTree) -> bool {
        let Some((key_bytes, index)) = self.position.take() else {
            return false;
        };
        let key = tree.mem_key(&key_bytes);
        if let Some(bucket) = tree.map.get(&key) {
            if index + 1 < bucket.len() {
                self.position = Some((key_bytes, index + 1));
                return true;
            }
        }
        self.position = tree
            .map
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(next_key, _)| (next_key.bytes.clone(), 0));
        self.is_valid()
    }

    pub fn previous(&mut self, tree: &MemTree) -> bool {
        let Some((key_bytes, index)) = self.position.take() else {
            return false;
        };
        if index > 0 {
            self.position = Some((key_bytes, index - 1));
            return true;
        }
        let key = tree.mem_key(&key_bytes);
        self.position = tree
            .map
            .range((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(prev_key, bucket)| (prev_key.bytes.clone(), bucket.len() - 1));
        self.is_valid()
    }

    pub fn seek(&mut self, tree: &MemTree, key: &[u8], op: CompareOp) -> Result<bool> {
        let key = tree.mem_key(key);
        self.position = match op {
            CompareOp::Eq => tree.map.get_key_value(&key).map(|(k, _)| (k.bytes.clone(), 0)),
            CompareOp::GreaterEq => tree
                .map
                .range((Bound::Included(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| (k.bytes.clone(), 0)),
            CompareOp::Greater => tree
                .map
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| (k.bytes.clone(), 0)),
            CompareOp::LessEq => tree
                .map
                .range((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .map(|(k, bucket)| (k.bytes.clone(), bucket.len() - 1)),
            CompareOp::Less => tree
                .map
                .range((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
                .map(|(k, bucket)| (k.bytes.clone(), bucket.len() - 1)),
            CompareOp::NotEq => {
                return Err(Error::msg("seek with != has no scan direction"));
            }
        };
        Ok(self.is_valid())
    }

    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        let (key, _) = self.require_position()?;
        Ok(key.clone())
    }

    pub fn record_bytes(&self, tree: &MemTree) -> Result<Vec<u8>> {
        let (key_bytes, index) = self.require_position()?;
        let bucket = tree
            .map
            .get(&tree.mem_key(key_bytes))
            .ok_or_else(|| Error::msg("cursor points at a removed entry"))?;
        Ok(bucket[*index].clone())
    }

    pub fn update(&mut self, tree: &mut MemTree, record: &[u8]) -> Result<()> {
        let (key_bytes, index) = self.require_position()?.clone();
        let key = tree.mem_key(&key_bytes);
        let bucket = tree
            .map
            .get_mut(&key)
            .ok_or_else(|| Error::msg("cursor points at a removed entry"))?;
        bucket[index] = record.to_vec();
        Ok(())
    }

    /// Deletes the current entry and repositions on its successor, which
    /// may be the next duplicate of the same key.
    pub fn delete(&mut self, tree: &mut MemTree) -> Result<DeleteOutcome> {
        let (key_bytes, index) = self.require_position()?.clone();
        let key = tree.mem_key(&key_bytes);
        let bucket = tree
            .map
            .get_mut(&key)
            .ok_or_else(|| Error::msg("cursor points at a removed entry"))?;
        bucket.remove(index);
        tree.len -= 1;
        let emptied = bucket.is_empty();
        if emptied {
            tree.map.remove(&key);
        }

        if !emptied && index < tree.map.get(&key).map_or(0, |bucket| bucket.len()) {
            self.position = Some((key_bytes, index));
            return Ok(DeleteOutcome::Deleted);
        }
        self.position = tree
            .map
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(next_key, _)| (next_key.bytes.clone(), 0));
        if self.is_valid() {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::DeletedAndInvalidated)
        }
    }

    fn require_position(&self) -> Result<&(Vec<u8>, usize)> {
        self.position
            .as_ref()
            .ok_or_else(|| Error::msg("cursor is not positioned on a row"))
    }
}

#[cfg(test)]
mod tests {
    use super::{MemTree, MemTreeCursor};
    use crate::common::CompareOp;
    use crate::storage::btree::DeleteOutcome;
    use crate::types::DataType;

    fn key(k: u32) -> [u8; 4] {
        k.to_le_bytes()
    }

    fn collect_forward(tree: &MemTree) -> Vec<(u32, Vec<u8>)> {
        let mut cursor = MemTreeCursor::new();
        let mut out = Vec::new();
        let mut more = cursor.first(tree);
        while more {
            let k = u32::from_le_bytes(cursor.key_bytes().unwrap()[..4].try_into().unwrap());
            out.push((k, cursor.record_bytes(tree).unwrap()));
            more = cursor.next(tree);
        }
        out
    }

    #[test]
    fn traversal_is_in_key_order() {
        let mut tree = MemTree::new(DataType::U32, false);
        for k in [30u32, 10, 20, 40] {
            tree.insert(&key(k), b"r").unwrap();
        }
        let keys: Vec<u32> = collect_forward(&tree).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30, 40]);
    }

    #[test]
    fn duplicates_keep_insertion_order_within_a_key() {
        let mut tree = MemTree::new(DataType::U32, true);
        tree.insert(&key(5), b"a").unwrap();
        tree.insert(&key(5), b"b").unwrap();
        tree.insert(&key(1), b"c").unwrap();
        let rows = collect_forward(&tree);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (1, b"c".to_vec()));
        assert_eq!(rows[1], (5, b"a".to_vec()));
        assert_eq!(rows[2], (5, b"b".to_vec()));
    }

    #[test]
    fn duplicate_rejected_when_not_allowed() {
        let mut tree = MemTree::new(DataType::U32, false);
        tree.insert(&key(5), b"a").unwrap();
        assert!(tree.insert(&key(5), b"b").is_err());
    }

    #[test]
    fn backward_traversal_and_seeks() {
        let mut tree = MemTree::new(DataType::U32, true);
        for k in [10u32, 20, 30] {
            tree.insert(&key(k), b"r").unwrap();
        }
        let mut cursor = MemTreeCursor::new();
        assert!(cursor.last(&tree));
        assert_eq!(cursor.key_bytes().unwrap(), key(30));
        assert!(cursor.previous(&tree));
        assert_eq!(cursor.key_bytes().unwrap(), key(20));

        assert!(cursor.seek(&tree, &key(15), CompareOp::Greater).unwrap());
        assert_eq!(cursor.key_bytes().unwrap(), key(20));
        assert!(cursor.seek(&tree, &key(15), CompareOp::Less).unwrap());
        assert_eq!(cursor.key_bytes().unwrap(), key(10));
        assert!(!cursor.seek(&tree, &key(15), CompareOp::Eq).unwrap());
    }

    #[test]
    fn delete_steps_through_duplicates_first() {
        let mut tree = MemTree::new(DataType::U32, true);
        tree.insert(&key(5), b"a").unwrap();
        tree.insert(&key(5), b"b").unwrap();
        tree.insert(&key(9), b"c").unwrap();

        let mut cursor = MemTreeCursor::new();
        cursor.first(&tree);
        assert_eq!(cursor.delete(&mut tree).unwrap(), DeleteOutcome::Deleted);
        assert_eq!(cursor.record_bytes(&tree).unwrap(), b"b".to_vec());
        assert_eq!(cursor.delete(&mut tree).unwrap(), DeleteOutcome::Deleted);
        assert_eq!(cursor.key_bytes().unwrap(), key(9));
        assert_eq!(
            cursor.delete(&mut tree).unwrap(),
            DeleteOutcome::DeletedAndInvalidated
        );
        assert!(tree.is_empty());
    }
}
