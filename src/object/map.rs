//! Hand-rolled separate-chaining hash map (§3.3, §6.5).
//!
//! A bucket/chain layout instead of `std::collections::HashMap` because
//! inline caches (§6.5) key off a stable `cached_bucket_index` — a detail
//! `HashMap`'s opaque internal layout can't expose. Grounded on the
//! teacher's `HeapData::Map(HashMap<...>)` generalized to the explicit
//! bucket table spec.md's IC contract requires.

use crate::value::Boxed64;

const INITIAL_BUCKETS: usize = 8;
const MAX_LOAD_FACTOR: f64 = 0.75;

pub struct MapEntry {
    pub key: Box<str>,
    pub value: Boxed64,
}

pub struct MapBody {
    buckets: Vec<Vec<MapEntry>>,
    len: usize,
}

impl MapBody {
    pub fn new() -> Self {
        Self { buckets: (0..INITIAL_BUCKETS).map(|_| Vec::new()).collect(), len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn hash(key: &str) -> u64 {
        // FNV-1a: simple, stable across runs, adequate for a bucket index.
        let mut h: u64 = 0xcbf29ce484222325;
        for b in key.as_bytes() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }

    /// The bucket a key currently hashes to — this is the index §6.5's
    /// inline cache stashes as `cached_bucket_index`.
    pub fn bucket_index(&self, key: &str) -> usize {
        (Self::hash(key) as usize) % self.buckets.len()
    }

    pub fn get(&self, key: &str) -> Option<Boxed64> {
        let idx = self.bucket_index(key);
        self.buckets[idx].iter().find(|e| e.key.as_ref() == key).map(|e| e.value)
    }

    /// Looks up via a previously cached bucket index (§6.5 IC hit path).
    /// Falls back to `None` if the cache is stale (bucket count changed).
    pub fn get_cached(&self, key: &str, cached_bucket_index: usize) -> Option<Boxed64> {
        if cached_bucket_index >= self.buckets.len() {
            return None;
        }
        self.buckets[cached_bucket_index].iter().find(|e| e.key.as_ref() == key).map(|e| e.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: Boxed64) {
        if self.len + 1 > (self.buckets.len() as f64 * MAX_LOAD_FACTOR) as usize {
            self.grow();
        }
        let idx = self.bucket_index(key);
        if let Some(entry) = self.buckets[idx].iter_mut().find(|e| e.key.as_ref() == key) {
            entry.value = value;
            return;
        }
        self.buckets[idx].push(MapEntry { key: key.into(), value });
        self.len += 1;
    }

    pub fn remove(&mut self, key: &str) -> Option<Boxed64> {
        let idx = self.bucket_index(key);
        let chain = &mut self.buckets[idx];
        let pos = chain.iter().position(|e| e.key.as_ref() == key)?;
        let entry = chain.remove(pos);
        self.len -= 1;
        Some(entry.value)
    }

    fn grow(&mut self) {
        let new_count = self.buckets.len() * 2;
        let mut new_buckets: Vec<Vec<MapEntry>> = (0..new_count).map(|_| Vec::new()).collect();
        for chain in self.buckets.drain(..) {
            for entry in chain {
                let idx = (Self::hash(&entry.key) as usize) % new_count;
                new_buckets[idx].push(entry);
            }
        }
        self.buckets = new_buckets;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Boxed64)> {
        self.buckets.iter().flat_map(|chain| chain.iter().map(|e| (e.key.as_ref(), e.value)))
    }

    /// Deep-clones the map for copy-on-write (§4.2): fresh buckets, same
    /// keys, same value payloads (the caller is responsible for retaining
    /// any pointer values the clone now also references).
    pub fn clone_shallow(&self) -> Self {
        Self {
            buckets: self
                .buckets
                .iter()
                .map(|chain| {
                    chain
                        .iter()
                        .map(|e| MapEntry { key: e.key.clone(), value: e.value })
                        .collect()
                })
                .collect(),
            len: self.len,
        }
    }
}

impl Default for MapBody {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_roundtrip() {
        let mut m = MapBody::new();
        m.set("a", Boxed64::encode_int(1));
        m.set("b", Boxed64::encode_int(2));
        assert_eq!(m.get("a").unwrap().decode_int(), 1);
        assert_eq!(m.len(), 2);
        assert_eq!(m.remove("a").unwrap().decode_int(), 1);
        assert!(m.get("a").is_none());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut m = MapBody::new();
        for i in 0..100 {
            m.set(&format!("k{i}"), Boxed64::encode_int(i));
        }
        assert_eq!(m.len(), 100);
        for i in 0..100 {
            assert_eq!(m.get(&format!("k{i}")).unwrap().decode_int(), i);
        }
    }

    #[test]
    fn cached_bucket_lookup_matches_fresh_lookup() {
        let mut m = MapBody::new();
        m.set("x", Boxed64::encode_int(7));
        let idx = m.bucket_index("x");
        assert_eq!(m.get_cached("x", idx).unwrap().decode_int(), 7);
    }
}
