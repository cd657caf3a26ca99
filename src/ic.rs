//! Inline caches for map-key lookups (§6.5).
//!
//! `Uninitialized -> Monomorphic -> Polymorphic(<=k) -> Megamorphic`,
//! keyed on a map's shape identity. Copy-on-write gives a mutated map a
//! fresh object identity (`cow_clone_map` in `heap::container_ops`), so
//! using the object's address as the shape id is sufficient: a cache that
//! still points at the pre-mutation object simply misses and re-learns.

use crate::object::{MapBody, Object};
use crate::value::Boxed64;

/// A single observed (shape, bucket index) pairing.
#[derive(Clone, Copy)]
struct CacheEntry {
    shape_id: usize,
    bucket_index: usize,
}

const DEFAULT_POLYMORPHIC_LIMIT: usize = 4;

pub enum InlineCache {
    Uninitialized,
    Monomorphic(CacheEntry),
    Polymorphic(Vec<CacheEntry>),
    Megamorphic,
}

impl InlineCache {
    pub fn new() -> Self {
        InlineCache::Uninitialized
    }

    fn shape_id(obj: *const Object) -> usize {
        obj as usize
    }

    /// Attempts a cached lookup of `key` on `map`, owned by `obj`.
    /// Returns `None` on any miss (uninitialized, unseen shape, or
    /// megamorphic — megamorphic caches never attempt a cached bucket,
    /// they fall through to the ordinary hash lookup every time).
    pub fn lookup(&self, obj: *const Object, map: &MapBody, key: &str) -> Option<Boxed64> {
        let shape = Self::shape_id(obj);
        match self {
            InlineCache::Uninitialized | InlineCache::Megamorphic => None,
            InlineCache::Monomorphic(entry) if entry.shape_id == shape => {
                map.get_cached(key, entry.bucket_index)
            }
            InlineCache::Monomorphic(_) => None,
            InlineCache::Polymorphic(entries) => entries
                .iter()
                .find(|e| e.shape_id == shape)
                .and_then(|e| map.get_cached(key, e.bucket_index)),
        }
    }

    /// Records a successful lookup's (shape, bucket index), advancing the
    /// cache's state per §6.5's transition table.
    pub fn update(&mut self, obj: *const Object, key: &str, map: &MapBody, limit: usize) {
        let shape = Self::shape_id(obj);
        let bucket_index = map.bucket_index(key);
        let entry = CacheEntry { shape_id: shape, bucket_index };
        *self = match std::mem::replace(self, InlineCache::Uninitialized) {
            InlineCache::Uninitialized => InlineCache::Monomorphic(entry),
            InlineCache::Monomorphic(existing) if existing.shape_id == shape => {
                InlineCache::Monomorphic(entry)
            }
            InlineCache::Monomorphic(existing) => InlineCache::Polymorphic(vec![existing, entry]),
            InlineCache::Polymorphic(mut entries) => {
                if let Some(slot) = entries.iter_mut().find(|e| e.shape_id == shape) {
                    slot.bucket_index = bucket_index;
                    InlineCache::Polymorphic(entries)
                } else if entries.len() + 1 >= limit.max(DEFAULT_POLYMORPHIC_LIMIT) {
                    InlineCache::Megamorphic
                } else {
                    entries.push(entry);
                    InlineCache::Polymorphic(entries)
                }
            }
            InlineCache::Megamorphic => InlineCache::Megamorphic,
        };
    }
}

impl Default for InlineCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectBody;

    fn make_map(entries: &[(&str, i64)]) -> Box<Object> {
        let mut m = MapBody::new();
        for (k, v) in entries {
            m.set(k, Boxed64::encode_int(*v));
        }
        Object::new(ObjectBody::Map(m))
    }

    fn map_body(obj: &Object) -> &MapBody {
        match &obj.body {
            ObjectBody::Map(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn starts_uninitialized_and_misses() {
        let obj = make_map(&[("a", 1)]);
        let ic = InlineCache::new();
        assert!(ic.lookup(obj.as_ref(), map_body(&obj), "a").is_none());
    }

    #[test]
    fn becomes_monomorphic_then_hits() {
        let obj = make_map(&[("a", 1)]);
        let mut ic = InlineCache::new();
        ic.update(obj.as_ref(), "a", map_body(&obj), 4);
        assert!(matches!(ic, InlineCache::Monomorphic(_)));
        assert_eq!(ic.lookup(obj.as_ref(), map_body(&obj), "a").unwrap().decode_int(), 1);
    }

    #[test]
    fn second_shape_promotes_to_polymorphic() {
        let obj_a = make_map(&[("a", 1)]);
        let obj_b = make_map(&[("a", 2)]);
        let mut ic = InlineCache::new();
        ic.update(obj_a.as_ref(), "a", map_body(&obj_a), 4);
        ic.update(obj_b.as_ref(), "a", map_body(&obj_b), 4);
        assert!(matches!(ic, InlineCache::Polymorphic(_)));
        assert_eq!(ic.lookup(obj_a.as_ref(), map_body(&obj_a), "a").unwrap().decode_int(), 1);
        assert_eq!(ic.lookup(obj_b.as_ref(), map_body(&obj_b), "a").unwrap().decode_int(), 2);
    }

    #[test]
    fn exceeding_limit_goes_megamorphic() {
        let mut ic = InlineCache::new();
        let objs: Vec<_> = (0..6).map(|i| make_map(&[("a", i)])).collect();
        for obj in &objs {
            ic.update(obj.as_ref(), "a", map_body(obj), 4);
        }
        assert!(matches!(ic, InlineCache::Megamorphic));
        assert!(ic.lookup(objs[0].as_ref(), map_body(&objs[0]), "a").is_none());
    }
}
