//! Heap tuning knobs (§4.3), generalized from the teacher's hardcoded
//! `STACK_SIZE`/`MAX_FRAMES`/`MAX_ITERATIONS` constants into configuration
//! structs so embedders can size a heap per block without recompiling.

/// Tuning knobs for a single block's heap.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Soft allocation ceiling before a collection is forced (bytes).
    pub initial_gc_threshold: usize,
    /// Hard allocation ceiling; exceeding it even after a full collection
    /// is an out-of-memory error (§4.3.8).
    pub max_heap_size: usize,
    /// Survivor count (§3.2's survival nibble) at which an object is
    /// promoted from young to old generation.
    pub promotion_threshold: u8,
    /// Number of objects scanned per `incremental_step` call (§4.3.7).
    pub incremental_work_unit: usize,
    /// Growth factor applied to `next_gc` after a full collection that
    /// didn't free enough to stay under the current threshold.
    pub growth_factor: f64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_gc_threshold: 1 << 20, // 1 MiB
            max_heap_size: 1 << 30,        // 1 GiB
            promotion_threshold: 2,
            incremental_work_unit: 64,
            growth_factor: 2.0,
        }
    }
}

/// Cumulative collection counters (§4.3), exposed for diagnostics/logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub minor_collections: u64,
    pub full_collections: u64,
    pub objects_freed: u64,
    pub bytes_freed: u64,
    pub promotions: u64,
}
