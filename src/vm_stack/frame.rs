//! Call frame for the stack VM (§4.4.1, §4.4.3).

use crate::object::Object;

/// One activation record. `base` is the stack index of the frame's first
/// local slot; locals are addressed `base + n` and never shift once a
/// frame is pushed (the teacher's `CallFrame` convention in
/// `vm_nanbox.rs`, generalized to carry a closure pointer for upvalue
/// access instead of assuming globals-only capture).
pub struct CallFrame {
    pub chunk_index: u32,
    pub ip: usize,
    pub base: usize,
    /// The closure this frame is executing, if called indirectly through
    /// one (carries captured upvalues); `None` for a direct top-level or
    /// plain-function call with no captures.
    pub closure: Option<*const Object>,
    /// Unique per-activation id, used as `UpvalueState::Open`'s frame
    /// tag so a closed-over slot can be identified after the frame that
    /// owned it has been popped.
    pub frame_id: u64,
}

impl CallFrame {
    pub fn new(chunk_index: u32, base: usize, closure: Option<*const Object>, frame_id: u64) -> Self {
        Self { chunk_index, ip: 0, base, closure, frame_id }
    }
}
