//! Tri-color mark-sweep with an explicit gray worklist (§4.3.3, §4.3.4).
//!
//! A single mark bit plus an explicit gray `Vec`, not Lua's two-white-color
//! swap (`examples/other_examples/.../gc_object.rs`) — the swap exists to
//! avoid an O(n) unmark pass between cycles, which this design accepts in
//! exchange for a far simpler invariant. Recorded as an Open Question
//! resolution in DESIGN.md.

use crate::object::{for_each_child, Object, ObjectTag};
use crate::value::Boxed64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Idle,
    Marking,
    Sweeping,
}

/// Pushes `obj` onto the gray worklist if it is not already marked
/// (§4.3.3's "white becomes gray" step).
pub fn shade(obj: *mut Object, gray: &mut Vec<*mut Object>) {
    unsafe {
        let header = &(*obj).header;
        if !header.is_marked() {
            header.set_marked(true);
            gray.push(obj);
        }
    }
}

/// Seeds the gray list from a root value, ignoring non-pointer roots.
pub fn shade_root(root: Boxed64, gray: &mut Vec<*mut Object>) {
    if root.is_obj() {
        shade(root.decode_obj_mut(), gray);
    }
}

/// Pops one gray object, marks its children gray ("blacken"), per
/// `incremental_work_unit` worth of progress (§4.3.7). Returns `true` if
/// work remained, `false` if the gray list is now empty.
pub fn mark_step(gray: &mut Vec<*mut Object>) -> bool {
    match gray.pop() {
        Some(obj) => {
            unsafe {
                for_each_child(obj, &mut |child| shade(child, gray));
            }
            true
        }
        None => false,
    }
}

/// Sweeps at most `budget` objects starting at `cursor`, following the
/// heap's intrusive object list. `prev` is the last surviving object
/// (null meaning "the list head itself is the link-in slot"). Unmarked
/// objects are released (children torn down, memory freed); survivors
/// have their mark bit cleared for the next cycle and their survival
/// count bumped. Returns the updated `(cursor, prev, objects_freed,
/// bytes_freed, reached_end)` so the caller can resume next call.
///
/// # Safety
/// `cursor` must be null or point at a live `Object` owned by `heap_head`'s
/// intrusive list, and `prev`, if non-null, must be the object
/// immediately preceding `cursor` in that same list.
pub unsafe fn sweep_step(
    heap_head: &mut *mut Object,
    mut cursor: *mut Object,
    mut prev: *mut Object,
    budget: usize,
    size_of: impl Fn(&Object) -> usize,
) -> (*mut Object, *mut Object, u64, u64, bool) {
    let mut freed = 0u64;
    let mut bytes = 0u64;
    let mut remaining = budget;
    while remaining > 0 {
        if cursor.is_null() {
            return (cursor, prev, freed, bytes, true);
        }
        let obj = cursor;
        let next = (*obj).header.next;
        if (*obj).header.is_marked() {
            (*obj).header.set_marked(false);
            (*obj).header.bump_survival();
            prev = obj;
        } else {
            bytes += size_of(&*obj) as u64;
            crate::object::teardown_children(obj);
            if prev.is_null() {
                *heap_head = next;
            } else {
                (*prev).header.next = next;
            }
            drop(Box::from_raw(obj));
            freed += 1;
        }
        cursor = next;
        remaining -= 1;
    }
    (cursor, prev, freed, bytes, cursor.is_null())
}

/// Approximates an object's retained size for accounting purposes
/// (§4.3.1). Not exact — containers' heap-allocated backing stores are
/// estimated by length, not measured.
pub fn approx_size(obj: &Object) -> usize {
    const HEADER: usize = std::mem::size_of::<Boxed64>() * 2;
    HEADER
        + match obj.header.tag {
            ObjectTag::String => match &obj.body {
                crate::object::ObjectBody::String(s) => s.len(),
                _ => 0,
            },
            ObjectTag::Array => match &obj.body {
                crate::object::ObjectBody::Array(a) => a.items.len() * 8,
                _ => 0,
            },
            ObjectTag::Map => match &obj.body {
                crate::object::ObjectBody::Map(m) => m.len() * 32,
                _ => 0,
            },
            ObjectTag::Bytes => match &obj.body {
                crate::object::ObjectBody::Bytes(b) => b.len(),
                _ => 0,
            },
            ObjectTag::Vector => match &obj.body {
                crate::object::ObjectBody::Vector(v) => v.items.len() * 8,
                _ => 0,
            },
            ObjectTag::Closure => match &obj.body {
                crate::object::ObjectBody::Closure(c) => c.upvalues.len() * 8,
                _ => 0,
            },
            ObjectTag::Struct => match &obj.body {
                crate::object::ObjectBody::Struct(s) => s.fields.len() * 8,
                _ => 0,
            },
            _ => 16,
        }
}
