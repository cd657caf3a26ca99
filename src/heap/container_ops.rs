//! Copy-on-write mutating operations for `Array` and `Map` (§4.2).
//!
//! A mutation only clones the backing body when the container is shared
//! (refcount > 1); an exclusively-held container is mutated in place.
//! Every mutation that stores a pointer runs the GC write barrier before
//! the store, and COW-cloning an existing element list means every
//! retained child needs an extra `retain` to back the new container's
//! copy of the reference.

use crate::error::{ErrorKind, VmError};
use crate::heap::Heap;
use crate::object::{self, ArrayBody, MapBody, Object, ObjectBody};
use crate::value::Boxed64;

/// Returns `target` unchanged if exclusively held (`refcount == 1`);
/// otherwise allocates a clone with a freshly retained copy of every
/// child reference and returns that instead. The caller is responsible
/// for releasing its hold on `target` if a clone was returned in its
/// place (array/map ops here always consume the caller's reference and
/// return the reference to use going forward).
fn cow_clone_array(
    heap: &mut Heap,
    target: *mut Object,
) -> Result<*mut Object, VmError> {
    unsafe {
        if (*target).header.refcount() <= 1 {
            return Ok(target);
        }
        let items = match &(*target).body {
            ObjectBody::Array(a) => a.items.clone(),
            _ => unreachable!("cow_clone_array on non-array object"),
        };
        for item in &items {
            if item.is_obj() {
                object::retain(item.decode_obj());
            }
        }
        let boxed = heap
            .alloc(ObjectBody::Array(ArrayBody::from_vec(items)), Vec::new)
            .map_err(|_| VmError::new(ErrorKind::OutOfMemory, "heap exhausted during array copy-on-write"))?;
        object::release(target);
        Ok(boxed.decode_obj_mut())
    }
}

fn cow_clone_map(heap: &mut Heap, target: *mut Object) -> Result<*mut Object, VmError> {
    unsafe {
        if (*target).header.refcount() <= 1 {
            return Ok(target);
        }
        let cloned = match &(*target).body {
            ObjectBody::Map(m) => m.clone_shallow(),
            _ => unreachable!("cow_clone_map on non-map object"),
        };
        for (_, v) in cloned.iter() {
            if v.is_obj() {
                object::retain(v.decode_obj());
            }
        }
        let boxed = heap
            .alloc(ObjectBody::Map(cloned), Vec::new)
            .map_err(|_| VmError::new(ErrorKind::OutOfMemory, "heap exhausted during map copy-on-write"))?;
        object::release(target);
        Ok(boxed.decode_obj_mut())
    }
}

fn with_array_mut<R>(obj: *mut Object, f: impl FnOnce(&mut ArrayBody) -> R) -> R {
    unsafe {
        match &mut (*obj).body {
            ObjectBody::Array(a) => f(a),
            _ => unreachable!("expected array body"),
        }
    }
}

fn with_map_mut<R>(obj: *mut Object, f: impl FnOnce(&mut MapBody) -> R) -> R {
    unsafe {
        match &mut (*obj).body {
            ObjectBody::Map(m) => f(m),
            _ => unreachable!("expected map body"),
        }
    }
}

pub fn array_push(heap: &mut Heap, target: *mut Object, value: Boxed64) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    if value.is_obj() {
        unsafe { heap.write_barrier(obj, value) };
    }
    with_array_mut(obj, |a| a.items.push(value));
    Ok(obj)
}

pub fn array_pop(heap: &mut Heap, target: *mut Object) -> Result<(*mut Object, Option<Boxed64>), VmError> {
    let obj = cow_clone_array(heap, target)?;
    let popped = with_array_mut(obj, |a| a.items.pop());
    Ok((obj, popped))
}

pub fn array_set(
    heap: &mut Heap,
    target: *mut Object,
    index: usize,
    value: Boxed64,
) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    let len = with_array_mut(obj, |a| a.items.len());
    if index >= len {
        return Err(VmError::new(ErrorKind::OutOfBounds, format!("array index {index} out of bounds (len {len})")));
    }
    if value.is_obj() {
        unsafe { heap.write_barrier(obj, value) };
    }
    with_array_mut(obj, |a| {
        let old = a.items[index];
        if old.is_obj() {
            unsafe { object::release(old.decode_obj_mut()) };
        }
        a.items[index] = value;
    });
    Ok(obj)
}

pub fn array_insert(
    heap: &mut Heap,
    target: *mut Object,
    index: usize,
    value: Boxed64,
) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    let len = with_array_mut(obj, |a| a.items.len());
    if index > len {
        return Err(VmError::new(ErrorKind::OutOfBounds, format!("array insert index {index} out of bounds (len {len})")));
    }
    if value.is_obj() {
        unsafe { heap.write_barrier(obj, value) };
    }
    with_array_mut(obj, |a| a.items.insert(index, value));
    Ok(obj)
}

pub fn array_remove(
    heap: &mut Heap,
    target: *mut Object,
    index: usize,
) -> Result<(*mut Object, Boxed64), VmError> {
    let obj = cow_clone_array(heap, target)?;
    let len = with_array_mut(obj, |a| a.items.len());
    if index >= len {
        return Err(VmError::new(ErrorKind::OutOfBounds, format!("array remove index {index} out of bounds (len {len})")));
    }
    let removed = with_array_mut(obj, |a| a.items.remove(index));
    Ok((obj, removed))
}

pub fn array_clear(heap: &mut Heap, target: *mut Object) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    with_array_mut(obj, |a| {
        for item in a.items.drain(..) {
            if item.is_obj() {
                unsafe { object::release(item.decode_obj_mut()) };
            }
        }
    });
    Ok(obj)
}

pub fn array_reverse(heap: &mut Heap, target: *mut Object) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    with_array_mut(obj, |a| a.items.reverse());
    Ok(obj)
}

/// Sorts by the default value order (§4.2); elements that are not
/// mutually comparable under that order are left in their relative
/// position (a stable partial sort).
pub fn array_sort(heap: &mut Heap, target: *mut Object) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    with_array_mut(obj, |a| {
        a.items.sort_by(|x, y| object::default_compare(*x, *y).unwrap_or(std::cmp::Ordering::Equal));
    });
    Ok(obj)
}

/// Sorts by a caller-supplied comparator, installed for the duration of
/// the sort via [`object::with_sort_comparator`] (§4.2, §9) so the
/// callback never needs to cross an FFI-style boundary as a raw pointer.
pub fn array_sort_by(
    heap: &mut Heap,
    target: *mut Object,
    comparator: Box<dyn FnMut(Boxed64, Boxed64) -> std::cmp::Ordering>,
) -> Result<*mut Object, VmError> {
    let obj = cow_clone_array(heap, target)?;
    object::with_sort_comparator(comparator, || {
        with_array_mut(obj, |a| a.items.sort_by(|x, y| object::call_sort_comparator(*x, *y)));
    });
    Ok(obj)
}

pub fn map_set(heap: &mut Heap, target: *mut Object, key: &str, value: Boxed64) -> Result<*mut Object, VmError> {
    let obj = cow_clone_map(heap, target)?;
    if value.is_obj() {
        unsafe { heap.write_barrier(obj, value) };
    }
    with_map_mut(obj, |m| {
        if let Some(old) = m.get(key) {
            if old.is_obj() {
                unsafe { object::release(old.decode_obj_mut()) };
            }
        }
        m.set(key, value);
    });
    Ok(obj)
}

pub fn map_remove(heap: &mut Heap, target: *mut Object, key: &str) -> Result<(*mut Object, Option<Boxed64>), VmError> {
    let obj = cow_clone_map(heap, target)?;
    let removed = with_map_mut(obj, |m| m.remove(key));
    Ok((obj, removed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;

    fn new_heap() -> Heap {
        Heap::new(HeapConfig::default())
    }

    #[test]
    fn push_on_exclusively_held_array_mutates_in_place() {
        let mut heap = new_heap();
        let arr = heap.alloc(ObjectBody::Array(ArrayBody::new()), Vec::new).unwrap().decode_obj_mut();
        let same = array_push(&mut heap, arr, Boxed64::encode_int(1)).unwrap();
        assert_eq!(same, arr);
        with_array_mut(same, |a| assert_eq!(a.items.len(), 1));
    }

    #[test]
    fn push_on_shared_array_clones_and_leaves_original_untouched() {
        let mut heap = new_heap();
        let arr = heap.alloc(ObjectBody::Array(ArrayBody::new()), Vec::new).unwrap().decode_obj_mut();
        unsafe {
            object::retain(arr); // refcount now 2: "shared"
        }
        let result = array_push(&mut heap, arr, Boxed64::encode_int(9)).unwrap();
        assert_ne!(result, arr);
        with_array_mut(arr, |a| assert_eq!(a.items.len(), 0));
        with_array_mut(result, |a| assert_eq!(a.items.len(), 1));
    }

    #[test]
    fn set_out_of_bounds_errors() {
        let mut heap = new_heap();
        let arr = heap.alloc(ObjectBody::Array(ArrayBody::new()), Vec::new).unwrap().decode_obj_mut();
        let err = array_set(&mut heap, arr, 0, Boxed64::encode_int(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfBounds);
    }

    #[test]
    fn map_set_then_get_roundtrips() {
        let mut heap = new_heap();
        let m = heap.alloc(ObjectBody::Map(MapBody::new()), Vec::new).unwrap().decode_obj_mut();
        let m = map_set(&mut heap, m, "k", Boxed64::encode_int(5)).unwrap();
        with_map_mut(m, |mb| assert_eq!(mb.get("k").unwrap().decode_int(), 5));
    }
}
