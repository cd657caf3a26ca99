//! End-to-end scenarios spanning the value/heap/VM layers together,
//! rather than any single module in isolation.

use std::collections::HashMap;

use nebula::{
    Block, Boxed64, ErrorKind, GcPhase, Heap, HeapConfig, Outcome, Pid, Scheduler, VmResult,
};
use nebula::heap::container_ops;
use nebula::object::{ArrayBody, MapBody, ObjectBody};
use nebula::{Chunk, OpCode, StackVm, VmLimits};

struct TestScheduler {
    blocks: HashMap<Pid, Block>,
    next_pid: Pid,
}

impl TestScheduler {
    fn new() -> Self {
        Self { blocks: HashMap::new(), next_pid: 1 }
    }
}

impl Scheduler for TestScheduler {
    fn get_block(&self, pid: Pid) -> Option<&Block> {
        self.blocks.get(&pid)
    }
    fn get_block_mut(&mut self, pid: Pid) -> Option<&mut Block> {
        self.blocks.get_mut(&pid)
    }
    fn enqueue(&mut self, target: Pid, message: Boxed64) -> VmResult<()> {
        if let Some(b) = self.blocks.get_mut(&target) {
            b.mailbox.push_back(message);
        }
        Ok(())
    }
    fn spawn(&mut self, _entry: Boxed64, capabilities: Vec<String>) -> VmResult<Pid> {
        let pid = self.next_pid;
        self.next_pid += 1;
        self.blocks.insert(pid, Block::new(pid, None, capabilities));
        Ok(pid)
    }
    fn block_pids(&self) -> Vec<Pid> {
        self.blocks.keys().copied().collect()
    }
}

#[test]
fn allocation_past_threshold_triggers_a_full_collection() {
    let mut heap = Heap::new(HeapConfig { initial_gc_threshold: 128, max_heap_size: 1 << 20, ..Default::default() });
    let kept = heap.alloc(ObjectBody::String("kept".into()), Vec::new).unwrap();

    for _ in 0..20 {
        let _ = heap.alloc(ObjectBody::String("garbage".into()), || vec![kept]);
    }

    assert_eq!(heap.phase(), GcPhase::Idle);
    assert!(heap.stats().full_collections >= 1, "expected at least one collection to have run");
    assert!(heap.stats().objects_freed > 0, "garbage strings should have been swept");
}

#[test]
fn survivors_of_repeated_minor_collections_are_promoted() {
    let mut heap = Heap::new(HeapConfig { promotion_threshold: 2, ..Default::default() });
    let survivor = heap.alloc(ObjectBody::String("alive".into()), Vec::new).unwrap();
    let obj = survivor.decode_obj();

    for _ in 0..3 {
        heap.minor_collect(vec![survivor]);
    }

    unsafe {
        assert!((*obj).header.is_old(), "object surviving past the promotion threshold should be tenured");
    }
}

#[test]
fn write_barrier_adds_old_to_young_edges_to_the_remembered_set() {
    let mut heap = Heap::new(HeapConfig::default());
    let container = heap.alloc(ObjectBody::Array(ArrayBody::new()), Vec::new).unwrap();
    let young = heap.alloc(ObjectBody::String("young".into()), Vec::new).unwrap();
    unsafe {
        (*container.decode_obj_mut()).header.set_old(true);
    }
    let updated = container_ops::array_push(&mut heap, container.decode_obj_mut(), young).unwrap();
    unsafe {
        assert!((*updated).header.is_remembered());
    }
}

#[test]
fn stack_vm_runs_call_and_return_arithmetic() {
    let mut vm = StackVm::new(1, VmLimits::default());
    let mut heap = Heap::new(HeapConfig::default());
    let mut scheduler = TestScheduler::new();

    let mut chunk = Chunk::new();
    let a = chunk.add_constant(Boxed64::encode_int(40));
    let b = chunk.add_constant(Boxed64::encode_int(2));
    chunk.write_op(OpCode::PushConst, 1);
    chunk.write_byte(a, 1);
    chunk.write_op(OpCode::PushConst, 1);
    chunk.write_byte(b, 1);
    chunk.write_op(OpCode::Add, 1);
    chunk.write_op(OpCode::Return, 1);
    let idx = vm.push_chunk(chunk);

    match vm.call_entry(idx, Vec::new(), &mut scheduler, &mut heap) {
        Outcome::Ok(v) => assert_eq!(v.decode_int(), 42),
        other => panic!("expected Ok(42), got {other:?}"),
    }
}

#[test]
fn selective_receive_blocks_until_a_message_arrives() {
    let mut heap = Heap::new(HeapConfig::default());
    let mut scheduler = TestScheduler::new();
    scheduler.blocks.insert(1, Block::new(1, None, Vec::new()));

    let mut chunk = Chunk::new();
    chunk.write_op(OpCode::Receive, 1);
    chunk.write_op(OpCode::Return, 1);

    // Nothing in the mailbox yet: the VM reports Waiting rather than
    // blocking the worker thread.
    let mut vm = StackVm::new(1, VmLimits::default());
    let idx = vm.push_chunk(chunk);
    let outcome = vm.call_entry(idx, Vec::new(), &mut scheduler, &mut heap);
    assert!(matches!(outcome, Outcome::Waiting));

    // Once a message is enqueued, a freshly dispatched run of the same
    // code (the scheduler resuming the block on its next turn) observes
    // it immediately. Resuming the exact suspended frame in place is the
    // scheduler's responsibility, not this core's — exercised here with
    // a fresh VM to isolate the RECEIVE contract itself.
    scheduler.blocks.get_mut(&1).unwrap().mailbox.push_back(Boxed64::encode_int(99));
    let mut chunk2 = Chunk::new();
    chunk2.write_op(OpCode::Receive, 1);
    chunk2.write_op(OpCode::Return, 1);
    let mut vm2 = StackVm::new(1, VmLimits::default());
    let idx2 = vm2.push_chunk(chunk2);
    match vm2.call_entry(idx2, Vec::new(), &mut scheduler, &mut heap) {
        Outcome::Ok(v) => assert_eq!(v.decode_int(), 99),
        other => panic!("expected Ok(99), got {other:?}"),
    }
}

fn map_with(heap: &mut Heap, pairs: &[(&str, Boxed64)]) -> Boxed64 {
    let v = heap.alloc(ObjectBody::Map(MapBody::new()), Vec::new).unwrap();
    unsafe {
        if let ObjectBody::Map(m) = &mut (*v.decode_obj_mut()).body {
            for (k, val) in pairs {
                m.set(k, *val);
            }
        }
    }
    v
}

fn string_obj(heap: &mut Heap, s: &str) -> Boxed64 {
    heap.alloc(ObjectBody::String(s.into()), Vec::new).unwrap()
}

#[test]
fn receive_match_skips_non_matching_messages_into_the_save_queue() {
    let mut heap = Heap::new(HeapConfig::default());
    let mut scheduler = TestScheduler::new();
    scheduler.blocks.insert(1, Block::new(1, None, Vec::new()));

    let kind_b = string_obj(&mut heap, "B");
    let msg_b = map_with(&mut heap, &[("kind", kind_b)]);
    let kind_a = string_obj(&mut heap, "A");
    let msg_a = map_with(&mut heap, &[("kind", kind_a), ("n", Boxed64::encode_int(1))]);
    scheduler.blocks.get_mut(&1).unwrap().mailbox.push_back(msg_b);
    scheduler.blocks.get_mut(&1).unwrap().mailbox.push_back(msg_a);

    let pattern_kind_a = string_obj(&mut heap, "A");
    let pattern = map_with(&mut heap, &[("kind", pattern_kind_a)]);

    let mut vm = StackVm::new(1, VmLimits::default());
    let mut chunk = Chunk::new();
    let pattern_const = chunk.add_constant(pattern);
    chunk.write_op(OpCode::PushConst, 1);
    chunk.write_byte(pattern_const, 1);
    chunk.write_op(OpCode::ReceiveMatch, 1);
    chunk.write_op(OpCode::Return, 1);
    let idx = vm.push_chunk(chunk);

    match vm.call_entry(idx, Vec::new(), &mut scheduler, &mut heap) {
        Outcome::Ok(v) => unsafe {
            match &(*v.decode_obj()).body {
                ObjectBody::Map(m) => {
                    let kind = m.get("kind").unwrap();
                    match &(*kind.decode_obj()).body {
                        ObjectBody::String(s) => assert_eq!(s.as_ref(), "A"),
                        _ => panic!("kind is not a string"),
                    }
                    assert_eq!(m.get("n").unwrap().decode_int(), 1);
                }
                _ => panic!("expected a map result"),
            }
        },
        other => panic!("expected Ok(map), got {other:?}"),
    }

    let block = scheduler.blocks.get(&1).unwrap();
    assert_eq!(block.save_queue.len(), 1);
    unsafe {
        match &(*block.save_queue.front().unwrap().decode_obj()).body {
            ObjectBody::Map(m) => match &(*m.get("kind").unwrap().decode_obj()).body {
                ObjectBody::String(s) => assert_eq!(s.as_ref(), "B"),
                _ => panic!("kind is not a string"),
            },
            _ => panic!("expected a map in the save queue"),
        }
    }
}

#[test]
fn copy_on_write_leaves_shared_arrays_untouched() {
    let mut heap = Heap::new(HeapConfig::default());
    let arr = heap.alloc(ObjectBody::Array(ArrayBody::new()), Vec::new).unwrap().decode_obj_mut();
    let arr = container_ops::array_push(&mut heap, arr, Boxed64::encode_int(1)).unwrap();

    unsafe {
        nebula::object::retain(arr);
    }
    let shared_view = arr;
    let mutated = container_ops::array_push(&mut heap, arr, Boxed64::encode_int(2)).unwrap();

    assert_ne!(mutated, shared_view, "mutating a shared array must not mutate in place");
    unsafe {
        match &(*shared_view).body {
            ObjectBody::Array(a) => assert_eq!(a.items.len(), 1, "original array must be unaffected by the mutation"),
            _ => unreachable!(),
        }
        match &(*mutated).body {
            ObjectBody::Array(a) => assert_eq!(a.items.len(), 2),
            _ => unreachable!(),
        }
    }
}

#[test]
fn division_by_zero_surfaces_as_a_typed_error_with_line_info() {
    let mut vm = StackVm::new(1, VmLimits::default());
    let mut heap = Heap::new(HeapConfig::default());
    let mut scheduler = TestScheduler::new();

    let mut chunk = Chunk::new();
    let a = chunk.add_constant(Boxed64::encode_int(5));
    let z = chunk.add_constant(Boxed64::encode_int(0));
    chunk.write_op(OpCode::PushConst, 7);
    chunk.write_byte(a, 7);
    chunk.write_op(OpCode::PushConst, 7);
    chunk.write_byte(z, 7);
    chunk.write_op(OpCode::Div, 7);
    chunk.write_op(OpCode::Return, 7);
    let idx = vm.push_chunk(chunk);

    match vm.call_entry(idx, Vec::new(), &mut scheduler, &mut heap) {
        Outcome::Err(e) => {
            assert_eq!(e.kind, ErrorKind::DivisionByZero);
            assert_eq!(e.line, 7);
        }
        other => panic!("expected a DivisionByZero error, got {other:?}"),
    }
}
