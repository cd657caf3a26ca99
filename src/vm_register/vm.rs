//! Register-based dispatch loop (§4.5).
//!
//! Shares `Boxed64`/`Object`/`Heap` with the stack VM — no duplicated
//! value or heap model, only a different bytecode shape and calling
//! convention. Each frame gets its own register window (up to
//! `config.max_registers_per_frame`, lazily zeroed to the callee's
//! declared `num_regs` rather than always materializing all 256), and up
//! to `config.max_frames` frames may be active at once, mirroring the
//! stack VM's `VmLimits` the way the teacher mirrors constants across its
//! own VM variants.

use tracing::trace;

use crate::error::{ErrorKind, Outcome, VmError};
use crate::heap::Heap;
use crate::object::{ArrayBody, ClosureBody, MapBody, Object, ObjectBody, UpvalueState};
use crate::scheduler::{Pid, Scheduler};
use crate::value::Boxed64;
use crate::vm_stack::{concat_operand, structural_match};

use super::instr::{self, RegOp};

#[derive(Debug, Clone)]
pub struct RegVmLimits {
    pub max_registers_per_frame: usize,
    pub max_frames: usize,
    pub reduction_batch: usize,
    pub reduction_quota: usize,
}

impl Default for RegVmLimits {
    fn default() -> Self {
        Self { max_registers_per_frame: 256, max_frames: 64, reduction_batch: 64, reduction_quota: 4096 }
    }
}

/// A function's code, constants, and declared register count.
#[derive(Default)]
pub struct RegChunk {
    pub code: Vec<u32>,
    pub constants: Vec<Boxed64>,
    pub num_regs: u8,
}

impl RegChunk {
    pub fn new(num_regs: u8) -> Self {
        Self { code: Vec::new(), constants: Vec::new(), num_regs }
    }

    pub fn add_constant(&mut self, value: Boxed64) -> u16 {
        if let Some(pos) = self.constants.iter().position(|c| c.bits() == value.bits()) {
            return pos as u16;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u16
    }
}

struct RegFrame {
    chunk_index: u32,
    ip: usize,
    base: usize,
    /// Caller's register to receive this frame's return value; `None`
    /// for the entry frame (there's no caller register to fill).
    dest_reg: Option<(usize, u8)>,
    frame_id: u64,
    closure: Option<*const Object>,
}

pub struct RegisterVm {
    pub pid: Pid,
    registers: Vec<Boxed64>,
    frames: Vec<RegFrame>,
    pub chunks: Vec<RegChunk>,
    limits: RegVmLimits,
    reductions_used: usize,
    next_frame_id: u64,
    /// Open upvalues sorted by descending register-file index, mirroring
    /// the stack VM's `open_upvalues` (§4.4.1, §4.5).
    open_upvalues: Vec<*mut Object>,
}

impl RegisterVm {
    pub fn new(pid: Pid, limits: RegVmLimits) -> Self {
        Self {
            pid,
            registers: Vec::new(),
            frames: Vec::new(),
            chunks: Vec::new(),
            limits,
            reductions_used: 0,
            next_frame_id: 0,
            open_upvalues: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: RegChunk) -> u32 {
        self.chunks.push(chunk);
        (self.chunks.len() - 1) as u32
    }

    fn push_frame(
        &mut self,
        chunk_index: u32,
        dest_reg: Option<(usize, u8)>,
        closure: Option<*const Object>,
    ) -> Result<(), VmError> {
        if self.frames.len() >= self.limits.max_frames {
            return Err(VmError::new(ErrorKind::StackOverflow, "register-vm call depth exceeded"));
        }
        let num_regs = self.chunks[chunk_index as usize].num_regs as usize;
        let base = self.registers.len();
        self.registers.resize(base + num_regs, Boxed64::encode_nil());
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frames.push(RegFrame { chunk_index, ip: 0, base, dest_reg, frame_id, closure });
        Ok(())
    }

    pub fn call_entry(
        &mut self,
        chunk_index: u32,
        args: &[Boxed64],
        scheduler: &mut dyn Scheduler,
        heap: &mut Heap,
    ) -> Outcome<Boxed64> {
        if let Err(e) = self.push_frame(chunk_index, None, None) {
            return Outcome::Err(e);
        }
        let base = self.frames.last().unwrap().base;
        for (i, arg) in args.iter().enumerate() {
            if base + i < self.registers.len() {
                self.registers[base + i] = *arg;
            }
        }
        self.run(scheduler, heap)
    }

    fn reg(&self, index: u8) -> Boxed64 {
        let base = self.frames.last().unwrap().base;
        self.registers[base + index as usize]
    }

    fn set_reg(&mut self, index: u8, value: Boxed64) {
        let base = self.frames.last().unwrap().base;
        self.registers[base + index as usize] = value;
    }

    fn fetch(&mut self) -> u32 {
        let frame = self.frames.last_mut().unwrap();
        let word = self.chunks[frame.chunk_index as usize].code[frame.ip];
        frame.ip += 1;
        word
    }

    pub fn run(&mut self, scheduler: &mut dyn Scheduler, heap: &mut Heap) -> Outcome<Boxed64> {
        loop {
            let mut batch = 0usize;
            while batch < self.limits.reduction_batch {
                if self.frames.is_empty() {
                    return Outcome::Halt;
                }
                match self.step(scheduler, heap) {
                    Ok(Some(v)) => return Outcome::Ok(v),
                    Ok(None) => {}
                    Err(Signal::Error(e)) => return Outcome::Err(e),
                    Err(Signal::Halt) => return Outcome::Halt,
                    Err(Signal::Waiting) => return Outcome::Waiting,
                }
                batch += 1;
                self.reductions_used += 1;
            }
            if self.reductions_used >= self.limits.reduction_quota {
                self.reductions_used = 0;
                return Outcome::Yield;
            }
        }
    }

    fn numeric_binop(
        &mut self,
        rd: u8,
        rs1: u8,
        rs2: u8,
        f_int: impl Fn(i64, i64) -> Option<i64>,
        f_double: impl Fn(f64, f64) -> f64,
    ) -> Result<(), VmError> {
        let a = self.reg(rs1);
        let b = self.reg(rs2);
        if a.is_int() && b.is_int() {
            match f_int(a.decode_int(), b.decode_int()) {
                Some(v) => self.set_reg(rd, Boxed64::encode_int(v)),
                None => return Err(VmError::new(ErrorKind::DivisionByZero, "division by zero")),
            }
        } else if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            self.set_reg(rd, Boxed64::encode_double(f_double(x, y)));
        } else {
            return Err(VmError::new(ErrorKind::Type, "operand is not numeric"));
        }
        Ok(())
    }

    fn step(&mut self, scheduler: &mut dyn Scheduler, heap: &mut Heap) -> Result<Option<Boxed64>, Signal> {
        let word = self.fetch();
        let op = RegOp::from_byte(instr::decode_op(word))
            .ok_or_else(|| Signal::Error(VmError::new(ErrorKind::Runtime, "invalid register opcode")))?;
        trace!(?op, "register-vm: dispatch");

        match op {
            RegOp::LoadConst => {
                let i = instr::decode_i(word);
                let frame_chunk = self.frames.last().unwrap().chunk_index as usize;
                let v = self.chunks[frame_chunk].constants[i.imm as usize];
                self.set_reg(i.rd, v);
            }
            RegOp::LoadNil => {
                let i = instr::decode_i(word);
                self.set_reg(i.rd, Boxed64::encode_nil());
            }
            RegOp::LoadTrue => {
                let i = instr::decode_i(word);
                self.set_reg(i.rd, Boxed64::encode_bool(true));
            }
            RegOp::LoadFalse => {
                let i = instr::decode_i(word);
                self.set_reg(i.rd, Boxed64::encode_bool(false));
            }
            RegOp::Move => {
                let r = instr::decode_r(word);
                let v = self.reg(r.rs1);
                self.set_reg(r.rd, v);
            }
            RegOp::Add => {
                let r = instr::decode_r(word);
                self.numeric_binop(r.rd, r.rs1, r.rs2, |a, b| a.checked_add(b), |a, b| a + b).map_err(Signal::Error)?;
            }
            RegOp::Sub => {
                let r = instr::decode_r(word);
                self.numeric_binop(r.rd, r.rs1, r.rs2, |a, b| a.checked_sub(b), |a, b| a - b).map_err(Signal::Error)?;
            }
            RegOp::Mul => {
                let r = instr::decode_r(word);
                self.numeric_binop(r.rd, r.rs1, r.rs2, |a, b| a.checked_mul(b), |a, b| a * b).map_err(Signal::Error)?;
            }
            RegOp::Div => {
                let r = instr::decode_r(word);
                self.numeric_binop(r.rd, r.rs1, r.rs2, |a, b| if b == 0 { None } else { Some(a / b) }, |a, b| a / b)
                    .map_err(Signal::Error)?;
            }
            RegOp::Mod => {
                let r = instr::decode_r(word);
                self.numeric_binop(r.rd, r.rs1, r.rs2, |a, b| if b == 0 { None } else { Some(a % b) }, |a, b| a % b)
                    .map_err(Signal::Error)?;
            }
            RegOp::Neg => {
                let r = instr::decode_r(word);
                let v = self.reg(r.rs1);
                if v.is_int() {
                    self.set_reg(r.rd, Boxed64::encode_int(-v.decode_int()));
                } else if v.is_double() {
                    self.set_reg(r.rd, Boxed64::encode_double(-v.decode_double()));
                } else {
                    return Err(Signal::Error(VmError::new(ErrorKind::Type, "cannot negate non-numeric")));
                }
            }
            RegOp::Eq => {
                let r = instr::decode_r(word);
                let eq = crate::object::boxed_deep_equal(self.reg(r.rs1), self.reg(r.rs2));
                self.set_reg(r.rd, Boxed64::encode_bool(eq));
            }
            RegOp::Lt | RegOp::Le => {
                let r = instr::decode_r(word);
                let ord = crate::object::default_compare(self.reg(r.rs1), self.reg(r.rs2))
                    .ok_or_else(|| Signal::Error(VmError::new(ErrorKind::Type, "values are not comparable")))?;
                use std::cmp::Ordering::*;
                let result = match (op, ord) {
                    (RegOp::Lt, Less) => true,
                    (RegOp::Le, Less | Equal) => true,
                    _ => false,
                };
                self.set_reg(r.rd, Boxed64::encode_bool(result));
            }
            RegOp::Not => {
                let r = instr::decode_r(word);
                let v = self.reg(r.rs1);
                self.set_reg(r.rd, Boxed64::encode_bool(!v.is_truthy()));
            }
            RegOp::Jmp => {
                let j = instr::decode_j(word);
                let frame = self.frames.last_mut().unwrap();
                frame.ip = (frame.ip as i64 + j.offset as i64) as usize;
            }
            RegOp::JmpIfFalse => {
                let b = instr::decode_b(word);
                if !self.reg(b.rd).is_truthy() {
                    let frame = self.frames.last_mut().unwrap();
                    frame.ip = (frame.ip as i64 + b.offset as i64) as usize;
                }
            }
            RegOp::Call => {
                let r = instr::decode_r(word);
                // rs1 holds the target chunk index as a tagged int
                // (direct-call convention; indirect closures follow the
                // stack VM's `Closure`/`resolve_callable` path instead).
                let callee = self.reg(r.rs1);
                if !callee.is_int() {
                    return Err(Signal::Error(VmError::new(ErrorKind::Type, "call target is not a direct chunk reference")));
                }
                let chunk_index = callee.decode_int() as u32;
                let argc = r.rs2 as usize;
                let caller_base = self.frames.last().unwrap().base;
                let mut args = Vec::with_capacity(argc);
                for k in 0..argc {
                    args.push(self.registers[caller_base + r.rs1 as usize + 1 + k]);
                }
                self.push_frame(chunk_index, Some((caller_base, r.rd)), None).map_err(Signal::Error)?;
                let new_base = self.frames.last().unwrap().base;
                for (k, arg) in args.into_iter().enumerate() {
                    self.registers[new_base + k] = arg;
                }
            }
            RegOp::Ret => {
                let i = instr::decode_i(word);
                let value = self.reg(i.rd);
                let frame = self.frames.pop().unwrap();
                self.close_upvalues_above(frame.base);
                self.registers.truncate(frame.base);
                match frame.dest_reg {
                    Some((caller_base, dest)) => {
                        self.registers[caller_base + dest as usize] = value;
                    }
                    None => return Ok(Some(value)),
                }
            }
            RegOp::Halt => return Err(Signal::Halt),

            RegOp::NewArray => {
                let i = instr::decode_i(word);
                let count = i.imm as usize;
                let base = self.frames.last().unwrap().base;
                let start = base + i.rd as usize + 1;
                let items: Vec<Boxed64> = self.registers[start..start + count].to_vec();
                let v = heap
                    .alloc(ObjectBody::Array(ArrayBody::from_vec(items)), Vec::new)
                    .map_err(|_| Signal::Error(VmError::new(ErrorKind::OutOfMemory, "heap exhausted")))?;
                self.set_reg(i.rd, v);
            }
            RegOp::NewMap => {
                let i = instr::decode_i(word);
                let v = heap
                    .alloc(ObjectBody::Map(MapBody::new()), Vec::new)
                    .map_err(|_| Signal::Error(VmError::new(ErrorKind::OutOfMemory, "heap exhausted")))?;
                self.set_reg(i.rd, v);
            }
            RegOp::Index => {
                let r = instr::decode_r(word);
                let container = self.reg(r.rs1);
                let index = self.reg(r.rs2);
                let result = self.index_get(container, index).map_err(Signal::Error)?;
                self.set_reg(r.rd, result);
            }
            RegOp::StoreIndex => {
                let r = instr::decode_r(word);
                let container = self.reg(r.rd);
                let index = self.reg(r.rs1);
                let value = self.reg(r.rs2);
                let updated = self.index_set(container, index, value, heap).map_err(Signal::Error)?;
                self.set_reg(r.rd, updated);
            }
            RegOp::Len => {
                let r = instr::decode_r(word);
                let len = self.container_len(self.reg(r.rs1)).map_err(Signal::Error)?;
                self.set_reg(r.rd, Boxed64::encode_int(len as i64));
            }
            RegOp::Concat => {
                let r = instr::decode_r(word);
                let a = self.reg(r.rs1);
                let b = self.reg(r.rs2);
                match (concat_operand(a), concat_operand(b)) {
                    (Some(sa), Some(sb)) => {
                        let mut combined = sa;
                        combined.push_str(&sb);
                        let v = heap
                            .alloc(ObjectBody::String(combined.into_boxed_str()), Vec::new)
                            .map_err(|_| Signal::Error(VmError::new(ErrorKind::OutOfMemory, "heap exhausted")))?;
                        self.set_reg(r.rd, v);
                    }
                    _ => return Err(Signal::Error(VmError::new(ErrorKind::Type, "concat operand is not string-or-nil"))),
                }
            }
            RegOp::TypeOf => {
                let r = instr::decode_r(word);
                let name = type_name(self.reg(r.rs1));
                let v = heap
                    .alloc(ObjectBody::String(name.into()), Vec::new)
                    .map_err(|_| Signal::Error(VmError::new(ErrorKind::OutOfMemory, "heap exhausted")))?;
                self.set_reg(r.rd, v);
            }
            RegOp::Print => {
                let r = instr::decode_r(word);
                println!("{}", format_value(self.reg(r.rs1)));
            }

            RegOp::MakeClosure => {
                let i = instr::decode_i(word);
                let func_idx = i.imm;
                let n = self.fetch();
                let frame_chunk = self.frames.last().unwrap().chunk_index as usize;
                let func_val = self.chunks[frame_chunk].constants[func_idx as usize];
                if !func_val.is_obj() {
                    return Err(Signal::Error(VmError::new(ErrorKind::Type, "closure constant is not a function")));
                }
                let function_ptr = func_val.decode_obj();
                let frame_id = self.frames.last().unwrap().frame_id;
                let base = self.frames.last().unwrap().base;
                let enclosing_closure = self.frames.last().unwrap().closure;
                let mut upvalues = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let descriptor = self.fetch().to_be_bytes();
                    let is_local = descriptor[0];
                    let index = descriptor[1] as usize;
                    if is_local != 0 {
                        let slot = base + index;
                        let up = self.capture_upvalue(frame_id, slot, heap).map_err(Signal::Error)?;
                        upvalues.push(up as *const Object);
                    } else {
                        let enclosing = match enclosing_closure {
                            Some(e) => e,
                            None => {
                                return Err(Signal::Error(VmError::new(
                                    ErrorKind::Runtime,
                                    "no enclosing closure for upvalue capture",
                                )))
                            }
                        };
                        let up = unsafe {
                            match &(*enclosing).body {
                                ObjectBody::Closure(c) => match c.upvalues.get(index) {
                                    Some(&u) => u,
                                    None => {
                                        return Err(Signal::Error(VmError::new(ErrorKind::Runtime, "upvalue index out of range")))
                                    }
                                },
                                _ => return Err(Signal::Error(VmError::new(ErrorKind::Runtime, "enclosing object is not a closure"))),
                            }
                        };
                        upvalues.push(up);
                    }
                }
                let closure_val = heap
                    .alloc(ObjectBody::Closure(ClosureBody { function: function_ptr, upvalues }), Vec::new)
                    .map_err(|_| Signal::Error(VmError::new(ErrorKind::OutOfMemory, "heap exhausted")))?;
                self.set_reg(i.rd, closure_val);
            }
            RegOp::LoadUpvalue => {
                let i = instr::decode_i(word);
                let closure = self.frames.last().unwrap().closure.ok_or_else(|| {
                    Signal::Error(VmError::new(ErrorKind::Runtime, "no closure in current frame"))
                })?;
                let up_ptr = unsafe {
                    match &(*closure).body {
                        ObjectBody::Closure(c) => *c.upvalues.get(i.imm as usize).ok_or_else(|| {
                            Signal::Error(VmError::new(ErrorKind::Runtime, "upvalue index out of range"))
                        })?,
                        _ => return Err(Signal::Error(VmError::new(ErrorKind::Runtime, "current frame closure is malformed"))),
                    }
                };
                let value = unsafe {
                    match &(*up_ptr).body {
                        ObjectBody::Upvalue(UpvalueState::Open { slot, .. }) => self.registers[*slot],
                        ObjectBody::Upvalue(UpvalueState::Closed(v)) => *v,
                        _ => return Err(Signal::Error(VmError::new(ErrorKind::Runtime, "upvalue object is malformed"))),
                    }
                };
                self.set_reg(i.rd, value);
            }
            RegOp::StoreUpvalue => {
                let i = instr::decode_i(word);
                let closure = self.frames.last().unwrap().closure.ok_or_else(|| {
                    Signal::Error(VmError::new(ErrorKind::Runtime, "no closure in current frame"))
                })?;
                let up_ptr = unsafe {
                    match &(*closure).body {
                        ObjectBody::Closure(c) => *c.upvalues.get(i.imm as usize).ok_or_else(|| {
                            Signal::Error(VmError::new(ErrorKind::Runtime, "upvalue index out of range"))
                        })?,
                        _ => return Err(Signal::Error(VmError::new(ErrorKind::Runtime, "current frame closure is malformed"))),
                    }
                };
                let value = self.reg(i.rd);
                let open_slot = unsafe {
                    match &(*up_ptr).body {
                        ObjectBody::Upvalue(UpvalueState::Open { slot, .. }) => Some(*slot),
                        ObjectBody::Upvalue(UpvalueState::Closed(_)) => None,
                        _ => return Err(Signal::Error(VmError::new(ErrorKind::Runtime, "upvalue object is malformed"))),
                    }
                };
                match open_slot {
                    Some(slot) => self.registers[slot] = value,
                    None => unsafe {
                        if let ObjectBody::Upvalue(state) = &mut (*(up_ptr as *mut Object)).body {
                            *state = UpvalueState::Closed(value);
                        }
                    },
                }
            }

            RegOp::Spawn => {
                let r = instr::decode_r(word);
                let entry = self.reg(r.rs1);
                let pid = scheduler.spawn(entry, Vec::new()).map_err(Signal::Error)?;
                self.set_reg(r.rd, Boxed64::encode_pid(pid));
            }
            RegOp::Send => {
                let r = instr::decode_r(word);
                let target = self.reg(r.rs1);
                let message = self.reg(r.rs2);
                if !target.is_pid() {
                    return Err(Signal::Error(VmError::new(ErrorKind::Type, "send target is not a pid")));
                }
                scheduler.enqueue(target.decode_pid(), message).map_err(Signal::Error)?;
            }
            RegOp::Receive => {
                let i = instr::decode_i(word);
                let block = scheduler.get_block_mut(self.pid);
                match block.and_then(|b| b.mailbox.pop_front()) {
                    Some(msg) => self.set_reg(i.rd, msg),
                    None => {
                        self.frames.last_mut().unwrap().ip -= 1;
                        return Err(Signal::Waiting);
                    }
                }
            }
            RegOp::ReceiveTimeout => {
                let i = instr::decode_i(word);
                let timeout_ms = i.imm;
                let block = match scheduler.get_block_mut(self.pid) {
                    Some(b) => b,
                    None => {
                        self.frames.last_mut().unwrap().ip -= 1;
                        return Err(Signal::Waiting);
                    }
                };
                match block.mailbox.pop_front() {
                    Some(msg) => {
                        block.pending_deadline = None;
                        self.set_reg(i.rd, msg);
                    }
                    None => {
                        let now = std::time::Instant::now();
                        match block.pending_deadline {
                            Some(deadline) if now >= deadline => {
                                block.pending_deadline = None;
                                return Err(Signal::Error(VmError::new(ErrorKind::Timeout, "receive timed out")));
                            }
                            Some(_) => {}
                            None => {
                                block.pending_deadline = Some(now + std::time::Duration::from_millis(timeout_ms as u64));
                            }
                        }
                        self.frames.last_mut().unwrap().ip -= 1;
                        return Err(Signal::Waiting);
                    }
                }
            }
            RegOp::ReceiveMatch => {
                let r = instr::decode_r(word);
                let pattern = self.reg(r.rs1);
                if !pattern.is_obj() {
                    return Err(Signal::Error(VmError::new(ErrorKind::Type, "receive pattern is not a map")));
                }
                let pattern_map: *const MapBody = unsafe {
                    match &(*pattern.decode_obj()).body {
                        ObjectBody::Map(m) => m as *const MapBody,
                        _ => return Err(Signal::Error(VmError::new(ErrorKind::Type, "receive pattern is not a map"))),
                    }
                };
                let block = match scheduler.get_block_mut(self.pid) {
                    Some(b) => b,
                    None => {
                        self.frames.last_mut().unwrap().ip -= 1;
                        return Err(Signal::Waiting);
                    }
                };
                let save_hit = block.save_queue.iter().position(|msg| structural_match(unsafe { &*pattern_map }, *msg));
                if let Some(idx) = save_hit {
                    let msg = block.save_queue.remove(idx).expect("index just found by position");
                    self.set_reg(r.rd, msg);
                } else {
                    let mailbox_len = block.mailbox.len();
                    let mut matched = None;
                    for _ in 0..mailbox_len {
                        let msg = block.mailbox.pop_front().expect("loop bound is mailbox length");
                        if structural_match(unsafe { &*pattern_map }, msg) {
                            matched = Some(msg);
                            break;
                        }
                        block.save_queue.push_back(msg);
                    }
                    match matched {
                        Some(msg) => self.set_reg(r.rd, msg),
                        None => {
                            self.frames.last_mut().unwrap().ip -= 1;
                            return Err(Signal::Waiting);
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn index_get(&self, container: Boxed64, index: Boxed64) -> Result<Boxed64, VmError> {
        if !container.is_obj() {
            return Err(VmError::new(ErrorKind::Type, "cannot index a non-container value"));
        }
        unsafe {
            match &(*container.decode_obj()).body {
                ObjectBody::Array(a) => {
                    let idx = index.decode_int();
                    a.items.get(idx as usize).copied().ok_or_else(|| {
                        VmError::new(ErrorKind::OutOfBounds, format!("array index {idx} out of bounds"))
                    })
                }
                ObjectBody::Map(m) => {
                    let key = match &(*index.decode_obj()).body {
                        ObjectBody::String(s) => s.clone(),
                        _ => return Err(VmError::new(ErrorKind::Type, "map key is not a string")),
                    };
                    Ok(m.get(&key).unwrap_or_default())
                }
                ObjectBody::Vector(v) => {
                    let idx = index.decode_int() as usize;
                    v.items.get(idx).copied().map(Boxed64::encode_double).ok_or_else(|| {
                        VmError::new(ErrorKind::OutOfBounds, format!("vector index {idx} out of bounds"))
                    })
                }
                _ => Err(VmError::new(ErrorKind::Type, "value is not indexable")),
            }
        }
    }

    fn index_set(&self, container: Boxed64, index: Boxed64, value: Boxed64, heap: &mut Heap) -> Result<Boxed64, VmError> {
        if !container.is_obj() {
            return Err(VmError::new(ErrorKind::Type, "cannot index a non-container value"));
        }
        let obj = container.decode_obj_mut();
        let tag = unsafe { (*obj).header.tag };
        match tag {
            crate::object::ObjectTag::Array => {
                let idx = index.decode_int();
                if idx < 0 {
                    return Err(VmError::new(ErrorKind::OutOfBounds, "negative array index"));
                }
                let updated = crate::heap::container_ops::array_set(heap, obj, idx as usize, value)?;
                Ok(unsafe { (*updated).as_boxed64() })
            }
            crate::object::ObjectTag::Map => {
                let key = unsafe {
                    match &(*index.decode_obj()).body {
                        ObjectBody::String(s) => s.clone(),
                        _ => return Err(VmError::new(ErrorKind::Type, "map key is not a string")),
                    }
                };
                let updated = crate::heap::container_ops::map_set(heap, obj, &key, value)?;
                Ok(unsafe { (*updated).as_boxed64() })
            }
            _ => Err(VmError::new(ErrorKind::Type, "value does not support index assignment")),
        }
    }

    fn container_len(&self, v: Boxed64) -> Result<usize, VmError> {
        if !v.is_obj() {
            return Err(VmError::new(ErrorKind::Type, "value has no length"));
        }
        unsafe {
            match &(*v.decode_obj()).body {
                ObjectBody::Array(a) => Ok(a.items.len()),
                ObjectBody::Map(m) => Ok(m.len()),
                ObjectBody::String(s) => Ok(s.len()),
                ObjectBody::Bytes(b) => Ok(b.len()),
                ObjectBody::Vector(vec) => Ok(vec.items.len()),
                _ => Err(VmError::new(ErrorKind::Type, "value has no length")),
            }
        }
    }

    /// Mirrors the stack VM's `close_upvalues_above` (§4.4.1): copies each
    /// open upvalue's live register value out and marks it `Closed` before
    /// its owning frame's register window is truncated.
    fn close_upvalues_above(&mut self, threshold: usize) {
        while let Some(&last) = self.open_upvalues.last() {
            let slot = unsafe {
                match &(*last).body {
                    ObjectBody::Upvalue(UpvalueState::Open { slot, .. }) => *slot,
                    _ => break,
                }
            };
            if slot < threshold {
                break;
            }
            self.open_upvalues.pop();
            let value = self.registers[slot];
            unsafe {
                if let ObjectBody::Upvalue(state) = &mut (*last).body {
                    *state = UpvalueState::Closed(value);
                }
            }
        }
    }

    fn capture_upvalue(&mut self, frame_id: u64, slot: usize, heap: &mut Heap) -> Result<*mut Object, VmError> {
        if let Some(&existing) = self.open_upvalues.iter().find(|&&ptr| unsafe {
            matches!(&(*ptr).body, ObjectBody::Upvalue(UpvalueState::Open { slot: s, .. }) if *s == slot)
        }) {
            return Ok(existing);
        }
        let boxed = heap
            .alloc(ObjectBody::Upvalue(UpvalueState::Open { frame_id, slot }), Vec::new)
            .map_err(|_| VmError::new(ErrorKind::OutOfMemory, "heap exhausted"))?;
        let ptr = boxed.decode_obj_mut();
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&p| unsafe {
                match &(*p).body {
                    ObjectBody::Upvalue(UpvalueState::Open { slot: s, .. }) => *s < slot,
                    _ => false,
                }
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, ptr);
        Ok(ptr)
    }
}

/// Cold, human-readable type name for `TypeOf`/diagnostics — not part of
/// the hot dispatch path, so a plain string match is fine here.
fn type_name(v: Boxed64) -> &'static str {
    if v.is_nil() {
        "nil"
    } else if v.is_bool() {
        "bool"
    } else if v.is_int() {
        "int"
    } else if v.is_double() {
        "double"
    } else if v.is_pid() {
        "pid"
    } else if v.is_obj() {
        unsafe {
            match &(*v.decode_obj()).body {
                ObjectBody::String(_) => "string",
                ObjectBody::Array(_) => "array",
                ObjectBody::Map(_) => "map",
                ObjectBody::Bytes(_) => "bytes",
                ObjectBody::Vector(_) => "vector",
                ObjectBody::Function(_) => "function",
                ObjectBody::Closure(_) => "closure",
                ObjectBody::Upvalue(_) => "upvalue",
                ObjectBody::Result(_) => "result",
                ObjectBody::Option(_) => "option",
                ObjectBody::Struct(_) => "struct",
                ObjectBody::Enum(_) => "enum",
            }
        }
    } else {
        "unknown"
    }
}

fn format_value(v: Boxed64) -> String {
    if v.is_nil() {
        "nil".to_string()
    } else if v.is_bool() {
        v.decode_bool().to_string()
    } else if v.is_int() {
        v.decode_int().to_string()
    } else if v.is_double() {
        v.decode_double().to_string()
    } else if v.is_obj() {
        unsafe {
            match &(*v.decode_obj()).body {
                ObjectBody::String(s) => s.to_string(),
                _ => format!("<{}>", type_name(v)),
            }
        }
    } else {
        "<unknown>".to_string()
    }
}

enum Signal {
    Error(VmError),
    Halt,
    Waiting,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;
    use std::collections::HashMap;

    struct TestScheduler {
        blocks: HashMap<Pid, crate::scheduler::Block>,
        next_pid: Pid,
    }

    impl TestScheduler {
        fn new() -> Self {
            Self { blocks: HashMap::new(), next_pid: 1 }
        }
    }

    impl Scheduler for TestScheduler {
        fn get_block(&self, pid: Pid) -> Option<&crate::scheduler::Block> {
            self.blocks.get(&pid)
        }
        fn get_block_mut(&mut self, pid: Pid) -> Option<&mut crate::scheduler::Block> {
            self.blocks.get_mut(&pid)
        }
        fn enqueue(&mut self, target: Pid, message: Boxed64) -> crate::error::VmResult<()> {
            if let Some(b) = self.blocks.get_mut(&target) {
                b.mailbox.push_back(message);
            }
            Ok(())
        }
        fn spawn(&mut self, _entry: Boxed64, capabilities: Vec<String>) -> crate::error::VmResult<Pid> {
            let pid = self.next_pid;
            self.next_pid += 1;
            self.blocks.insert(pid, crate::scheduler::Block::new(pid, None, capabilities));
            Ok(pid)
        }
        fn block_pids(&self) -> Vec<Pid> {
            self.blocks.keys().copied().collect()
        }
    }

    #[test]
    fn arithmetic_and_return() {
        let mut vm = RegisterVm::new(1, RegVmLimits::default());
        let mut heap = Heap::new(HeapConfig::default());
        let mut scheduler = TestScheduler::new();
        let mut chunk = RegChunk::new(4);
        let two = chunk.add_constant(Boxed64::encode_int(2));
        let three = chunk.add_constant(Boxed64::encode_int(3));
        chunk.code.push(instr::encode_i(RegOp::LoadConst, 0, two));
        chunk.code.push(instr::encode_i(RegOp::LoadConst, 1, three));
        chunk.code.push(instr::encode_r(RegOp::Add, 2, 0, 1));
        chunk.code.push(instr::encode_i(RegOp::Ret, 2, 0));
        let idx = vm.push_chunk(chunk);
        match vm.call_entry(idx, &[], &mut scheduler, &mut heap) {
            Outcome::Ok(v) => assert_eq!(v.decode_int(), 5),
            other => panic!("expected Ok(5), got {other:?}"),
        }
    }

    #[test]
    fn conditional_jump_skips_false_branch() {
        let mut vm = RegisterVm::new(1, RegVmLimits::default());
        let mut heap = Heap::new(HeapConfig::default());
        let mut scheduler = TestScheduler::new();
        let mut chunk = RegChunk::new(4);
        let one = chunk.add_constant(Boxed64::encode_int(1));
        let two = chunk.add_constant(Boxed64::encode_int(2));
        chunk.code.push(instr::encode_i(RegOp::LoadFalse, 0, 0));
        chunk.code.push(instr::encode_b(RegOp::JmpIfFalse, 0, 1)); // skip the true-branch instruction
        chunk.code.push(instr::encode_i(RegOp::LoadConst, 1, one));
        chunk.code.push(instr::encode_i(RegOp::LoadConst, 1, two));
        chunk.code.push(instr::encode_i(RegOp::Ret, 1, 0));
        let idx = vm.push_chunk(chunk);
        match vm.call_entry(idx, &[], &mut scheduler, &mut heap) {
            Outcome::Ok(v) => assert_eq!(v.decode_int(), 2),
            other => panic!("expected Ok(2), got {other:?}"),
        }
    }

    #[test]
    fn nested_call_returns_into_caller_register() {
        let mut vm = RegisterVm::new(1, RegVmLimits::default());
        let mut heap = Heap::new(HeapConfig::default());
        let mut scheduler = TestScheduler::new();

        let mut callee = RegChunk::new(2);
        callee.code.push(instr::encode_r(RegOp::Add, 0, 0, 1));
        callee.code.push(instr::encode_i(RegOp::Ret, 0, 0));
        let callee_idx = vm.push_chunk(callee);

        let mut caller = RegChunk::new(4);
        let callee_ref = caller.add_constant(Boxed64::encode_int(callee_idx as i64));
        let a = caller.add_constant(Boxed64::encode_int(10));
        let b = caller.add_constant(Boxed64::encode_int(20));
        caller.code.push(instr::encode_i(RegOp::LoadConst, 0, callee_ref));
        caller.code.push(instr::encode_i(RegOp::LoadConst, 1, a));
        caller.code.push(instr::encode_i(RegOp::LoadConst, 2, b));
        caller.code.push(instr::encode_r(RegOp::Call, 3, 0, 2)); // result->r3, callee ref r0, argc 2
        caller.code.push(instr::encode_i(RegOp::Ret, 3, 0));
        let caller_idx = vm.push_chunk(caller);

        match vm.call_entry(caller_idx, &[], &mut scheduler, &mut heap) {
            Outcome::Ok(v) => assert_eq!(v.decode_int(), 30),
            other => panic!("expected Ok(30), got {other:?}"),
        }
    }

    #[test]
    fn closure_captures_local_upvalue_by_reference() {
        let mut vm = RegisterVm::new(1, RegVmLimits::default());
        let mut heap = Heap::new(HeapConfig::default());
        let mut scheduler = TestScheduler::new();

        // Inner function body: loads its captured upvalue into r0 and returns it.
        let mut inner = RegChunk::new(1);
        inner.code.push(instr::encode_i(RegOp::LoadUpvalue, 0, 0));
        inner.code.push(instr::encode_i(RegOp::Ret, 0, 0));
        let inner_idx = vm.push_chunk(inner);

        let mut outer = RegChunk::new(3);
        let inner_const = outer.add_constant(Boxed64::encode_int(inner_idx as i64));
        let val = outer.add_constant(Boxed64::encode_int(7));
        outer.code.push(instr::encode_i(RegOp::LoadConst, 0, val));
        // MakeClosure rd=1, imm=inner_const, then raw words: n=1, (is_local=1, index=0)
        outer.code.push(instr::encode_i(RegOp::MakeClosure, 1, inner_const));
        outer.code.push(1);
        outer.code.push(u32::from_be_bytes([1, 0, 0, 0]));
        outer.code.push(instr::encode_i(RegOp::Ret, 1, 0));
        let outer_idx = vm.push_chunk(outer);

        match vm.call_entry(outer_idx, &[], &mut scheduler, &mut heap) {
            Outcome::Ok(v) => assert!(v.is_obj(), "expected a closure object, got {v:?}"),
            other => panic!("expected Ok(closure), got {other:?}"),
        }
    }

    #[test]
    fn receive_reports_waiting_on_empty_mailbox() {
        let mut vm = RegisterVm::new(1, RegVmLimits::default());
        let mut heap = Heap::new(HeapConfig::default());
        let mut scheduler = TestScheduler::new();
        scheduler.blocks.insert(1, crate::scheduler::Block::new(1, None, Vec::new()));

        let mut chunk = RegChunk::new(1);
        chunk.code.push(instr::encode_i(RegOp::Receive, 0, 0));
        chunk.code.push(instr::encode_i(RegOp::Ret, 0, 0));
        let idx = vm.push_chunk(chunk);

        let outcome = vm.call_entry(idx, &[], &mut scheduler, &mut heap);
        assert!(matches!(outcome, Outcome::Waiting));
    }
}
