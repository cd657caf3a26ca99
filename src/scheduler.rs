//! Scheduler/block seam (§6.2): the VM dispatches actor operations
//! through this trait and never touches a run queue or mailbox directly.
//!
//! Modeled on the teacher's `Extension`/`ExtFunction` seam in `ext.rs` —
//! a contract module that defines the boundary without implementing
//! what's on the other side of it. Scheduling policy, supervision trees,
//! and process registries are an external collaborator per scope.

use crate::error::VmResult;
use crate::value::Boxed64;

pub type Pid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Runnable,
    Running,
    Waiting,
    Dead,
}

/// A block's scheduler-visible state (§5.1, §6.2). The VM and Heap this
/// block owns are not part of this struct — they live with the worker
/// that's currently running the block, not with the scheduler.
pub struct Block {
    pub pid: Pid,
    pub capabilities: Vec<String>,
    pub mailbox: std::collections::VecDeque<Boxed64>,
    /// Messages skipped by a selective receive (§4.4.4), preserved in
    /// arrival order ahead of the mailbox for the next receive attempt.
    pub save_queue: std::collections::VecDeque<Boxed64>,
    pub state: BlockState,
    pub parent: Option<Pid>,
    pub links: Vec<Pid>,
    pub monitors: Vec<Pid>,
    /// Installed once by a `RECEIVE_TIMEOUT` that finds an empty mailbox
    /// on its first entry; cleared on the next message arrival or on
    /// expiry (§4.4.4).
    pub pending_deadline: Option<std::time::Instant>,
}

impl Block {
    pub fn new(pid: Pid, parent: Option<Pid>, capabilities: Vec<String>) -> Self {
        Self {
            pid,
            capabilities,
            mailbox: std::collections::VecDeque::new(),
            save_queue: std::collections::VecDeque::new(),
            state: BlockState::Runnable,
            parent,
            links: Vec::new(),
            monitors: Vec::new(),
            pending_deadline: None,
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

/// The scheduler-facing contract a VM's `SPAWN`/`SEND`/`RECEIVE` opcodes
/// dispatch through (§4.4.4, §6.2). Implementations own the run queue,
/// fairness policy, and supervision semantics; this crate only defines
/// what a VM needs to call.
pub trait Scheduler {
    /// Looks up a block by PID, if it still exists.
    fn get_block(&self, pid: Pid) -> Option<&Block>;

    fn get_block_mut(&mut self, pid: Pid) -> Option<&mut Block>;

    /// Deep-copies `message` (per §3.4's no-structural-sharing-across-
    /// blocks rule) into `target`'s mailbox. Fails if `target` is dead or
    /// the deep copy can't be performed (e.g. the source heap can't be
    /// borrowed).
    fn enqueue(&mut self, target: Pid, message: Boxed64) -> VmResult<()>;

    /// Creates a new block running `entry`, returning its PID.
    fn spawn(&mut self, entry: Boxed64, capabilities: Vec<String>) -> VmResult<Pid>;

    /// All blocks currently known to the scheduler, for diagnostics.
    fn block_pids(&self) -> Vec<Pid>;
}
