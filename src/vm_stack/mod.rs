//! The stack-based bytecode interpreter (§4.4).

mod chunk;
mod frame;
mod opcode;
mod vm;

pub use chunk::Chunk;
pub use frame::CallFrame;
pub use opcode::OpCode;
pub use vm::{StackVm, VmLimits};
pub(crate) use vm::{concat_operand, structural_match};
