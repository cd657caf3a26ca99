//! Type-specific object bodies (§3.3).

use super::{MapBody, ObjectTag};
use crate::value::Boxed64;

pub struct ArrayBody {
    pub items: Vec<Boxed64>,
}

impl ArrayBody {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_vec(items: Vec<Boxed64>) -> Self {
        Self { items }
    }
}

impl Default for ArrayBody {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-length, numeric-only container (§3.3's `Vector`, distinct from
/// the heterogeneous, resizable `Array`). Open Question resolved in
/// DESIGN.md: backed by `Vec<f64>` rather than `Vec<Boxed64>` since every
/// element is guaranteed numeric at construction and the hot arithmetic
/// path never needs to re-check a tag.
pub struct VectorBody {
    pub items: Vec<f64>,
}

/// Static metadata for a compiled function (§4.4.1, §6.1): body bytecode
/// lives in the chunk addressed by `chunk_index`, not here.
pub struct FunctionBody {
    pub name: Option<Box<str>>,
    pub arity: u8,
    pub chunk_index: u32,
    pub upvalue_count: u8,
}

/// A location an upvalue refers to: either still open (pointing at a slot
/// on some live frame's stack window) or closed (the value has been
/// copied out because the owning frame returned). `list_next` threads
/// open upvalues through the VM's sorted-by-slot open-upvalue list and is
/// otherwise unused once closed (§4.4.1).
pub enum UpvalueState {
    Open { frame_id: u64, slot: usize },
    Closed(Boxed64),
}

pub struct ClosureBody {
    pub function: *const super::Object,
    pub upvalues: Vec<*const super::Object>,
}

pub struct ResultBody {
    pub is_ok: bool,
    pub payload: Boxed64,
}

pub struct OptionBody {
    pub some: bool,
    pub payload: Boxed64,
}

pub struct StructBody {
    pub type_name: Box<str>,
    pub fields: Vec<Boxed64>,
}

pub struct EnumBody {
    pub type_name: Box<str>,
    pub variant: Box<str>,
    pub payload: Option<Boxed64>,
}

pub enum ObjectBody {
    String(Box<str>),
    Array(ArrayBody),
    Map(MapBody),
    Bytes(Vec<u8>),
    Vector(VectorBody),
    Function(FunctionBody),
    Closure(ClosureBody),
    Upvalue(UpvalueState),
    Result(ResultBody),
    Option(OptionBody),
    Struct(StructBody),
    Enum(EnumBody),
}

impl ObjectBody {
    pub fn tag(&self) -> ObjectTag {
        match self {
            ObjectBody::String(_) => ObjectTag::String,
            ObjectBody::Array(_) => ObjectTag::Array,
            ObjectBody::Map(_) => ObjectTag::Map,
            ObjectBody::Bytes(_) => ObjectTag::Bytes,
            ObjectBody::Vector(_) => ObjectTag::Vector,
            ObjectBody::Function(_) => ObjectTag::Function,
            ObjectBody::Closure(_) => ObjectTag::Closure,
            ObjectBody::Upvalue(_) => ObjectTag::Upvalue,
            ObjectBody::Result(_) => ObjectTag::Result,
            ObjectBody::Option(_) => ObjectTag::Option,
            ObjectBody::Struct(_) => ObjectTag::Struct,
            ObjectBody::Enum(_) => ObjectTag::Enum,
        }
    }
}
