//! Variable-width bytecode opcodes for the stack VM (§4.4.2).
//!
//! Grounded on the teacher's `vm/opcode.rs` `OpCode` enum (explicit
//! discriminants, `operand_size`/`from_byte`, roundtrip test), expanded
//! from its ~45 entries to the hot-core operation set spec.md's §4.4
//! names: actor ops, Result/Option ops, and an IC-consuming map-get. Cold
//! opcodes (the ones the design notes mark low-frequency) are deferred —
//! not given byte encodings yet — rather than padding this table out for
//! its own sake.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // --- constants & stack shape ---
    PushConst = 0,
    PushNil = 1,
    PushTrue = 2,
    PushFalse = 3,
    Pop = 4,
    Dup = 5,
    Nop = 61,
    Dup2 = 62,
    Swap = 63,

    // --- locals & globals ---
    LoadLocal = 6,
    StoreLocal = 7,
    LoadGlobal = 8,
    StoreGlobal = 9,
    LoadUpvalue = 10,
    StoreUpvalue = 11,
    CloseUpvalue = 12,

    // --- arithmetic ---
    Add = 13,
    Sub = 14,
    Mul = 15,
    Div = 16,
    Mod = 17,
    Neg = 18,

    // --- comparison & logic ---
    Eq = 19,
    NotEq = 20,
    Less = 21,
    LessEq = 22,
    Greater = 23,
    GreaterEq = 24,
    Not = 25,

    // --- control flow ---
    Jump = 26,
    JumpIfFalse = 27,
    JumpIfTrue = 28,
    Loop = 29,

    // --- calls ---
    Call = 30,
    Return = 31,
    Closure = 32,

    // --- containers ---
    NewArray = 33,
    NewMap = 34,
    Index = 35,
    StoreIndex = 36,
    /// Reads a map by constant string key through an inline cache slot
    /// (operand: u16 cache slot index); §6.5.
    MapGetIc = 37,
    Len = 38,

    // --- iteration ---
    IterInit = 39,
    IterNext = 40,

    // --- Result / Option (§3.3) ---
    MakeOk = 41,
    MakeErr = 42,
    MakeSome = 43,
    MakeNone = 44,
    UnwrapOrJump = 45,

    // --- actors (dispatch through `Scheduler`, §4.4.4, §6.2) ---
    Spawn = 46,
    Send = 47,
    Receive = 48,
    ReceiveTimeout = 49,
    /// Selective receive against a structural-subset Map pattern (§4.4.4).
    ReceiveMatch = 64,

    // --- misc ---
    Throw = 50,
    Halt = 51,

    // --- specialized fast paths (superinstructions) ---
    // Folding the common `LoadLocal <0|1|2>` / `LoadGlobal <0|1|2>` /
    // integer-only arithmetic shapes into zero-operand opcodes skips a
    // byte read and a generic numeric-tag dispatch on the hottest paths.
    LoadLocal0 = 52,
    LoadLocal1 = 53,
    LoadLocal2 = 54,
    LoadGlobal0 = 55,
    LoadGlobal1 = 56,
    LoadGlobal2 = 57,
    AddInt = 58,
    SubInt = 59,
    MulInt = 60,
}

impl OpCode {
    /// Bytes of operand data immediately following the opcode byte in
    /// the chunk (not counting the opcode byte itself).
    pub fn operand_size(self) -> usize {
        use OpCode::*;
        match self {
            PushConst | LoadLocal | StoreLocal | LoadUpvalue | StoreUpvalue | CloseUpvalue
            | Call | NewArray | StoreIndex | Len | IterInit | IterNext => 1,
            LoadGlobal | StoreGlobal | Jump | JumpIfFalse | JumpIfTrue | Loop | Closure
            | UnwrapOrJump | ReceiveTimeout => 2,
            // Cache slot (u16) plus a constant-pool key index (u8).
            MapGetIc => 3,
            PushNil | PushTrue | PushFalse | Pop | Dup | Add | Sub | Mul | Div | Mod | Neg
            | Eq | NotEq | Less | LessEq | Greater | GreaterEq | Not | Return | NewMap
            | Index | MakeOk | MakeErr | MakeSome | MakeNone | Spawn | Send | Receive | Throw
            | Halt | LoadLocal0 | LoadLocal1 | LoadLocal2 | LoadGlobal0 | LoadGlobal1
            | LoadGlobal2 | AddInt | SubInt | MulInt | Nop | Dup2 | Swap | ReceiveMatch => 0,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        use OpCode::*;
        Some(match byte {
            0 => PushConst,
            1 => PushNil,
            2 => PushTrue,
            3 => PushFalse,
            4 => Pop,
            5 => Dup,
            6 => LoadLocal,
            7 => StoreLocal,
            8 => LoadGlobal,
            9 => StoreGlobal,
            10 => LoadUpvalue,
            11 => StoreUpvalue,
            12 => CloseUpvalue,
            13 => Add,
            14 => Sub,
            15 => Mul,
            16 => Div,
            17 => Mod,
            18 => Neg,
            19 => Eq,
            20 => NotEq,
            21 => Less,
            22 => LessEq,
            23 => Greater,
            24 => GreaterEq,
            25 => Not,
            26 => Jump,
            27 => JumpIfFalse,
            28 => JumpIfTrue,
            29 => Loop,
            30 => Call,
            31 => Return,
            32 => Closure,
            33 => NewArray,
            34 => NewMap,
            35 => Index,
            36 => StoreIndex,
            37 => MapGetIc,
            38 => Len,
            39 => IterInit,
            40 => IterNext,
            41 => MakeOk,
            42 => MakeErr,
            43 => MakeSome,
            44 => MakeNone,
            45 => UnwrapOrJump,
            46 => Spawn,
            47 => Send,
            48 => Receive,
            49 => ReceiveTimeout,
            50 => Throw,
            51 => Halt,
            52 => LoadLocal0,
            53 => LoadLocal1,
            54 => LoadLocal2,
            55 => LoadGlobal0,
            56 => LoadGlobal1,
            57 => LoadGlobal2,
            58 => AddInt,
            59 => SubInt,
            60 => MulInt,
            61 => Nop,
            62 => Dup2,
            63 => Swap,
            64 => ReceiveMatch,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_discriminant_roundtrips_through_from_byte() {
        for byte in 0..=64u8 {
            let op = OpCode::from_byte(byte).unwrap_or_else(|| panic!("missing opcode {byte}"));
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    fn unknown_byte_is_none() {
        assert!(OpCode::from_byte(200).is_none());
    }
}
