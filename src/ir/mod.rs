//! The emitted module: type definitions, executor, and annotation parsing.

pub mod exec;
pub mod parse;
pub mod types;

pub use types::{
    BinOp, Callee, Const, Function, FunctionBody, GlobalValue, Instr, Module, Operand, Reg, RtOp,
    MODULE_DETAILS_GLOBAL, NO_EVENT_ID, TOP_LEVEL_IDENTIFIER_GLOBAL,
};
