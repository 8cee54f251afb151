//! RPN expression engine (§4.7): a stack-based postfix language compiled
//! once and evaluated repeatedly against a register bank and the object of
//! whichever node is "current" for a given call.

pub mod compile;
pub mod eval;

pub use compile::{compile, Instr, Program, RegKind};
pub use eval::{eval_bool, eval_double, eval_integer, eval_set, Ctx, Operand, RegValue};
