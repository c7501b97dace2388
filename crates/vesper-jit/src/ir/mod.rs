//! SSA intermediate representation for the optimizing tier.
//!
//! All IR nodes live in [`graph::Graph`] arenas and are addressed by the
//! index newtypes below. Instructions reference operands by [`ValueId`];
//! the graph keeps the reverse use lists in sync whenever operands change.

use std::fmt;

pub mod block;
pub mod display;
pub mod graph;
pub mod instr;
pub mod types;

pub use block::{Block, Terminator};
pub use graph::{Graph, ResumeMode, ResumePoint};
pub use instr::{CompareOp, ConstValue, ElementKind, Instr, InstrKind, UnboxMode, UseSite};
pub use types::IrType;

/// Index of an instruction (or phi) in the graph's value arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Index of a basic block in the graph's block arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of a resume point in the graph's resume-point arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResumePointId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ResumePointId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for ResumePointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rp{}", self.0)
    }
}
