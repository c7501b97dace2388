//! Basic blocks.

use crate::bytecode::Pc;

use super::{BlockId, ResumePointId, ValueId};

/// Block-ending control transfer. Terminator operands (the test condition,
/// switch input, returned value) are tracked in use lists like instruction
/// operands.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Block still under construction.
    None,
    Goto {
        target: BlockId,
    },
    Test {
        cond: ValueId,
        if_true: BlockId,
        if_false: BlockId,
    },
    /// Dense table dispatch. `cases[i]` handles `low + i`; out-of-table
    /// inputs go to `default`.
    TableSwitch {
        input: ValueId,
        low: i32,
        cases: Vec<BlockId>,
        default: BlockId,
    },
    Return {
        value: ValueId,
    },
    Throw {
        value: ValueId,
    },
}

impl Terminator {
    /// The single value operand, if the terminator has one.
    pub fn operand(&self) -> Option<ValueId> {
        match self {
            Terminator::Test { cond, .. } => Some(*cond),
            Terminator::TableSwitch { input, .. } => Some(*input),
            Terminator::Return { value } | Terminator::Throw { value } => Some(*value),
            Terminator::None | Terminator::Goto { .. } => None,
        }
    }

    pub fn set_operand(&mut self, new: ValueId) {
        match self {
            Terminator::Test { cond, .. } => *cond = new,
            Terminator::TableSwitch { input, .. } => *input = new,
            Terminator::Return { value } | Terminator::Throw { value } => *value = new,
            Terminator::None | Terminator::Goto { .. } => {}
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::None | Terminator::Return { .. } | Terminator::Throw { .. } => Vec::new(),
            Terminator::Goto { target } => vec![*target],
            Terminator::Test { if_true, if_false, .. } => vec![*if_true, *if_false],
            Terminator::TableSwitch { cases, default, .. } => {
                let mut succs = cases.clone();
                succs.push(*default);
                succs
            }
        }
    }

    pub fn replace_successor(&mut self, from: BlockId, to: BlockId) {
        match self {
            Terminator::Goto { target } => {
                if *target == from {
                    *target = to;
                }
            }
            Terminator::Test { if_true, if_false, .. } => {
                if *if_true == from {
                    *if_true = to;
                }
                if *if_false == from {
                    *if_false = to;
                }
            }
            Terminator::TableSwitch { cases, default, .. } => {
                for c in cases.iter_mut() {
                    if *c == from {
                        *c = to;
                    }
                }
                if *default == from {
                    *default = to;
                }
            }
            Terminator::None | Terminator::Return { .. } | Terminator::Throw { .. } => {}
        }
    }
}

/// A basic block: ordered phis, ordered instructions, a terminator, and the
/// abstract frame state (`slots`) maintained while the graph is built.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// Bytecode position this block starts at.
    pub pc: Pc,
    pub phis: Vec<ValueId>,
    pub instrs: Vec<ValueId>,
    pub terminator: Terminator,
    pub preds: Vec<BlockId>,
    pub loop_depth: u32,
    pub is_loop_header: bool,
    /// Predecessor that closes the loop, set when the backedge is patched.
    pub backedge: Option<BlockId>,
    /// Resume point describing the frame at block entry.
    pub entry_resume: Option<ResumePointId>,
    pub idom: Option<BlockId>,
    /// Scratch bit for loop-body marking.
    pub mark: bool,
    /// Range analysis proved the block's entry condition impossible.
    pub early_abort: bool,
    /// The on-stack-replacement entry path; excluded from range unions.
    pub osr_like: bool,
    /// Abstract frame: args, locals, then expression stack. Only meaningful
    /// during graph construction.
    pub slots: Vec<ValueId>,
}

impl Block {
    pub fn new(id: BlockId, pc: Pc) -> Block {
        Block {
            id,
            pc,
            phis: Vec::new(),
            instrs: Vec::new(),
            terminator: Terminator::None,
            preds: Vec::new(),
            loop_depth: 0,
            is_loop_header: false,
            backedge: None,
            entry_resume: None,
            idom: None,
            mark: false,
            early_abort: false,
            osr_like: false,
            slots: Vec::new(),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator.successors()
    }

    pub fn is_terminated(&self) -> bool {
        !matches!(self.terminator, Terminator::None)
    }

    /// Position of `pred` in the predecessor list. Phi operand order
    /// matches this order.
    pub fn pred_index(&self, pred: BlockId) -> Option<usize> {
        self.preds.iter().position(|&p| p == pred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_successors() {
        let goto = Terminator::Goto { target: BlockId(3) };
        assert_eq!(goto.successors(), vec![BlockId(3)]);

        let test = Terminator::Test {
            cond: ValueId(0),
            if_true: BlockId(1),
            if_false: BlockId(2),
        };
        assert_eq!(test.successors(), vec![BlockId(1), BlockId(2)]);
        assert_eq!(test.operand(), Some(ValueId(0)));

        let ret = Terminator::Return { value: ValueId(7) };
        assert!(ret.successors().is_empty());
    }

    #[test]
    fn replace_successor() {
        let mut t = Terminator::Test {
            cond: ValueId(0),
            if_true: BlockId(1),
            if_false: BlockId(2),
        };
        t.replace_successor(BlockId(2), BlockId(9));
        assert_eq!(t.successors(), vec![BlockId(1), BlockId(9)]);
    }
}
