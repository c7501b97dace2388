//! Stack-machine bytecode consumed by the graph builder.
//!
//! Every op occupies one pc slot and jump targets are absolute op
//! indices. Structured control flow leaves a note at the opening op so
//! the builder can recover the construct's bounds without scanning ahead;
//! the expected op shapes are documented on each [`SrcNote`] variant.

use std::fmt;

use rustc_hash::FxHashMap;

/// Absolute position of an op in a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Pc(pub u32);

impl Pc {
    pub fn next(self) -> Pc {
        Pc(self.0 + 1)
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Interned name referenced by property and scope ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId(pub u32);

/// Identity of a script, used to key per-script compile state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Nop,
    Pop,
    Dup,

    Int32(i32),
    Double(f64),
    Bool(bool),
    Undefined,
    Str(NameId),

    GetArg(u16),
    SetArg(u16),
    GetLocal(u16),
    SetLocal(u16),

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,

    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Lsh,
    Rsh,
    Ursh,

    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,

    GetProp(NameId),
    SetProp(NameId),
    GetName(NameId),
    GetElem,
    SetElem,
    /// Pops `argc` arguments then the callee; pushes the result.
    Call(u16),
    Length,
    CharCodeAt,

    Goto(Pc),
    /// Pops the condition; branches to the target when falsy.
    IfFalse(Pc),
    /// Pops the condition; branches to the target when truthy. Only used
    /// as a loop backedge.
    IfTrue(Pc),
    /// Short-circuit and/or: peeks the condition, jumps to the join
    /// keeping it on the stack, or falls into the right-hand side after
    /// popping it.
    And(Pc),
    Or(Pc),
    LoopHead,
    /// Labeled statement; the target is the pc right after it.
    Label(Pc),
    /// Case in a cond switch: pops the case value and, on a match with the
    /// switch value below it, pops that too and jumps to the body.
    Case(Pc),
    /// Closes a cond switch's case chain; jumps to the default body.
    Default(Pc),
    CondSwitch,
    /// `targets[i]` handles `low + i`. A target equal to the switch's own
    /// pc marks a hole in the table.
    TableSwitch { low: i32, high: i32, default: Pc, targets: Vec<Pc> },

    Return,
    ReturnUndef,
    Throw,
}

/// Control-structure notes attached at the op that opens the construct.
#[derive(Debug, Clone, PartialEq)]
pub enum SrcNote {
    /// On an `IfFalse` whose branch target is the join point.
    If,
    /// On an `IfFalse`; `true_end` is the `Goto` ending the true arm,
    /// whose target is the join point.
    IfElse { true_end: Pc },
    /// On the `Goto` opening a while loop:
    /// ```text
    /// pc:    Goto cond        ; note While
    /// pc+1:  LoopHead
    ///        ...body...
    /// cond:  ...condition...
    /// ifne:  IfTrue -> pc+1
    /// ```
    While { ifne: Pc },
    /// On the `Nop` opening a do-while loop; the body starts at `pc + 2`
    /// (after the `LoopHead`) and runs to `cond`.
    DoWhile { cond: Pc, ifne: Pc },
    /// On the `Nop`/`Pop` opening a for loop. `cond == ifne` encodes a
    /// missing condition, `update == cond` a missing update clause:
    /// ```text
    /// pc:     Nop or Pop       ; note For
    /// pc+1:   Goto cond        ; only when a condition exists
    ///         LoopHead
    /// body:   ...
    /// update: ...
    /// cond:   ...
    /// ifne:   IfTrue -> LoopHead   (Goto when no condition)
    /// ```
    For { cond: Pc, update: Pc, ifne: Pc },
    /// On a `Goto` leaving a loop.
    Break,
    /// On a `Goto` leaving a labeled statement.
    BreakLabel,
    /// On a `Goto` to a loop's continue point.
    Continue,
    /// On a `Goto` leaving a switch.
    SwitchBreak,
    /// On a `TableSwitch`.
    Switch { exit: Pc },
    /// On a `CondSwitch`; `first_case` is the first `Case` op.
    CondSwitchNote { exit: Pc, first_case: Pc },
    /// On a `Case`; `next` is the following `Case` or `Default`.
    NextCase { next: Pc },
}

#[derive(Debug, Clone)]
pub struct Script {
    pub id: ScriptId,
    pub nargs: u16,
    pub nlocals: u16,
    ops: Vec<Op>,
    notes: FxHashMap<u32, SrcNote>,
    names: Vec<String>,
}

impl Script {
    pub fn op(&self, pc: Pc) -> &Op {
        &self.ops[pc.0 as usize]
    }

    pub fn note(&self, pc: Pc) -> Option<&SrcNote> {
        self.notes.get(&pc.0)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn limit(&self) -> Pc {
        Pc(self.ops.len() as u32)
    }

    pub fn name(&self, id: NameId) -> &str {
        &self.names[id.0 as usize]
    }
}

/// Emit helper; also the way tests assemble scripts.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    nargs: u16,
    nlocals: u16,
    ops: Vec<Op>,
    notes: FxHashMap<u32, SrcNote>,
    names: Vec<String>,
}

impl ScriptBuilder {
    pub fn new(nargs: u16, nlocals: u16) -> ScriptBuilder {
        ScriptBuilder { nargs, nlocals, ..ScriptBuilder::default() }
    }

    /// Append an op, returning its pc.
    pub fn op(&mut self, op: Op) -> Pc {
        let pc = Pc(self.ops.len() as u32);
        self.ops.push(op);
        pc
    }

    /// Next pc to be emitted.
    pub fn here(&self) -> Pc {
        Pc(self.ops.len() as u32)
    }

    /// Rewrite an already-emitted op; used to patch forward jumps.
    pub fn patch(&mut self, at: Pc, op: Op) {
        self.ops[at.0 as usize] = op;
    }

    pub fn note(&mut self, at: Pc, note: SrcNote) {
        self.notes.insert(at.0, note);
    }

    /// Intern a name, reusing an existing id for duplicates.
    pub fn name(&mut self, name: &str) -> NameId {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return NameId(pos as u32);
        }
        self.names.push(name.to_string());
        NameId((self.names.len() - 1) as u32)
    }

    pub fn finish(self, id: ScriptId) -> Script {
        Script {
            id,
            nargs: self.nargs,
            nlocals: self.nlocals,
            ops: self.ops,
            notes: self.notes,
            names: self.names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_patch() {
        let mut sb = ScriptBuilder::new(1, 0);
        let jump = sb.op(Op::Goto(Pc(0)));
        sb.op(Op::GetArg(0));
        let target = sb.op(Op::Return);
        sb.patch(jump, Op::Goto(target));

        let script = sb.finish(ScriptId(0));
        assert_eq!(script.op(jump), &Op::Goto(Pc(2)));
        assert_eq!(script.len(), 3);
    }

    #[test]
    fn names_are_interned() {
        let mut sb = ScriptBuilder::new(0, 0);
        let a = sb.name("length");
        let b = sb.name("x");
        let c = sb.name("length");
        assert_eq!(a, c);
        assert_ne!(a, b);
        let script = sb.finish(ScriptId(1));
        assert_eq!(script.name(b), "x");
    }

    #[test]
    fn notes_attach_to_pcs() {
        let mut sb = ScriptBuilder::new(0, 0);
        let goto = sb.op(Op::Goto(Pc(5)));
        sb.note(goto, SrcNote::While { ifne: Pc(9) });
        let script = sb.finish(ScriptId(2));
        assert_eq!(script.note(goto), Some(&SrcNote::While { ifne: Pc(9) }));
        assert_eq!(script.note(Pc(0).next()), None);
    }
}
