//! Control-flow recovery during graph building.
//!
//! Each structured construct pushes a [`CfgState`] carrying the pc at
//! which it must be resolved. The traversal loop in `builder/mod.rs`
//! calls back in here whenever it reaches that pc or a control op.
//! Breaks and continues leave their blocks unterminated on the state
//! they target; the catch block that joins them is created when the
//! construct closes.

use tracing::trace;

use crate::bytecode::{Op, Pc, SrcNote};
use crate::ir::{BlockId, CompareOp, ConstValue, InstrKind, IrType, Terminator};

use super::{AbortReason, GraphBuilder};

/// What the traversal loop should do after a control handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlStatus {
    /// Not a control op; translate the instruction normally.
    Fallthrough,
    /// Control moved somewhere else; `pc` and `current` were updated.
    Jumped,
    /// A construct closed and control resumed at its join point.
    Joined,
    /// Every path out of the construct terminated.
    Ended,
}

/// Stack entry locating a loop, switch or label for break/continue
/// resolution: the index of its state on the cfg stack plus its continue
/// (or exit, for switches and labels) pc.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ControlFlowInfo {
    pub cfg_index: usize,
    pub pc: Pc,
}

#[derive(Debug)]
pub(crate) struct CfgState {
    /// Processing the current branch stops here.
    pub stop_at: Pc,
    pub kind: CfgKind,
}

#[derive(Debug)]
pub(crate) enum CfgKind {
    /// if without else; `stop_at` is the join, which is the false block.
    If { if_false: BlockId },
    /// Translating the true arm; `stop_at` is its closing goto.
    IfElseTrue { false_end: Pc, if_false: BlockId },
    /// Translating the false arm; `stop_at` is the join.
    IfElseFalse { if_true: Option<BlockId> },
    /// Translating the right-hand side; `stop_at` is the join.
    AndOr { join: BlockId },
    Label { breaks: Vec<BlockId> },
    TableSwitch(TableSwitchState),
    /// Walking the chain of case comparisons.
    CondSwitchCase(CondSwitchState),
    /// Walking the case bodies in pc order.
    CondSwitchBody(CondSwitchState),
    WhileCond(LoopState),
    WhileBody(LoopState),
    DoWhileBody(LoopState),
    DoWhileCond(LoopState),
    ForCond(LoopState),
    ForBody(LoopState),
    ForUpdate(LoopState),
}

#[derive(Debug)]
pub(crate) struct LoopState {
    pub header: BlockId,
    /// Exit block of the loop test, if one has been created yet.
    pub successor: Option<BlockId>,
    pub breaks: Vec<BlockId>,
    pub continues: Vec<BlockId>,
    pub body_start: Pc,
    pub body_end: Pc,
    pub exit_pc: Pc,
    pub continue_pc: Pc,
    /// Start of the update clause of a for loop.
    pub update_pc: Option<Pc>,
    pub update_end: Pc,
}

#[derive(Debug)]
pub(crate) struct TableSwitchState {
    pub exit: Pc,
    /// Default and non-hole case blocks, sorted by pc.
    pub blocks: Vec<BlockId>,
    pub current: usize,
    pub breaks: Vec<BlockId>,
}

#[derive(Debug)]
pub(crate) struct CondSwitchState {
    pub exit: Pc,
    pub default_target: Pc,
    pub default_idx: Option<usize>,
    /// Bodies in pc order. A `None` slot is reserved for a default body
    /// that has not been allocated yet.
    pub bodies: Vec<Option<BlockId>>,
    pub current_idx: usize,
    pub last_target: Option<Pc>,
    pub breaks: Vec<BlockId>,
}

impl<'a> GraphBuilder<'a> {
    // ---- dispatch ----

    /// Handle ops that transfer control. Anything else falls through to
    /// plain instruction translation.
    pub(crate) fn snoop_control_flow(&mut self) -> Result<ControlStatus, AbortReason> {
        match self.script.op(self.pc).clone() {
            Op::Nop | Op::Pop => match self.script.note(self.pc).cloned() {
                Some(SrcNote::For { cond, update, ifne }) => self.for_loop(cond, update, ifne),
                Some(SrcNote::DoWhile { cond, ifne }) => self.do_while_loop(cond, ifne),
                _ => Ok(ControlStatus::Fallthrough),
            },
            Op::Goto(target) => match self.script.note(self.pc).cloned() {
                Some(SrcNote::While { ifne }) => self.while_loop(target, ifne),
                Some(SrcNote::Break) => self.process_break(target, false),
                Some(SrcNote::BreakLabel) => self.process_break(target, true),
                Some(SrcNote::Continue) => self.process_continue(target),
                Some(SrcNote::SwitchBreak) => self.process_switch_break(target),
                _ => Err(AbortReason::Unsupported("goto without source note")),
            },
            Op::TableSwitch { .. } => self.table_switch(),
            Op::Return => self.process_return(false),
            Op::ReturnUndef => self.process_return(true),
            Op::Throw => self.process_throw(),
            Op::IfTrue(_) => Err(AbortReason::Unsupported("backedge outside a loop")),
            _ => Ok(ControlStatus::Fallthrough),
        }
    }

    /// Resolve the innermost pending construct, then keep resolving outer
    /// ones as long as every path through them has terminated.
    pub(crate) fn process_cfg_stack(&mut self) -> Result<ControlStatus, AbortReason> {
        let mut status = match self.cfg_stack.pop() {
            Some(state) => self.process_cfg_entry(state)?,
            None => return Ok(ControlStatus::Ended),
        };
        while status == ControlStatus::Ended {
            match self.cfg_stack.pop() {
                Some(state) => status = self.process_cfg_entry(state)?,
                None => return Ok(ControlStatus::Ended),
            }
        }
        Ok(status)
    }

    fn process_cfg_entry(&mut self, state: CfgState) -> Result<ControlStatus, AbortReason> {
        let stop_at = state.stop_at;
        match state.kind {
            CfgKind::If { if_false } => self.process_if_end(if_false),
            CfgKind::IfElseTrue { false_end, if_false } => {
                self.process_if_else_true_end(false_end, if_false)
            }
            CfgKind::IfElseFalse { if_true } => self.process_if_else_false_end(if_true, stop_at),
            CfgKind::AndOr { join } => self.process_and_or_end(join),
            CfgKind::Label { breaks } => self.process_label_end(breaks, stop_at),
            CfgKind::TableSwitch(s) => self.process_next_table_switch_case(s),
            CfgKind::CondSwitchCase(s) => self.process_cond_switch_case(s),
            CfgKind::CondSwitchBody(s) => self.process_cond_switch_body(s),
            CfgKind::WhileCond(s) => self.process_loop_cond_end(s, false),
            CfgKind::WhileBody(s) => self.process_loop_backedge(s),
            CfgKind::DoWhileBody(s) => self.process_do_while_body_end(s),
            CfgKind::DoWhileCond(s) => self.process_do_while_cond_end(s),
            CfgKind::ForCond(s) => self.process_loop_cond_end(s, true),
            CfgKind::ForBody(s) => self.process_for_body_end(s),
            CfgKind::ForUpdate(s) => self.process_loop_backedge(s),
        }
    }

    /// A branch died (return, throw, break, continue); resolve pending
    /// control flow with no current block.
    fn process_control_end(&mut self) -> Result<ControlStatus, AbortReason> {
        debug_assert!(self.current.is_none());
        if self.cfg_stack.is_empty() {
            // The last path out of the script.
            return Ok(ControlStatus::Ended);
        }
        self.process_cfg_stack()
    }

    // ---- if / else / short-circuit ----

    pub(crate) fn op_iffalse(&mut self, block: BlockId, target: Pc) -> Result<(), AbortReason> {
        let cond = self.pop(block)?;
        let true_start = self.pc.next();
        let if_true = self.new_block(block, true_start);
        let if_false = self.new_block(block, target);
        self.graph.end(block, Terminator::Test { cond, if_true, if_false });

        match self.script.note(self.pc) {
            Some(SrcNote::If) => {
                self.cfg_stack.push(CfgState { stop_at: target, kind: CfgKind::If { if_false } });
            }
            Some(SrcNote::IfElse { true_end }) => {
                let true_end = *true_end;
                let false_end = match self.script.op(true_end) {
                    Op::Goto(join) => *join,
                    _ => return Err(AbortReason::Unsupported("malformed if-else")),
                };
                self.cfg_stack.push(CfgState {
                    stop_at: true_end,
                    kind: CfgKind::IfElseTrue { false_end, if_false },
                });
            }
            _ => return Err(AbortReason::Unsupported("branch without source note")),
        }
        self.current = Some(if_true);
        Ok(())
    }

    fn process_if_end(&mut self, if_false: BlockId) -> Result<ControlStatus, AbortReason> {
        // The false block is the join point; the true arm may already
        // have terminated.
        if let Some(cur) = self.current.take() {
            self.graph.end(cur, Terminator::Goto { target: if_false });
            self.graph.add_predecessor(if_false, cur);
        }
        self.pc = self.graph.block(if_false).pc;
        self.current = Some(if_false);
        Ok(ControlStatus::Joined)
    }

    fn process_if_else_true_end(
        &mut self,
        false_end: Pc,
        if_false: BlockId,
    ) -> Result<ControlStatus, AbortReason> {
        let if_true = self.current.take();
        self.cfg_stack.push(CfgState { stop_at: false_end, kind: CfgKind::IfElseFalse { if_true } });
        self.pc = self.graph.block(if_false).pc;
        self.current = Some(if_false);
        Ok(ControlStatus::Jumped)
    }

    fn process_if_else_false_end(
        &mut self,
        if_true: Option<BlockId>,
        join_pc: Pc,
    ) -> Result<ControlStatus, AbortReason> {
        let if_false = self.current.take();
        let (pred, other) = match (if_false, if_true) {
            (Some(f), t) => (f, t),
            (None, Some(t)) => (t, None),
            (None, None) => return Ok(ControlStatus::Ended),
        };
        let join = self.new_block(pred, join_pc);
        self.graph.end(pred, Terminator::Goto { target: join });
        if let Some(other) = other {
            self.graph.end(other, Terminator::Goto { target: join });
            self.graph.add_predecessor(join, other);
        }
        self.pc = join_pc;
        self.current = Some(join);
        Ok(ControlStatus::Joined)
    }

    pub(crate) fn op_andor(&mut self, block: BlockId, target: Pc, is_and: bool) -> Result<(), AbortReason> {
        // The left-hand side stays on the stack along both edges.
        let lhs = self.peek(block, 0)?;
        let eval_rhs = self.new_block(block, self.pc.next());
        let join = self.new_block(block, target);
        let (if_true, if_false) = if is_and { (eval_rhs, join) } else { (join, eval_rhs) };
        self.graph.end(block, Terminator::Test { cond: lhs, if_true, if_false });
        self.cfg_stack.push(CfgState { stop_at: target, kind: CfgKind::AndOr { join } });
        self.current = Some(eval_rhs);
        Ok(())
    }

    fn process_and_or_end(&mut self, join: BlockId) -> Result<ControlStatus, AbortReason> {
        let cur = self.take_current()?;
        self.graph.end(cur, Terminator::Goto { target: join });
        self.graph.add_predecessor(join, cur);
        self.pc = self.graph.block(join).pc;
        self.current = Some(join);
        Ok(ControlStatus::Joined)
    }

    // ---- labels ----

    pub(crate) fn op_label(&mut self, end: Pc) -> Result<(), AbortReason> {
        self.labels.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: end });
        self.cfg_stack.push(CfgState { stop_at: end, kind: CfgKind::Label { breaks: Vec::new() } });
        Ok(())
    }

    fn process_label_end(
        &mut self,
        breaks: Vec<BlockId>,
        end: Pc,
    ) -> Result<ControlStatus, AbortReason> {
        self.labels.pop();
        if breaks.is_empty() {
            return Ok(if self.current.is_none() {
                ControlStatus::Ended
            } else {
                ControlStatus::Joined
            });
        }
        let successor = self.create_break_catch_block(&breaks, end);
        if let Some(cur) = self.current.take() {
            self.graph.end(cur, Terminator::Goto { target: successor });
            self.graph.add_predecessor(successor, cur);
        }
        self.pc = end;
        self.current = Some(successor);
        Ok(ControlStatus::Joined)
    }

    // ---- returns, throws, breaks, continues ----

    fn process_return(&mut self, undefined: bool) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;
        let value = if undefined {
            self.constant(block, ConstValue::Undefined)
        } else {
            self.pop(block)?
        };
        self.graph.end(block, Terminator::Return { value });
        self.process_control_end()
    }

    fn process_throw(&mut self) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;
        let value = self.pop(block)?;
        self.graph.end(block, Terminator::Throw { value });
        self.process_control_end()
    }

    fn process_break(&mut self, target: Pc, labeled: bool) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;
        let mut found = None;
        if labeled {
            for info in self.labels.iter().rev() {
                if info.pc == target {
                    found = Some(info.cfg_index);
                    break;
                }
            }
            match found.and_then(|idx| match &mut self.cfg_stack[idx].kind {
                CfgKind::Label { breaks } => Some(breaks),
                _ => None,
            }) {
                Some(breaks) => breaks.push(block),
                None => return Err(AbortReason::Unsupported("labeled break target not found")),
            }
        } else {
            for info in self.loops.iter().rev() {
                if self.loop_state(info.cfg_index).map(|l| l.exit_pc) == Some(target) {
                    found = Some(info.cfg_index);
                    break;
                }
            }
            match found.and_then(|idx| self.loop_state_mut(idx)) {
                Some(state) => state.breaks.push(block),
                None => return Err(AbortReason::Unsupported("break target not found")),
            }
        }
        self.pc = self.pc.next();
        self.process_control_end()
    }

    fn process_continue(&mut self, target: Pc) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;
        let mut found = None;
        for info in self.loops.iter().rev() {
            if info.pc == target || self.effective_continue(info.pc) == target {
                found = Some(info.cfg_index);
                break;
            }
        }
        match found.and_then(|idx| self.loop_state_mut(idx)) {
            Some(state) => state.continues.push(block),
            None => return Err(AbortReason::Unsupported("continue target not found")),
        }
        self.pc = self.pc.next();
        self.process_control_end()
    }

    fn process_switch_break(&mut self, target: Pc) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;
        let mut found = None;
        for info in self.switches.iter().rev() {
            if info.pc == target {
                found = Some(info.cfg_index);
                break;
            }
        }
        match found.map(|idx| &mut self.cfg_stack[idx].kind) {
            Some(CfgKind::TableSwitch(s)) => s.breaks.push(block),
            Some(CfgKind::CondSwitchCase(s)) | Some(CfgKind::CondSwitchBody(s)) => {
                s.breaks.push(block)
            }
            _ => return Err(AbortReason::Unsupported("switch break target not found")),
        }
        self.pc = self.pc.next();
        self.process_control_end()
    }

    /// A loop's continue pc can itself be a goto (an empty update clause);
    /// continues then jump straight to its target.
    fn effective_continue(&self, pc: Pc) -> Pc {
        match self.script.op(pc) {
            Op::Goto(t) => *t,
            _ => pc,
        }
    }

    fn loop_state(&self, idx: usize) -> Option<&LoopState> {
        match &self.cfg_stack[idx].kind {
            CfgKind::WhileCond(s)
            | CfgKind::WhileBody(s)
            | CfgKind::DoWhileBody(s)
            | CfgKind::DoWhileCond(s)
            | CfgKind::ForCond(s)
            | CfgKind::ForBody(s)
            | CfgKind::ForUpdate(s) => Some(s),
            _ => None,
        }
    }

    fn loop_state_mut(&mut self, idx: usize) -> Option<&mut LoopState> {
        match &mut self.cfg_stack[idx].kind {
            CfgKind::WhileCond(s)
            | CfgKind::WhileBody(s)
            | CfgKind::DoWhileBody(s)
            | CfgKind::DoWhileCond(s)
            | CfgKind::ForCond(s)
            | CfgKind::ForBody(s)
            | CfgKind::ForUpdate(s) => Some(s),
            _ => None,
        }
    }

    // ---- loops ----

    fn while_loop(&mut self, cond_pc: Pc, ifne: Pc) -> Result<ControlStatus, AbortReason> {
        let loop_head = self.pc.next();
        match self.script.op(ifne) {
            Op::IfTrue(t) if *t == loop_head => {}
            _ => return Err(AbortReason::Unsupported("malformed while loop")),
        }
        let mut pred = self.take_current()?;
        if self.osr_pc == Some(cond_pc) {
            let preheader = self.new_osr_preheader(pred, cond_pc)?;
            self.graph.end(pred, Terminator::Goto { target: preheader });
            pred = preheader;
        }
        let header = self.new_loop_header(pred, loop_head);
        self.graph.end(pred, Terminator::Goto { target: header });

        let state = LoopState {
            header,
            successor: None,
            breaks: Vec::new(),
            continues: Vec::new(),
            body_start: loop_head.next(),
            body_end: cond_pc,
            exit_pc: ifne.next(),
            continue_pc: cond_pc,
            update_pc: None,
            update_end: ifne,
        };
        self.loops.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: cond_pc });
        self.cfg_stack.push(CfgState { stop_at: ifne, kind: CfgKind::WhileCond(state) });
        self.current = Some(header);
        self.pc = cond_pc;
        trace!(header = %header, "while loop");
        Ok(ControlStatus::Jumped)
    }

    fn do_while_loop(&mut self, cond_pc: Pc, ifne: Pc) -> Result<ControlStatus, AbortReason> {
        let loop_head = self.pc.next();
        match self.script.op(ifne) {
            Op::IfTrue(t) if *t == loop_head => {}
            _ => return Err(AbortReason::Unsupported("malformed do-while loop")),
        }
        let mut pred = self.take_current()?;
        if self.osr_pc == Some(loop_head) {
            let preheader = self.new_osr_preheader(pred, loop_head)?;
            self.graph.end(pred, Terminator::Goto { target: preheader });
            pred = preheader;
        }
        let header = self.new_loop_header(pred, loop_head);
        self.graph.end(pred, Terminator::Goto { target: header });

        let body_start = loop_head.next();
        let state = LoopState {
            header,
            successor: None,
            breaks: Vec::new(),
            continues: Vec::new(),
            body_start,
            body_end: cond_pc,
            exit_pc: ifne.next(),
            continue_pc: cond_pc,
            update_pc: None,
            update_end: ifne,
        };
        self.loops.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: cond_pc });
        self.cfg_stack.push(CfgState { stop_at: cond_pc, kind: CfgKind::DoWhileBody(state) });
        self.current = Some(header);
        self.pc = body_start;
        trace!(header = %header, "do-while loop");
        Ok(ControlStatus::Jumped)
    }

    fn for_loop(&mut self, cond: Pc, update: Pc, ifne: Pc) -> Result<ControlStatus, AbortReason> {
        let pred = self.take_current()?;
        if matches!(self.script.op(self.pc), Op::Pop) {
            // The init clause left its value on the stack.
            self.pop(pred)?;
        }
        let cond_exists = cond != ifne;
        let update_exists = update != cond;

        let loop_head;
        if cond_exists {
            match self.script.op(self.pc.next()) {
                Op::Goto(t) if *t == cond => {}
                _ => return Err(AbortReason::Unsupported("malformed for loop")),
            }
            loop_head = self.pc.next().next();
            match self.script.op(ifne) {
                Op::IfTrue(t) if *t == loop_head => {}
                _ => return Err(AbortReason::Unsupported("malformed for loop")),
            }
        } else {
            loop_head = self.pc.next();
            match self.script.op(ifne) {
                Op::Goto(t) if *t == loop_head => {}
                _ => return Err(AbortReason::Unsupported("malformed for loop")),
            }
        }
        let loop_entry = if cond_exists { cond } else { loop_head };

        let mut pred = pred;
        if self.osr_pc == Some(loop_entry) {
            let preheader = self.new_osr_preheader(pred, loop_entry)?;
            self.graph.end(pred, Terminator::Goto { target: preheader });
            pred = preheader;
        }
        let header = self.new_loop_header(pred, loop_head);
        self.graph.end(pred, Terminator::Goto { target: header });

        let body_start = loop_head.next();
        let body_end = if update_exists {
            update
        } else if cond_exists {
            cond
        } else {
            ifne
        };
        let continue_pc = body_end;
        let state = LoopState {
            header,
            successor: None,
            breaks: Vec::new(),
            continues: Vec::new(),
            body_start,
            body_end,
            exit_pc: ifne.next(),
            continue_pc,
            update_pc: if update_exists { Some(update) } else { None },
            update_end: if cond_exists { cond } else { ifne },
        };
        self.loops.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: continue_pc });
        if cond_exists {
            self.cfg_stack.push(CfgState { stop_at: ifne, kind: CfgKind::ForCond(state) });
            self.current = Some(header);
            self.pc = cond;
        } else {
            self.cfg_stack.push(CfgState { stop_at: body_end, kind: CfgKind::ForBody(state) });
            self.current = Some(header);
            self.pc = body_start;
        }
        trace!(header = %header, cond_exists, update_exists, "for loop");
        Ok(ControlStatus::Jumped)
    }

    /// The loop condition has been translated into the header; split into
    /// the body and the exit.
    fn process_loop_cond_end(
        &mut self,
        mut state: LoopState,
        is_for: bool,
    ) -> Result<ControlStatus, AbortReason> {
        let cur = self.take_current()?;
        let cond = self.pop(cur)?;
        let body = self.new_block(cur, state.body_start);
        let exit = self.new_block_with_depth(cur, state.exit_pc, self.loop_depth - 1);
        self.graph.end(cur, Terminator::Test { cond, if_true: body, if_false: exit });
        state.successor = Some(exit);

        let stop_at = state.body_end;
        self.pc = state.body_start;
        self.current = Some(body);
        let kind = if is_for { CfgKind::ForBody(state) } else { CfgKind::WhileBody(state) };
        self.cfg_stack.push(CfgState { stop_at, kind });
        Ok(ControlStatus::Jumped)
    }

    /// End of a while body or a for update clause: close the backedge.
    fn process_loop_backedge(&mut self, mut state: LoopState) -> Result<ControlStatus, AbortReason> {
        self.process_deferred_continues(&mut state)?;
        let cur = match self.current.take() {
            Some(cur) => cur,
            None => return self.process_broken_loop(state),
        };
        self.graph.end(cur, Terminator::Goto { target: state.header });
        self.graph.set_backedge(state.header, cur);
        self.finish_loop(state)
    }

    fn process_do_while_body_end(&mut self, mut state: LoopState) -> Result<ControlStatus, AbortReason> {
        self.process_deferred_continues(&mut state)?;
        if self.current.is_none() {
            return self.process_broken_loop(state);
        }
        // Fall into the condition; pc is already at its first op.
        let stop_at = state.update_end;
        self.cfg_stack.push(CfgState { stop_at, kind: CfgKind::DoWhileCond(state) });
        Ok(ControlStatus::Jumped)
    }

    fn process_do_while_cond_end(&mut self, mut state: LoopState) -> Result<ControlStatus, AbortReason> {
        let cur = self.take_current()?;
        let cond = self.pop(cur)?;
        let exit = self.new_block_with_depth(cur, state.exit_pc, self.loop_depth - 1);
        self.graph.end(cur, Terminator::Test { cond, if_true: state.header, if_false: exit });
        self.graph.set_backedge(state.header, cur);
        state.successor = Some(exit);
        self.finish_loop(state)
    }

    fn process_for_body_end(&mut self, mut state: LoopState) -> Result<ControlStatus, AbortReason> {
        self.process_deferred_continues(&mut state)?;
        if self.current.is_none() {
            return self.process_broken_loop(state);
        }
        if let Some(update_pc) = state.update_pc {
            let stop_at = state.update_end;
            self.pc = update_pc;
            self.cfg_stack.push(CfgState { stop_at, kind: CfgKind::ForUpdate(state) });
            return Ok(ControlStatus::Jumped);
        }
        let cur = self.take_current()?;
        self.graph.end(cur, Terminator::Goto { target: state.header });
        self.graph.set_backedge(state.header, cur);
        self.finish_loop(state)
    }

    /// Merge deferred continue edges into a fresh block at the continue
    /// point and make it current.
    fn process_deferred_continues(&mut self, state: &mut LoopState) -> Result<(), AbortReason> {
        if state.continues.is_empty() {
            return Ok(());
        }
        let continues = std::mem::take(&mut state.continues);
        let update = self.create_break_catch_block(&continues, state.continue_pc);
        if let Some(cur) = self.current.take() {
            self.graph.end(cur, Terminator::Goto { target: update });
            self.graph.add_predecessor(update, cur);
        }
        self.current = Some(update);
        Ok(())
    }

    /// Close a loop whose backedge was reached. Break edges merge into a
    /// catch block behind the test's exit.
    fn finish_loop(&mut self, mut state: LoopState) -> Result<ControlStatus, AbortReason> {
        self.loop_depth -= 1;
        self.loops.pop();
        let mut successor = state.successor;
        if !state.breaks.is_empty() {
            let breaks = std::mem::take(&mut state.breaks);
            let catch_block = self.create_break_catch_block(&breaks, state.exit_pc);
            if let Some(succ) = successor {
                self.graph.end(succ, Terminator::Goto { target: catch_block });
                self.graph.add_predecessor(catch_block, succ);
            }
            successor = Some(catch_block);
        }
        match successor {
            Some(succ) => {
                self.pc = state.exit_pc;
                self.current = Some(succ);
                Ok(ControlStatus::Joined)
            }
            None => Ok(ControlStatus::Ended),
        }
    }

    /// No path reached the backedge; demote the header and continue from
    /// the exit or the break edges, if any.
    fn process_broken_loop(&mut self, mut state: LoopState) -> Result<ControlStatus, AbortReason> {
        debug_assert!(self.current.is_none());
        self.loop_depth -= 1;
        self.loops.pop();
        self.graph.block_mut(state.header).is_loop_header = false;
        if let Some(succ) = state.successor {
            self.graph.block_mut(succ).loop_depth = self.loop_depth;
        }
        let mut successor = state.successor;
        if !state.breaks.is_empty() {
            let breaks = std::mem::take(&mut state.breaks);
            let catch_block = self.create_break_catch_block(&breaks, state.exit_pc);
            if let Some(succ) = successor {
                self.graph.end(succ, Terminator::Goto { target: catch_block });
                self.graph.add_predecessor(catch_block, succ);
            }
            successor = Some(catch_block);
        }
        match successor {
            Some(succ) => {
                self.pc = state.exit_pc;
                self.current = Some(succ);
                Ok(ControlStatus::Joined)
            }
            None => Ok(ControlStatus::Ended),
        }
    }

    /// Join a list of deferred edges into one block at `pc`, terminating
    /// each edge with a goto.
    fn create_break_catch_block(&mut self, edges: &[BlockId], pc: Pc) -> BlockId {
        debug_assert!(!edges.is_empty());
        let first = edges[0];
        let block = self.new_block(first, pc);
        self.graph.end(first, Terminator::Goto { target: block });
        for &edge in &edges[1..] {
            self.graph.end(edge, Terminator::Goto { target: block });
            self.graph.add_predecessor(block, edge);
        }
        block
    }

    // ---- table switch ----

    fn table_switch(&mut self) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;
        let (low, default_pc, targets) = match self.script.op(self.pc).clone() {
            Op::TableSwitch { low, default, targets, .. } => (low, default, targets),
            _ => return Err(AbortReason::Unsupported("bad table switch")),
        };
        let exit = match self.script.note(self.pc) {
            Some(SrcNote::Switch { exit }) => *exit,
            _ => return Err(AbortReason::Unsupported("table switch without note")),
        };

        let input = self.pop(block)?;
        let default = self.new_block(block, default_pc);
        let mut queue = vec![default];
        let mut cases = Vec::with_capacity(targets.len());
        for &target in &targets {
            if target == self.pc {
                // A hole in the table goes straight to the default body.
                let gap = self.new_block(block, default_pc);
                self.graph.end(gap, Terminator::Goto { target: default });
                self.graph.add_predecessor(default, gap);
                cases.push(gap);
            } else {
                let case = self.new_block(block, target);
                cases.push(case);
                queue.push(case);
            }
        }
        let graph = &self.graph;
        queue.sort_by_key(|b| graph.block(*b).pc);
        self.graph.end(block, Terminator::TableSwitch { input, low, cases, default });

        let stop_at = if queue.len() > 1 { self.graph.block(queue[1]).pc } else { exit };
        self.pc = self.graph.block(queue[0]).pc;
        self.current = Some(queue[0]);
        let state = TableSwitchState { exit, blocks: queue, current: 0, breaks: Vec::new() };
        self.switches.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: exit });
        self.cfg_stack.push(CfgState { stop_at, kind: CfgKind::TableSwitch(state) });
        Ok(ControlStatus::Jumped)
    }

    fn process_next_table_switch_case(
        &mut self,
        mut state: TableSwitchState,
    ) -> Result<ControlStatus, AbortReason> {
        state.current += 1;
        if state.current == state.blocks.len() {
            let breaks = std::mem::take(&mut state.breaks);
            return self.process_switch_end(breaks, state.exit);
        }
        let successor = state.blocks[state.current];
        // A live current block means the previous case had no break and
        // falls through.
        if let Some(cur) = self.current.take() {
            self.graph.end(cur, Terminator::Goto { target: successor });
            self.graph.add_predecessor(successor, cur);
        }
        let stop_at = if state.current + 1 < state.blocks.len() {
            self.graph.block(state.blocks[state.current + 1]).pc
        } else {
            state.exit
        };
        self.pc = self.graph.block(successor).pc;
        self.current = Some(successor);
        self.cfg_stack.push(CfgState { stop_at, kind: CfgKind::TableSwitch(state) });
        Ok(ControlStatus::Jumped)
    }

    fn process_switch_end(
        &mut self,
        breaks: Vec<BlockId>,
        exit: Pc,
    ) -> Result<ControlStatus, AbortReason> {
        self.switches.pop();
        let current = self.current.take();
        if breaks.is_empty() && current.is_none() {
            return Ok(ControlStatus::Ended);
        }
        let successor = if breaks.is_empty() {
            match current {
                Some(cur) => {
                    let succ = self.new_block(cur, exit);
                    self.graph.end(cur, Terminator::Goto { target: succ });
                    succ
                }
                None => return Ok(ControlStatus::Ended),
            }
        } else {
            let succ = self.create_break_catch_block(&breaks, exit);
            if let Some(cur) = current {
                self.graph.end(cur, Terminator::Goto { target: succ });
                self.graph.add_predecessor(succ, cur);
            }
            succ
        };
        self.pc = exit;
        self.current = Some(successor);
        Ok(ControlStatus::Joined)
    }

    // ---- cond switch ----

    pub(crate) fn op_condswitch(&mut self, _block: BlockId) -> Result<(), AbortReason> {
        let (exit, first_case) = match self.script.note(self.pc) {
            Some(SrcNote::CondSwitchNote { exit, first_case }) => (*exit, *first_case),
            _ => return Err(AbortReason::Unsupported("cond switch without note")),
        };
        // Walk the case chain once to size the body list. Case targets are
        // monotonic; consecutive cases may share one body.
        let mut targets: Vec<Pc> = Vec::new();
        let mut cur = first_case;
        let default_target = loop {
            match self.script.op(cur) {
                Op::Case(t) => {
                    if targets.last().is_some_and(|last| *last > *t) {
                        return Err(AbortReason::Unsupported("unordered cond switch"));
                    }
                    if targets.last() != Some(t) {
                        targets.push(*t);
                    }
                    cur = match self.script.note(cur) {
                        Some(SrcNote::NextCase { next }) => *next,
                        _ => return Err(AbortReason::Unsupported("case without chain note")),
                    };
                }
                Op::Default(t) => break *t,
                _ => return Err(AbortReason::Unsupported("malformed cond switch chain")),
            }
        };
        let mut nbodies = targets.len();
        if !targets.contains(&default_target) {
            nbodies += 1;
        }
        let state = CondSwitchState {
            exit,
            default_target,
            default_idx: None,
            bodies: vec![None; nbodies],
            current_idx: 0,
            last_target: None,
            breaks: Vec::new(),
        };
        self.cfg_stack.push(CfgState { stop_at: first_case, kind: CfgKind::CondSwitchCase(state) });
        Ok(())
    }

    fn process_cond_switch_case(
        &mut self,
        mut state: CondSwitchState,
    ) -> Result<ControlStatus, AbortReason> {
        let block = self.take_current()?;

        // A chain with no cases jumps straight to the default body.
        if let Op::Default(target) = *self.script.op(self.pc) {
            let body = self.new_block_popn(block, target, 1);
            self.pop(block)?;
            self.graph.end(block, Terminator::Goto { target: body });
            state.bodies.clear();
            state.bodies.push(Some(body));
            state.default_idx = Some(0);
            state.current_idx = 0;
            self.current = None;
            self.switches.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: state.exit });
            return self.process_cond_switch_body(state);
        }

        let body_target = match *self.script.op(self.pc) {
            Op::Case(t) => t,
            _ => return Err(AbortReason::Unsupported("expected switch case")),
        };
        let next_case = match self.script.note(self.pc) {
            Some(SrcNote::NextCase { next }) => *next,
            _ => return Err(AbortReason::Unsupported("case without chain note")),
        };
        let case_is_default = matches!(self.script.op(next_case), Op::Default(_));

        // The matching body: new unless it aliases the previous case's.
        let mut body_is_new = false;
        let body_block = if state.last_target.map_or(true, |last| last < body_target) {
            // Reserve the default body's position when it lands before or
            // at this body.
            if state.last_target.map_or(true, |last| last < state.default_target)
                && state.default_target <= body_target
            {
                state.default_idx = Some(state.current_idx);
                if state.default_target < body_target {
                    state.current_idx += 1;
                }
            }
            body_is_new = true;
            let b = self.new_block_popn(block, body_target, 2);
            let idx = state.current_idx;
            state.current_idx += 1;
            match state.bodies.get_mut(idx) {
                Some(slot) => *slot = Some(b),
                None => return Err(AbortReason::Unsupported("cond switch body overflow")),
            }
            b
        } else {
            state
                .bodies
                .get(state.current_idx.wrapping_sub(1))
                .copied()
                .flatten()
                .ok_or(AbortReason::Unsupported("aliased case without body"))?
        };
        state.last_target = Some(body_target);

        // The non-matching side: the next case's condition, or the default
        // body when this is the last case.
        let mut case_is_new = false;
        let case_block = if !case_is_default {
            case_is_new = true;
            self.new_block_popn(block, self.pc.next(), 1)
        } else {
            let idx = match state.default_idx {
                Some(idx) => idx,
                None => {
                    // The default body follows every case body.
                    let idx = state.current_idx;
                    state.default_idx = Some(idx);
                    state.current_idx += 1;
                    idx
                }
            };
            match state.bodies.get(idx).copied().flatten() {
                Some(b) => b,
                None => {
                    case_is_new = true;
                    let b = self.new_block_popn(block, state.default_target, 2);
                    match state.bodies.get_mut(idx) {
                        Some(slot) => *slot = Some(b),
                        None => return Err(AbortReason::Unsupported("cond switch body overflow")),
                    }
                    b
                }
            }
        };

        if body_block != case_block {
            let case_operand = self.pop(block)?;
            let switch_operand = self.peek(block, 0)?;
            let cmp = self.add(
                block,
                InstrKind::Compare { op: CompareOp::StrictEq },
                IrType::Boolean,
                &[switch_operand, case_operand],
            );
            self.graph.end(block, Terminator::Test { cond: cmp, if_true: body_block, if_false: case_block });
            if !body_is_new {
                self.graph.add_predecessor_popn(body_block, block, 1);
            }
            if !case_is_new {
                self.graph.add_predecessor_popn(case_block, block, 1);
            }
        } else {
            // Matching and non-matching sides are the same body.
            self.pop(block)?;
            self.pop(block)?;
            self.graph.end(block, Terminator::Goto { target: body_block });
            if !body_is_new {
                self.graph.add_predecessor(body_block, block);
            }
        }

        if case_is_default {
            state.bodies.truncate(state.current_idx);
            state.current_idx = 0;
            self.current = None;
            self.switches.push(ControlFlowInfo { cfg_index: self.cfg_stack.len(), pc: state.exit });
            return self.process_cond_switch_body(state);
        }
        self.pc = self.pc.next();
        self.current = Some(case_block);
        self.cfg_stack.push(CfgState { stop_at: next_case, kind: CfgKind::CondSwitchCase(state) });
        Ok(ControlStatus::Jumped)
    }

    fn process_cond_switch_body(
        &mut self,
        mut state: CondSwitchState,
    ) -> Result<ControlStatus, AbortReason> {
        if state.current_idx == state.bodies.len() {
            let breaks = std::mem::take(&mut state.breaks);
            return self.process_switch_end(breaks, state.exit);
        }
        let next = state.bodies[state.current_idx]
            .ok_or(AbortReason::Unsupported("cond switch body missing"))?;
        state.current_idx += 1;
        // A live current block is the previous body falling through.
        if let Some(cur) = self.current.take() {
            self.graph.end(cur, Terminator::Goto { target: next });
            self.graph.add_predecessor(next, cur);
        }
        let stop_at = if state.current_idx < state.bodies.len() {
            let after = state.bodies[state.current_idx]
                .ok_or(AbortReason::Unsupported("cond switch body missing"))?;
            self.graph.block(after).pc
        } else {
            state.exit
        };
        self.pc = self.graph.block(next).pc;
        self.current = Some(next);
        self.cfg_stack.push(CfgState { stop_at, kind: CfgKind::CondSwitchBody(state) });
        Ok(ControlStatus::Jumped)
    }
}
