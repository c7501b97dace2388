//! Bytecode to SSA translation.
//!
//! The builder walks the bytecode in order, as if traversing the source
//! AST, keeping a current block whose `slots` map frame positions to SSA
//! values. Structured control flow is recovered from source notes and
//! pushed on a stack of pending [`control::CfgState`] entries; reaching an
//! entry's `stop_at` pc resolves it (see `builder/control.rs`). This
//! builds SSA in a single pass: joins create phis as predecessors are
//! added, and loop headers get pending phis that are back-patched when the
//! backedge closes.

mod control;

use thiserror::Error;
use tracing::{debug, trace};

use crate::bytecode::{NameId, Op, Pc, Script};
use crate::context::CompileOptions;
use crate::ir::{
    CompareOp, ConstValue, Graph, InstrKind, IrType, ResumeMode, Terminator, UnboxMode, ValueId,
};
use crate::ir::{BlockId, ResumePointId};
use crate::object::{ObjectModel, PropertyLocation};
use crate::oracle::OracleSnapshot;

use control::{CfgState, ControlFlowInfo, ControlStatus};

/// Why a compilation gave up. `Disabled` and repeated occurrences of the
/// others feed the per-script disable flag kept by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("allocation failure during compilation")]
    Alloc,
    #[error("unsupported construct: {0}")]
    Unsupported(&'static str),
    #[error("inlining aborted")]
    Inlining,
    #[error("compilation disabled for this script")]
    Disabled,
}

pub struct GraphBuilder<'a> {
    pub(crate) script: &'a Script,
    pub(crate) oracle: &'a OracleSnapshot,
    pub(crate) objects: &'a dyn ObjectModel,
    #[allow(dead_code)]
    pub(crate) options: &'a CompileOptions,
    pub(crate) graph: Graph,
    pub(crate) current: Option<BlockId>,
    pub(crate) pc: Pc,
    pub(crate) cfg_stack: Vec<CfgState>,
    pub(crate) loops: Vec<ControlFlowInfo>,
    pub(crate) switches: Vec<ControlFlowInfo>,
    pub(crate) labels: Vec<ControlFlowInfo>,
    pub(crate) loop_depth: u32,
    pub(crate) osr_pc: Option<Pc>,
    pub(crate) osr_block: Option<BlockId>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        script: &'a Script,
        oracle: &'a OracleSnapshot,
        objects: &'a dyn ObjectModel,
        options: &'a CompileOptions,
        osr_pc: Option<Pc>,
    ) -> GraphBuilder<'a> {
        GraphBuilder {
            script,
            oracle,
            objects,
            options,
            graph: Graph::new(script.nargs as usize, script.nlocals as usize),
            current: None,
            pc: Pc(0),
            cfg_stack: Vec::new(),
            loops: Vec::new(),
            switches: Vec::new(),
            labels: Vec::new(),
            loop_depth: 0,
            osr_pc,
            osr_block: None,
        }
    }

    pub fn build(mut self) -> Result<Graph, AbortReason> {
        debug!(script = self.script.id.0, osr = ?self.osr_pc, "building graph");
        self.init_entry()?;
        self.traverse()?;

        if self.osr_pc.is_some() && self.graph.osr_entry.is_none() {
            return Err(AbortReason::Unsupported("osr pc is not a loop entry"));
        }
        self.graph.build_dominators();
        self.graph.assert_coherent();
        debug!(blocks = self.graph.num_blocks(), values = self.graph.num_values(), "graph built");
        Ok(self.graph)
    }

    fn init_entry(&mut self) -> Result<(), AbortReason> {
        let entry = self.graph.add_block(Pc(0));
        self.graph.entry = entry;
        self.graph.add_instr(entry, InstrKind::Start, IrType::None, &[]);

        let mut slots = Vec::with_capacity(self.graph.nslots());
        for i in 0..self.script.nargs {
            let ty = self.oracle.arg_type(i);
            let param = self.graph.add_instr(entry, InstrKind::Parameter { index: i }, ty, &[]);
            slots.push(param);
        }
        let undef = self.graph.add_instr(
            entry,
            InstrKind::Constant { value: ConstValue::Undefined },
            IrType::Value,
            &[],
        );
        for _ in 0..self.script.nlocals {
            slots.push(undef);
        }
        self.graph.block_mut(entry).slots = slots;
        self.attach_entry_resume(entry);

        // The OSR entry lives at a fixed position, directly after the
        // entry block, so consumers can locate it without scanning.
        if let Some(osr_pc) = self.osr_pc {
            let osr = self.graph.add_block(osr_pc);
            self.graph.block_mut(osr).osr_like = true;
            self.osr_block = Some(osr);
        }

        self.current = Some(entry);
        self.pc = Pc(0);
        Ok(())
    }

    fn traverse(&mut self) -> Result<(), AbortReason> {
        loop {
            loop {
                // Leaving one control structure can place us at the edge
                // of another, so loop rather than test once.
                if self.cfg_stack.last().map(|s| s.stop_at) == Some(self.pc) {
                    let _status = self.process_cfg_stack()?;
                    if self.current.is_none() {
                        return Ok(());
                    }
                    continue;
                }
                match self.snoop_control_flow()? {
                    ControlStatus::Fallthrough => break,
                    _ => {
                        if self.current.is_none() {
                            return Ok(());
                        }
                    }
                }
            }
            let block = self.take_current()?;
            self.current = Some(block);
            let op = self.script.op(self.pc).clone();
            self.inspect_op(block, &op)?;
            self.pc = self.pc.next();
        }
    }

    // ---- frame state ----

    pub(crate) fn take_current(&mut self) -> Result<BlockId, AbortReason> {
        self.current.take().ok_or(AbortReason::Unsupported("no active block"))
    }

    pub(crate) fn push(&mut self, block: BlockId, value: ValueId) {
        self.graph.block_mut(block).slots.push(value);
    }

    pub(crate) fn pop(&mut self, block: BlockId) -> Result<ValueId, AbortReason> {
        self.graph
            .block_mut(block)
            .slots
            .pop()
            .ok_or(AbortReason::Unsupported("operand stack underflow"))
    }

    pub(crate) fn peek(&self, block: BlockId, depth: usize) -> Result<ValueId, AbortReason> {
        let slots = &self.graph.block(block).slots;
        slots
            .get(slots.len().wrapping_sub(1 + depth))
            .copied()
            .ok_or(AbortReason::Unsupported("operand stack underflow"))
    }

    fn arg_slot(&self, index: u16) -> usize {
        index as usize
    }

    fn local_slot(&self, index: u16) -> usize {
        self.script.nargs as usize + index as usize
    }

    // ---- block and resume helpers ----

    pub(crate) fn new_block(&mut self, pred: BlockId, pc: Pc) -> BlockId {
        self.new_block_with_depth(pred, pc, self.loop_depth)
    }

    pub(crate) fn new_block_with_depth(&mut self, pred: BlockId, pc: Pc, depth: u32) -> BlockId {
        let block = self.graph.new_block_from(pred, pc, depth);
        self.attach_entry_resume(block);
        block
    }

    pub(crate) fn new_block_popn(&mut self, pred: BlockId, pc: Pc, popped: usize) -> BlockId {
        let block = self.graph.new_block_popn(pred, pc, popped, self.loop_depth);
        self.attach_entry_resume(block);
        block
    }

    pub(crate) fn new_loop_header(&mut self, pred: BlockId, pc: Pc) -> BlockId {
        self.loop_depth += 1;
        let header = self.graph.new_pending_loop_header(pred, pc, self.loop_depth);
        self.attach_entry_resume(header);
        header
    }

    pub(crate) fn attach_entry_resume(&mut self, block: BlockId) {
        let pc = self.graph.block(block).pc;
        let operands = self.graph.block(block).slots.clone();
        let rp = self.graph.add_resume_point(block, pc, ResumeMode::At, operands);
        self.graph.block_mut(block).entry_resume = Some(rp);
    }

    pub(crate) fn resume_after(&mut self, block: BlockId, ins: ValueId) -> ResumePointId {
        let operands = self.graph.block(block).slots.clone();
        let rp = self.graph.add_resume_point(block, self.pc, ResumeMode::After, operands);
        self.graph.instr_mut(ins).resume_after = Some(rp);
        rp
    }

    pub(crate) fn add(&mut self, block: BlockId, kind: InstrKind, ty: IrType, operands: &[ValueId]) -> ValueId {
        self.graph.add_instr(block, kind, ty, operands)
    }

    pub(crate) fn constant(&mut self, block: BlockId, value: ConstValue) -> ValueId {
        let ty = value.ty();
        self.add(block, InstrKind::Constant { value }, ty, &[])
    }

    /// Coerce a value to int32, inserting a truncation if its type is not
    /// already int32.
    fn int32_operand(&mut self, block: BlockId, value: ValueId) -> ValueId {
        if self.graph.instr(value).ty == IrType::Int32 {
            value
        } else {
            self.add(block, InstrKind::TruncateToInt32, IrType::Int32, &[value])
        }
    }

    // ---- the OSR preheader ----

    /// Build the OSR entry block (reconstructing every frame slot from the
    /// unoptimized frame) and a preheader joining it with the normal path.
    pub(crate) fn new_osr_preheader(&mut self, pred: BlockId, loop_entry: Pc) -> Result<BlockId, AbortReason> {
        let osr = self.osr_block.ok_or(AbortReason::Unsupported("osr entry without osr pc"))?;
        if self.graph.osr_entry.is_some() {
            return Err(AbortReason::Unsupported("second osr loop entry"));
        }
        trace!(%loop_entry, "building osr preheader");

        let entry_ins = self.graph.add_instr(osr, InstrKind::OsrEntry, IrType::None, &[]);
        let nslots = self.graph.block(pred).slots.len();
        let mut slots = Vec::with_capacity(nslots);
        for i in 0..nslots {
            let v = self.graph.add_instr(
                osr,
                InstrKind::OsrValue { slot: i as u16 },
                IrType::Value,
                &[entry_ins],
            );
            slots.push(v);
        }
        // The frame reads are infallible, so the first valid resume point
        // captures the boxed values after they all execute.
        let rp = self.graph.add_resume_point(osr, loop_entry, ResumeMode::At, slots.clone());
        self.graph.block_mut(osr).entry_resume = Some(rp);

        // Unbox slots the oracle speculates a type for. A slot whose cold
        // frame disagreed stays boxed.
        if let Some(types) = self.oracle.osr_slot_types(loop_entry) {
            let types = types.to_vec();
            for (i, ty) in types.iter().enumerate().take(nslots) {
                if let Some(ty) = ty {
                    if ty.is_unboxable() {
                        let unbox = self.graph.add_instr(
                            osr,
                            InstrKind::Unbox { mode: UnboxMode::Infallible },
                            *ty,
                            &[slots[i]],
                        );
                        slots[i] = unbox;
                    }
                }
            }
        }
        self.graph.block_mut(osr).slots = slots;

        let preheader = self.new_block(pred, loop_entry);
        self.graph.end(osr, Terminator::Goto { target: preheader });
        self.graph.add_predecessor(preheader, osr);
        self.graph.osr_entry = Some(osr);
        Ok(preheader)
    }

    // ---- opcode translation ----

    fn inspect_op(&mut self, block: BlockId, op: &Op) -> Result<(), AbortReason> {
        match op {
            Op::Nop | Op::LoopHead => Ok(()),
            Op::Pop => {
                self.pop(block)?;
                Ok(())
            }
            Op::Dup => {
                let top = self.peek(block, 0)?;
                self.push(block, top);
                Ok(())
            }

            Op::Int32(n) => {
                let c = self.constant(block, ConstValue::Int32(*n));
                self.push(block, c);
                Ok(())
            }
            Op::Double(n) => {
                let c = self.constant(block, ConstValue::Double(*n));
                self.push(block, c);
                Ok(())
            }
            Op::Bool(b) => {
                let c = self.constant(block, ConstValue::Boolean(*b));
                self.push(block, c);
                Ok(())
            }
            Op::Undefined => {
                let c = self.constant(block, ConstValue::Undefined);
                self.push(block, c);
                Ok(())
            }
            Op::Str(name) => {
                let c = self.constant(block, ConstValue::Str(*name));
                self.push(block, c);
                Ok(())
            }

            Op::GetArg(i) => {
                let slot = self.arg_slot(*i);
                let v = self.graph.block(block).slots[slot];
                self.push(block, v);
                Ok(())
            }
            Op::SetArg(i) => {
                let slot = self.arg_slot(*i);
                let v = self.peek(block, 0)?;
                self.graph.block_mut(block).slots[slot] = v;
                Ok(())
            }
            Op::GetLocal(i) => {
                let slot = self.local_slot(*i);
                let v = self.graph.block(block).slots[slot];
                self.push(block, v);
                Ok(())
            }
            Op::SetLocal(i) => {
                let slot = self.local_slot(*i);
                let v = self.peek(block, 0)?;
                self.graph.block_mut(block).slots[slot] = v;
                Ok(())
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => self.op_binary(block, op),
            Op::Neg => self.op_neg(block),
            Op::Not => {
                let v = self.pop(block)?;
                let ins = self.add(block, InstrKind::Not, IrType::Boolean, &[v]);
                self.push(block, ins);
                Ok(())
            }

            Op::BitAnd | Op::BitOr | Op::BitXor | Op::Lsh | Op::Rsh | Op::Ursh => {
                self.op_bitop(block, op)
            }
            Op::BitNot => {
                let v = self.pop(block)?;
                let v = self.int32_operand(block, v);
                let ins = self.add(block, InstrKind::BitNot, IrType::Int32, &[v]);
                self.push(block, ins);
                Ok(())
            }

            Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne | Op::StrictEq | Op::StrictNe => {
                self.op_compare(block, op)
            }

            Op::GetProp(name) => self.op_getprop(block, *name),
            Op::SetProp(name) => self.op_setprop(block, *name),
            Op::GetName(name) => {
                let ty = self.oracle.result_type(self.pc);
                let ins = self.add(block, InstrKind::GetNameCache { name: *name }, ty, &[]);
                self.push(block, ins);
                self.resume_after(block, ins);
                Ok(())
            }
            Op::GetElem => self.op_getelem(block),
            Op::SetElem => self.op_setelem(block),
            Op::Call(argc) => self.op_call(block, *argc),
            Op::Length => self.op_length(block),
            Op::CharCodeAt => {
                let index = self.pop(block)?;
                let string = self.pop(block)?;
                let index = self.int32_operand(block, index);
                let ins = self.add(block, InstrKind::CharCodeAt, IrType::Int32, &[string, index]);
                self.push(block, ins);
                Ok(())
            }

            Op::IfFalse(target) => self.op_iffalse(block, *target),
            Op::And(target) => self.op_andor(block, *target, true),
            Op::Or(target) => self.op_andor(block, *target, false),
            Op::Label(end) => self.op_label(*end),
            Op::CondSwitch => self.op_condswitch(block),

            // These are resolved as stop points of pending control flow;
            // reaching one directly means the notes are inconsistent.
            Op::Case(_) | Op::Default(_) => Err(AbortReason::Unsupported("stray switch case")),
            Op::Goto(_) | Op::IfTrue(_) => Err(AbortReason::Unsupported("jump without source note")),
            Op::TableSwitch { .. } | Op::Return | Op::ReturnUndef | Op::Throw => {
                Err(AbortReason::Unsupported("control op reached outside snooping"))
            }
        }
    }

    fn op_binary(&mut self, block: BlockId, op: &Op) -> Result<(), AbortReason> {
        let rhs = self.pop(block)?;
        let lhs = self.pop(block)?;
        let types = self.oracle.binary_types(self.pc);
        let ty = if types.lhs == IrType::Int32 && types.rhs == IrType::Int32 && types.result == IrType::Int32 {
            IrType::Int32
        } else if types.lhs.is_numeric() && types.rhs.is_numeric() {
            IrType::Double
        } else {
            // Unspecialized arithmetic can run arbitrary conversion code;
            // this tier only compiles numeric ops.
            return Err(AbortReason::Unsupported("unspecialized arithmetic"));
        };
        let kind = match op {
            Op::Add => InstrKind::Add,
            Op::Sub => InstrKind::Sub,
            Op::Mul => InstrKind::Mul { can_be_negative_zero: true },
            Op::Div => InstrKind::Div { can_be_negative_zero: true },
            Op::Mod => InstrKind::Mod,
            _ => return Err(AbortReason::Unsupported("bad binary op")),
        };
        // Integer division typically produces fractions; keep int32 only
        // for the ops whose int32 result the oracle observed.
        let ty = match kind {
            InstrKind::Div { .. } if ty == IrType::Int32 && types.result != IrType::Int32 => IrType::Double,
            _ => ty,
        };
        let ins = self.add(block, kind, ty, &[lhs, rhs]);
        self.push(block, ins);
        Ok(())
    }

    fn op_neg(&mut self, block: BlockId) -> Result<(), AbortReason> {
        let v = self.pop(block)?;
        let ty = self.graph.instr(v).ty;
        if !ty.is_numeric() {
            return Err(AbortReason::Unsupported("unspecialized negation"));
        }
        let ins = self.add(block, InstrKind::Neg, ty, &[v]);
        self.push(block, ins);
        Ok(())
    }

    fn op_bitop(&mut self, block: BlockId, op: &Op) -> Result<(), AbortReason> {
        let rhs = self.pop(block)?;
        let lhs = self.pop(block)?;
        let lhs = self.int32_operand(block, lhs);
        let rhs = self.int32_operand(block, rhs);
        let kind = match op {
            Op::BitAnd => InstrKind::BitAnd,
            Op::BitOr => InstrKind::BitOr,
            Op::BitXor => InstrKind::BitXor,
            Op::Lsh => InstrKind::Lsh,
            Op::Rsh => InstrKind::Rsh,
            Op::Ursh => InstrKind::Ursh,
            _ => return Err(AbortReason::Unsupported("bad bitop")),
        };
        // Unsigned shift can overflow int32; represent its result as
        // double unless feedback saw only int32 results.
        let ty = if matches!(kind, InstrKind::Ursh)
            && self.oracle.binary_types(self.pc).result != IrType::Int32
        {
            IrType::Double
        } else {
            IrType::Int32
        };
        let ins = self.add(block, kind, ty, &[lhs, rhs]);
        self.push(block, ins);
        Ok(())
    }

    fn op_compare(&mut self, block: BlockId, op: &Op) -> Result<(), AbortReason> {
        let rhs = self.pop(block)?;
        let lhs = self.pop(block)?;
        let cmp = match op {
            Op::Lt => CompareOp::Lt,
            Op::Le => CompareOp::Le,
            Op::Gt => CompareOp::Gt,
            Op::Ge => CompareOp::Ge,
            Op::Eq => CompareOp::Eq,
            Op::Ne => CompareOp::Ne,
            Op::StrictEq => CompareOp::StrictEq,
            Op::StrictNe => CompareOp::StrictNe,
            _ => return Err(AbortReason::Unsupported("bad compare op")),
        };
        let ins = self.add(block, InstrKind::Compare { op: cmp }, IrType::Boolean, &[lhs, rhs]);
        self.push(block, ins);
        Ok(())
    }

    fn op_getprop(&mut self, block: BlockId, name: NameId) -> Result<(), AbortReason> {
        let obj = self.pop(block)?;
        let pc = self.pc;
        let result_ty = self.oracle.result_type(pc);
        // Monomorphic receiver with a data slot: guard the shape and load
        // the slot directly, no cache.
        if let Some(shape) = self.oracle.property_types(pc).and_then(|s| s.known_shape()) {
            if let Some(loc) = self.objects.lookup(shape, name) {
                if let Some(slot) = slot_index(loc) {
                    let guard = self.add(block, InstrKind::ShapeGuard { shape }, IrType::Object, &[obj]);
                    let load = self.add(block, InstrKind::LoadSlot { slot }, result_ty, &[guard]);
                    self.push(block, load);
                    return Ok(());
                }
            }
        }
        let idempotent = self.oracle.property_is_pure(pc);
        let ins = self.add(block, InstrKind::GetPropertyCache { name, idempotent }, result_ty, &[obj]);
        self.push(block, ins);
        if !idempotent {
            self.resume_after(block, ins);
        }
        Ok(())
    }

    fn op_setprop(&mut self, block: BlockId, name: NameId) -> Result<(), AbortReason> {
        let value = self.pop(block)?;
        let obj = self.pop(block)?;
        let pc = self.pc;
        if let Some(shape) = self.oracle.property_types(pc).and_then(|s| s.known_shape()) {
            if let Some(loc) = self.objects.lookup(shape, name) {
                if let Some(slot) = slot_index(loc) {
                    let guard = self.add(block, InstrKind::ShapeGuard { shape }, IrType::Object, &[obj]);
                    let store = self.add(block, InstrKind::StoreSlot { slot }, IrType::None, &[guard, value]);
                    self.push(block, value);
                    self.resume_after(block, store);
                    return Ok(());
                }
            }
        }
        let ins = self.add(block, InstrKind::SetPropertyCache { name }, IrType::None, &[obj, value]);
        self.push(block, value);
        self.resume_after(block, ins);
        Ok(())
    }

    fn op_getelem(&mut self, block: BlockId) -> Result<(), AbortReason> {
        let index = self.pop(block)?;
        let obj = self.pop(block)?;
        let pc = self.pc;
        if let Some(kind) = self.oracle.typed_element(pc) {
            let index = self.int32_operand(block, index);
            let len = self.add(block, InstrKind::TypedLength, IrType::Int32, &[obj]);
            let check = self.add(block, InstrKind::BoundsCheck { minimum: 0, maximum: 0 }, IrType::Int32, &[index, len]);
            let load = self.add(block, InstrKind::LoadTypedElement { kind }, kind.ir_type(), &[obj, check]);
            self.push(block, load);
            return Ok(());
        }
        if let Some(elem_ty) = self.oracle.dense_element(pc) {
            let index = self.int32_operand(block, index);
            let len = self.add(block, InstrKind::InitializedLength, IrType::Int32, &[obj]);
            let check = self.add(block, InstrKind::BoundsCheck { minimum: 0, maximum: 0 }, IrType::Int32, &[index, len]);
            let load = self.add(block, InstrKind::LoadElement, elem_ty, &[obj, check]);
            self.push(block, load);
            return Ok(());
        }
        let ty = self.oracle.result_type(pc);
        let ins = self.add(block, InstrKind::GetElementCache, ty, &[obj, index]);
        self.push(block, ins);
        self.resume_after(block, ins);
        Ok(())
    }

    fn op_setelem(&mut self, block: BlockId) -> Result<(), AbortReason> {
        let value = self.pop(block)?;
        let index = self.pop(block)?;
        let obj = self.pop(block)?;
        let pc = self.pc;
        if let Some(kind) = self.oracle.typed_element(pc) {
            let index = self.int32_operand(block, index);
            let len = self.add(block, InstrKind::TypedLength, IrType::Int32, &[obj]);
            let check = self.add(block, InstrKind::BoundsCheck { minimum: 0, maximum: 0 }, IrType::Int32, &[index, len]);
            let value = if kind == crate::ir::ElementKind::Uint8Clamped {
                self.add(block, InstrKind::ClampToUint8, IrType::Int32, &[value])
            } else {
                value
            };
            let store = self.add(block, InstrKind::StoreTypedElement { kind }, IrType::None, &[obj, check, value]);
            self.push(block, value);
            self.resume_after(block, store);
            return Ok(());
        }
        if self.oracle.dense_element(pc).is_some() {
            let index = self.int32_operand(block, index);
            let len = self.add(block, InstrKind::InitializedLength, IrType::Int32, &[obj]);
            let check = self.add(block, InstrKind::BoundsCheck { minimum: 0, maximum: 0 }, IrType::Int32, &[index, len]);
            let store = self.add(block, InstrKind::StoreElement, IrType::None, &[obj, check, value]);
            self.push(block, value);
            self.resume_after(block, store);
            return Ok(());
        }
        let ins = self.add(block, InstrKind::SetElementCache, IrType::None, &[obj, index, value]);
        self.push(block, value);
        self.resume_after(block, ins);
        Ok(())
    }

    fn op_call(&mut self, block: BlockId, argc: u16) -> Result<(), AbortReason> {
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop(block)?);
        }
        args.reverse();
        let callee = self.pop(block)?;
        let mut operands = vec![callee];
        operands.extend(args);
        let ty = self.oracle.result_type(self.pc);
        let ins = self.add(block, InstrKind::Call { argc }, ty, &operands);
        self.push(block, ins);
        self.resume_after(block, ins);
        Ok(())
    }

    fn op_length(&mut self, block: BlockId) -> Result<(), AbortReason> {
        let obj = self.pop(block)?;
        let kind = match self.graph.instr(obj).ty {
            IrType::Str => InstrKind::StringLength,
            IrType::Object => {
                if self.oracle.typed_element(self.pc).is_some() {
                    InstrKind::TypedLength
                } else {
                    InstrKind::ArrayLength
                }
            }
            _ => return Err(AbortReason::Unsupported("length of unknown receiver")),
        };
        let ins = self.add(block, kind, IrType::Int32, &[obj]);
        self.push(block, ins);
        Ok(())
    }
}

fn slot_index(loc: PropertyLocation) -> Option<u32> {
    match loc {
        PropertyLocation::FixedSlot(i) | PropertyLocation::DynamicSlot(i) => Some(i),
        PropertyLocation::Accessor => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ScriptBuilder, ScriptId, SrcNote};
    use crate::object::MockObjects;
    use crate::oracle::{BinaryTypes, StaticOracle, TypeOracle};

    fn build(script: &Script, oracle: &StaticOracle, osr: Option<Pc>) -> Result<Graph, AbortReason> {
        let snapshot = oracle.snapshot();
        let objects = MockObjects::new();
        let options = CompileOptions::default();
        GraphBuilder::new(script, &snapshot, &objects, &options, osr).build()
    }

    fn loop_header(g: &Graph) -> BlockId {
        g.block_ids().find(|&b| g.block(b).is_loop_header).unwrap()
    }

    fn count_kind(g: &Graph, pred: impl Fn(&InstrKind) -> bool) -> usize {
        g.block_ids()
            .flat_map(|b| g.block(b).instrs.clone())
            .filter(|&v| pred(&g.instr(v).kind))
            .count()
    }

    // i = 0; while (i < limit) { i = i + 1 } return i
    fn counting_while(limit: i32) -> (ScriptBuilder, Pc, Pc) {
        let mut b = ScriptBuilder::new(0, 1);
        b.op(Op::Int32(0));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let opening = b.op(Op::Goto(Pc(0)));
        b.op(Op::LoopHead);
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(1));
        let add_i = b.op(Op::Add);
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let cond = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(limit));
        b.op(Op::Lt);
        let ifne = b.op(Op::IfTrue(opening.next()));
        b.op(Op::GetLocal(0));
        b.op(Op::Return);
        b.patch(opening, Op::Goto(cond));
        b.note(opening, SrcNote::While { ifne });
        (b, cond, add_i)
    }

    // i = 0; do { i = i + 1 } while (i < 10); return i
    #[test]
    fn do_while_tests_on_the_backedge() {
        let mut b = ScriptBuilder::new(0, 1);
        b.op(Op::Int32(0));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let open = b.op(Op::Nop);
        b.op(Op::LoopHead);
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(1));
        let add_i = b.op(Op::Add);
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let cond = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(10));
        b.op(Op::Lt);
        let ifne = b.op(Op::IfTrue(open.next()));
        b.op(Op::GetLocal(0));
        b.op(Op::Return);
        b.note(open, SrcNote::DoWhile { cond, ifne });

        let oracle = StaticOracle::new();
        oracle.set_binary_types(add_i, BinaryTypes::int32());
        let g = build(&b.finish(ScriptId(0)), &oracle, None).unwrap();

        let header = loop_header(&g);
        assert_eq!(g.block(header).phis.len(), 1);
        // The condition runs at the bottom, so the backedge block carries
        // the loop test.
        let backedge = g.block(header).backedge.unwrap();
        assert!(matches!(
            g.block(backedge).terminator,
            Terminator::Test { if_true, .. } if if_true == header
        ));
    }

    // for (i = 0; i < 10; i = i + 1) { i }
    #[test]
    fn for_loop_splits_cond_body_and_update() {
        let mut b = ScriptBuilder::new(0, 1);
        b.op(Op::Int32(0));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let open = b.op(Op::Nop);
        let goto_cond = b.op(Op::Goto(Pc(0)));
        let loop_head = b.op(Op::LoopHead);
        b.op(Op::GetLocal(0));
        b.op(Op::Pop);
        let update = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(1));
        let add_i = b.op(Op::Add);
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let cond = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(10));
        b.op(Op::Lt);
        let ifne = b.op(Op::IfTrue(loop_head));
        b.op(Op::GetLocal(0));
        b.op(Op::Return);
        b.patch(goto_cond, Op::Goto(cond));
        b.note(open, SrcNote::For { cond, update, ifne });

        let oracle = StaticOracle::new();
        oracle.set_binary_types(add_i, BinaryTypes::int32());
        let g = build(&b.finish(ScriptId(1)), &oracle, None).unwrap();

        // The condition is translated into the header and the update
        // clause closes the backedge.
        let header = loop_header(&g);
        assert_eq!(g.block(header).phis.len(), 1);
        assert!(matches!(g.block(header).terminator, Terminator::Test { .. }));
        let backedge = g.block(header).backedge.unwrap();
        assert!(g
            .block(backedge)
            .instrs
            .iter()
            .any(|&v| matches!(g.instr(v).kind, InstrKind::Add)));
    }

    // while (i < 10) { if (i == 7) break; if (i == 3) continue; i = i + 1 }
    #[test]
    fn break_and_continue_edges_rejoin_the_loop() {
        let mut b = ScriptBuilder::new(0, 1);
        b.op(Op::Int32(0));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let opening = b.op(Op::Goto(Pc(0)));
        b.op(Op::LoopHead);
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(7));
        b.op(Op::Eq);
        let br_test = b.op(Op::IfFalse(Pc(0)));
        let br = b.op(Op::Goto(Pc(0)));
        let no_break = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(3));
        b.op(Op::Eq);
        let cont_test = b.op(Op::IfFalse(Pc(0)));
        let cont = b.op(Op::Goto(Pc(0)));
        let no_cont = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(1));
        let add_i = b.op(Op::Add);
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let cond = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Int32(10));
        b.op(Op::Lt);
        let ifne = b.op(Op::IfTrue(opening.next()));
        let exit = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Return);
        b.patch(opening, Op::Goto(cond));
        b.patch(br_test, Op::IfFalse(no_break));
        b.patch(br, Op::Goto(exit));
        b.patch(cont_test, Op::IfFalse(no_cont));
        b.patch(cont, Op::Goto(cond));
        b.note(opening, SrcNote::While { ifne });
        b.note(br_test, SrcNote::If);
        b.note(br, SrcNote::Break);
        b.note(cont_test, SrcNote::If);
        b.note(cont, SrcNote::Continue);

        let oracle = StaticOracle::new();
        oracle.set_binary_types(add_i, BinaryTypes::int32());
        let g = build(&b.finish(ScriptId(2)), &oracle, None).unwrap();

        // The continue edge and the fallthrough merge right before the
        // backedge closes.
        let header = loop_header(&g);
        let backedge = g.block(header).backedge.unwrap();
        assert_eq!(g.block(backedge).preds.len(), 2);
        // The break edge and the test exit merge in front of the return.
        let ret = g
            .block_ids()
            .find(|&blk| matches!(g.block(blk).terminator, Terminator::Return { .. }))
            .unwrap();
        assert_eq!(g.block(ret).preds.len(), 2);
    }

    // label: { if (arg0 < 5) break label; local0 = arg0 } return local0
    #[test]
    fn labeled_break_joins_at_the_label_end() {
        let mut b = ScriptBuilder::new(1, 1);
        let label = b.op(Op::Label(Pc(0)));
        b.op(Op::GetArg(0));
        b.op(Op::Int32(5));
        b.op(Op::Lt);
        let branch = b.op(Op::IfFalse(Pc(0)));
        let br = b.op(Op::Goto(Pc(0)));
        let skip = b.here();
        b.op(Op::GetArg(0));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let end = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Return);
        b.patch(label, Op::Label(end));
        b.patch(branch, Op::IfFalse(skip));
        b.patch(br, Op::Goto(end));
        b.note(branch, SrcNote::If);
        b.note(br, SrcNote::BreakLabel);

        let oracle = StaticOracle::new();
        oracle.set_arg_types(vec![IrType::Int32]);
        let g = build(&b.finish(ScriptId(3)), &oracle, None).unwrap();

        // The local differs between the break path and the fallthrough, so
        // the join needs a phi.
        let ret = g
            .block_ids()
            .find(|&blk| matches!(g.block(blk).terminator, Terminator::Return { .. }))
            .unwrap();
        assert_eq!(g.block(ret).preds.len(), 2);
        assert_eq!(g.block(ret).phis.len(), 1);
    }

    // switch (arg0) { case 2: local0 = 10; break; default: local0 = 20 }
    #[test]
    fn cond_switch_compares_and_merges_at_the_exit() {
        let mut b = ScriptBuilder::new(1, 1);
        b.op(Op::GetArg(0));
        let switch = b.op(Op::CondSwitch);
        b.op(Op::Int32(2));
        let case = b.op(Op::Case(Pc(0)));
        let default = b.op(Op::Default(Pc(0)));
        let body = b.here();
        b.op(Op::Int32(10));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let br = b.op(Op::Goto(Pc(0)));
        let default_body = b.here();
        b.op(Op::Int32(20));
        b.op(Op::SetLocal(0));
        b.op(Op::Pop);
        let exit = b.here();
        b.op(Op::GetLocal(0));
        b.op(Op::Return);
        b.patch(case, Op::Case(body));
        b.patch(default, Op::Default(default_body));
        b.patch(br, Op::Goto(exit));
        b.note(switch, SrcNote::CondSwitchNote { exit, first_case: case });
        b.note(case, SrcNote::NextCase { next: default });
        b.note(br, SrcNote::SwitchBreak);

        let oracle = StaticOracle::new();
        let g = build(&b.finish(ScriptId(4)), &oracle, None).unwrap();

        assert_eq!(
            count_kind(&g, |k| matches!(
                k,
                InstrKind::Compare { op: CompareOp::StrictEq }
            )),
            1
        );
        let ret = g
            .block_ids()
            .find(|&blk| matches!(g.block(blk).terminator, Terminator::Return { .. }))
            .unwrap();
        assert_eq!(g.block(ret).preds.len(), 2);
        assert_eq!(g.block(ret).phis.len(), 1);
    }

    #[test]
    fn osr_entry_reads_and_unboxes_the_cold_frame() {
        let (b, cond, add_i) = counting_while(10);
        let oracle = StaticOracle::new();
        oracle.set_binary_types(add_i, BinaryTypes::int32());
        oracle.set_osr_slot_types(cond, vec![Some(IrType::Int32)]);
        let g = build(&b.finish(ScriptId(5)), &oracle, Some(cond)).unwrap();

        let osr = g.osr_entry.unwrap();
        assert!(g.block(osr).osr_like);
        let kinds: Vec<_> =
            g.block(osr).instrs.iter().map(|&v| g.instr(v).kind.clone()).collect();
        assert!(kinds.iter().any(|k| matches!(k, InstrKind::OsrEntry)));
        assert_eq!(kinds.iter().filter(|k| matches!(k, InstrKind::OsrValue { .. })).count(), 1);
        assert_eq!(kinds.iter().filter(|k| matches!(k, InstrKind::Unbox { .. })).count(), 1);
        // The normal path and the frame entry merge ahead of the header.
        let merge = g.block_ids().find(|&blk| g.block(blk).preds.contains(&osr)).unwrap();
        assert_eq!(g.block(merge).preds.len(), 2);
    }

    #[test]
    fn osr_outside_a_loop_aborts() {
        let (b, _, add_i) = counting_while(10);
        let oracle = StaticOracle::new();
        oracle.set_binary_types(add_i, BinaryTypes::int32());
        let err = build(&b.finish(ScriptId(6)), &oracle, Some(Pc(0))).unwrap_err();
        assert!(matches!(err, AbortReason::Unsupported(_)));
    }
}
