//! Flow-sensitive range propagation.
//!
//! The pass runs in three phases over a graph with dominators built:
//! beta nodes pin branch facts onto values at block entries, one pass in
//! reverse postorder computes a [`Range`] per definition and analyzes
//! loops (iteration bounds, symbolic phi bounds, bounds-check hoisting),
//! and finally the betas are unwound so later passes see the plain values.

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::ir::{
    BlockId, CompareOp, ConstValue, ElementKind, Graph, InstrKind, IrType, Terminator, ValueId,
};

use super::{LinearSum, Range, SimpleLinearSum};

/// Upper bound on the number of backedges a loop can take, expressed as a
/// linear sum over loop-invariant values.
#[derive(Debug, Clone)]
pub struct LoopIterationBound {
    pub header: BlockId,
    /// Block whose exit test established the bound.
    pub test_block: BlockId,
    pub sum: LinearSum,
}

/// A symbolic bound on a loop phi. When `test_block` is set the bound only
/// holds below that test, because it depends on the loop's exit condition.
#[derive(Debug, Clone)]
pub struct SymbolicBound {
    pub test_block: Option<BlockId>,
    pub sum: LinearSum,
}

/// Annotate every definition in `graph` with a range. Requires dominators.
pub fn analyze_ranges(graph: &mut Graph) {
    let mut pass = RangeAnalysis::new(graph);
    pass.add_beta_nodes();
    pass.analyze();
    pass.remove_beta_nodes();
    pass.graph.assert_coherent();
}

struct RangeAnalysis<'g> {
    graph: &'g mut Graph,
    symbolic_lower: FxHashMap<ValueId, SymbolicBound>,
    symbolic_upper: FxHashMap<ValueId, SymbolicBound>,
}

impl<'g> RangeAnalysis<'g> {
    fn new(graph: &'g mut Graph) -> RangeAnalysis<'g> {
        RangeAnalysis {
            graph,
            symbolic_lower: FxHashMap::default(),
            symbolic_upper: FxHashMap::default(),
        }
    }

    // ---- beta nodes ----

    /// Insert a beta node at the entry of every block that is the target of
    /// a conditional branch on a comparison, pinning the fact the branch
    /// proves onto the compared value.
    fn add_beta_nodes(&mut self) {
        for i in 0..self.graph.num_blocks() {
            let block = BlockId(i as u32);
            if self.graph.block(block).preds.len() != 1 {
                continue;
            }
            let parent = self.graph.block(block).preds[0];
            let (cond, if_true, if_false) = match self.graph.block(parent).terminator {
                Terminator::Test { cond, if_true, if_false } => (cond, if_true, if_false),
                _ => continue,
            };
            if if_true == if_false {
                continue;
            }
            let op = match self.graph.instr(cond).kind {
                InstrKind::Compare { op } => op,
                _ => continue,
            };
            let op = if if_false == block { op.negate() } else { op };
            let lhs = self.graph.instr(cond).operands[0];
            let rhs = self.graph.instr(cond).operands[1];

            let (val, bound, op) = match (
                self.graph.instr(lhs).as_int32_constant(),
                self.graph.instr(rhs).as_int32_constant(),
            ) {
                (Some(bound), None) => (rhs, bound, op.reverse()),
                (None, Some(bound)) => (lhs, bound, op),
                _ => {
                    // No constant side. A strict ordering still excludes one
                    // extreme from each operand.
                    let (smaller, greater) = match op {
                        CompareOp::Lt => (lhs, rhs),
                        CompareOp::Gt => (rhs, lhs),
                        _ => continue,
                    };
                    let mut below_max = Range::infinite();
                    below_max.set_upper(i32::MAX as i64 - 1);
                    self.insert_beta(block, smaller, below_max);
                    let mut above_min = Range::infinite();
                    above_min.set_lower(i32::MIN as i64 + 1);
                    self.insert_beta(block, greater, above_min);
                    continue;
                }
            };

            let mut comp = Range::infinite();
            match op {
                CompareOp::Le => comp.set_upper(bound as i64),
                CompareOp::Lt => comp.set_upper(bound as i64 - 1),
                CompareOp::Ge => comp.set_lower(bound as i64),
                CompareOp::Gt => comp.set_lower(bound as i64 + 1),
                CompareOp::Eq | CompareOp::StrictEq => {
                    comp.set_lower(bound as i64);
                    comp.set_upper(bound as i64);
                }
                _ => continue,
            }
            self.insert_beta(block, val, comp);
        }
    }

    fn insert_beta(&mut self, block: BlockId, val: ValueId, range: Range) {
        let ty = self.graph.instr(val).ty;
        let beta = self.graph.insert_instr(block, 0, InstrKind::Beta { range }, ty, &[val]);
        trace!(%beta, %val, %block, %range, "beta");
        self.graph.replace_dominated_uses(val, beta, block);
    }

    fn remove_beta_nodes(&mut self) {
        for i in 0..self.graph.num_blocks() {
            let block = BlockId(i as u32);
            let betas: Vec<ValueId> = self
                .graph
                .block(block)
                .instrs
                .iter()
                .copied()
                .filter(|&v| matches!(self.graph.instr(v).kind, InstrKind::Beta { .. }))
                .collect();
            for beta in betas {
                let val = self.graph.instr(beta).operands[0];
                self.graph.replace_all_uses(beta, val);
                self.graph.discard(beta);
            }
        }
    }

    // ---- range propagation ----

    fn analyze(&mut self) {
        let rpo = self.graph.rpo();
        for &block in &rpo {
            let phis = self.graph.block(block).phis.clone();
            for phi in phis {
                let range = self.compute_phi_range(phi);
                self.graph.instr_mut(phi).range = range;
            }
            let instrs = self.graph.block(block).instrs.clone();
            for value in instrs {
                self.refine_negative_zero(value);
                let range = self.compute_range(value);
                if let Some(r) = range {
                    trace!(%value, range = %r, "range");
                }
                self.graph.instr_mut(value).range = range;
            }
            if self.graph.block(block).is_loop_header {
                self.analyze_loop(block);
            }
        }
    }

    /// The stored range of `v`, or the widest range its static type allows.
    fn value_range(&self, v: ValueId) -> Range {
        let ins = self.graph.instr(v);
        match ins.range {
            Some(r) => r,
            None => match ins.ty {
                IrType::Int32 => Range::new_int32(),
                IrType::Boolean => Range::new(0, 1),
                _ => Range::infinite(),
            },
        }
    }

    /// Union over the operands. Paths the analysis proved impossible and
    /// the OSR entry path carry no profile and are skipped; any remaining
    /// operand without a range leaves the phi unknown.
    fn compute_phi_range(&self, phi: ValueId) -> Option<Range> {
        let ins = self.graph.instr(phi);
        if ins.ty != IrType::Int32 && ins.ty != IrType::Double {
            return None;
        }
        let mut range: Option<Range> = None;
        for &op in &ins.operands {
            let def = self.graph.instr(op);
            let def_block = self.graph.block(def.block);
            if def_block.early_abort || def_block.osr_like {
                continue;
            }
            let input = def.range?;
            match &mut range {
                None => range = Some(input),
                Some(r) => r.union_with(&input),
            }
        }
        range
    }

    fn compute_range(&mut self, value: ValueId) -> Option<Range> {
        let ins = self.graph.instr(value);
        let kind = ins.kind.clone();
        let ty = ins.ty;
        let block = ins.block;
        let ops = ins.operands.clone();
        let numeric = ty == IrType::Int32 || ty == IrType::Double;

        match kind {
            InstrKind::Constant { value: ConstValue::Int32(n) } => Some(Range::singleton(n)),
            InstrKind::Constant { value: ConstValue::Double(d) } => {
                if d.is_finite() && d.abs() <= i32::MAX as f64 {
                    Some(Range::new(d.floor() as i64, d.ceil() as i64).with_decimal(d.fract() != 0.0))
                } else {
                    None
                }
            }
            InstrKind::Beta { range } => {
                let (r, emptied) = self.value_range(ops[0]).intersect(&range);
                if emptied {
                    debug!(%block, "branch condition contradicts known range");
                    self.graph.block_mut(block).early_abort = true;
                }
                Some(r)
            }
            InstrKind::Add if numeric => {
                Some(Range::add(&self.value_range(ops[0]), &self.value_range(ops[1])))
            }
            InstrKind::Sub if numeric => {
                Some(Range::sub(&self.value_range(ops[0]), &self.value_range(ops[1])))
            }
            InstrKind::Mul { .. } if numeric => {
                Some(Range::mul(&self.value_range(ops[0]), &self.value_range(ops[1])))
            }
            InstrKind::Mod if numeric => {
                let rhs = self.graph.instr(ops[1]).range?;
                if !rhs.is_int32() {
                    return None;
                }
                let magnitude = (rhs.lower() as i64).abs().max((rhs.upper() as i64).abs());
                if magnitude == 0 {
                    return None;
                }
                let decimal =
                    self.value_range(ops[0]).is_decimal() || rhs.is_decimal();
                Some(Range::new(-(magnitude - 1), magnitude - 1).with_decimal(decimal))
            }
            InstrKind::Neg if numeric => {
                Some(Range::sub(&Range::singleton(0), &self.value_range(ops[0])))
            }
            InstrKind::Abs if numeric => {
                let r = self.value_range(ops[0]);
                if !r.is_int32() {
                    return None;
                }
                let hi = (r.lower() as i64).abs().max((r.upper() as i64).abs());
                Some(Range::new(0, hi).with_decimal(r.is_decimal()))
            }
            InstrKind::BitAnd => {
                Some(Range::and(&self.value_range(ops[0]), &self.value_range(ops[1])))
            }
            InstrKind::BitNot => {
                Some(Range::sub(&Range::singleton(-1), &self.value_range(ops[0])))
            }
            InstrKind::Lsh => {
                let shift = self.graph.instr(ops[1]).as_int32_constant()?;
                Some(Range::shl(&self.value_range(ops[0]), shift))
            }
            InstrKind::Rsh => {
                let shift = self.graph.instr(ops[1]).as_int32_constant()?;
                Some(Range::shr(&self.value_range(ops[0]), shift))
            }
            InstrKind::ToDouble => self.graph.instr(ops[0]).range,
            InstrKind::ToInt32 | InstrKind::TruncateToInt32 => {
                let (r, _) = self.value_range(ops[0]).intersect(&Range::new_int32());
                Some(r)
            }
            InstrKind::ClampToUint8 => Some(Range::new(0, 255)),
            InstrKind::CharCodeAt => Some(Range::new(0, 0xffff)),
            InstrKind::LoadTypedElement { kind } => match kind {
                ElementKind::Int8 => Some(Range::new(-128, 127)),
                ElementKind::Uint8 | ElementKind::Uint8Clamped => Some(Range::new(0, 255)),
                ElementKind::Int16 => Some(Range::new(-32768, 32767)),
                ElementKind::Uint16 => Some(Range::new(0, 0xffff)),
                ElementKind::Int32 => Some(Range::new_int32()),
                ElementKind::Uint32 | ElementKind::Float64 => None,
            },
            InstrKind::ArrayLength
            | InstrKind::InitializedLength
            | InstrKind::TypedLength
            | InstrKind::StringLength => Some(Range::new(0, i32::MAX as i64)),
            // A bounds check evaluates to its index.
            InstrKind::BoundsCheck { .. } => self.graph.instr(ops[0]).range,
            _ => None,
        }
    }

    /// Clear a multiplication's negative-zero flag once the operand ranges
    /// rule a `-0` result out.
    fn refine_negative_zero(&mut self, value: ValueId) {
        let ins = self.graph.instr(value);
        let (lhs, rhs) = match ins.kind {
            InstrKind::Mul { can_be_negative_zero: true } => (ins.operands[0], ins.operands[1]),
            _ => return,
        };
        let l = self.value_range(lhs);
        let r = self.value_range(rhs);
        let possible = (l.can_be_zero() && r.can_be_negative())
            || (r.can_be_zero() && l.can_be_negative());
        if !possible {
            self.graph.instr_mut(value).kind = InstrKind::Mul { can_be_negative_zero: false };
        }
    }

    // ---- loop analysis ----

    fn analyze_loop(&mut self, header: BlockId) {
        let backedge = match self.graph.block(header).backedge {
            Some(b) if b != header => b,
            _ => return,
        };
        self.mark_loop(header, backedge);

        // Look for a test on the dominator chain from the backedge whose
        // other successor leaves the loop; its condition bounds the trip
        // count.
        let mut bound = None;
        let mut block = backedge;
        while block != header {
            let idom = match self.graph.idom(block) {
                Some(d) => d,
                None => break,
            };
            if let Terminator::Test { cond, if_true, if_false } = self.graph.block(idom).terminator
            {
                if if_true == block || if_false == block {
                    let other = if if_true == block { if_false } else { if_true };
                    if !self.graph.block(other).mark {
                        let exit_on_false = if_true == block;
                        bound = self.analyze_loop_iteration_count(header, idom, cond, exit_on_false);
                        if bound.is_some() {
                            break;
                        }
                    }
                }
            }
            block = idom;
        }

        if let Some(bound) = bound {
            debug!(%header, bound = %bound.sum, "loop iteration bound");
            let phis = self.graph.block(header).phis.clone();
            for phi in phis {
                self.analyze_loop_phi(header, &bound, phi);
            }
            let mut hoisted = Vec::new();
            for i in 0..self.graph.num_blocks() {
                let b = BlockId(i as u32);
                if !self.graph.block(b).mark {
                    continue;
                }
                let instrs = self.graph.block(b).instrs.clone();
                for v in instrs {
                    if matches!(self.graph.instr(v).kind, InstrKind::BoundsCheck { .. })
                        && self.try_hoist_bounds_check(header, v)
                    {
                        hoisted.push(v);
                    }
                }
            }
            for check in hoisted {
                debug!(%check, %header, "hoisted bounds check out of loop");
                let index = self.graph.instr(check).operands[0];
                self.graph.replace_all_uses(check, index);
                self.graph.discard(check);
            }
        }
        self.unmark_all();
    }

    /// Mark the natural loop of `header`/`backedge` by walking predecessor
    /// edges backward from the backedge.
    fn mark_loop(&mut self, header: BlockId, backedge: BlockId) {
        self.graph.block_mut(header).mark = true;
        self.graph.block_mut(backedge).mark = true;
        let mut worklist = vec![backedge];
        while let Some(b) = worklist.pop() {
            let preds = self.graph.block(b).preds.clone();
            for p in preds {
                if !self.graph.block(p).mark {
                    self.graph.block_mut(p).mark = true;
                    worklist.push(p);
                }
            }
        }
    }

    fn unmark_all(&mut self) {
        for i in 0..self.graph.num_blocks() {
            self.graph.block_mut(BlockId(i as u32)).mark = false;
        }
    }

    fn analyze_loop_iteration_count(
        &self,
        header: BlockId,
        test_block: BlockId,
        cond: ValueId,
        exit_on_false: bool,
    ) -> Option<LoopIterationBound> {
        let (lhs, rhs, less_equal) = self.extract_linear_inequality(cond, exit_on_false)?;

        // The bound must be expressed over loop-invariant values.
        if let Some(r) = rhs {
            if self.graph.block(self.graph.instr(r).block).mark {
                return None;
            }
        }

        // The varying side must be a loop phi advancing by a constant step.
        let phi = lhs.term?;
        let phi_ins = self.graph.instr(phi);
        if !phi_ins.is_phi() || phi_ins.block != header || phi_ins.operands.len() != 2 {
            return None;
        }
        let initial = phi_ins.operands[0];
        let modified = extract_linear_sum(self.graph, phi_ins.operands[1]);
        if modified.term != Some(phi) {
            return None;
        }

        let mut sum = LinearSum::new();
        if modified.constant == 1 && !less_equal {
            // The phi is initial + k after k backedges, and the loop ends
            // once phi + c >= rhs. Backedges taken <= rhs - initial - c.
            if let Some(r) = rhs {
                if !self.sum_add_value(&mut sum, r, 1) {
                    return None;
                }
            }
            if !self.sum_add_value(&mut sum, initial, -1) {
                return None;
            }
            if !sum.add_constant(0i32.checked_sub(lhs.constant)?) {
                return None;
            }
        } else if modified.constant == -1 && less_equal {
            // Decreasing phi; ends once phi + c <= rhs - 1. Backedges
            // taken <= initial - rhs + c + 1.
            if !self.sum_add_value(&mut sum, initial, 1) {
                return None;
            }
            if let Some(r) = rhs {
                if !self.sum_add_value(&mut sum, r, -1) {
                    return None;
                }
            }
            if !sum.add_constant(lhs.constant) {
                return None;
            }
            if !sum.add_constant(1) {
                return None;
            }
        } else {
            return None;
        }
        Some(LoopIterationBound { header, test_block, sum })
    }

    /// Normalize the comparison a loop exits on into
    /// `lhs.term + lhs.constant (<=|>=) rhs`.
    fn extract_linear_inequality(
        &self,
        cond: ValueId,
        exit_on_false: bool,
    ) -> Option<(SimpleLinearSum, Option<ValueId>, bool)> {
        let ins = self.graph.instr(cond);
        let op = match ins.kind {
            InstrKind::Compare { op } => op,
            _ => return None,
        };
        let lhs = ins.operands[0];
        let rhs = ins.operands[1];
        if self.graph.instr(lhs).ty != IrType::Int32 || self.graph.instr(rhs).ty != IrType::Int32 {
            return None;
        }
        let op = if exit_on_false { op.negate() } else { op };
        let lsum = extract_linear_sum(self.graph, lhs);
        let rsum = extract_linear_sum(self.graph, rhs);
        let mut constant = lsum.constant.checked_sub(rsum.constant)?;
        let less_equal = match op {
            CompareOp::Le => true,
            CompareOp::Lt => {
                constant = constant.checked_add(1)?;
                true
            }
            CompareOp::Ge => false,
            CompareOp::Gt => {
                constant = constant.checked_sub(1)?;
                false
            }
            _ => return None,
        };
        Some((SimpleLinearSum::new(lsum.term, constant), rsum.term, less_equal))
    }

    /// Derive numeric and symbolic bounds for a loop phi that steps by a
    /// constant each iteration.
    fn analyze_loop_phi(&mut self, header: BlockId, bound: &LoopIterationBound, phi: ValueId) {
        let ins = self.graph.instr(phi);
        if ins.operands.len() != 2 {
            return;
        }
        let initial = ins.operands[0];
        let modified = extract_linear_sum(self.graph, ins.operands[1]);
        if modified.term != Some(phi) || modified.constant == 0 {
            return;
        }

        let mut initial_sum = LinearSum::new();
        if !self.sum_add_value(&mut initial_sum, initial, 1) {
            return;
        }
        let mut limit_sum = LinearSum::new();
        if !limit_sum.add_scaled(&bound.sum, modified.constant) {
            return;
        }
        if !self.sum_add_value(&mut limit_sum, initial, 1) {
            return;
        }

        let initial_range = self.graph.instr(initial).range;
        let mut range = Range::infinite();
        if modified.constant > 0 {
            // Nondecreasing: the initial value is a hard lower bound, the
            // exit condition a symbolic upper one.
            if let Some(init) = initial_range {
                if !init.lower_infinite() {
                    range.set_lower(init.lower() as i64);
                }
                range = range.with_decimal(init.is_decimal());
            }
            self.symbolic_lower
                .insert(phi, SymbolicBound { test_block: None, sum: initial_sum });
            self.symbolic_upper
                .insert(phi, SymbolicBound { test_block: Some(bound.test_block), sum: limit_sum });
        } else {
            if let Some(init) = initial_range {
                if !init.upper_infinite() {
                    range.set_upper(init.upper() as i64);
                }
                range = range.with_decimal(init.is_decimal());
            }
            self.symbolic_upper
                .insert(phi, SymbolicBound { test_block: None, sum: initial_sum });
            self.symbolic_lower
                .insert(phi, SymbolicBound { test_block: Some(bound.test_block), sum: limit_sum });
        }
        debug_assert_eq!(self.graph.instr(phi).block, header);
        self.graph.instr_mut(phi).range = Some(range);
    }

    /// Replace a per-iteration bounds check on a linear function of a loop
    /// phi with two loop-invariant checks in the preheader. Returns true
    /// when the caller may drop the original check.
    fn try_hoist_bounds_check(&mut self, header: BlockId, check: ValueId) -> bool {
        let index_op = self.graph.instr(check).operands[0];
        let length = skip_betas(self.graph, self.graph.instr(check).operands[1]);
        if self.graph.block(self.graph.instr(length).block).mark {
            return false;
        }

        let index = extract_linear_sum(self.graph, index_op);
        let term = match index.term {
            Some(t) => t,
            None => return false,
        };
        let term_ins = self.graph.instr(term);
        if !term_ins.is_phi() || term_ins.block != header {
            return false;
        }
        let lower = match self.symbolic_lower.get(&term) {
            Some(b) => b.clone(),
            None => return false,
        };
        let upper = match self.symbolic_upper.get(&term) {
            Some(b) => b.clone(),
            None => return false,
        };
        if !self.symbolic_bound_is_valid(header, check, &lower)
            || !self.symbolic_bound_is_valid(header, check, &upper)
        {
            return false;
        }
        let preheader = self.graph.block(header).preds[0];
        if self.graph.block(preheader).mark {
            return false;
        }

        // index + index.constant >= 0 given index >= lower.sum, so check
        // lower.sum's terms >= -index.constant - lower.sum.constant.
        let lower_constant = match 0i32
            .checked_sub(index.constant)
            .and_then(|c| c.checked_sub(lower.sum.constant()))
        {
            Some(c) => c,
            None => return false,
        };
        // index + index.constant < length given index <= upper.sum, so
        // check upper.sum's terms + (upper.sum.constant + index.constant)
        // < length.
        let upper_constant = match index.constant.checked_add(upper.sum.constant()) {
            Some(c) => c,
            None => return false,
        };

        let lower_term = self.convert_linear_sum(preheader, &lower.sum);
        let upper_term = self.convert_linear_sum(preheader, &upper.sum);
        self.graph.add_instr(
            preheader,
            InstrKind::BoundsCheckLower { minimum: lower_constant },
            IrType::Int32,
            &[lower_term],
        );
        self.graph.add_instr(
            preheader,
            InstrKind::BoundsCheck { minimum: upper_constant, maximum: upper_constant },
            IrType::Int32,
            &[upper_term, length],
        );
        true
    }

    /// A bound tied to the loop's exit test only holds for code dominated
    /// by that test.
    fn symbolic_bound_is_valid(&self, header: BlockId, check: ValueId, bound: &SymbolicBound) -> bool {
        let test_block = match bound.test_block {
            Some(b) => b,
            None => return true,
        };
        let mut block = self.graph.instr(check).block;
        if block == header {
            return false;
        }
        loop {
            block = match self.graph.idom(block) {
                Some(d) => d,
                None => return false,
            };
            if block == test_block {
                return true;
            }
            if block == header {
                return false;
            }
        }
    }

    /// Materialize the terms of `sum` as instructions at the end of
    /// `block`. The constant part is carried by the check that consumes
    /// the result, not materialized here.
    fn convert_linear_sum(&mut self, block: BlockId, sum: &LinearSum) -> ValueId {
        let mut def: Option<ValueId> = None;
        for t in sum.terms() {
            match t.scale {
                1 => {
                    def = Some(match def {
                        Some(d) => {
                            self.graph.add_instr(block, InstrKind::Add, IrType::Int32, &[d, t.term])
                        }
                        None => t.term,
                    });
                }
                -1 => {
                    let lhs = match def {
                        Some(d) => d,
                        None => self.int32_constant(block, 0),
                    };
                    def = Some(self.graph.add_instr(
                        block,
                        InstrKind::Sub,
                        IrType::Int32,
                        &[lhs, t.term],
                    ));
                }
                scale => {
                    let factor = self.int32_constant(block, scale);
                    let mul = self.graph.add_instr(
                        block,
                        InstrKind::Mul { can_be_negative_zero: false },
                        IrType::Int32,
                        &[t.term, factor],
                    );
                    def = Some(match def {
                        Some(d) => {
                            self.graph.add_instr(block, InstrKind::Add, IrType::Int32, &[d, mul])
                        }
                        None => mul,
                    });
                }
            }
        }
        match def {
            Some(d) => d,
            None => self.int32_constant(block, 0),
        }
    }

    fn int32_constant(&mut self, block: BlockId, n: i32) -> ValueId {
        self.graph.add_instr(
            block,
            InstrKind::Constant { value: ConstValue::Int32(n) },
            IrType::Int32,
            &[],
        )
    }

    /// Fold a constant definition into the sum's constant part, so the sum
    /// never carries constant terms.
    fn sum_add_value(&self, sum: &mut LinearSum, value: ValueId, scale: i32) -> bool {
        match self.graph.instr(value).as_int32_constant() {
            Some(n) => match n.checked_mul(scale) {
                Some(c) => sum.add_constant(c),
                None => false,
            },
            None => sum.add_term(value, scale),
        }
    }
}

/// Resolve through beta refinements to the underlying definition.
fn skip_betas(graph: &Graph, mut v: ValueId) -> ValueId {
    while let InstrKind::Beta { .. } = graph.instr(v).kind {
        v = graph.instr(v).operands[0];
    }
    v
}

/// Peel constant additions off a definition: `x + 3 - 1` becomes
/// `(x, 2)`. A definition that fits no linear shape is its own term.
pub(crate) fn extract_linear_sum(graph: &Graph, v: ValueId) -> SimpleLinearSum {
    let v = skip_betas(graph, v);
    let ins = graph.instr(v);
    if ins.ty != IrType::Int32 {
        return SimpleLinearSum::new(Some(v), 0);
    }
    if let Some(n) = ins.as_int32_constant() {
        return SimpleLinearSum::new(None, n);
    }
    match ins.kind {
        InstrKind::Add | InstrKind::Sub => {
            let lhs = ins.operands[0];
            let rhs = ins.operands[1];
            if graph.instr(lhs).ty != IrType::Int32 || graph.instr(rhs).ty != IrType::Int32 {
                return SimpleLinearSum::new(Some(v), 0);
            }
            let lsum = extract_linear_sum(graph, lhs);
            let rsum = extract_linear_sum(graph, rhs);
            // At most one variable side can be folded.
            if lsum.term.is_some() && rsum.term.is_some() {
                return SimpleLinearSum::new(Some(v), 0);
            }
            match ins.kind {
                InstrKind::Add => match lsum.constant.checked_add(rsum.constant) {
                    Some(c) => SimpleLinearSum::new(lsum.term.or(rsum.term), c),
                    None => SimpleLinearSum::new(Some(v), 0),
                },
                _ => {
                    // Only `term - constant` keeps a linear shape; a negated
                    // term does not fit.
                    if rsum.term.is_some() {
                        return SimpleLinearSum::new(Some(v), 0);
                    }
                    match lsum.constant.checked_sub(rsum.constant) {
                        Some(c) => SimpleLinearSum::new(lsum.term, c),
                        None => SimpleLinearSum::new(Some(v), 0),
                    }
                }
            }
        }
        _ => SimpleLinearSum::new(Some(v), 0),
    }
}
