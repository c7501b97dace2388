//! Range-based truncation.
//!
//! Arithmetic whose every use only observes the low 32 bits may wrap
//! around instead of overflowing into a double. The pass walks each block
//! backward so a consumer is marked truncated before its producers are
//! considered, then fixes the graph up: truncations of now-int32 outputs
//! are removed, non-int32 inputs of truncated instructions get an explicit
//! [`InstrKind::TruncateToInt32`], and no-op bitops like `x | 0` fold away.

use tracing::trace;

use crate::ir::{ConstValue, Graph, InstrKind, IrType, UseSite, ValueId};

use super::Range;

pub fn truncate_graph(graph: &mut Graph) {
    let mut worklist: Vec<ValueId> = Vec::new();
    let mut bitops: Vec<ValueId> = Vec::new();

    for block in graph.postorder() {
        let instrs = graph.block(block).instrs.clone();
        for &value in instrs.iter().rev() {
            match graph.instr(value).kind {
                InstrKind::BitAnd
                | InstrKind::BitOr
                | InstrKind::BitXor
                | InstrKind::Lsh
                | InstrKind::Rsh
                | InstrKind::Ursh => bitops.push(value),
                _ => {}
            }
            if !is_candidate(graph, value) || !all_uses_truncate(graph, value) {
                continue;
            }
            if truncate_def(graph, value) && !graph.instr(value).in_worklist {
                graph.instr_mut(value).in_worklist = true;
                worklist.push(value);
            }
        }
    }

    while let Some(value) = worklist.pop() {
        graph.instr_mut(value).in_worklist = false;
        remove_truncates_on_output(graph, value);
        adjust_truncated_inputs(graph, value);
    }

    for bitop in bitops {
        if let Some(folded) = fold_bitop(graph, bitop) {
            trace!(%bitop, %folded, "folding no-op bitop");
            graph.replace_all_uses(bitop, folded);
            graph.discard(bitop);
        }
    }

    graph.assert_coherent();
}

fn is_candidate(graph: &Graph, value: ValueId) -> bool {
    let ins = graph.instr(value);
    let numeric = ins.ty == IrType::Int32 || ins.ty == IrType::Double;
    match ins.kind {
        InstrKind::Add
        | InstrKind::Sub
        | InstrKind::Mul { .. }
        | InstrKind::Div { .. }
        | InstrKind::Mod => numeric,
        InstrKind::ToDouble => true,
        InstrKind::Constant { value: ConstValue::Double(_) } => true,
        _ => false,
    }
}

/// Every use either truncates the operand itself or is a resume-point
/// capture that will never observe the difference. A resume capture only
/// observes wraparound if an optimization already removed a real use and
/// the value is not naturally int32.
fn all_uses_truncate(graph: &Graph, value: ValueId) -> bool {
    let ins = graph.instr(value);
    let needs_conversion = !ins.range.is_some_and(|r| r.is_int32());
    for site in &ins.uses {
        match *site {
            UseSite::Def { user, index } => {
                if !graph.instr(user).is_operand_truncated(index) {
                    return false;
                }
            }
            UseSite::Resume { .. } => {
                if ins.use_removed && needs_conversion {
                    return false;
                }
            }
            UseSite::Term { .. } => return false,
        }
    }
    true
}

/// Apply per-kind truncation. Returns true when the definition now
/// produces an int32 and its surroundings need fixing up.
fn truncate_def(graph: &mut Graph, value: ValueId) -> bool {
    let ins = graph.instr_mut(value);
    match ins.kind {
        InstrKind::Add | InstrKind::Sub | InstrKind::Mul { .. } => {
            trace!(%value, "truncating arithmetic");
            ins.truncated = true;
            ins.ty = IrType::Int32;
            if let Some(r) = ins.range {
                if !r.is_int32() {
                    ins.range = Some(Range::new_int32());
                }
            }
            true
        }
        // Division keeps its type; the flag lets codegen use a truncating
        // division that bails out on a remainder or overflow.
        InstrKind::Div { .. } | InstrKind::Mod => {
            ins.truncated = true;
            false
        }
        InstrKind::ToDouble => {
            // Retyped now, replaced by its (converted) operand in the
            // fixup pass.
            ins.ty = IrType::Int32;
            true
        }
        InstrKind::Constant { value: ConstValue::Double(d) } => {
            let n = ecma_to_int32(d);
            ins.kind = InstrKind::Constant { value: ConstValue::Int32(n) };
            ins.ty = IrType::Int32;
            ins.range = Some(Range::singleton(n));
            true
        }
        _ => false,
    }
}

/// Truncations of a value that is already int32 are no-ops; route their
/// uses straight to the value.
fn remove_truncates_on_output(graph: &mut Graph, value: ValueId) {
    debug_assert_eq!(graph.instr(value).ty, IrType::Int32);
    let users: Vec<ValueId> = graph
        .instr(value)
        .uses
        .iter()
        .filter_map(|site| match *site {
            UseSite::Def { user, .. } => Some(user),
            _ => None,
        })
        .filter(|&user| matches!(graph.instr(user).kind, InstrKind::TruncateToInt32))
        .collect();
    for user in users {
        graph.replace_all_uses(user, value);
        graph.discard(user);
    }
}

/// Give every truncated operand of `value` an int32 representation,
/// inserting an explicit truncation where the input is not int32 yet.
fn adjust_truncated_inputs(graph: &mut Graph, value: ValueId) {
    let block = graph.instr(value).block;
    for i in 0..graph.instr(value).operands.len() {
        if !graph.instr(value).is_operand_truncated(i) {
            continue;
        }
        let input = graph.instr(value).operands[i];
        if graph.instr(input).ty == IrType::Int32 {
            continue;
        }
        // An int32-to-double conversion feeding a truncation is transparent.
        if matches!(graph.instr(input).kind, InstrKind::ToDouble)
            && graph.instr(graph.instr(input).operands[0]).ty == IrType::Int32
        {
            let through = graph.instr(input).operands[0];
            graph.replace_operand(value, i, through);
            continue;
        }
        let at = graph
            .block(block)
            .instrs
            .iter()
            .position(|&v| v == value)
            .unwrap_or(0);
        let trunc =
            graph.insert_instr(block, at, InstrKind::TruncateToInt32, IrType::Int32, &[input]);
        graph.replace_operand(value, i, trunc);
    }
    // A truncated ToDouble is an int32 identity by now.
    if matches!(graph.instr(value).kind, InstrKind::ToDouble) {
        let input = graph.instr(value).operands[0];
        graph.replace_all_uses(value, input);
        graph.discard(value);
    }
}

/// `x | 0`, `x & -1` and friends are identities on int32 inputs.
fn fold_bitop(graph: &Graph, value: ValueId) -> Option<ValueId> {
    let ins = graph.instr(value);
    if ins.ty != IrType::Int32 {
        return None;
    }
    let lhs = ins.operands[0];
    let rhs = ins.operands[1];
    let lc = graph.instr(lhs).as_int32_constant();
    let rc = graph.instr(rhs).as_int32_constant();
    let is_int32 = |v: ValueId| graph.instr(v).ty == IrType::Int32;
    match ins.kind {
        InstrKind::BitOr | InstrKind::BitXor => {
            if rc == Some(0) && is_int32(lhs) {
                Some(lhs)
            } else if lc == Some(0) && is_int32(rhs) {
                Some(rhs)
            } else {
                None
            }
        }
        InstrKind::BitAnd => {
            if rc == Some(-1) && is_int32(lhs) {
                Some(lhs)
            } else if lc == Some(-1) && is_int32(rhs) {
                Some(rhs)
            } else if rc == Some(0) {
                Some(rhs)
            } else if lc == Some(0) {
                Some(lhs)
            } else {
                None
            }
        }
        InstrKind::Lsh | InstrKind::Rsh => {
            if rc == Some(0) && is_int32(lhs) {
                Some(lhs)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// ECMA-style modular conversion of a double to int32.
fn ecma_to_int32(d: f64) -> i32 {
    if !d.is_finite() {
        return 0;
    }
    let m = d.trunc().rem_euclid(4294967296.0);
    m as u32 as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Pc;
    use crate::ir::{BlockId, ResumeMode, Terminator};

    fn double_const(g: &mut Graph, block: BlockId, d: f64) -> ValueId {
        g.add_instr(block, InstrKind::Constant { value: ConstValue::Double(d) }, IrType::Double, &[])
    }

    fn int_const(g: &mut Graph, block: BlockId, n: i32) -> ValueId {
        g.add_instr(block, InstrKind::Constant { value: ConstValue::Int32(n) }, IrType::Int32, &[])
    }

    #[test]
    fn overflowing_add_feeding_bitor_goes_int32() {
        // (c + c) | 0 where c == 2^31: everything downstream truncates, so
        // the add may wrap and the bitor folds away entirely.
        let mut g = Graph::new(0, 0);
        let b0 = g.add_block(Pc(0));
        let c = double_const(&mut g, b0, 2147483648.0);
        let add = g.add_instr(b0, InstrKind::Add, IrType::Double, &[c, c]);
        let tr = g.add_instr(b0, InstrKind::TruncateToInt32, IrType::Int32, &[add]);
        let zero = int_const(&mut g, b0, 0);
        let or = g.add_instr(b0, InstrKind::BitOr, IrType::Int32, &[tr, zero]);
        g.end(b0, Terminator::Return { value: or });

        truncate_graph(&mut g);

        assert_eq!(g.block(b0).terminator, Terminator::Return { value: add });
        assert_eq!(g.instr(add).ty, IrType::Int32);
        assert!(g.instr(add).truncated);
        assert_eq!(g.instr(c).as_int32_constant(), Some(i32::MIN));
        assert_eq!(g.block(b0).instrs, vec![c, add, zero]);
    }

    #[test]
    fn truncated_division_keeps_its_type() {
        let mut g = Graph::new(0, 0);
        let b0 = g.add_block(Pc(0));
        let a = double_const(&mut g, b0, 10.0);
        let b = double_const(&mut g, b0, 3.0);
        let div =
            g.add_instr(b0, InstrKind::Div { can_be_negative_zero: true }, IrType::Double, &[a, b]);
        let tr = g.add_instr(b0, InstrKind::TruncateToInt32, IrType::Int32, &[div]);
        g.end(b0, Terminator::Return { value: tr });

        truncate_graph(&mut g);

        assert_eq!(g.instr(div).ty, IrType::Double);
        assert!(g.instr(div).truncated);
        // The explicit truncation stays; only the flag changed.
        assert_eq!(g.block(b0).terminator, Terminator::Return { value: tr });
    }

    #[test]
    fn removed_use_makes_resume_captures_observers() {
        let build = |use_removed: bool| {
            let mut g = Graph::new(0, 0);
            let b0 = g.add_block(Pc(0));
            let c = double_const(&mut g, b0, 1e10);
            let add = g.add_instr(b0, InstrKind::Add, IrType::Double, &[c, c]);
            let rp = g.add_resume_point(b0, Pc(0), ResumeMode::At, vec![add]);
            g.block_mut(b0).entry_resume = Some(rp);
            let tr = g.add_instr(b0, InstrKind::TruncateToInt32, IrType::Int32, &[add]);
            g.end(b0, Terminator::Return { value: tr });
            g.instr_mut(add).use_removed = use_removed;
            truncate_graph(&mut g);
            g.instr(add).ty
        };

        // With every original use intact the capture cannot tell.
        assert_eq!(build(false), IrType::Int32);
        // Once a use was optimized away the capture may be the only
        // observer left, so the add must stay exact.
        assert_eq!(build(true), IrType::Double);
    }

    #[test]
    fn mixed_input_gets_explicit_truncation() {
        // d + 1 with a double d: the add truncates, its double input gets
        // a TruncateToInt32 inserted in front.
        let mut g = Graph::new(0, 0);
        let b0 = g.add_block(Pc(0));
        let p = g.add_instr(b0, InstrKind::Parameter { index: 0 }, IrType::Value, &[]);
        let d = g.add_instr(b0, InstrKind::Unbox { mode: crate::ir::UnboxMode::Infallible },
            IrType::Double, &[p]);
        let one = int_const(&mut g, b0, 1);
        let add = g.add_instr(b0, InstrKind::Add, IrType::Double, &[d, one]);
        let tr = g.add_instr(b0, InstrKind::TruncateToInt32, IrType::Int32, &[add]);
        g.end(b0, Terminator::Return { value: tr });

        truncate_graph(&mut g);

        assert_eq!(g.instr(add).ty, IrType::Int32);
        let new_input = g.instr(add).operands[0];
        assert!(matches!(g.instr(new_input).kind, InstrKind::TruncateToInt32));
        assert_eq!(g.instr(new_input).operands, vec![d]);
        // The old output truncation collapsed onto the add itself.
        assert_eq!(g.block(b0).terminator, Terminator::Return { value: add });
    }
}
