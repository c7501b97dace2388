//! Whole-pipeline tests: bytecode in, published unit out.

use vesper_jit::bytecode::{Op, Pc, ScriptBuilder, ScriptId, SrcNote};
use vesper_jit::context::CompileOptions;
use vesper_jit::ir::{InstrKind, IrType};
use vesper_jit::object::MockObjects;
use vesper_jit::oracle::{BinaryTypes, StaticOracle};
use vesper_jit::pipeline::Jit;

fn compile(script: vesper_jit::bytecode::Script, oracle: &StaticOracle) -> vesper_jit::CompiledUnit {
    let mut jit = Jit::new(CompileOptions::default());
    let objects = MockObjects::new();
    match jit.compile(&script, oracle, &objects, None) {
        Ok(unit) => unit,
        Err(reason) => panic!("compilation aborted: {reason}"),
    }
}

fn count_instrs(unit: &vesper_jit::CompiledUnit, pred: impl Fn(&InstrKind) -> bool) -> usize {
    unit.graph
        .block_ids()
        .flat_map(|b| unit.graph.block(b).instrs.clone())
        .filter(|&v| pred(&unit.graph.instr(v).kind))
        .count()
}

// if (arg0 < 10) local0 = arg0 + 1; else local0 = 0; return local0
#[test]
fn if_else_joins_through_a_phi() {
    let mut b = ScriptBuilder::new(1, 1);
    b.op(Op::GetArg(0));
    b.op(Op::Int32(10));
    b.op(Op::Lt);
    let branch = b.op(Op::IfFalse(Pc(0)));
    b.op(Op::GetArg(0));
    b.op(Op::Int32(1));
    let add = b.op(Op::Add);
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let true_end = b.op(Op::Goto(Pc(0)));
    let false_start = b.here();
    b.op(Op::Int32(0));
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let join = b.here();
    b.op(Op::GetLocal(0));
    b.op(Op::Return);
    b.patch(branch, Op::IfFalse(false_start));
    b.patch(true_end, Op::Goto(join));
    b.note(branch, SrcNote::IfElse { true_end });

    let oracle = StaticOracle::new();
    oracle.set_arg_types(vec![IrType::Int32]);
    oracle.set_binary_types(add, BinaryTypes::int32());
    let script = b.finish(ScriptId(0));

    let unit = compile(script, &oracle);
    let phis: usize = unit.graph.block_ids().map(|b| unit.graph.block(b).phis.len()).sum();
    assert_eq!(phis, 1);
    assert!(!unit.snapshots.is_empty());
}

// return arg0 + 2147483647
#[test]
fn speculative_add_keeps_its_overflow_check() {
    let mut b = ScriptBuilder::new(1, 0);
    b.op(Op::GetArg(0));
    b.op(Op::Int32(i32::MAX));
    let add = b.op(Op::Add);
    b.op(Op::Return);

    let oracle = StaticOracle::new();
    oracle.set_arg_types(vec![IrType::Int32]);
    oracle.set_binary_types(add, BinaryTypes::int32());
    let script = b.finish(ScriptId(9));

    let unit = compile(script, &oracle);
    let add_value = unit
        .graph
        .block_ids()
        .flat_map(|b| unit.graph.block(b).instrs.clone())
        .find(|&v| matches!(unit.graph.instr(v).kind, InstrKind::Add))
        .unwrap();
    let ins = unit.graph.instr(add_value);
    // The result escapes through the return, so wraparound would be
    // observable: the add must stay a checked int32 add, with a resume
    // point available for the overflow bailout.
    assert_eq!(ins.ty, IrType::Int32);
    assert!(!ins.truncated);
    assert!(ins.range.unwrap().upper_infinite());
    assert!(!unit.snapshots.is_empty());
}

// i = 0; while (i < limit) { i = i + 1 } return i
fn counting_loop(limit: i32, id: u32) -> (vesper_jit::bytecode::Script, StaticOracle) {
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

    let oracle = StaticOracle::new();
    oracle.set_binary_types(add_i, BinaryTypes::int32());
    (b.finish(ScriptId(id)), oracle)
}

fn counter_phi_range(unit: &vesper_jit::CompiledUnit) -> Option<vesper_jit::Range> {
    let header = unit
        .graph
        .block_ids()
        .find(|&b| unit.graph.block(b).is_loop_header)
        .unwrap();
    let phis = &unit.graph.block(header).phis;
    assert_eq!(phis.len(), 1);
    unit.graph.instr(phis[0]).range
}

#[test]
fn loop_limit_boundaries_keep_the_counter_bounded() {
    // Zero-trip and single-trip loops still have a well formed bound, and
    // the widest limit must not overflow the bound arithmetic.
    for (i, limit) in [0, 1, i32::MAX].into_iter().enumerate() {
        let (script, oracle) = counting_loop(limit, 20 + i as u32);
        let unit = compile(script, &oracle);
        let range = counter_phi_range(&unit).unwrap();
        assert_eq!(range.lower(), 0, "limit {limit}");
        assert!(!range.lower_infinite(), "limit {limit}");
    }
}

#[test]
fn loop_limit_at_int32_min_drops_the_bound() {
    // The exit condition is `i >= INT32_MIN`; normalizing it overflows
    // 32 bits, so the analysis must give up rather than wrap.
    let (script, oracle) = counting_loop(i32::MIN, 24);
    let unit = compile(script, &oracle);
    assert!(counter_phi_range(&unit).is_none());
}

// i = 0; sum = 0; while (i < 1000) { sum = sum + i; i = i + 1 } return sum
#[test]
fn counted_loop_phis_learn_their_ranges() {
    let mut b = ScriptBuilder::new(0, 2);
    b.op(Op::Int32(0));
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    b.op(Op::Int32(0));
    b.op(Op::SetLocal(1));
    b.op(Op::Pop);
    let opening = b.op(Op::Goto(Pc(0)));
    b.op(Op::LoopHead);
    b.op(Op::GetLocal(1));
    b.op(Op::GetLocal(0));
    let add_sum = b.op(Op::Add);
    b.op(Op::SetLocal(1));
    b.op(Op::Pop);
    b.op(Op::GetLocal(0));
    b.op(Op::Int32(1));
    let add_i = b.op(Op::Add);
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let cond = b.here();
    b.op(Op::GetLocal(0));
    b.op(Op::Int32(1000));
    b.op(Op::Lt);
    let ifne = b.op(Op::IfTrue(opening.next()));
    b.op(Op::GetLocal(1));
    b.op(Op::Return);
    b.patch(opening, Op::Goto(cond));
    b.note(opening, SrcNote::While { ifne });

    let oracle = StaticOracle::new();
    oracle.set_binary_types(add_sum, BinaryTypes::int32());
    oracle.set_binary_types(add_i, BinaryTypes::int32());
    let script = b.finish(ScriptId(1));

    let unit = compile(script, &oracle);
    let header = unit
        .graph
        .block_ids()
        .find(|&b| unit.graph.block(b).is_loop_header)
        .unwrap();
    let phis = unit.graph.block(header).phis.clone();
    assert_eq!(phis.len(), 2);
    // The counter is a linear recurrence, so it learns its lower bound;
    // the accumulator is not and stays unbounded.
    let ranged: Vec<_> = phis
        .iter()
        .filter_map(|&phi| unit.graph.instr(phi).range)
        .collect();
    assert_eq!(ranged.len(), 1);
    assert_eq!(ranged[0].lower(), 0);
    assert!(!ranged[0].lower_infinite());
}

// i = 0; sum = 0; while (i < arr.length) { sum = sum + arr[i]; i = i + 1 }
#[test]
fn array_sum_loop_keeps_its_bounds_check() {
    let mut b = ScriptBuilder::new(1, 2);
    b.op(Op::Int32(0));
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    b.op(Op::Int32(0));
    b.op(Op::SetLocal(1));
    b.op(Op::Pop);
    let opening = b.op(Op::Goto(Pc(0)));
    b.op(Op::LoopHead);
    b.op(Op::GetLocal(1));
    b.op(Op::GetArg(0));
    b.op(Op::GetLocal(0));
    let elem = b.op(Op::GetElem);
    let add_sum = b.op(Op::Add);
    b.op(Op::SetLocal(1));
    b.op(Op::Pop);
    b.op(Op::GetLocal(0));
    b.op(Op::Int32(1));
    let add_i = b.op(Op::Add);
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let cond = b.here();
    b.op(Op::GetLocal(0));
    b.op(Op::GetArg(0));
    b.op(Op::Length);
    b.op(Op::Lt);
    let ifne = b.op(Op::IfTrue(opening.next()));
    b.op(Op::GetLocal(1));
    b.op(Op::Return);
    b.patch(opening, Op::Goto(cond));
    b.note(opening, SrcNote::While { ifne });

    let oracle = StaticOracle::new();
    oracle.set_arg_types(vec![IrType::Object]);
    oracle.set_dense_element(elem, IrType::Int32);
    oracle.set_binary_types(add_sum, BinaryTypes::int32());
    oracle.set_binary_types(add_i, BinaryTypes::int32());
    let script = b.finish(ScriptId(2));

    let unit = compile(script, &oracle);
    // The length lives inside the loop, so the check cannot move.
    assert_eq!(count_instrs(&unit, |k| matches!(k, InstrKind::BoundsCheck { .. })), 1);
    assert_eq!(count_instrs(&unit, |k| matches!(k, InstrKind::LoadElement)), 1);
}

// switch (arg0) { case 0: local0 = 10; break; case 1: local0 = 20; break;
//                 default: local0 = 0 } return local0
#[test]
fn table_switch_merges_all_cases() {
    let mut b = ScriptBuilder::new(1, 1);
    b.op(Op::GetArg(0));
    let switch = b.op(Op::Nop);
    let case0 = b.here();
    b.op(Op::Int32(10));
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let break0 = b.op(Op::Goto(Pc(0)));
    let case1 = b.here();
    b.op(Op::Int32(20));
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let break1 = b.op(Op::Goto(Pc(0)));
    let default = b.here();
    b.op(Op::Int32(0));
    b.op(Op::SetLocal(0));
    b.op(Op::Pop);
    let exit = b.here();
    b.op(Op::GetLocal(0));
    b.op(Op::Return);
    b.patch(
        switch,
        Op::TableSwitch { low: 0, high: 1, default, targets: vec![case0, case1] },
    );
    b.patch(break0, Op::Goto(exit));
    b.patch(break1, Op::Goto(exit));
    b.note(switch, SrcNote::Switch { exit });
    b.note(break0, SrcNote::SwitchBreak);
    b.note(break1, SrcNote::SwitchBreak);

    let oracle = StaticOracle::new();
    oracle.set_arg_types(vec![IrType::Int32]);
    let script = b.finish(ScriptId(3));

    let unit = compile(script, &oracle);
    // Three bodies join at the exit.
    let exit_block = unit
        .graph
        .block_ids()
        .find(|&b| unit.graph.block(b).preds.len() == 3)
        .unwrap();
    assert_eq!(unit.graph.block(exit_block).phis.len(), 1);
}
