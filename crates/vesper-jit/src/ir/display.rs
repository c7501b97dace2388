//! Textual graph dump, used by spew and by tests asserting on structure.

use std::fmt;
use std::fmt::Write as _;

use super::block::Terminator;
use super::graph::Graph;
use super::instr::InstrKind;
use super::types::IrType;
use super::ValueId;

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block_id in self.block_ids() {
            let block = self.block(block_id);
            write!(f, "{}", block_id)?;
            if block.is_loop_header {
                write!(f, " (loop header, depth {})", block.loop_depth)?;
            } else if block.loop_depth > 0 {
                write!(f, " (depth {})", block.loop_depth)?;
            }
            if block.osr_like {
                write!(f, " (osr)")?;
            }
            write!(f, " @{}", block.pc.0)?;
            if !block.preds.is_empty() {
                write!(f, " preds:")?;
                for pred in &block.preds {
                    write!(f, " {}", pred)?;
                }
            }
            writeln!(f)?;
            for &phi in &block.phis {
                writeln!(f, "  {}", format_value(self, phi))?;
            }
            for &value in &block.instrs {
                writeln!(f, "  {}", format_value(self, value))?;
            }
            match &block.terminator {
                Terminator::None => writeln!(f, "  <unterminated>")?,
                Terminator::Goto { target } => writeln!(f, "  goto {}", target)?,
                Terminator::Test { cond, if_true, if_false } => {
                    writeln!(f, "  test {} ? {} : {}", cond, if_true, if_false)?
                }
                Terminator::TableSwitch { input, low, cases, default } => {
                    write!(f, "  tableswitch {} low {}", input, low)?;
                    for case in cases {
                        write!(f, " {}", case)?;
                    }
                    writeln!(f, " default {}", default)?;
                }
                Terminator::Return { value } => writeln!(f, "  return {}", value)?,
                Terminator::Throw { value } => writeln!(f, "  throw {}", value)?,
            }
        }
        Ok(())
    }
}

fn format_value(graph: &Graph, id: ValueId) -> String {
    let ins = graph.instr(id);
    let mut out = String::new();
    if ins.ty == IrType::None {
        let _ = write!(out, "{} = {}", id, ins.kind.mnemonic());
    } else {
        let _ = write!(out, "{}:{} = {}", id, ins.ty, ins.kind.mnemonic());
    }
    match &ins.kind {
        InstrKind::Constant { value } => {
            let _ = write!(out, " {:?}", value);
        }
        InstrKind::Parameter { index } => {
            let _ = write!(out, " #{}", index);
        }
        InstrKind::OsrValue { slot } => {
            let _ = write!(out, " slot {}", slot);
        }
        InstrKind::Compare { op } => {
            let _ = write!(out, " {:?}", op);
        }
        InstrKind::Beta { range } => {
            let _ = write!(out, " {}", range);
        }
        InstrKind::LoadSlot { slot } | InstrKind::StoreSlot { slot } => {
            let _ = write!(out, " slot {}", slot);
        }
        InstrKind::GetPropertyCache { name, idempotent } => {
            let _ = write!(out, " name {}{}", name.0, if *idempotent { " idempotent" } else { "" });
        }
        InstrKind::SetPropertyCache { name } | InstrKind::GetNameCache { name } => {
            let _ = write!(out, " name {}", name.0);
        }
        _ => {}
    }
    for op in &ins.operands {
        let _ = write!(out, " {}", op);
    }
    if let Some(range) = &ins.range {
        let _ = write!(out, " ; range {}", range);
    }
    if ins.truncated {
        out.push_str(" ; truncated");
    }
    if let Some(rp) = ins.resume_after {
        let _ = write!(out, " ; resume {}", rp);
    }
    out
}

#[cfg(test)]
mod tests {
    use crate::bytecode::Pc;
    use crate::ir::{ConstValue, Graph, InstrKind, IrType, Terminator};

    #[test]
    fn dump_shows_blocks_and_operands() {
        let mut g = Graph::new(0, 0);
        let b0 = g.add_block(Pc(0));
        let c = g.add_instr(
            b0,
            InstrKind::Constant { value: ConstValue::Int32(7) },
            IrType::Int32,
            &[],
        );
        let neg = g.add_instr(b0, InstrKind::Neg, IrType::Int32, &[c]);
        g.end(b0, Terminator::Return { value: neg });

        let dump = g.to_string();
        assert!(dump.contains("b0"));
        assert!(dump.contains("constant"));
        assert!(dump.contains(&format!("neg {}", c)));
        assert!(dump.contains(&format!("return {}", neg)));
    }
}
