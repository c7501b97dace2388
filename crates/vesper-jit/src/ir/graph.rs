//! The SSA graph: arena storage for blocks, instructions and resume
//! points, plus every mutation that has to keep operand lists and use
//! lists in sync.
//!
//! Mutating an operand anywhere but through the methods here is a bug;
//! [`Graph::assert_coherent`] cross-checks the two directions and is
//! called after every pass in debug builds.

use rustc_hash::FxHashMap;

use crate::bytecode::Pc;

use super::block::{Block, Terminator};
use super::instr::{Instr, InstrKind, UseSite};
use super::types::IrType;
use super::{BlockId, ResumePointId, ValueId};

/// How the interpreter resumes at a resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResumeMode {
    /// Re-execute the operation at `pc`.
    At,
    /// The operation at `pc` already completed; resume at the next one.
    After,
}

/// A mapping of frame slots to SSA values at a bytecode position. Captured
/// at every block entry and after every effectful instruction, so that any
/// guard can reconstruct the interpreter frame.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub pc: Pc,
    pub mode: ResumeMode,
    /// One value per frame slot: args, locals, then expression stack.
    pub operands: Vec<ValueId>,
    pub block: BlockId,
}

#[derive(Debug, Clone)]
pub struct Graph {
    instrs: Vec<Instr>,
    blocks: Vec<Block>,
    resume_points: Vec<ResumePoint>,
    pub entry: BlockId,
    pub osr_entry: Option<BlockId>,
    pub nargs: usize,
    pub nlocals: usize,
}

impl Graph {
    pub fn new(nargs: usize, nlocals: usize) -> Graph {
        Graph {
            instrs: Vec::new(),
            blocks: Vec::new(),
            resume_points: Vec::new(),
            entry: BlockId(0),
            osr_entry: None,
            nargs,
            nlocals,
        }
    }

    /// Number of fixed frame slots (args + locals); the expression stack
    /// begins above these.
    pub fn nslots(&self) -> usize {
        self.nargs + self.nlocals
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_values(&self) -> usize {
        self.instrs.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    pub fn instr(&self, id: ValueId) -> &Instr {
        &self.instrs[id.index()]
    }

    pub fn instr_mut(&mut self, id: ValueId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    pub fn resume_point(&self, id: ResumePointId) -> &ResumePoint {
        &self.resume_points[id.index()]
    }

    pub fn resume_point_mut(&mut self, id: ResumePointId) -> &mut ResumePoint {
        &mut self.resume_points[id.index()]
    }

    pub fn num_resume_points(&self) -> usize {
        self.resume_points.len()
    }

    // ---- construction ----

    pub fn add_block(&mut self, pc: Pc) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id, pc));
        id
    }

    fn new_value(&mut self, block: BlockId, kind: InstrKind, ty: IrType, operands: Vec<ValueId>) -> ValueId {
        let id = ValueId(self.instrs.len() as u32);
        let guard = kind.is_guard();
        let movable = !kind.has_side_effects() && !guard;
        self.instrs.push(Instr {
            kind,
            ty,
            operands,
            uses: Vec::new(),
            range: None,
            resume_after: None,
            block,
            guard,
            movable,
            truncated: false,
            use_removed: false,
            in_worklist: false,
        });
        for i in 0..self.instrs[id.index()].operands.len() {
            let op = self.instrs[id.index()].operands[i];
            self.instrs[op.index()].uses.push(UseSite::Def { user: id, index: i });
        }
        id
    }

    /// Append an instruction to `block`.
    pub fn add_instr(&mut self, block: BlockId, kind: InstrKind, ty: IrType, operands: &[ValueId]) -> ValueId {
        let id = self.new_value(block, kind, ty, operands.to_vec());
        self.blocks[block.index()].instrs.push(id);
        id
    }

    /// Insert an instruction before position `at` in `block`'s instruction
    /// list. Used for betas and truncation fixups.
    pub fn insert_instr(&mut self, block: BlockId, at: usize, kind: InstrKind, ty: IrType, operands: &[ValueId]) -> ValueId {
        let id = self.new_value(block, kind, ty, operands.to_vec());
        self.blocks[block.index()].instrs.insert(at, id);
        id
    }

    pub fn add_phi(&mut self, block: BlockId, ty: IrType, operands: Vec<ValueId>) -> ValueId {
        let id = self.new_value(block, InstrKind::Phi, ty, operands);
        self.blocks[block.index()].phis.push(id);
        id
    }

    pub fn add_phi_operand(&mut self, phi: ValueId, value: ValueId) {
        let index = self.instrs[phi.index()].operands.len();
        self.instrs[phi.index()].operands.push(value);
        self.instrs[value.index()].uses.push(UseSite::Def { user: phi, index });
    }

    /// Set the terminator of `block`, registering the terminator operand as
    /// a use. Predecessor lists of the successors are maintained by the
    /// join helpers, not here.
    pub fn end(&mut self, block: BlockId, term: Terminator) {
        debug_assert!(!self.blocks[block.index()].is_terminated(), "{block} ended twice");
        if let Some(op) = term.operand() {
            self.instrs[op.index()].uses.push(UseSite::Term { block, index: 0 });
        }
        self.blocks[block.index()].terminator = term;
    }

    pub fn add_resume_point(&mut self, block: BlockId, pc: Pc, mode: ResumeMode, operands: Vec<ValueId>) -> ResumePointId {
        let id = ResumePointId(self.resume_points.len() as u32);
        for (i, &op) in operands.iter().enumerate() {
            self.instrs[op.index()].uses.push(UseSite::Resume { rp: id, index: i });
        }
        self.resume_points.push(ResumePoint { pc, mode, operands, block });
        id
    }

    // ---- join helpers used while building ----

    /// New block at `pc` inheriting the abstract frame of `pred`.
    pub fn new_block_from(&mut self, pred: BlockId, pc: Pc, loop_depth: u32) -> BlockId {
        self.new_block_popn(pred, pc, 0, loop_depth)
    }

    /// Like [`Graph::new_block_from`] but with `popped` stack slots of the
    /// predecessor consumed by the edge.
    pub fn new_block_popn(&mut self, pred: BlockId, pc: Pc, popped: usize, loop_depth: u32) -> BlockId {
        let id = self.add_block(pc);
        let slots = {
            let p = &self.blocks[pred.index()];
            p.slots[..p.slots.len() - popped].to_vec()
        };
        let block = &mut self.blocks[id.index()];
        block.slots = slots;
        block.preds.push(pred);
        block.loop_depth = loop_depth;
        id
    }

    /// New loop header at `pc` with one phi per slot, each seeded with the
    /// predecessor's value. The backedge operand is patched in later by
    /// [`Graph::set_backedge`].
    pub fn new_pending_loop_header(&mut self, pred: BlockId, pc: Pc, loop_depth: u32) -> BlockId {
        let id = self.add_block(pc);
        let pred_slots = self.blocks[pred.index()].slots.clone();
        let mut slots = Vec::with_capacity(pred_slots.len());
        for &value in &pred_slots {
            let ty = self.instrs[value.index()].ty;
            let phi = self.add_phi(id, ty, vec![value]);
            slots.push(phi);
        }
        let block = &mut self.blocks[id.index()];
        block.slots = slots;
        block.preds.push(pred);
        block.loop_depth = loop_depth;
        block.is_loop_header = true;
        id
    }

    /// Register `pred` as a new predecessor of `block`, inserting phis for
    /// every slot whose value disagrees.
    pub fn add_predecessor(&mut self, block: BlockId, pred: BlockId) {
        self.add_predecessor_popn(block, pred, 0);
    }

    pub fn add_predecessor_popn(&mut self, block: BlockId, pred: BlockId, popped: usize) {
        let pred_slots = {
            let p = &self.blocks[pred.index()];
            p.slots[..p.slots.len() - popped].to_vec()
        };
        debug_assert_eq!(self.blocks[block.index()].slots.len(), pred_slots.len(),
            "stack depth mismatch joining {pred} into {block}");
        let npreds = self.blocks[block.index()].preds.len();
        for i in 0..pred_slots.len() {
            let mine = self.blocks[block.index()].slots[i];
            let theirs = pred_slots[i];
            if mine == theirs {
                continue;
            }
            let mine_is_own_phi = {
                let ins = &self.instrs[mine.index()];
                ins.is_phi() && ins.block == block
            };
            if mine_is_own_phi {
                self.add_phi_operand(mine, theirs);
            } else {
                let ty = self.join_type(mine, theirs);
                let mut operands = vec![mine; npreds];
                operands.push(theirs);
                let phi = self.add_phi(block, ty, operands);
                self.blocks[block.index()].slots[i] = phi;
            }
        }
        self.blocks[block.index()].preds.push(pred);
    }

    /// Patch the loop phis of `header` with the values flowing around the
    /// backedge and close the loop.
    pub fn set_backedge(&mut self, header: BlockId, pred: BlockId) {
        let pred_slots = self.blocks[pred.index()].slots.clone();
        let phis = self.blocks[header.index()].phis.clone();
        debug_assert_eq!(phis.len(), pred_slots.len());
        for (i, &phi) in phis.iter().enumerate() {
            let mut exit = pred_slots[i];
            // A slot the loop never writes flows the phi back into itself;
            // close it over the initial value instead.
            if exit == phi {
                exit = self.instrs[phi.index()].operands[0];
            }
            self.add_phi_operand(phi, exit);
        }
        self.blocks[header.index()].preds.push(pred);
        self.blocks[header.index()].backedge = Some(pred);
    }

    fn join_type(&self, a: ValueId, b: ValueId) -> IrType {
        let ta = self.instrs[a.index()].ty;
        let tb = self.instrs[b.index()].ty;
        if ta == tb {
            ta
        } else {
            IrType::Value
        }
    }

    // ---- use-list mutation ----

    fn remove_use(&mut self, def: ValueId, site: UseSite) {
        let uses = &mut self.instrs[def.index()].uses;
        if let Some(pos) = uses.iter().position(|u| *u == site) {
            uses.swap_remove(pos);
        } else {
            debug_assert!(false, "use of {def} not found");
        }
    }

    /// Rewrite operand `index` of `user` to `new`, updating both use lists.
    pub fn replace_operand(&mut self, user: ValueId, index: usize, new: ValueId) {
        let old = self.instrs[user.index()].operands[index];
        if old == new {
            return;
        }
        self.remove_use(old, UseSite::Def { user, index });
        self.instrs[user.index()].operands[index] = new;
        self.instrs[new.index()].uses.push(UseSite::Def { user, index });
    }

    pub fn replace_resume_operand(&mut self, rp: ResumePointId, index: usize, new: ValueId) {
        let old = self.resume_points[rp.index()].operands[index];
        if old == new {
            return;
        }
        self.remove_use(old, UseSite::Resume { rp, index });
        self.resume_points[rp.index()].operands[index] = new;
        self.instrs[new.index()].uses.push(UseSite::Resume { rp, index });
    }

    pub fn replace_term_operand(&mut self, block: BlockId, new: ValueId) {
        let old = match self.blocks[block.index()].terminator.operand() {
            Some(v) => v,
            None => return,
        };
        if old == new {
            return;
        }
        self.remove_use(old, UseSite::Term { block, index: 0 });
        self.blocks[block.index()].terminator.set_operand(new);
        self.instrs[new.index()].uses.push(UseSite::Term { block, index: 0 });
    }

    fn apply_use(&mut self, site: UseSite, new: ValueId) {
        match site {
            UseSite::Def { user, index } => self.replace_operand(user, index, new),
            UseSite::Resume { rp, index } => self.replace_resume_operand(rp, index, new),
            UseSite::Term { block, .. } => self.replace_term_operand(block, new),
        }
    }

    /// Redirect every use of `old` to `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        let uses = self.instrs[old.index()].uses.clone();
        for site in uses {
            self.apply_use(site, new);
        }
    }

    /// Redirect the uses of `old` that are dominated by `dom` to `new`,
    /// skipping uses by `new` itself. A phi use lives in the predecessor
    /// block its operand index selects, not in the phi's own block.
    pub fn replace_dominated_uses(&mut self, old: ValueId, new: ValueId, dom: BlockId) {
        let uses = self.instrs[old.index()].uses.clone();
        for site in uses {
            let use_block = match site {
                UseSite::Def { user, index } => {
                    if user == new {
                        continue;
                    }
                    let ins = &self.instrs[user.index()];
                    if ins.is_phi() {
                        self.blocks[ins.block.index()].preds[index]
                    } else {
                        ins.block
                    }
                }
                UseSite::Resume { rp, .. } => self.resume_points[rp.index()].block,
                UseSite::Term { block, .. } => block,
            };
            if self.dominates(dom, use_block) {
                self.apply_use(site, new);
            }
        }
    }

    /// Remove an instruction from its block. The caller must have rewired
    /// all uses already; the operands' defs are flagged `use_removed` so
    /// later observability analysis stays conservative.
    pub fn discard(&mut self, value: ValueId) {
        debug_assert!(self.instrs[value.index()].uses.is_empty(),
            "discarding {value} which still has uses");
        let operands: Vec<ValueId> = self.instrs[value.index()].operands.clone();
        for (i, &op) in operands.iter().enumerate() {
            self.remove_use(op, UseSite::Def { user: value, index: i });
            self.instrs[op.index()].use_removed = true;
        }
        self.instrs[value.index()].operands.clear();
        let block = self.instrs[value.index()].block;
        let b = &mut self.blocks[block.index()];
        if let Some(pos) = b.instrs.iter().position(|&v| v == value) {
            b.instrs.remove(pos);
        } else if let Some(pos) = b.phis.iter().position(|&v| v == value) {
            b.phis.remove(pos);
        }
    }

    // ---- orderings and dominance ----

    /// Blocks in postorder of a successor-DFS from the entry. The OSR entry
    /// block has no forward edge into it and is not part of the ordering.
    pub fn postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        // (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry.index()] = true;
        loop {
            let (block, next) = match stack.last_mut() {
                Some(top) => {
                    let frame = (top.0, top.1);
                    top.1 += 1;
                    frame
                }
                None => break,
            };
            let succs = self.blocks[block.index()].successors();
            if next < succs.len() {
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                order.push(block);
                stack.pop();
            }
        }
        order
    }

    pub fn rpo(&self) -> Vec<BlockId> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Compute immediate dominators over the entry-reachable subgraph.
    /// Predecessors outside it (the OSR entry) do not constrain the tree.
    pub fn build_dominators(&mut self) {
        let rpo = self.rpo();
        let mut index: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, &b) in rpo.iter().enumerate() {
            index.insert(b, i);
        }
        for block in &mut self.blocks {
            block.idom = None;
        }
        self.blocks[self.entry.index()].idom = Some(self.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let preds = self.blocks[b.index()].preds.clone();
                let mut new_idom: Option<BlockId> = None;
                for &p in &preds {
                    if self.blocks[p.index()].idom.is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => self.intersect(cur, p, &index),
                    });
                }
                if let Some(idom) = new_idom {
                    if self.blocks[b.index()].idom != Some(idom) {
                        self.blocks[b.index()].idom = Some(idom);
                        changed = true;
                    }
                }
            }
        }
    }

    fn intersect(&self, mut a: BlockId, mut b: BlockId, index: &FxHashMap<BlockId, usize>) -> BlockId {
        while a != b {
            while index[&a] > index[&b] {
                a = self.blocks[a.index()].idom.unwrap_or(a);
            }
            while index[&b] > index[&a] {
                b = self.blocks[b.index()].idom.unwrap_or(b);
            }
        }
        a
    }

    /// Walks the dominator tree; requires [`Graph::build_dominators`].
    pub fn dominates(&self, a: BlockId, mut b: BlockId) -> bool {
        loop {
            if a == b {
                return true;
            }
            match self.blocks[b.index()].idom {
                Some(parent) if parent != b => b = parent,
                _ => return false,
            }
        }
    }

    /// Immediate dominator, if the block is reachable and not the entry.
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        match self.blocks[b.index()].idom {
            Some(parent) if parent != b => Some(parent),
            _ => None,
        }
    }

    // ---- resume-point queries ----

    /// The resume point in effect just before `value` executes: the closest
    /// preceding effectful instruction's resume-after, the block's entry
    /// resume point, or the same walking up the dominator tree.
    pub fn nearest_resume_point(&self, value: ValueId) -> Option<ResumePointId> {
        let ins = &self.instrs[value.index()];
        let mut block = ins.block;
        let mut limit: Option<usize> = if ins.is_phi() {
            Some(0)
        } else {
            self.blocks[block.index()].instrs.iter().position(|&v| v == value)
        };
        loop {
            let b = &self.blocks[block.index()];
            let upto = limit.unwrap_or(b.instrs.len());
            for &prev in b.instrs[..upto].iter().rev() {
                if let Some(rp) = self.instrs[prev.index()].resume_after {
                    return Some(rp);
                }
            }
            if let Some(rp) = b.entry_resume {
                return Some(rp);
            }
            block = self.idom(block)?;
            limit = None;
        }
    }

    // ---- validation ----

    /// Debug cross-check of operand lists, use lists, phi arity, resume
    /// points and the pred/succ relation. A failure is a compiler bug.
    pub fn assert_coherent(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        for block in &self.blocks {
            for &phi in &block.phis {
                let ins = &self.instrs[phi.index()];
                assert!(ins.is_phi());
                assert_eq!(ins.block, block.id);
                assert_eq!(ins.operands.len(), block.preds.len(),
                    "phi {phi} arity does not match predecessors of {}", block.id);
            }
            for &value in &block.instrs {
                assert_eq!(self.instrs[value.index()].block, block.id);
            }
            for value in block.phis.iter().chain(block.instrs.iter()) {
                let ins = &self.instrs[value.index()];
                for (i, &op) in ins.operands.iter().enumerate() {
                    let site = UseSite::Def { user: *value, index: i };
                    assert!(self.instrs[op.index()].uses.contains(&site),
                        "{op} missing use record for operand {i} of {value}");
                }
                for site in &ins.uses {
                    self.check_use_site(*value, *site);
                }
            }
            if let Some(op) = block.terminator.operand() {
                let site = UseSite::Term { block: block.id, index: 0 };
                assert!(self.instrs[op.index()].uses.contains(&site));
            }
            for succ in block.successors() {
                assert!(self.blocks[succ.index()].preds.contains(&block.id),
                    "{} missing predecessor {}", succ, block.id);
            }
            for &pred in &block.preds {
                assert!(self.blocks[pred.index()].successors().contains(&block.id),
                    "{} missing successor {}", pred, block.id);
            }
        }
        for (i, rp) in self.resume_points.iter().enumerate() {
            let id = ResumePointId(i as u32);
            for (slot, &op) in rp.operands.iter().enumerate() {
                let site = UseSite::Resume { rp: id, index: slot };
                assert!(self.instrs[op.index()].uses.contains(&site),
                    "{op} missing use record for slot {slot} of {id}");
            }
        }
    }

    fn check_use_site(&self, def: ValueId, site: UseSite) {
        match site {
            UseSite::Def { user, index } => {
                assert_eq!(self.instrs[user.index()].operands.get(index), Some(&def),
                    "stale use record of {def} on {user}");
            }
            UseSite::Resume { rp, index } => {
                assert_eq!(self.resume_points[rp.index()].operands.get(index), Some(&def));
            }
            UseSite::Term { block, .. } => {
                assert_eq!(self.blocks[block.index()].terminator.operand(), Some(def));
            }
        }
    }

    /// Checks the contract of a graph leaving the optimization pipeline:
    /// no beta nodes remain and every guard can reach a resume point.
    pub fn assert_finalized(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        self.assert_coherent();
        for block in &self.blocks {
            for &value in &block.instrs {
                let ins = &self.instrs[value.index()];
                assert!(!matches!(ins.kind, InstrKind::Beta { .. }),
                    "beta {value} survived finalization");
                if ins.guard || ins.is_effectful() {
                    assert!(self.nearest_resume_point(value).is_some(),
                        "{value} cannot reach a resume point");
                }
            }
        }
    }
}
