//! Bailout and deoptimization protocol.
//!
//! Compiled code is speculative; every guard that can fail carries enough
//! metadata to abandon the compiled frame and hand the interpreter an
//! equivalent one. The metadata is a [`SnapshotTable`]: one entry per
//! resume point, each describing where every frame slot lives at that
//! point, either a known constant or a machine location read through a
//! [`FrameReader`].
//!
//! Invalidation is the permanent form: a unit whose assumptions are
//! broken is marked non-reentrant in the [`InvalidationRegistry`].
//! Running activations cannot be patched in place; each one checks its
//! unit's flag at the next bailout or return and unwinds itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::bytecode::{Pc, Script, ScriptId};
use crate::context::CompileOptions;
use crate::ir::{ConstValue, Graph, ResumeMode, ResumePointId};
use crate::object::Value;

/// Which guard failed. Feeds the per-unit tally that decides when
/// repeated bailouts turn into invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BailoutKind {
    /// Int32 arithmetic overflowed.
    Overflow,
    /// An int32 operation would have produced -0.
    NegativeZero,
    BoundsCheck,
    /// A bounds check hoisted to a loop preheader failed.
    HoistedBoundsCheck,
    ShapeGuard,
    TypeBarrier,
    /// An unbox guard saw a value of the wrong type.
    UnexpectedType,
}

impl BailoutKind {
    pub const COUNT: usize = 7;

    fn index(self) -> usize {
        match self {
            BailoutKind::Overflow => 0,
            BailoutKind::NegativeZero => 1,
            BailoutKind::BoundsCheck => 2,
            BailoutKind::HoistedBoundsCheck => 3,
            BailoutKind::ShapeGuard => 4,
            BailoutKind::TypeBarrier => 5,
            BailoutKind::UnexpectedType => 6,
        }
    }
}

/// Position of a guard in the compiled unit's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeOffset(pub u32);

/// Where one interpreter frame slot lives at a resume point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SlotSource {
    /// Compile-time constant, not stored anywhere at runtime.
    Constant(Value),
    /// Machine location, read back through a [`FrameReader`].
    Machine(u32),
}

/// Serialized recipe for rebuilding one interpreter frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub pc: Pc,
    pub mode: ResumeMode,
    pub slots: Vec<SlotSource>,
}

/// Per-unit table mapping native offsets to snapshots. Built once at the
/// end of compilation and kept alive as long as the unit can bail out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotTable {
    snapshots: Vec<Snapshot>,
}

impl SnapshotTable {
    /// Encode every resume point of a finished graph. Entry `i` is the
    /// snapshot for resume point `i`, so the offset a guard embeds is
    /// just its resume point's index.
    pub fn from_graph(graph: &Graph, script: &Script) -> SnapshotTable {
        let mut snapshots = Vec::with_capacity(graph.num_resume_points());
        for i in 0..graph.num_resume_points() {
            let rp = graph.resume_point(ResumePointId(i as u32));
            let slots = rp
                .operands
                .iter()
                .map(|&v| match graph.instr(v).const_value() {
                    Some(value) => SlotSource::Constant(const_to_value(value, script)),
                    None => SlotSource::Machine(v.0),
                })
                .collect();
            snapshots.push(Snapshot { pc: rp.pc, mode: rp.mode, slots });
        }
        trace!(entries = snapshots.len(), "encoded snapshot table");
        SnapshotTable { snapshots }
    }

    pub fn offset_of(rp: ResumePointId) -> NativeOffset {
        NativeOffset(rp.0)
    }

    pub fn snapshot(&self, offset: NativeOffset) -> Option<&Snapshot> {
        self.snapshots.get(offset.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

fn const_to_value(value: &ConstValue, script: &Script) -> Value {
    match *value {
        ConstValue::Int32(n) => Value::Int32(n),
        ConstValue::Double(d) => Value::Double(d),
        ConstValue::Boolean(b) => Value::Boolean(b),
        ConstValue::Str(name) => Value::Str(script.name(name).to_string()),
        ConstValue::Undefined => Value::Undefined,
    }
}

/// Access to the paused compiled frame's machine state.
pub trait FrameReader {
    fn read(&self, slot: u32) -> Value;
}

/// Table-backed [`FrameReader`] used by tests and by the interpreter
/// shim. Unassigned slots read as `Undefined`.
#[derive(Debug, Default)]
pub struct MachineSlots {
    values: FxHashMap<u32, Value>,
}

impl MachineSlots {
    pub fn new() -> MachineSlots {
        MachineSlots::default()
    }

    pub fn set(&mut self, slot: u32, value: Value) {
        self.values.insert(slot, value);
    }
}

impl FrameReader for MachineSlots {
    fn read(&self, slot: u32) -> Value {
        self.values.get(&slot).cloned().unwrap_or(Value::Undefined)
    }
}

/// A reconstructed interpreter frame, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterFrame {
    /// First op the interpreter executes.
    pub pc: Pc,
    pub slots: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BailoutError {
    #[error("no snapshot at native offset {0}")]
    UnknownOffset(u32),
}

/// Rebuild the interpreter frame for a failed guard. `ResumeMode::At`
/// retries the faulting op; `ResumeMode::After` means its effect already
/// happened and execution continues at the next op.
pub fn take_bailout(
    table: &SnapshotTable,
    offset: NativeOffset,
    kind: BailoutKind,
    reader: &dyn FrameReader,
) -> Result<InterpreterFrame, BailoutError> {
    let snapshot = table
        .snapshot(offset)
        .ok_or(BailoutError::UnknownOffset(offset.0))?;
    let slots = snapshot
        .slots
        .iter()
        .map(|s| match s {
            SlotSource::Constant(v) => v.clone(),
            SlotSource::Machine(slot) => reader.read(*slot),
        })
        .collect();
    let pc = match snapshot.mode {
        ResumeMode::At => snapshot.pc,
        ResumeMode::After => snapshot.pc.next(),
    };
    debug!(?kind, offset = offset.0, pc = pc.0, "bailing out");
    Ok(InterpreterFrame { pc, slots })
}

/// Per-kind bailout counts for one compiled unit. When any kind reaches
/// the configured threshold the unit is no longer worth keeping.
#[derive(Debug)]
pub struct BailoutTally {
    counts: [u32; BailoutKind::COUNT],
    threshold: u32,
}

impl BailoutTally {
    pub fn new(options: &CompileOptions) -> BailoutTally {
        BailoutTally { counts: [0; BailoutKind::COUNT], threshold: options.bailout_threshold }
    }

    /// Record one bailout. Returns true when this kind just reached the
    /// threshold and the unit should be invalidated.
    pub fn record(&mut self, kind: BailoutKind) -> bool {
        let slot = &mut self.counts[kind.index()];
        *slot += 1;
        *slot == self.threshold
    }

    pub fn count(&self, kind: BailoutKind) -> u32 {
        self.counts[kind.index()]
    }
}

/// Shared non-reentrancy flag for one compiled unit.
#[derive(Debug, Default)]
pub struct UnitStatus {
    invalidated: AtomicBool,
}

impl UnitStatus {
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    fn invalidate(&self) -> bool {
        !self.invalidated.swap(true, Ordering::AcqRel)
    }
}

/// An entry into a compiled unit. Holders check [`Activation::still_valid`]
/// at every bailout and return; a false answer means the unit was
/// invalidated underneath them and the frame must unwind.
#[derive(Debug)]
pub struct Activation {
    pub script: ScriptId,
    unit: Arc<UnitStatus>,
}

impl Activation {
    pub fn still_valid(&self) -> bool {
        !self.unit.is_invalidated()
    }
}

/// Registry of live compiled units, keyed by script.
#[derive(Debug, Default)]
pub struct InvalidationRegistry {
    units: Mutex<FxHashMap<ScriptId, Arc<UnitStatus>>>,
}

impl InvalidationRegistry {
    pub fn new() -> InvalidationRegistry {
        InvalidationRegistry::default()
    }

    /// Publish a fresh unit for `script`, replacing any previous one.
    /// The old unit's status stays invalidated for whoever still holds it.
    pub fn register(&self, script: ScriptId) -> Arc<UnitStatus> {
        let status = Arc::new(UnitStatus::default());
        if let Some(old) = self.units.lock().insert(script, Arc::clone(&status)) {
            old.invalidate();
        }
        status
    }

    pub fn status(&self, script: ScriptId) -> Option<Arc<UnitStatus>> {
        self.units.lock().get(&script).cloned()
    }

    /// Mark `script`'s unit non-reentrant. Returns true the first time,
    /// false when the unit was already invalidated or never registered.
    pub fn invalidate(&self, script: ScriptId) -> bool {
        let status = match self.status(script) {
            Some(status) => status,
            None => return false,
        };
        let first = status.invalidate();
        if first {
            debug!(script = script.0, "invalidating compiled unit");
        }
        first
    }

    pub fn is_invalidated(&self, script: ScriptId) -> bool {
        self.status(script).is_some_and(|s| s.is_invalidated())
    }

    /// Enter a unit. Invalidated units are non-reentrant, so this fails
    /// once the flag is set.
    pub fn enter(&self, script: ScriptId) -> Option<Activation> {
        let unit = self.status(script)?;
        if unit.is_invalidated() {
            return None;
        }
        Some(Activation { script, unit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ScriptBuilder;
    use crate::ir::{InstrKind, IrType};

    fn table_with(snapshots: Vec<Snapshot>) -> SnapshotTable {
        SnapshotTable { snapshots }
    }

    #[test]
    fn table_encodes_constants_and_machine_slots() {
        let script = ScriptBuilder::new(1, 0).finish(ScriptId(0));
        let mut g = Graph::new(1, 0);
        let b0 = g.add_block(Pc(0));
        let param = g.add_instr(b0, InstrKind::Parameter { index: 0 }, IrType::Value, &[]);
        let c = g.add_instr(
            b0,
            InstrKind::Constant { value: ConstValue::Int32(3) },
            IrType::Int32,
            &[],
        );
        let rp = g.add_resume_point(b0, Pc(4), ResumeMode::After, vec![param, c]);

        let table = SnapshotTable::from_graph(&g, &script);
        let snapshot = table.snapshot(SnapshotTable::offset_of(rp)).unwrap();
        assert_eq!(snapshot.pc, Pc(4));
        assert_eq!(snapshot.mode, ResumeMode::After);
        assert_eq!(
            snapshot.slots,
            vec![SlotSource::Machine(param.0), SlotSource::Constant(Value::Int32(3))]
        );
    }

    #[test]
    fn frame_materializes_and_resume_mode_picks_the_pc() {
        let table = table_with(vec![
            Snapshot {
                pc: Pc(2),
                mode: ResumeMode::At,
                slots: vec![SlotSource::Machine(7), SlotSource::Constant(Value::Boolean(true))],
            },
            Snapshot { pc: Pc(2), mode: ResumeMode::After, slots: vec![SlotSource::Machine(9)] },
        ]);
        let mut machine = MachineSlots::new();
        machine.set(7, Value::Int32(41));

        // At retries the faulting op.
        let frame =
            take_bailout(&table, NativeOffset(0), BailoutKind::Overflow, &machine).unwrap();
        assert_eq!(frame.pc, Pc(2));
        assert_eq!(frame.slots, vec![Value::Int32(41), Value::Boolean(true)]);

        // After resumes at the next op; slot 9 was never written.
        let frame =
            take_bailout(&table, NativeOffset(1), BailoutKind::ShapeGuard, &machine).unwrap();
        assert_eq!(frame.pc, Pc(3));
        assert_eq!(frame.slots, vec![Value::Undefined]);
    }

    #[test]
    fn unknown_offset_is_an_error() {
        let table = table_with(Vec::new());
        let err = take_bailout(&table, NativeOffset(5), BailoutKind::BoundsCheck, &MachineSlots::new());
        assert_eq!(err, Err(BailoutError::UnknownOffset(5)));
    }

    #[test]
    fn snapshot_table_round_trips_through_serde() {
        let table = table_with(vec![Snapshot {
            pc: Pc(1),
            mode: ResumeMode::At,
            slots: vec![
                SlotSource::Constant(Value::Str("x".to_string())),
                SlotSource::Machine(12),
            ],
        }]);
        let json = serde_json::to_string(&table).unwrap();
        let back: SnapshotTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn tally_reports_the_threshold_crossing_once() {
        let mut options = CompileOptions::default();
        options.bailout_threshold = 3;
        let mut tally = BailoutTally::new(&options);
        assert!(!tally.record(BailoutKind::Overflow));
        assert!(!tally.record(BailoutKind::Overflow));
        // Other kinds count separately.
        assert!(!tally.record(BailoutKind::BoundsCheck));
        assert!(tally.record(BailoutKind::Overflow));
        assert!(!tally.record(BailoutKind::Overflow));
        assert_eq!(tally.count(BailoutKind::Overflow), 4);
    }

    #[test]
    fn invalidation_is_sticky_and_blocks_reentry() {
        let registry = InvalidationRegistry::new();
        let script = ScriptId(3);
        registry.register(script);

        let activation = registry.enter(script).unwrap();
        assert!(activation.still_valid());

        assert!(registry.invalidate(script));
        assert!(!registry.invalidate(script));
        assert!(registry.is_invalidated(script));

        // The live activation sees the flag and must unwind; new entries
        // are refused outright.
        assert!(!activation.still_valid());
        assert!(registry.enter(script).is_none());
    }

    #[test]
    fn recompiling_replaces_the_unit_and_retires_the_old_one() {
        let registry = InvalidationRegistry::new();
        let script = ScriptId(0);
        let old = registry.register(script);
        let activation = registry.enter(script).unwrap();

        registry.register(script);
        assert!(old.is_invalidated());
        assert!(!activation.still_valid());
        assert!(!registry.is_invalidated(script));
        assert!(registry.enter(script).is_some());
    }
}
