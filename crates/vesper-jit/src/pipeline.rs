//! Compilation driver.
//!
//! [`Jit`] owns the tuning knobs, the per-script compile state and the
//! [`InvalidationRegistry`]; [`compile`](Jit::compile) runs the whole
//! pass order on the caller's thread. [`BackgroundCompiler`] runs the
//! same passes on a worker thread from a cloned oracle snapshot, and
//! [`attach`](Jit::attach) revalidates the snapshot's generation before
//! the result is allowed to exist; a stale result is simply dropped.

use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use rustc_hash::FxHashMap;
use tracing::{debug, debug_span, warn};

use crate::bailout::{
    take_bailout, BailoutError, BailoutKind, BailoutTally, InterpreterFrame, InvalidationRegistry,
    FrameReader, NativeOffset, SnapshotTable, UnitStatus,
};
use crate::builder::{AbortReason, GraphBuilder};
use crate::bytecode::{Pc, Script, ScriptId};
use crate::context::CompileOptions;
use crate::ic::{IcOutcome, IcSite};
use crate::ir::{Graph, InstrKind, ValueId};
use crate::object::{ObjectId, ObjectModel, Value};
use crate::oracle::{OracleSnapshot, TypeOracle};
use crate::range::{analyze_ranges, truncate_graph};

/// Everything compilation produces before the unit is published: the
/// optimized graph, its bailout metadata and its cache sites.
#[derive(Debug)]
pub struct CompiledArtifact {
    pub graph: Graph,
    pub snapshots: SnapshotTable,
    ic_sites: Vec<(ValueId, IcSite)>,
}

/// A published compiled unit for one script.
#[derive(Debug)]
pub struct CompiledUnit {
    pub script: ScriptId,
    /// Oracle generation the unit was compiled against.
    pub generation: u64,
    pub graph: Graph,
    pub snapshots: SnapshotTable,
    pub status: Arc<UnitStatus>,
    ic_sites: Vec<(ValueId, IcSite)>,
    tally: BailoutTally,
}

impl CompiledUnit {
    pub fn is_valid(&self) -> bool {
        !self.status.is_invalidated()
    }

    pub fn num_ic_sites(&self) -> usize {
        self.ic_sites.len()
    }

    pub fn ic_site(&self, cache: ValueId) -> Option<&IcSite> {
        self.ic_sites.iter().find(|(v, _)| *v == cache).map(|(_, s)| s)
    }

}

/// Run the full pass order over one script. The oracle snapshot is
/// immutable, so this is safe on any thread.
fn compile_artifact(
    script: &Script,
    oracle: &OracleSnapshot,
    objects: &dyn ObjectModel,
    options: &CompileOptions,
    osr_pc: Option<Pc>,
) -> Result<CompiledArtifact, AbortReason> {
    let span = debug_span!("compile", script = script.id.0);
    let _enter = span.enter();

    let mut graph = GraphBuilder::new(script, oracle, objects, options, osr_pc).build()?;
    analyze_ranges(&mut graph);
    truncate_graph(&mut graph);
    graph.assert_finalized();
    tracing::trace!(graph = %graph, "optimized graph");

    let snapshots = SnapshotTable::from_graph(&graph, script);
    let mut ic_sites = Vec::new();
    for block in graph.block_ids().collect::<Vec<_>>() {
        for &v in &graph.block(block).instrs {
            if let Some(site) = IcSite::from_cache_instr(&graph.instr(v).kind, options) {
                ic_sites.push((v, site));
            }
        }
    }
    debug!(
        blocks = graph.num_blocks(),
        snapshots = snapshots.len(),
        ic_sites = ic_sites.len(),
        "compiled"
    );
    Ok(CompiledArtifact { graph, snapshots, ic_sites })
}

#[derive(Debug, Default)]
struct ScriptState {
    aborts: u32,
    disabled: bool,
}

/// Top-level compiler instance.
pub struct Jit {
    options: CompileOptions,
    registry: InvalidationRegistry,
    scripts: FxHashMap<ScriptId, ScriptState>,
}

impl Jit {
    pub fn new(options: CompileOptions) -> Jit {
        Jit { options, registry: InvalidationRegistry::new(), scripts: FxHashMap::default() }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn registry(&self) -> &InvalidationRegistry {
        &self.registry
    }

    pub fn is_disabled(&self, script: ScriptId) -> bool {
        self.scripts.get(&script).is_some_and(|s| s.disabled)
    }

    /// Compile on the current thread and publish the unit.
    pub fn compile(
        &mut self,
        script: &Script,
        oracle: &dyn TypeOracle,
        objects: &dyn ObjectModel,
        osr_pc: Option<Pc>,
    ) -> Result<CompiledUnit, AbortReason> {
        if self.is_disabled(script.id) {
            return Err(AbortReason::Disabled);
        }
        let snapshot = oracle.snapshot();
        match compile_artifact(script, &snapshot, objects, &self.options, osr_pc) {
            Ok(artifact) => Ok(self.publish(script.id, snapshot.generation, artifact)),
            Err(reason) => {
                self.note_abort(script.id, &reason);
                Err(reason)
            }
        }
    }

    /// Accept a background compilation result. Returns `None` when the
    /// result aborted or was compiled against an outdated oracle; a stale
    /// unit must never run, so it is dropped here.
    pub fn attach(&mut self, result: CompileResult, oracle: &dyn TypeOracle) -> Option<CompiledUnit> {
        let artifact = match result.outcome {
            Ok(artifact) => artifact,
            Err(reason) => {
                self.note_abort(result.script, &reason);
                return None;
            }
        };
        if result.generation != oracle.generation() {
            debug!(
                script = result.script.0,
                compiled = result.generation,
                current = oracle.generation(),
                "dropping stale compilation result"
            );
            return None;
        }
        Some(self.publish(result.script, result.generation, artifact))
    }

    fn publish(&mut self, script: ScriptId, generation: u64, artifact: CompiledArtifact) -> CompiledUnit {
        let status = self.registry.register(script);
        CompiledUnit {
            script,
            generation,
            graph: artifact.graph,
            snapshots: artifact.snapshots,
            status,
            ic_sites: artifact.ic_sites,
            tally: BailoutTally::new(&self.options),
        }
    }

    fn note_abort(&mut self, script: ScriptId, reason: &AbortReason) {
        let state = self.scripts.entry(script).or_default();
        state.aborts += 1;
        if state.aborts >= self.options.max_compile_aborts && !state.disabled {
            warn!(script = script.0, %reason, "disabling script after repeated aborts");
            state.disabled = true;
        }
    }

    /// Handle a guard failure in `unit`: rebuild the interpreter frame
    /// and invalidate the unit once a bailout kind passes its threshold.
    pub fn bailout(
        &self,
        unit: &mut CompiledUnit,
        offset: NativeOffset,
        kind: BailoutKind,
        reader: &dyn FrameReader,
    ) -> Result<InterpreterFrame, BailoutError> {
        let frame = take_bailout(&unit.snapshots, offset, kind, reader)?;
        if unit.tally.record(kind) {
            self.registry.invalidate(unit.script);
        }
        Ok(frame)
    }

    /// Run a cached property read through the unit's site for `cache`.
    /// Falls back to the generic read when the instruction has no site.
    pub fn ic_get(
        &self,
        unit: &mut CompiledUnit,
        cache: ValueId,
        objects: &mut dyn ObjectModel,
        obj: ObjectId,
    ) -> Value {
        let script = unit.script;
        let Some(index) = unit.ic_sites.iter().position(|(v, _)| *v == cache) else {
            let name = match unit.graph.instr(cache).kind {
                InstrKind::GetPropertyCache { name, .. } | InstrKind::GetNameCache { name } => name,
                _ => return Value::Undefined,
            };
            return objects.generic_get(obj, name);
        };
        let (value, outcome) = unit.ic_sites[index].1.get(objects, obj);
        if outcome == IcOutcome::InvalidateUnit {
            self.registry.invalidate(script);
        }
        value
    }

    /// Run a cached property write through the unit's site for `cache`.
    pub fn ic_set(
        &self,
        unit: &mut CompiledUnit,
        cache: ValueId,
        objects: &mut dyn ObjectModel,
        obj: ObjectId,
        value: Value,
    ) {
        let script = unit.script;
        if let Some(index) = unit.ic_sites.iter().position(|(v, _)| *v == cache) {
            if unit.ic_sites[index].1.set(objects, obj, value) == IcOutcome::InvalidateUnit {
                self.registry.invalidate(script);
            }
        } else if let InstrKind::SetPropertyCache { name } = unit.graph.instr(cache).kind {
            objects.generic_set(obj, name, value);
        }
    }
}

struct CompileRequest {
    script: Script,
    oracle: OracleSnapshot,
    osr_pc: Option<Pc>,
}

/// Output of one background compilation.
#[derive(Debug)]
pub struct CompileResult {
    pub script: ScriptId,
    pub generation: u64,
    pub osr_pc: Option<Pc>,
    pub outcome: Result<CompiledArtifact, AbortReason>,
}

/// Worker thread running [`compile_artifact`] off the main thread. Each
/// request carries its own oracle snapshot, so the worker never touches
/// live oracle state; staleness is decided at attach time.
pub struct BackgroundCompiler {
    requests: Option<Sender<CompileRequest>>,
    results: Receiver<CompileResult>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BackgroundCompiler {
    pub fn new(options: CompileOptions, objects: Arc<dyn ObjectModel + Send + Sync>) -> BackgroundCompiler {
        let (req_tx, req_rx) = channel::unbounded::<CompileRequest>();
        let (res_tx, res_rx) = channel::unbounded();
        let worker = thread::spawn(move || {
            for req in req_rx.iter() {
                let outcome =
                    compile_artifact(&req.script, &req.oracle, &*objects, &options, req.osr_pc);
                let result = CompileResult {
                    script: req.script.id,
                    generation: req.oracle.generation,
                    osr_pc: req.osr_pc,
                    outcome,
                };
                if res_tx.send(result).is_err() {
                    break;
                }
            }
        });
        BackgroundCompiler { requests: Some(req_tx), results: res_rx, worker: Some(worker) }
    }

    /// Queue a script. The oracle is snapshotted here, on the requesting
    /// thread, so the worker sees a consistent view.
    pub fn enqueue(&self, script: Script, oracle: &dyn TypeOracle, osr_pc: Option<Pc>) -> bool {
        let request = CompileRequest { script, oracle: oracle.snapshot(), osr_pc };
        self.requests.as_ref().is_some_and(|tx| tx.send(request).is_ok())
    }

    /// Non-blocking poll for a finished compilation.
    pub fn poll(&self) -> Option<CompileResult> {
        self.results.try_recv().ok()
    }

    /// Block until the next compilation finishes. `None` once the worker
    /// has shut down.
    pub fn wait(&self) -> Option<CompileResult> {
        self.results.recv().ok()
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        // Closing the request channel stops the worker loop.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
