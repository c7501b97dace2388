//! Vesper optimizing JIT core.
//!
//! The crate covers the speculative middle of a JavaScript-style JIT:
//! - **Bytecode**: stack-machine scripts with source notes (`bytecode` module)
//! - **Builder**: single-pass bytecode to SSA translation (`builder` module)
//! - **IR**: the control-flow graph, instructions and dominators (`ir` module)
//! - **Range**: integer range analysis and truncation (`range` module)
//! - **ICs**: shape-guarded inline caches (`ic` module)
//! - **Bailouts**: snapshots, deoptimization and invalidation (`bailout` module)
//! - **Pipeline**: the driver tying the passes together (`pipeline` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use vesper_jit::bytecode::{Op, ScriptBuilder, ScriptId};
//! use vesper_jit::context::CompileOptions;
//! use vesper_jit::object::MockObjects;
//! use vesper_jit::oracle::StaticOracle;
//! use vesper_jit::pipeline::Jit;
//!
//! let mut b = ScriptBuilder::new(1, 0);
//! b.op(Op::GetArg(0));
//! b.op(Op::Int32(1));
//! b.op(Op::Add);
//! b.op(Op::Return);
//! let script = b.finish(ScriptId(0));
//!
//! let mut jit = Jit::new(CompileOptions::default());
//! let unit = jit.compile(&script, &StaticOracle::new(), &MockObjects::new(), None)?;
//! ```

pub mod bailout;
pub mod builder;
pub mod bytecode;
pub mod context;
pub mod ic;
pub mod ir;
pub mod object;
pub mod oracle;
pub mod pipeline;
pub mod range;

pub use bailout::{BailoutKind, InterpreterFrame, SnapshotTable};
pub use builder::{AbortReason, GraphBuilder};
pub use context::CompileOptions;
pub use ic::{IcOutcome, IcSite, IcState};
pub use ir::Graph;
pub use pipeline::{BackgroundCompiler, CompiledUnit, Jit};
pub use range::Range;
