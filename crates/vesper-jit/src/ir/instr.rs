//! SSA instructions.
//!
//! An [`Instr`] is a struct whose behavior is selected by the closed
//! [`InstrKind`] union. Adding a kind means the compiler points at every
//! exhaustive match that must be extended, so per-kind queries like
//! [`InstrKind::has_side_effects`] can never silently fall out of date.

use crate::bytecode::NameId;
use crate::object::ShapeId;
use crate::range::Range;

use super::types::IrType;
use super::{BlockId, ResumePointId, ValueId};

/// A compile-time constant embedded in the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int32(i32),
    Double(f64),
    Boolean(bool),
    Str(NameId),
    Undefined,
}

impl ConstValue {
    pub fn ty(&self) -> IrType {
        match self {
            ConstValue::Int32(_) => IrType::Int32,
            ConstValue::Double(_) => IrType::Double,
            ConstValue::Boolean(_) => IrType::Boolean,
            ConstValue::Str(_) => IrType::Str,
            ConstValue::Undefined => IrType::Value,
        }
    }

    pub fn as_int32(&self) -> Option<i32> {
        match self {
            ConstValue::Int32(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            ConstValue::Double(n) => Some(*n),
            _ => None,
        }
    }
}

/// Comparison operator carried by `InstrKind::Compare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

impl CompareOp {
    /// The operator tested on the false edge of a branch.
    pub fn negate(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Ge => CompareOp::Lt,
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::StrictEq => CompareOp::StrictNe,
            CompareOp::StrictNe => CompareOp::StrictEq,
        }
    }

    /// The operator with its operands swapped.
    pub fn reverse(self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::Le => CompareOp::Ge,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::Ge => CompareOp::Le,
            other => other,
        }
    }
}

/// Storage kind of a typed (binary) array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float64,
}

impl ElementKind {
    pub fn ir_type(self) -> IrType {
        match self {
            ElementKind::Float64 | ElementKind::Uint32 => IrType::Double,
            _ => IrType::Int32,
        }
    }
}

/// Whether an unbox may fail at runtime (and therefore guards).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnboxMode {
    Fallible,
    Infallible,
}

/// Closed set of instruction kinds. Operand counts are fixed per kind and
/// documented next to each variant; operands themselves live on [`Instr`].
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    /// Function entry marker. No operands.
    Start,
    /// On-stack-replacement entry marker. No operands.
    OsrEntry,
    /// Reads frame slot `slot` from the unoptimized frame. Operand: the
    /// `OsrEntry`.
    OsrValue { slot: u16 },
    /// Formal argument `index`. No operands.
    Parameter { index: u16 },
    /// Constant. No operands.
    Constant { value: ConstValue },
    /// Join of one value per predecessor.
    Phi,
    /// Range refinement pinned at a block start. Operand: the refined value.
    Beta { range: Range },

    /// Binary arithmetic. Operands: lhs, rhs.
    Add,
    Sub,
    Mul { can_be_negative_zero: bool },
    Div { can_be_negative_zero: bool },
    Mod,
    /// Unary numeric. Operand: input.
    Neg,
    Abs,

    /// Bitwise binary. Operands: lhs, rhs.
    BitAnd,
    BitOr,
    BitXor,
    Lsh,
    Rsh,
    Ursh,
    /// Operand: input.
    BitNot,

    /// Operands: lhs, rhs.
    Compare { op: CompareOp },
    /// Operand: input.
    Not,

    /// Conversions. Operand: input.
    ToDouble,
    ToInt32,
    TruncateToInt32,
    BoxValue,
    Unbox { mode: UnboxMode },

    /// Guards. `BoundsCheck` operands: index, length. `BoundsCheckLower`
    /// operand: index. `ShapeGuard` operand: object.
    BoundsCheck { minimum: i32, maximum: i32 },
    BoundsCheckLower { minimum: i32 },
    ShapeGuard { shape: ShapeId },

    /// Slot and element access. Slot ops operand: object (+ value for
    /// stores). Element ops operands: elements-object, index (+ value).
    LoadSlot { slot: u32 },
    StoreSlot { slot: u32 },
    LoadElement,
    StoreElement,
    LoadTypedElement { kind: ElementKind },
    StoreTypedElement { kind: ElementKind },
    /// Operand: input. Clamps a number into 0..=255 for clamped stores.
    ClampToUint8,

    /// Length queries. Operand: object (string for `StringLength`).
    ArrayLength,
    InitializedLength,
    TypedLength,
    StringLength,
    /// Operands: string, index.
    CharCodeAt,

    /// Generic call. Operands: callee, then `argc` arguments.
    Call { argc: u16 },

    /// Property caches, dispatched through per-site stub tables at runtime.
    /// Operand: object (+ value for set).
    GetPropertyCache { name: NameId, idempotent: bool },
    SetPropertyCache { name: NameId },
    /// No operands; looks `name` up in the scope.
    GetNameCache { name: NameId },
    /// Operands: object, index (+ value for set).
    GetElementCache,
    SetElementCache,
}

impl InstrKind {
    /// True when execution order is observable: the instruction writes
    /// memory or can run arbitrary code. Effectful instructions carry a
    /// resume-after point and never move.
    pub fn has_side_effects(&self) -> bool {
        match self {
            InstrKind::StoreSlot { .. }
            | InstrKind::StoreElement
            | InstrKind::StoreTypedElement { .. }
            | InstrKind::Call { .. }
            | InstrKind::SetPropertyCache { .. }
            | InstrKind::GetNameCache { .. }
            | InstrKind::GetElementCache
            | InstrKind::SetElementCache => true,
            InstrKind::GetPropertyCache { idempotent, .. } => !idempotent,
            _ => false,
        }
    }

    /// True when the instruction must stay in the graph even if unused,
    /// because it observes a runtime condition and bails out on failure.
    pub fn is_guard(&self) -> bool {
        match self {
            InstrKind::BoundsCheck { .. }
            | InstrKind::BoundsCheckLower { .. }
            | InstrKind::ShapeGuard { .. } => true,
            InstrKind::Unbox { mode } => *mode == UnboxMode::Fallible,
            _ => false,
        }
    }

    /// Short name used by the textual dump.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            InstrKind::Start => "start",
            InstrKind::OsrEntry => "osrentry",
            InstrKind::OsrValue { .. } => "osrvalue",
            InstrKind::Parameter { .. } => "parameter",
            InstrKind::Constant { .. } => "constant",
            InstrKind::Phi => "phi",
            InstrKind::Beta { .. } => "beta",
            InstrKind::Add => "add",
            InstrKind::Sub => "sub",
            InstrKind::Mul { .. } => "mul",
            InstrKind::Div { .. } => "div",
            InstrKind::Mod => "mod",
            InstrKind::Neg => "neg",
            InstrKind::Abs => "abs",
            InstrKind::BitAnd => "bitand",
            InstrKind::BitOr => "bitor",
            InstrKind::BitXor => "bitxor",
            InstrKind::Lsh => "lsh",
            InstrKind::Rsh => "rsh",
            InstrKind::Ursh => "ursh",
            InstrKind::BitNot => "bitnot",
            InstrKind::Compare { .. } => "compare",
            InstrKind::Not => "not",
            InstrKind::ToDouble => "todouble",
            InstrKind::ToInt32 => "toint32",
            InstrKind::TruncateToInt32 => "truncate",
            InstrKind::BoxValue => "box",
            InstrKind::Unbox { .. } => "unbox",
            InstrKind::BoundsCheck { .. } => "boundscheck",
            InstrKind::BoundsCheckLower { .. } => "boundschecklower",
            InstrKind::ShapeGuard { .. } => "shapeguard",
            InstrKind::LoadSlot { .. } => "loadslot",
            InstrKind::StoreSlot { .. } => "storeslot",
            InstrKind::LoadElement => "loadelement",
            InstrKind::StoreElement => "storeelement",
            InstrKind::LoadTypedElement { .. } => "loadtypedelement",
            InstrKind::StoreTypedElement { .. } => "storetypedelement",
            InstrKind::ClampToUint8 => "clamptouint8",
            InstrKind::ArrayLength => "arraylength",
            InstrKind::InitializedLength => "initializedlength",
            InstrKind::TypedLength => "typedlength",
            InstrKind::StringLength => "stringlength",
            InstrKind::CharCodeAt => "charcodeat",
            InstrKind::Call { .. } => "call",
            InstrKind::GetPropertyCache { .. } => "getpropertycache",
            InstrKind::SetPropertyCache { .. } => "setpropertycache",
            InstrKind::GetNameCache { .. } => "getnamecache",
            InstrKind::GetElementCache => "getelementcache",
            InstrKind::SetElementCache => "setelementcache",
        }
    }
}

/// One entry in a definition's use list. Resume-point slots and block
/// terminators count as uses so that rewrites can never miss them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseSite {
    /// Operand `index` of instruction `user`.
    Def { user: ValueId, index: usize },
    /// Slot `index` of resume point `rp`.
    Resume { rp: ResumePointId, index: usize },
    /// Operand `index` of the terminator of `block`.
    Term { block: BlockId, index: usize },
}

/// An SSA instruction or phi.
#[derive(Debug, Clone)]
pub struct Instr {
    pub kind: InstrKind,
    pub ty: IrType,
    pub operands: Vec<ValueId>,
    pub uses: Vec<UseSite>,
    pub range: Option<Range>,
    /// Resume-after point, present on every effectful instruction.
    pub resume_after: Option<ResumePointId>,
    pub block: BlockId,
    /// Kept alive even if unused (runtime condition observed).
    pub guard: bool,
    pub movable: bool,
    /// Integer wraparound on this instruction is unobservable.
    pub truncated: bool,
    /// An optimization dropped a use; observable-use analysis must then
    /// treat resume-point captures as observers.
    pub use_removed: bool,
    pub in_worklist: bool,
}

impl Instr {
    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstrKind::Phi)
    }

    pub fn is_effectful(&self) -> bool {
        self.kind.has_side_effects()
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, InstrKind::Constant { .. })
    }

    pub fn const_value(&self) -> Option<&ConstValue> {
        match &self.kind {
            InstrKind::Constant { value } => Some(value),
            _ => None,
        }
    }

    /// The constant int32 this instruction evaluates to, if any.
    pub fn as_int32_constant(&self) -> Option<i32> {
        self.const_value().and_then(ConstValue::as_int32)
    }

    /// True when operand `index` only feeds an int32 truncation, so the
    /// producer may legally wrap around instead of overflowing.
    pub fn is_operand_truncated(&self, index: usize) -> bool {
        match self.kind {
            InstrKind::TruncateToInt32
            | InstrKind::BitAnd
            | InstrKind::BitOr
            | InstrKind::BitXor
            | InstrKind::Lsh
            | InstrKind::Rsh
            | InstrKind::Ursh
            | InstrKind::BitNot => true,
            InstrKind::Add | InstrKind::Sub | InstrKind::Mul { .. } => self.truncated,
            // A ToDouble already retyped to int32 passes truncation through.
            InstrKind::ToDouble => self.ty == IrType::Int32,
            InstrKind::StoreTypedElement { kind } => {
                // Value operand of an integer typed store; index 2 is the value.
                index == 2 && kind != ElementKind::Float64
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_negate_roundtrip() {
        for op in [
            CompareOp::Lt,
            CompareOp::Le,
            CompareOp::Gt,
            CompareOp::Ge,
            CompareOp::Eq,
            CompareOp::Ne,
        ] {
            assert_eq!(op.negate().negate(), op);
            assert_eq!(op.reverse().reverse(), op);
        }
    }

    #[test]
    fn effectful_kinds() {
        assert!(InstrKind::StoreElement.has_side_effects());
        assert!(InstrKind::Call { argc: 0 }.has_side_effects());
        assert!(!InstrKind::Add.has_side_effects());
        assert!(InstrKind::GetPropertyCache { name: NameId(0), idempotent: false }
            .has_side_effects());
        assert!(!InstrKind::GetPropertyCache { name: NameId(0), idempotent: true }
            .has_side_effects());
    }

    #[test]
    fn guard_kinds() {
        assert!(InstrKind::BoundsCheck { minimum: 0, maximum: 0 }.is_guard());
        assert!(InstrKind::Unbox { mode: UnboxMode::Fallible }.is_guard());
        assert!(!InstrKind::Unbox { mode: UnboxMode::Infallible }.is_guard());
        assert!(!InstrKind::LoadElement.is_guard());
    }
}
