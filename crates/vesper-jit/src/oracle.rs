//! Type feedback consumed by the builder.
//!
//! The compiler only ever reads an [`OracleSnapshot`], a deep copy of the
//! profiler's type sets taken on the main thread. Background compilations
//! keep their snapshot alive for the whole compile, so the profiler may
//! keep appending to its live sets concurrently. An empty set always means
//! "no information observed", never "provably none".

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::Pc;
use crate::ir::{ElementKind, IrType};
use crate::object::ShapeId;

/// An observed set of types and (for objects) shapes at one site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeSet {
    types: Vec<IrType>,
    shapes: Vec<ShapeId>,
}

impl TypeSet {
    pub fn new() -> TypeSet {
        TypeSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty() && self.shapes.is_empty()
    }

    pub fn add_type(&mut self, ty: IrType) {
        if !self.types.contains(&ty) {
            self.types.push(ty);
        }
    }

    pub fn add_shape(&mut self, shape: ShapeId) {
        if !self.shapes.contains(&shape) {
            self.shapes.push(shape);
        }
    }

    /// The single observed type, if the set is monomorphic.
    pub fn known_type(&self) -> Option<IrType> {
        match self.types.as_slice() {
            [ty] => Some(*ty),
            _ => None,
        }
    }

    /// The single observed shape, if the set is monomorphic.
    pub fn known_shape(&self) -> Option<ShapeId> {
        match self.shapes.as_slice() {
            [shape] => Some(*shape),
            _ => None,
        }
    }

    pub fn shapes(&self) -> &[ShapeId] {
        &self.shapes
    }
}

/// Observed operand and result types of a binary op.
#[derive(Debug, Clone, Copy)]
pub struct BinaryTypes {
    pub lhs: IrType,
    pub rhs: IrType,
    pub result: IrType,
}

impl BinaryTypes {
    pub fn unknown() -> BinaryTypes {
        BinaryTypes { lhs: IrType::Value, rhs: IrType::Value, result: IrType::Value }
    }

    pub fn int32() -> BinaryTypes {
        BinaryTypes { lhs: IrType::Int32, rhs: IrType::Int32, result: IrType::Int32 }
    }

    pub fn double() -> BinaryTypes {
        BinaryTypes { lhs: IrType::Double, rhs: IrType::Double, result: IrType::Double }
    }
}

/// Profiler interface. `snapshot` must deep-copy every type set it hands
/// out; the generation counter lets `attach` detect feedback that moved
/// underneath a background compilation.
pub trait TypeOracle: Send + Sync {
    fn generation(&self) -> u64;
    fn snapshot(&self) -> OracleSnapshot;
}

/// Cloned, immutable type feedback for one compilation.
#[derive(Debug, Clone, Default)]
pub struct OracleSnapshot {
    pub generation: u64,
    arg_types: Vec<IrType>,
    binary: FxHashMap<u32, BinaryTypes>,
    property: FxHashMap<u32, TypeSet>,
    result_types: FxHashMap<u32, IrType>,
    pure_properties: FxHashSet<u32>,
    dense_elements: FxHashMap<u32, IrType>,
    typed_elements: FxHashMap<u32, ElementKind>,
    osr_types: FxHashMap<u32, Vec<Option<IrType>>>,
}

impl OracleSnapshot {
    pub fn arg_type(&self, index: u16) -> IrType {
        self.arg_types.get(index as usize).copied().unwrap_or(IrType::Value)
    }

    pub fn binary_types(&self, pc: Pc) -> BinaryTypes {
        self.binary.get(&pc.0).copied().unwrap_or_else(BinaryTypes::unknown)
    }

    /// Shapes observed flowing into a property access.
    pub fn property_types(&self, pc: Pc) -> Option<&TypeSet> {
        self.property.get(&pc.0)
    }

    /// Observed result type of the op at `pc`.
    pub fn result_type(&self, pc: Pc) -> IrType {
        self.result_types.get(&pc.0).copied().unwrap_or(IrType::Value)
    }

    /// True when every observed read at `pc` was a plain data slot, so an
    /// idempotent cache may serve it.
    pub fn property_is_pure(&self, pc: Pc) -> bool {
        self.pure_properties.contains(&pc.0)
    }

    /// Element type when every observed receiver was a dense array.
    pub fn dense_element(&self, pc: Pc) -> Option<IrType> {
        self.dense_elements.get(&pc.0).copied()
    }

    /// Element kind when every observed receiver was a typed array.
    pub fn typed_element(&self, pc: Pc) -> Option<ElementKind> {
        self.typed_elements.get(&pc.0).copied()
    }

    /// Speculated unboxed types of the frame slots at an OSR entry.
    /// `None` for a slot means the cold frame disagreed; it stays boxed.
    pub fn osr_slot_types(&self, pc: Pc) -> Option<&[Option<IrType>]> {
        self.osr_types.get(&pc.0).map(Vec::as_slice)
    }
}

/// Programmable oracle backing unit and integration tests, and the
/// simplest possible host implementation.
#[derive(Debug, Default)]
pub struct StaticOracle {
    inner: RwLock<StaticOracleData>,
}

#[derive(Debug, Default)]
struct StaticOracleData {
    generation: u64,
    snapshot: OracleSnapshot,
}

impl StaticOracle {
    pub fn new() -> StaticOracle {
        StaticOracle::default()
    }

    pub fn set_arg_types(&self, types: Vec<IrType>) {
        self.inner.write().snapshot.arg_types = types;
    }

    pub fn set_binary_types(&self, pc: Pc, types: BinaryTypes) {
        self.inner.write().snapshot.binary.insert(pc.0, types);
    }

    pub fn set_property_types(&self, pc: Pc, set: TypeSet) {
        self.inner.write().snapshot.property.insert(pc.0, set);
    }

    pub fn set_result_type(&self, pc: Pc, ty: IrType) {
        self.inner.write().snapshot.result_types.insert(pc.0, ty);
    }

    pub fn mark_property_pure(&self, pc: Pc) {
        self.inner.write().snapshot.pure_properties.insert(pc.0);
    }

    pub fn set_dense_element(&self, pc: Pc, ty: IrType) {
        self.inner.write().snapshot.dense_elements.insert(pc.0, ty);
    }

    pub fn set_typed_element(&self, pc: Pc, kind: ElementKind) {
        self.inner.write().snapshot.typed_elements.insert(pc.0, kind);
    }

    pub fn set_osr_slot_types(&self, pc: Pc, types: Vec<Option<IrType>>) {
        self.inner.write().snapshot.osr_types.insert(pc.0, types);
    }

    /// Simulates new feedback arriving, e.g. a shape the compiler has not
    /// seen. Any in-flight compilation becomes stale.
    pub fn bump_generation(&self) {
        self.inner.write().generation += 1;
    }
}

impl TypeOracle for StaticOracle {
    fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    fn snapshot(&self) -> OracleSnapshot {
        let inner = self.inner.read();
        let mut snapshot = inner.snapshot.clone();
        snapshot.generation = inner.generation;
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_means_no_information() {
        let set = TypeSet::new();
        assert!(set.is_empty());
        assert_eq!(set.known_type(), None);
        assert_eq!(set.known_shape(), None);
    }

    #[test]
    fn monomorphic_sets() {
        let mut set = TypeSet::new();
        set.add_shape(ShapeId(3));
        set.add_shape(ShapeId(3));
        assert_eq!(set.known_shape(), Some(ShapeId(3)));
        set.add_shape(ShapeId(4));
        assert_eq!(set.known_shape(), None);
        assert_eq!(set.shapes().len(), 2);
    }

    #[test]
    fn snapshot_is_isolated_from_later_updates() {
        let oracle = StaticOracle::new();
        oracle.set_binary_types(Pc(4), BinaryTypes::int32());
        let snap = oracle.snapshot();

        oracle.set_binary_types(Pc(4), BinaryTypes::double());
        oracle.bump_generation();

        assert_eq!(snap.binary_types(Pc(4)).result, IrType::Int32);
        assert_eq!(snap.generation, 0);
        assert_eq!(oracle.generation(), 1);
    }

    #[test]
    fn defaults_are_boxed() {
        let snap = OracleSnapshot::default();
        assert_eq!(snap.arg_type(2), IrType::Value);
        assert_eq!(snap.binary_types(Pc(0)).result, IrType::Value);
        assert!(!snap.property_is_pure(Pc(0)));
        assert!(snap.dense_element(Pc(0)).is_none());
    }
}
