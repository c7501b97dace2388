//! Object-model seam between the compiler and the host runtime.
//!
//! The compiler never looks inside objects; everything it needs flows
//! through [`ObjectModel`]. [`MockObjects`] is the in-crate implementation
//! used by tests and by the inline-cache engine's unit tests.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::bytecode::NameId;

/// Identity of an object's layout. Two objects with the same shape have
/// the same properties at the same slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

/// A boxed runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Undefined,
    Int32(i32),
    Double(f64),
    Boolean(bool),
    Str(String),
    Object(ObjectId),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Int32(n) => *n != 0,
            Value::Double(n) => *n != 0.0 && !n.is_nan(),
            Value::Boolean(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }
}

/// Where a property lives on objects of a given shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyLocation {
    /// Inline slot at a fixed offset.
    FixedSlot(u32),
    /// Slot in the out-of-line slot array.
    DynamicSlot(u32),
    /// Getter/setter pair; reading or writing runs arbitrary code.
    Accessor,
}

impl PropertyLocation {
    /// True when a read from this location cannot run code.
    pub fn is_pure_read(&self) -> bool {
        !matches!(self, PropertyLocation::Accessor)
    }
}

/// Host runtime interface for shapes, slots and generic property access.
pub trait ObjectModel {
    fn shape_of(&self, obj: ObjectId) -> ShapeId;
    fn lookup(&self, shape: ShapeId, name: NameId) -> Option<PropertyLocation>;
    /// Read a slot directly; only valid for non-accessor locations.
    fn read_slot(&self, obj: ObjectId, loc: PropertyLocation) -> Value;
    fn write_slot(&mut self, obj: ObjectId, loc: PropertyLocation, value: Value);
    /// Full property read, running accessors if needed.
    fn generic_get(&mut self, obj: ObjectId, name: NameId) -> Value;
    fn generic_set(&mut self, obj: ObjectId, name: NameId, value: Value);
}

#[derive(Debug, Clone, Default)]
struct MockShape {
    layout: FxHashMap<NameId, PropertyLocation>,
}

#[derive(Debug, Clone)]
struct MockObject {
    shape: ShapeId,
    slots: Vec<Value>,
}

/// Table-backed object model. Accessor reads return `Undefined` and are
/// counted, so tests can assert whether a path stayed side-effect-free.
#[derive(Debug, Default)]
pub struct MockObjects {
    shapes: Vec<MockShape>,
    objects: Vec<MockObject>,
    pub accessor_calls: u32,
}

impl MockObjects {
    pub fn new() -> MockObjects {
        MockObjects::default()
    }

    pub fn add_shape(&mut self, layout: &[(NameId, PropertyLocation)]) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        let mut shape = MockShape::default();
        for &(name, loc) in layout {
            shape.layout.insert(name, loc);
        }
        self.shapes.push(shape);
        id
    }

    pub fn add_object(&mut self, shape: ShapeId, slots: Vec<Value>) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(MockObject { shape, slots });
        id
    }

    fn slot_index(loc: PropertyLocation) -> usize {
        match loc {
            PropertyLocation::FixedSlot(i) | PropertyLocation::DynamicSlot(i) => i as usize,
            PropertyLocation::Accessor => unreachable!("accessor has no slot"),
        }
    }
}

impl ObjectModel for MockObjects {
    fn shape_of(&self, obj: ObjectId) -> ShapeId {
        self.objects[obj.0 as usize].shape
    }

    fn lookup(&self, shape: ShapeId, name: NameId) -> Option<PropertyLocation> {
        self.shapes[shape.0 as usize].layout.get(&name).copied()
    }

    fn read_slot(&self, obj: ObjectId, loc: PropertyLocation) -> Value {
        let index = Self::slot_index(loc);
        self.objects[obj.0 as usize].slots[index].clone()
    }

    fn write_slot(&mut self, obj: ObjectId, loc: PropertyLocation, value: Value) {
        let index = Self::slot_index(loc);
        self.objects[obj.0 as usize].slots[index] = value;
    }

    fn generic_get(&mut self, obj: ObjectId, name: NameId) -> Value {
        let shape = self.shape_of(obj);
        match self.lookup(shape, name) {
            Some(PropertyLocation::Accessor) => {
                self.accessor_calls += 1;
                Value::Undefined
            }
            Some(loc) => self.read_slot(obj, loc),
            None => Value::Undefined,
        }
    }

    fn generic_set(&mut self, obj: ObjectId, name: NameId, value: Value) {
        let shape = self.shape_of(obj);
        match self.lookup(shape, name) {
            Some(PropertyLocation::Accessor) => {
                self.accessor_calls += 1;
            }
            Some(loc) => self.write_slot(obj, loc, value),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_objects_slot_access() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
        let obj = objs.add_object(shape, vec![Value::Int32(7)]);

        assert_eq!(objs.shape_of(obj), shape);
        assert_eq!(objs.lookup(shape, name), Some(PropertyLocation::FixedSlot(0)));
        assert_eq!(objs.generic_get(obj, name), Value::Int32(7));
        assert_eq!(objs.accessor_calls, 0);

        objs.generic_set(obj, name, Value::Int32(9));
        assert_eq!(objs.read_slot(obj, PropertyLocation::FixedSlot(0)), Value::Int32(9));
    }

    #[test]
    fn accessor_reads_are_counted() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape = objs.add_shape(&[(name, PropertyLocation::Accessor)]);
        let obj = objs.add_object(shape, vec![]);

        assert_eq!(objs.generic_get(obj, name), Value::Undefined);
        assert_eq!(objs.accessor_calls, 1);
        assert!(!PropertyLocation::Accessor.is_pure_read());
    }
}
