//! Inline-cache engine.
//!
//! Each cache site is a small dispatch table the compiled code calls
//! through: stubs are appended in attachment order and tried oldest
//! first, so attaching never rewrites anything already published. A stub
//! is an exact shape guard plus a fast path; any input no stub claims
//! falls through to the generic operation on the [`ObjectModel`], which
//! is also where new stubs are learned.
//!
//! Attachment failure is never an error. A site that cannot learn a
//! pattern simply keeps using the fallback, and thresholds turn
//! pathological sites off entirely.

use tracing::{debug, trace};

use crate::bytecode::NameId;
use crate::context::CompileOptions;
use crate::ir::InstrKind;
use crate::object::{ObjectId, ObjectModel, PropertyLocation, ShapeId, Value};

/// Lifecycle of a cache site. The only transitions are forward:
/// `Uninitialized → Monomorphic → Polymorphic → Megamorphic`, with
/// `Disabled` reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    /// No stub attached yet; every execution is the generic fallback.
    Uninitialized,
    Monomorphic,
    Polymorphic,
    /// Stub budget exhausted; permanently generic, no further attachments.
    Megamorphic,
    /// Too many failed attachments, or an idempotent-cache violation.
    Disabled,
}

/// What executing one cache site did, for the caller that owns the
/// compiled unit. Only `InvalidateUnit` requires action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcOutcome {
    /// A stub guard matched and the fast path ran.
    Hit,
    /// The fallback ran and a new stub was attached for its shape.
    Attached,
    /// The fallback ran; nothing was learned.
    Fallback,
    /// An idempotent cache met a pattern it cannot serve as a pure read.
    /// The owning unit's speculation is broken; recompile it. Reported
    /// exactly once per site.
    InvalidateUnit,
}

#[derive(Debug, Clone, Copy)]
enum StubAction {
    ReadSlot(PropertyLocation),
    WriteSlot(PropertyLocation),
    /// Accessor property; the fast path is the getter call itself.
    CallGetter,
}

#[derive(Debug, Clone, Copy)]
struct Stub {
    shape: ShapeId,
    action: StubAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IcKind {
    Get,
    Set,
}

/// One property-access cache site of a compiled unit.
#[derive(Debug)]
pub struct IcSite {
    kind: IcKind,
    name: NameId,
    /// Restricted to pure slot reads; see [`IcSite::idempotent_get`].
    idempotent: bool,
    state: IcState,
    stubs: Vec<Stub>,
    failed_updates: u32,
    invalidated: bool,
    max_stubs: u32,
    max_failed_updates: u32,
    pub hits: u64,
    pub misses: u64,
}

impl IcSite {
    pub fn get_property(options: &CompileOptions, name: NameId) -> IcSite {
        IcSite::new(IcKind::Get, name, false, options)
    }

    pub fn set_property(options: &CompileOptions, name: NameId) -> IcSite {
        IcSite::new(IcKind::Set, name, false, options)
    }

    /// A cache the compiler hoisted past control flow on the assumption
    /// that it behaves identically on every execution. It may only ever
    /// attach side-effect-free slot reads; anything else invalidates the
    /// owning unit.
    pub fn idempotent_get(options: &CompileOptions, name: NameId) -> IcSite {
        IcSite::new(IcKind::Get, name, true, options)
    }

    fn new(kind: IcKind, name: NameId, idempotent: bool, options: &CompileOptions) -> IcSite {
        IcSite {
            kind,
            name,
            idempotent,
            state: IcState::Uninitialized,
            stubs: Vec::new(),
            failed_updates: 0,
            invalidated: false,
            max_stubs: options.max_stubs,
            max_failed_updates: options.max_failed_updates,
            hits: 0,
            misses: 0,
        }
    }

    /// The runtime site for a cache instruction, if the instruction is a
    /// cached property or name access. Element caches dispatch through
    /// the generic element paths and carry no per-site state.
    pub fn from_cache_instr(kind: &InstrKind, options: &CompileOptions) -> Option<IcSite> {
        match *kind {
            InstrKind::GetPropertyCache { name, idempotent: true } => {
                Some(IcSite::idempotent_get(options, name))
            }
            InstrKind::GetPropertyCache { name, idempotent: false }
            | InstrKind::GetNameCache { name } => Some(IcSite::get_property(options, name)),
            InstrKind::SetPropertyCache { name } => Some(IcSite::set_property(options, name)),
            _ => None,
        }
    }

    pub fn state(&self) -> IcState {
        self.state
    }

    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    /// Execute a cached read: try the stub table in attachment order,
    /// fall back to the generic read on a miss and try to learn the new
    /// shape.
    pub fn get(&mut self, objects: &mut dyn ObjectModel, obj: ObjectId) -> (Value, IcOutcome) {
        debug_assert_eq!(self.kind, IcKind::Get);
        if !self.can_update() {
            // Megamorphic and disabled sites are permanently generic.
            self.misses += 1;
            return (objects.generic_get(obj, self.name), IcOutcome::Fallback);
        }
        let shape = objects.shape_of(obj);
        if let Some(action) = self.matching_stub(shape) {
            self.hits += 1;
            let value = match action {
                StubAction::ReadSlot(loc) => objects.read_slot(obj, loc),
                StubAction::CallGetter => objects.generic_get(obj, self.name),
                StubAction::WriteSlot(_) => unreachable!("write stub on a read site"),
            };
            return (value, IcOutcome::Hit);
        }
        self.misses += 1;
        let value = objects.generic_get(obj, self.name);
        let outcome = match objects.lookup(shape, self.name) {
            Some(loc) if loc.is_pure_read() => self.attach(shape, StubAction::ReadSlot(loc)),
            Some(PropertyLocation::Accessor) if !self.idempotent => {
                self.attach(shape, StubAction::CallGetter)
            }
            _ if self.idempotent => self.idempotent_violation(shape),
            _ => self.failed_update(),
        };
        (value, outcome)
    }

    /// Execute a cached write. Only plain slot stores are learnable;
    /// setters always go through the generic path.
    pub fn set(&mut self, objects: &mut dyn ObjectModel, obj: ObjectId, value: Value) -> IcOutcome {
        debug_assert_eq!(self.kind, IcKind::Set);
        if !self.can_update() {
            self.misses += 1;
            objects.generic_set(obj, self.name, value);
            return IcOutcome::Fallback;
        }
        let shape = objects.shape_of(obj);
        if let Some(action) = self.matching_stub(shape) {
            self.hits += 1;
            match action {
                StubAction::WriteSlot(loc) => objects.write_slot(obj, loc, value),
                _ => unreachable!("read stub on a write site"),
            }
            return IcOutcome::Hit;
        }
        self.misses += 1;
        objects.generic_set(obj, self.name, value);
        match objects.lookup(shape, self.name) {
            Some(loc) if loc.is_pure_read() => self.attach(shape, StubAction::WriteSlot(loc)),
            _ => self.failed_update(),
        }
    }

    fn matching_stub(&self, shape: ShapeId) -> Option<StubAction> {
        self.stubs.iter().find(|s| s.shape == shape).map(|s| s.action)
    }

    fn can_update(&self) -> bool {
        !matches!(self.state, IcState::Megamorphic | IcState::Disabled)
    }

    fn attach(&mut self, shape: ShapeId, action: StubAction) -> IcOutcome {
        if self.stubs.len() as u32 >= self.max_stubs {
            debug!(name = self.name.0, "stub budget exhausted, going megamorphic");
            self.state = IcState::Megamorphic;
            return IcOutcome::Fallback;
        }
        debug_assert!(
            self.stubs.iter().all(|s| s.shape != shape),
            "two stubs may not claim the same shape"
        );
        trace!(name = self.name.0, shape = shape.0, "attaching stub");
        self.stubs.push(Stub { shape, action });
        self.failed_updates = 0;
        self.state = if self.stubs.len() == 1 {
            IcState::Monomorphic
        } else {
            IcState::Polymorphic
        };
        IcOutcome::Attached
    }

    fn failed_update(&mut self) -> IcOutcome {
        self.failed_updates += 1;
        if self.failed_updates >= self.max_failed_updates {
            debug!(name = self.name.0, "too many failed updates, disabling cache");
            self.state = IcState::Disabled;
        }
        IcOutcome::Fallback
    }

    fn idempotent_violation(&mut self, shape: ShapeId) -> IcOutcome {
        self.state = IcState::Disabled;
        if self.invalidated {
            return IcOutcome::Fallback;
        }
        self.invalidated = true;
        debug!(
            name = self.name.0,
            shape = shape.0,
            "idempotent cache cannot serve shape as a pure read"
        );
        IcOutcome::InvalidateUnit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MockObjects;

    fn options() -> CompileOptions {
        CompileOptions::default()
    }

    #[test]
    fn monomorphic_then_polymorphic_stabilizes() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape_a = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
        let shape_b = objs.add_shape(&[(name, PropertyLocation::DynamicSlot(1))]);
        let a = objs.add_object(shape_a, vec![Value::Int32(1)]);
        let b = objs.add_object(shape_b, vec![Value::Undefined, Value::Int32(2)]);

        let opts = options();
        let mut site = IcSite::get_property(&opts, name);
        assert_eq!(site.state(), IcState::Uninitialized);

        assert_eq!(site.get(&mut objs, a), (Value::Int32(1), IcOutcome::Attached));
        assert_eq!(site.state(), IcState::Monomorphic);
        assert_eq!(site.get(&mut objs, b), (Value::Int32(2), IcOutcome::Attached));
        assert_eq!(site.state(), IcState::Polymorphic);
        assert_eq!(site.stub_count(), 2);

        // Both shapes now hit, in any order, with the generic result.
        for _ in 0..3 {
            assert_eq!(site.get(&mut objs, b), (Value::Int32(2), IcOutcome::Hit));
            assert_eq!(site.get(&mut objs, a), (Value::Int32(1), IcOutcome::Hit));
        }
        assert_eq!(site.stub_count(), 2);
        assert_eq!(objs.accessor_calls, 0);
    }

    #[test]
    fn stub_budget_goes_megamorphic() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let mut ids = Vec::new();
        for i in 0..3 {
            let shape = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
            ids.push(objs.add_object(shape, vec![Value::Int32(i)]));
        }

        let mut opts = options();
        opts.max_stubs = 2;
        let mut site = IcSite::get_property(&opts, name);
        assert_eq!(site.get(&mut objs, ids[0]).1, IcOutcome::Attached);
        assert_eq!(site.get(&mut objs, ids[1]).1, IcOutcome::Attached);
        assert_eq!(site.get(&mut objs, ids[2]), (Value::Int32(2), IcOutcome::Fallback));
        assert_eq!(site.state(), IcState::Megamorphic);
        assert_eq!(site.stub_count(), 2);

        // Megamorphic means generic forever, even for shapes with stubs.
        assert_eq!(site.get(&mut objs, ids[0]), (Value::Int32(0), IcOutcome::Fallback));
    }

    #[test]
    fn repeated_failed_updates_disable_the_site() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let missing = NameId(9);
        let shape = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
        let obj = objs.add_object(shape, vec![Value::Int32(5)]);

        let mut opts = options();
        opts.max_failed_updates = 3;
        let mut site = IcSite::get_property(&opts, missing);
        for _ in 0..3 {
            assert_eq!(site.get(&mut objs, obj), (Value::Undefined, IcOutcome::Fallback));
        }
        assert_eq!(site.state(), IcState::Disabled);
        assert_eq!(site.stub_count(), 0);
        // Still correct, just never cached.
        assert_eq!(site.get(&mut objs, obj), (Value::Undefined, IcOutcome::Fallback));
    }

    #[test]
    fn idempotent_violation_invalidates_exactly_once() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape = objs.add_shape(&[(name, PropertyLocation::Accessor)]);
        let obj = objs.add_object(shape, vec![]);

        let opts = options();
        let mut site = IcSite::idempotent_get(&opts, name);
        let (value, outcome) = site.get(&mut objs, obj);
        assert_eq!(value, Value::Undefined);
        assert_eq!(outcome, IcOutcome::InvalidateUnit);
        assert_eq!(site.state(), IcState::Disabled);

        // The flag is permanent; later misses are plain fallbacks.
        assert_eq!(site.get(&mut objs, obj).1, IcOutcome::Fallback);
        assert_eq!(site.get(&mut objs, obj).1, IcOutcome::Fallback);
    }

    #[test]
    fn idempotent_site_still_attaches_pure_reads() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
        let obj = objs.add_object(shape, vec![Value::Int32(7)]);

        let opts = options();
        let mut site = IcSite::idempotent_get(&opts, name);
        assert_eq!(site.get(&mut objs, obj), (Value::Int32(7), IcOutcome::Attached));
        assert_eq!(site.get(&mut objs, obj), (Value::Int32(7), IcOutcome::Hit));
        assert_eq!(objs.accessor_calls, 0);
    }

    #[test]
    fn accessor_getter_is_cacheable_on_plain_sites() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape = objs.add_shape(&[(name, PropertyLocation::Accessor)]);
        let obj = objs.add_object(shape, vec![]);

        let opts = options();
        let mut site = IcSite::get_property(&opts, name);
        assert_eq!(site.get(&mut objs, obj).1, IcOutcome::Attached);
        // The fast path still runs the getter each time.
        assert_eq!(site.get(&mut objs, obj).1, IcOutcome::Hit);
        assert_eq!(objs.accessor_calls, 2);
    }

    #[test]
    fn guard_mismatch_never_serves_stale_data() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape_a = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
        // Same property, different layout.
        let shape_b = objs.add_shape(&[(name, PropertyLocation::FixedSlot(1))]);
        let a = objs.add_object(shape_a, vec![Value::Int32(10)]);
        let b = objs.add_object(shape_b, vec![Value::Int32(99), Value::Int32(20)]);

        let opts = options();
        let mut site = IcSite::get_property(&opts, name);
        assert_eq!(site.get(&mut objs, a).0, Value::Int32(10));
        // The stub for shape A must not claim shape B.
        assert_eq!(site.get(&mut objs, b), (Value::Int32(20), IcOutcome::Attached));
        assert_eq!(site.get(&mut objs, b), (Value::Int32(20), IcOutcome::Hit));
        assert_eq!(site.get(&mut objs, a), (Value::Int32(10), IcOutcome::Hit));
    }

    #[test]
    fn write_stub_updates_the_slot() {
        let mut objs = MockObjects::new();
        let name = NameId(0);
        let shape = objs.add_shape(&[(name, PropertyLocation::FixedSlot(0))]);
        let obj = objs.add_object(shape, vec![Value::Int32(0)]);

        let opts = options();
        let mut site = IcSite::set_property(&opts, name);
        assert_eq!(site.set(&mut objs, obj, Value::Int32(4)), IcOutcome::Attached);
        assert_eq!(site.set(&mut objs, obj, Value::Int32(5)), IcOutcome::Hit);
        assert_eq!(objs.read_slot(obj, PropertyLocation::FixedSlot(0)), Value::Int32(5));

        // A setter is not a learnable write.
        let acc_shape = objs.add_shape(&[(name, PropertyLocation::Accessor)]);
        let acc = objs.add_object(acc_shape, vec![]);
        assert_eq!(site.set(&mut objs, acc, Value::Int32(1)), IcOutcome::Fallback);
        assert_eq!(objs.accessor_calls, 1);
    }

    #[test]
    fn sites_map_from_cache_instructions() {
        let opts = options();
        let site =
            IcSite::from_cache_instr(&InstrKind::GetPropertyCache { name: NameId(1), idempotent: true }, &opts)
                .unwrap();
        assert!(site.idempotent);
        assert!(IcSite::from_cache_instr(&InstrKind::GetElementCache, &opts).is_none());
        assert!(IcSite::from_cache_instr(&InstrKind::Add, &opts).is_none());
    }
}
