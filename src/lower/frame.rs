// src/lower/frame.rs
//! Shape of the generated state machine type.
//!
//! Field order is part of the contract: lowering the same method twice must
//! produce the same layout, so control fields come first in a fixed order
//! and capture fields follow in declaration order.

use rustc_hash::FxHashMap;

use crate::ir::code::{Body, FieldId, ProtocolRole};
use crate::ir::intern::Symbol;
use crate::ir::method::{MethodDescriptor, ParamId};
use crate::ir::tree::{LocalId, Ty};
use crate::lower::capture::CaptureSet;
use crate::lower::context::LowerCtx;
use crate::lower::lifecycle::LifecycleMode;
use crate::well_known::WellKnownMembers;

/// What a synthesized field stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Persisted dispatch state code.
    State,
    /// Value published at the most recent suspension.
    Current,
    /// Identity of the constructing thread (iterable mode, and only when
    /// the thread-identity member exists).
    InitialThread,
    /// Working proxy for the receiver.
    Receiver,
    /// Originally supplied receiver, preserved for re-enumeration.
    InitialReceiver,
    /// Working proxy for a parameter.
    Param(ParamId),
    /// Originally supplied parameter value, preserved for re-enumeration.
    InitialParam(ParamId),
    /// Hoisted local.
    Local(LocalId),
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: Symbol,
    pub ty: Ty,
    pub kind: FieldKind,
}

/// Constructor of the generated type: always a single integer parameter,
/// the initial state code.
#[derive(Debug, Clone, Copy)]
pub struct ConstructorDef {
    /// Stamp the thread-affinity field with the calling thread's identity.
    pub stamps_thread: bool,
}

/// Generated protocol member bodies, one named slot per role. A struct
/// rather than a map keeps iteration order out of the picture entirely.
#[derive(Debug, Clone, Default)]
pub struct ProtocolMethods {
    pub pull_next: Body,
    pub dispose: Body,
    pub current: Body,
    pub current_untyped: Body,
    pub reset: Body,
    pub get_enumerator: Option<Body>,
    pub get_enumerator_untyped: Option<Body>,
}

impl ProtocolMethods {
    pub fn body(&self, role: ProtocolRole) -> Option<&Body> {
        match role {
            ProtocolRole::PullNext => Some(&self.pull_next),
            ProtocolRole::Dispose => Some(&self.dispose),
            ProtocolRole::Current => Some(&self.current),
            ProtocolRole::CurrentUntyped => Some(&self.current_untyped),
            ProtocolRole::Reset => Some(&self.reset),
            ProtocolRole::GetEnumerator => self.get_enumerator.as_ref(),
            ProtocolRole::GetEnumeratorUntyped => self.get_enumerator_untyped.as_ref(),
        }
    }
}

/// The synthesized state machine type: the descriptor downstream emission
/// consumes.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub name: Symbol,
    pub mode: LifecycleMode,
    pub element_ty: Ty,
    pub fields: Vec<FieldDef>,
    pub state_field: FieldId,
    pub current_field: FieldId,
    pub thread_field: Option<FieldId>,
    pub constructor: ConstructorDef,
    pub methods: ProtocolMethods,
}

impl StateMachine {
    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0 as usize]
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn find_field(&self, kind: FieldKind) -> Option<FieldId> {
        self.fields
            .iter()
            .position(|f| f.kind == kind)
            .map(|i| FieldId(i as u32))
    }

    pub fn param_proxy(&self, id: ParamId) -> Option<FieldId> {
        self.find_field(FieldKind::Param(id))
    }

    pub fn initial_param(&self, id: ParamId) -> Option<FieldId> {
        self.find_field(FieldKind::InitialParam(id))
    }

    pub fn local_field(&self, id: LocalId) -> Option<FieldId> {
        self.find_field(FieldKind::Local(id))
    }

    pub fn receiver_field(&self) -> Option<FieldId> {
        self.find_field(FieldKind::Receiver)
    }

    pub fn initial_receiver_field(&self) -> Option<FieldId> {
        self.find_field(FieldKind::InitialReceiver)
    }
}

/// Build the state machine type shape for one lowering invocation. Emits no
/// executable code; the rewriter and protocol implementer fill `methods`.
pub fn build(
    ctx: &mut LowerCtx,
    method: &MethodDescriptor,
    captures: &CaptureSet,
    mode: LifecycleMode,
    well_known: &WellKnownMembers,
    element_ty: Ty,
) -> StateMachine {
    let name = ctx.generator_name(method);
    let mut frame = FrameFields::default();

    let state_field = frame.push(ctx, "__state", Ty::I64, FieldKind::State);
    let current_field = frame.push(ctx, "__current", element_ty, FieldKind::Current);

    let wants_thread = mode.wants_thread_affinity() && well_known.has_thread_identity();
    let thread_field =
        wants_thread.then(|| frame.push(ctx, "__initial_thread_id", Ty::I64, FieldKind::InitialThread));

    if captures.receiver {
        let receiver_ty = method
            .receiver_ty
            .expect("instance method without a receiver type");
        frame.push(ctx, "__this", receiver_ty, FieldKind::Receiver);
        if mode == LifecycleMode::Iterable {
            frame.push(ctx, "__initial_this", receiver_ty, FieldKind::InitialReceiver);
        }
    }

    for &param in &captures.params {
        let def = method.param(param);
        // Working proxies keep the parameter's own name.
        let base = ctx.interner.resolve(def.name).to_string();
        frame.push(ctx, &base, def.ty, FieldKind::Param(param));
    }
    if mode == LifecycleMode::Iterable {
        for &param in &captures.params {
            let def = method.param(param);
            let base = format!("__initial_{}", ctx.interner.resolve(def.name));
            frame.push(ctx, &base, def.ty, FieldKind::InitialParam(param));
        }
    }

    for local in &captures.locals {
        let base = format!("__{}", ctx.interner.resolve(local.name));
        frame.push(ctx, &base, local.ty, FieldKind::Local(local.id));
    }

    StateMachine {
        name,
        mode,
        element_ty,
        fields: frame.fields,
        state_field,
        current_field,
        thread_field,
        constructor: ConstructorDef {
            stamps_thread: wants_thread,
        },
        methods: ProtocolMethods::default(),
    }
}

/// Field accumulator with a per-frame name registry; name collisions get a
/// numeric suffix.
#[derive(Debug, Default)]
struct FrameFields {
    fields: Vec<FieldDef>,
    taken: FxHashMap<String, u32>,
}

impl FrameFields {
    fn push(&mut self, ctx: &mut LowerCtx, base: &str, ty: Ty, kind: FieldKind) -> FieldId {
        let count = self.taken.entry(base.to_string()).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            ctx.interner.intern(base)
        } else {
            ctx.interner.intern(&format!("{}_{}", base, count))
        };
        self.fields.push(FieldDef { name, ty, kind });
        FieldId(self.fields.len() as u32 - 1)
    }
}
