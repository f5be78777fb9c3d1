// src/lower/mod.rs
//! Iterator-to-state-machine lowering.
//!
//! The driver consumes a resolved method descriptor and its bound body and
//! hands back a descriptor of the generated type plus the replacement body
//! for the original method. On any diagnostic nothing is emitted at all;
//! the caller leaves the method un-lowered and fails the compilation
//! downstream.

pub mod capture;
pub mod context;
pub mod frame;
pub mod lifecycle;
pub mod protocol;
pub mod rewrite;

pub use capture::{CaptureSet, CapturedLocal};
pub use context::LowerCtx;
pub use frame::{ConstructorDef, FieldDef, FieldKind, ProtocolMethods, StateMachine};
pub use lifecycle::{
    ENTRY_STATE, FINISHED_STATE, FIRST_SUSPEND_STATE, LifecycleMode, NOT_STARTED_STATE,
};
pub use rewrite::{RewriteResult, SuspendPoint};

use crate::errors::{Diagnostics, LoweringError};
use crate::ir::code::FieldId;
use crate::ir::method::{MethodDescriptor, ParamId};
use crate::ir::tree::Stmt;
use crate::well_known::WellKnownMembers;

/// Where one constructor-time field store takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardSource {
    Param(ParamId),
    Receiver,
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardStore {
    pub field: FieldId,
    pub source: ForwardSource,
}

/// The replacement for the original method body: construct the generated
/// type with the mode's initial state, forward the arguments into fields,
/// return the instance.
#[derive(Debug, Clone)]
pub struct ReplacementBody {
    pub initial_state: i32,
    pub forwards: Vec<ForwardStore>,
}

/// Everything one lowering invocation produces.
#[derive(Debug)]
pub struct LoweredIterator {
    pub state_machine: StateMachine,
    pub replacement: ReplacementBody,
}

/// Lower one iterator method. Returns `None` (with diagnostics) when the
/// element type or a required runtime member is missing.
pub fn lower_iterator(
    method: &MethodDescriptor,
    body: &[Stmt],
    well_known: &WellKnownMembers,
    ctx: &mut LowerCtx,
    diags: &mut Diagnostics,
) -> Option<LoweredIterator> {
    let Some(element_ty) = method.element_ty else {
        diags.push(LoweringError::MissingElementType {
            method: ctx.interner.resolve(method.name).to_string(),
            span: method.span.into(),
        });
        return None;
    };

    let mode = LifecycleMode::select(method);
    let captures = capture::analyze(method, body, mode);
    let mut machine = frame::build(ctx, method, &captures, mode, well_known, element_ty);
    let rewritten = rewrite::rewrite(method, body, &machine, well_known, diags)?;
    protocol::implement(&mut machine, rewritten);

    let replacement = replacement_body(&machine, mode);
    Some(LoweredIterator {
        state_machine: machine,
        replacement,
    })
}

/// In iterable mode arguments land in the preserved `__initial_*` proxies
/// (activation copies them into the working proxies); in iterator mode
/// they go straight into the working proxies.
fn replacement_body(machine: &StateMachine, mode: LifecycleMode) -> ReplacementBody {
    let forwards = machine
        .fields
        .iter()
        .enumerate()
        .filter_map(|(index, field)| {
            let id = FieldId(index as u32);
            let source = match (mode, field.kind) {
                (LifecycleMode::Iterable, FieldKind::InitialParam(p)) => ForwardSource::Param(p),
                (LifecycleMode::Iterable, FieldKind::InitialReceiver) => ForwardSource::Receiver,
                (LifecycleMode::Iterator, FieldKind::Param(p)) => ForwardSource::Param(p),
                (LifecycleMode::Iterator, FieldKind::Receiver) => ForwardSource::Receiver,
                _ => return None,
            };
            Some(ForwardStore { field: id, source })
        })
        .collect();

    ReplacementBody {
        initial_state: mode.initial_state(),
        forwards,
    }
}
