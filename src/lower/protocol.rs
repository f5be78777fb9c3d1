// src/lower/protocol.rs
//! Emission of the fixed protocol member set.
//!
//! Pull-next and dispose come from the resumption rewriter; everything
//! else here is a small fixed body. Accessors are side-effect free and
//! stable between pull-next calls; reset is always the unsupported trap.

use crate::ir::code::{Body, BodyBuilder, CodeExpr, Instr, Place, ProtocolRole};
use crate::ir::tree::BinaryOp;
use crate::lower::frame::{FieldKind, StateMachine};
use crate::lower::lifecycle::{ENTRY_STATE, LifecycleMode, NOT_STARTED_STATE};
use crate::lower::rewrite::RewriteResult;

/// Fill the frame's protocol member slots.
pub fn implement(frame: &mut StateMachine, rewritten: RewriteResult) {
    frame.methods.pull_next = rewritten.pull_next;
    frame.methods.dispose = rewritten.dispose;

    frame.methods.current = return_current(frame);
    // The untyped view has the same shape; representation coercion is the
    // emitter's concern.
    frame.methods.current_untyped = return_current(frame);
    frame.methods.reset = Body {
        instrs: vec![Instr::Unsupported("reset")],
        slots: 0,
    };

    if frame.mode == LifecycleMode::Iterable {
        frame.methods.get_enumerator = Some(get_enumerator(frame));
        frame.methods.get_enumerator_untyped = Some(Body {
            instrs: vec![Instr::Delegate(ProtocolRole::GetEnumerator)],
            slots: 0,
        });
    }
}

fn return_current(frame: &StateMachine) -> Body {
    Body {
        instrs: vec![Instr::ReturnValue(CodeExpr::SelfField(frame.current_field))],
        slots: 0,
    }
}

/// The typed activation body.
///
/// Fast path: a template that was never activated (state still the
/// not-started sentinel), asked from its constructing thread, becomes the
/// enumerator itself, saving the allocation of the common enumerate-once
/// case. Every other call — second activations, cross-thread calls, or a
/// runtime without thread identity — clones a fresh instance at the entry
/// state. Both paths then forward the originally supplied
/// receiver/parameter values into the result's working proxies; on the
/// fast path those stores are self-copies.
fn get_enumerator(frame: &StateMachine) -> Body {
    let mut b = BodyBuilder::new();
    let result = b.alloc_slot();

    // (working proxy, preserved initial) pairs; the receiver is forwarded
    // exactly like a parameter.
    let mut copies: Vec<_> = frame
        .receiver_field()
        .zip(frame.initial_receiver_field())
        .into_iter()
        .collect();
    copies.extend(frame.fields.iter().filter_map(|f| match f.kind {
        FieldKind::Param(p) => Some((
            frame.param_proxy(p).expect("proxy field"),
            frame.initial_param(p).expect("initial proxy field"),
        )),
        _ => None,
    }));

    if let Some(thread_field) = frame.thread_field {
        let alloc = b.fresh_label();
        let this_initialized = b.fresh_label();

        b.emit(Instr::BranchFalse {
            cond: CodeExpr::binary(
                BinaryOp::Eq,
                CodeExpr::SelfField(frame.state_field),
                CodeExpr::state(NOT_STARTED_STATE),
            ),
            target: alloc,
        });
        b.emit(Instr::BranchFalse {
            cond: CodeExpr::binary(
                BinaryOp::Eq,
                CodeExpr::SelfField(thread_field),
                CodeExpr::CurrentThread,
            ),
            target: alloc,
        });
        b.emit(Instr::Store {
            place: Place::SelfField(frame.state_field),
            value: CodeExpr::state(ENTRY_STATE),
        });
        b.emit(Instr::Store {
            place: Place::Slot(result),
            value: CodeExpr::SelfRef,
        });
        b.emit(Instr::Jump(this_initialized));

        b.bind(alloc);
        b.emit(Instr::Store {
            place: Place::Slot(result),
            value: CodeExpr::NewInstance {
                initial_state: ENTRY_STATE,
            },
        });

        b.bind(this_initialized);
    } else {
        // No thread identity on this runtime: always allocate.
        b.emit(Instr::Store {
            place: Place::Slot(result),
            value: CodeExpr::NewInstance {
                initial_state: ENTRY_STATE,
            },
        });
    }

    for (proxy, initial) in copies {
        b.emit(Instr::Store {
            place: Place::SlotField(result, proxy),
            value: CodeExpr::SelfField(initial),
        });
        b.emit(Instr::Store {
            place: Place::SlotField(result, initial),
            value: CodeExpr::SelfField(initial),
        });
    }
    b.emit(Instr::ReturnValue(CodeExpr::Slot(result)));

    b.finish()
}
