// src/lower/rewrite.rs
//! The resumption rewriter: coroutine-via-dispatch over a flat body.
//!
//! One forward walk of the bound tree turns every suspend statement into
//! publish-value / set-state / return-true / resumption-label, allocating
//! dense state codes in textual order. The pull-next body is prefixed with
//! a dispatch on the persisted state; the dispose body is a second
//! dispatch that runs the finally chain enclosing the current suspension
//! and then stores the finished sentinel.
//!
//! Finally blocks are emitted once per body as cleanup subroutines.
//! `EnterCleanup`/`LeaveCleanup` keep the armed set in sync during a burst
//! so faults run the right handlers, and resumption labels re-arm the
//! enclosing regions because dispatch jumps straight past the region
//! entries.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::{Diagnostics, LoweringError};
use crate::ir::code::{Body, BodyBuilder, CodeExpr, FieldId, Instr, LabelId, Place, SlotId};
use crate::ir::method::{MethodDescriptor, ParamId};
use crate::ir::span::Span;
use crate::ir::tree::{AssignTarget, Expr, LocalId, Stmt};
use crate::lower::frame::{FieldKind, StateMachine};
use crate::lower::lifecycle::{ENTRY_STATE, FINISHED_STATE, FIRST_SUSPEND_STATE};
use crate::well_known::WellKnownMembers;

/// One suspension site of the rewritten dispatch body.
#[derive(Debug, Clone, Copy)]
pub struct SuspendPoint {
    pub state: i32,
    pub resume: LabelId,
    pub span: Span,
}

#[derive(Debug)]
pub struct RewriteResult {
    pub pull_next: Body,
    pub dispose: Body,
    pub suspend_points: Vec<SuspendPoint>,
}

/// Rewrite `body` into the pull-next and dispose bodies.
///
/// Aborts (diagnostic, `None`) when the target runtime lacks the dispose
/// contract; nothing is partially emitted in that case.
pub fn rewrite(
    method: &MethodDescriptor,
    body: &[Stmt],
    frame: &StateMachine,
    well_known: &WellKnownMembers,
    diags: &mut Diagnostics,
) -> Option<RewriteResult> {
    if !well_known.has_dispose() {
        diags.push(LoweringError::MissingRuntimeMember {
            member: "dispose".to_string(),
            span: method.span.into(),
        });
        return None;
    }

    let vars = VarMap::from_frame(frame);

    // Pull-next: dispatch prologue, rewritten body, epilogue.
    let mut e = Emitter::new(frame, &vars);
    let dispatch_at = e.b.len();
    e.b.emit(Instr::Dispatch {
        arms: Vec::new(),
        default: LabelId(0),
    });
    let entry = e.b.fresh_label();
    let not_running = e.b.fresh_label();
    e.epilogue = e.b.fresh_label();

    e.b.bind(entry);
    e.walk_stmts(body);
    e.b.bind(e.epilogue);
    e.store_state(FINISHED_STATE);
    e.b.emit(Instr::ReturnBool(false));
    e.b.bind(not_running);
    e.b.emit(Instr::ReturnBool(false));
    e.flush_subroutines();

    let mut arms = vec![(ENTRY_STATE, entry)];
    arms.extend(e.suspend_points.iter().map(|s| (s.state, s.resume)));
    e.b.patch(
        dispatch_at,
        Instr::Dispatch {
            arms,
            default: not_running,
        },
    );

    let suspend_points = std::mem::take(&mut e.suspend_points);
    let chains = std::mem::take(&mut e.chains);
    let regions: Vec<&[Stmt]> = e.regions.iter().map(|r| r.finally).collect();
    let pull_next = std::mem::take(&mut e.b).finish();

    let dispose = emit_dispose(frame, &vars, &regions, &chains);

    Some(RewriteResult {
        pull_next,
        dispose,
        suspend_points,
    })
}

/// Dispose: dispatch straight to the cleanup chain for the suspended
/// state, then poison to the finished sentinel. States outside any finally
/// region (and the not-started / finished sentinels) only get the store,
/// which makes repeated disposal idempotent.
fn emit_dispose(
    frame: &StateMachine,
    vars: &VarMap,
    regions: &[&[Stmt]],
    chains: &[(i32, SmallVec<[usize; 2]>)],
) -> Body {
    let mut e = Emitter::new(frame, vars);
    let dispatch_at = e.b.len();
    e.b.emit(Instr::Dispatch {
        arms: Vec::new(),
        default: LabelId(0),
    });
    let done = e.b.fresh_label();

    // Subroutine labels in this body for every region some chain references.
    let mut labels: FxHashMap<usize, LabelId> = FxHashMap::default();
    for (_, chain) in chains {
        for &region in chain {
            labels.entry(region).or_insert_with(|| e.b.fresh_label());
        }
    }

    let mut arms = Vec::new();
    for (state, chain) in chains {
        if chain.is_empty() {
            continue;
        }
        let arm = e.b.fresh_label();
        arms.push((*state, arm));
        e.b.bind(arm);
        for &region in chain {
            e.b.emit(Instr::CallCleanup(labels[&region]));
        }
        e.b.emit(Instr::Jump(done));
    }

    e.b.bind(done);
    e.store_state(FINISHED_STATE);
    e.b.emit(Instr::Return);

    let mut referenced: Vec<usize> = labels.keys().copied().collect();
    referenced.sort_unstable();
    for region in referenced {
        e.emit_subroutine(labels[&region], regions[region]);
    }
    e.flush_subroutines();

    e.b.patch(dispatch_at, Instr::Dispatch { arms, default: done });
    std::mem::take(&mut e.b).finish()
}

/// Where each captured variable lives in the frame.
struct VarMap {
    params: FxHashMap<ParamId, FieldId>,
    locals: FxHashMap<LocalId, FieldId>,
    receiver: Option<FieldId>,
}

impl VarMap {
    fn from_frame(frame: &StateMachine) -> VarMap {
        let mut params = FxHashMap::default();
        let mut locals = FxHashMap::default();
        let mut receiver = None;
        for (index, field) in frame.fields.iter().enumerate() {
            let id = FieldId(index as u32);
            match field.kind {
                FieldKind::Param(p) => {
                    params.insert(p, id);
                }
                FieldKind::Local(l) => {
                    locals.insert(l, id);
                }
                FieldKind::Receiver => receiver = Some(id),
                _ => {}
            }
        }
        VarMap {
            params,
            locals,
            receiver,
        }
    }
}

/// A try/finally region discovered during the walk.
#[derive(Clone, Copy)]
struct Region<'t> {
    label: LabelId,
    finally: &'t [Stmt],
}

struct Emitter<'a, 't> {
    frame: &'a StateMachine,
    vars: &'a VarMap,
    b: BodyBuilder,
    slots: FxHashMap<LocalId, SlotId>,
    regions: Vec<Region<'t>>,
    /// Regions whose subroutine body is not yet emitted.
    pending: Vec<usize>,
    pending_cursor: usize,
    /// Enclosing regions at the current walk position, outermost first.
    active: Vec<usize>,
    next_state: i32,
    suspend_points: Vec<SuspendPoint>,
    /// Per suspend state: enclosing region indices, innermost first.
    chains: Vec<(i32, SmallVec<[usize; 2]>)>,
    epilogue: LabelId,
    in_cleanup: bool,
}

impl<'a, 't> Emitter<'a, 't> {
    fn new(frame: &'a StateMachine, vars: &'a VarMap) -> Self {
        Emitter {
            frame,
            vars,
            b: BodyBuilder::new(),
            slots: FxHashMap::default(),
            regions: Vec::new(),
            pending: Vec::new(),
            pending_cursor: 0,
            active: Vec::new(),
            next_state: FIRST_SUSPEND_STATE,
            suspend_points: Vec::new(),
            chains: Vec::new(),
            epilogue: LabelId(0),
            in_cleanup: false,
        }
    }

    fn store_state(&mut self, code: i32) {
        self.b.emit(Instr::Store {
            place: Place::SelfField(self.frame.state_field),
            value: CodeExpr::state(code),
        });
    }

    fn walk_stmts(&mut self, stmts: &'t [Stmt]) {
        for stmt in stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &'t Stmt) {
        match stmt {
            Stmt::Block(stmts) => self.walk_stmts(stmts),
            Stmt::Local { id, init, .. } => {
                let place = if let Some(&field) = self.vars.locals.get(id) {
                    Place::SelfField(field)
                } else {
                    Place::Slot(self.slot(*id))
                };
                if let Some(init) = init {
                    let value = self.rewrite_expr(init);
                    self.b.emit(Instr::Store { place, value });
                }
            }
            Stmt::Assign { target, value } => {
                let value = self.rewrite_expr(value);
                let place = match target {
                    AssignTarget::Local(id) => {
                        if let Some(&field) = self.vars.locals.get(id) {
                            Place::SelfField(field)
                        } else {
                            Place::Slot(self.slot(*id))
                        }
                    }
                    AssignTarget::Param(id) => Place::SelfField(self.param_field(*id)),
                };
                self.b.emit(Instr::Store { place, value });
            }
            Stmt::Eval(expr) => {
                let value = self.rewrite_expr(expr);
                self.b.emit(Instr::Eval(value));
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let else_label = self.b.fresh_label();
                let end = self.b.fresh_label();
                let cond = self.rewrite_expr(cond);
                self.b.emit(Instr::BranchFalse {
                    cond,
                    target: else_label,
                });
                self.walk_stmts(then_body);
                self.b.emit(Instr::Jump(end));
                self.b.bind(else_label);
                self.walk_stmts(else_body);
                self.b.bind(end);
            }
            Stmt::While { cond, body } => {
                let head = self.b.fresh_label();
                let exit = self.b.fresh_label();
                self.b.bind(head);
                let cond = self.rewrite_expr(cond);
                self.b.emit(Instr::BranchFalse { cond, target: exit });
                self.walk_stmts(body);
                self.b.emit(Instr::Jump(head));
                self.b.bind(exit);
            }
            Stmt::TryFinally { body, finally } => {
                let label = self.b.fresh_label();
                let region = self.regions.len();
                self.regions.push(Region {
                    label,
                    finally: finally.as_slice(),
                });
                self.pending.push(region);

                self.b.emit(Instr::EnterCleanup(label));
                self.active.push(region);
                self.walk_stmts(body);
                self.active.pop();
                self.b.emit(Instr::LeaveCleanup);
                self.b.emit(Instr::CallCleanup(label));
            }
            Stmt::Suspend { value, span } => {
                assert!(
                    !self.in_cleanup,
                    "suspend point inside a finally region; the binder must reject this"
                );
                let state = self.next_state;
                self.next_state += 1;

                let value = self.rewrite_expr(value);
                self.b.emit(Instr::Store {
                    place: Place::SelfField(self.frame.current_field),
                    value,
                });
                self.store_state(state);
                self.b.emit(Instr::ReturnBool(true));

                let resume = self.b.fresh_label();
                self.b.bind(resume);
                // Dispatch jumps here past the region entries; re-arm them.
                for index in 0..self.active.len() {
                    let label = self.regions[self.active[index]].label;
                    self.b.emit(Instr::EnterCleanup(label));
                }

                self.suspend_points.push(SuspendPoint {
                    state,
                    resume,
                    span: *span,
                });
                let chain: SmallVec<[usize; 2]> = self.active.iter().rev().copied().collect();
                self.chains.push((state, chain));
            }
            Stmt::Finish => {
                assert!(
                    !self.in_cleanup,
                    "early finish inside a finally region; the binder must reject this"
                );
                for index in (0..self.active.len()).rev() {
                    let label = self.regions[self.active[index]].label;
                    self.b.emit(Instr::LeaveCleanup);
                    self.b.emit(Instr::CallCleanup(label));
                }
                self.b.emit(Instr::Jump(self.epilogue));
            }
            Stmt::Raise(expr) => {
                let value = self.rewrite_expr(expr);
                self.b.emit(Instr::Raise(value));
            }
        }
    }

    fn rewrite_expr(&mut self, expr: &Expr) -> CodeExpr {
        match expr {
            Expr::Literal(literal) => CodeExpr::Literal(literal.clone()),
            Expr::Local(id) => {
                if let Some(&field) = self.vars.locals.get(id) {
                    CodeExpr::SelfField(field)
                } else {
                    CodeExpr::Slot(self.slot(*id))
                }
            }
            Expr::Param(id) => CodeExpr::SelfField(self.param_field(*id)),
            Expr::Receiver => CodeExpr::SelfField(
                self.vars
                    .receiver
                    .expect("receiver reference without a receiver proxy"),
            ),
            Expr::Unary(op, operand) => {
                CodeExpr::Unary(*op, Box::new(self.rewrite_expr(operand)))
            }
            Expr::Binary { op, left, right } => CodeExpr::Binary {
                op: *op,
                left: Box::new(self.rewrite_expr(left)),
                right: Box::new(self.rewrite_expr(right)),
            },
        }
    }

    fn param_field(&self, id: ParamId) -> FieldId {
        *self
            .vars
            .params
            .get(&id)
            .expect("parameter reference without a proxy field")
    }

    fn slot(&mut self, id: LocalId) -> SlotId {
        if let Some(&slot) = self.slots.get(&id) {
            return slot;
        }
        let slot = self.b.alloc_slot();
        self.slots.insert(id, slot);
        slot
    }

    fn emit_subroutine(&mut self, label: LabelId, stmts: &'t [Stmt]) {
        self.b.bind(label);
        let was = std::mem::replace(&mut self.in_cleanup, true);
        self.walk_stmts(stmts);
        self.in_cleanup = was;
        self.b.emit(Instr::EndCleanup);
    }

    /// Emit subroutines for regions discovered during walking; walking a
    /// subroutine may discover more.
    fn flush_subroutines(&mut self) {
        while self.pending_cursor < self.pending.len() {
            let region = self.regions[self.pending[self.pending_cursor]];
            self.pending_cursor += 1;
            self.emit_subroutine(region.label, region.finally);
        }
    }
}
