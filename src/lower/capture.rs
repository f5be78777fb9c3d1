// src/lower/capture.rs
//! Capture analysis: which variables must be promoted to fields.
//!
//! A local survives on the execution stack only within one burst (between
//! two suspend points); anything observed on both sides of a suspension has
//! to live in a field of the generated type. The analysis is pure and must
//! be exhaustive: an uncaptured variable that crosses a suspension is a
//! silent correctness bug, so every rule here errs toward capturing.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ir::intern::Symbol;
use crate::ir::method::{MethodDescriptor, ParamId};
use crate::ir::tree::{AssignTarget, Expr, LocalId, Stmt, Ty};
use crate::lower::lifecycle::LifecycleMode;

/// A hoisted local: identity plus the declaration facts the type builder
/// needs to synthesize its field.
#[derive(Debug, Clone, Copy)]
pub struct CapturedLocal {
    pub id: LocalId,
    pub name: Symbol,
    pub ty: Ty,
}

/// The ordered capture set for one lowering invocation. Owned by the type
/// builder; the resumption rewriter only reads it.
#[derive(Debug, Clone)]
pub struct CaptureSet {
    /// Whether the receiver must be proxied for cross-suspend access.
    pub receiver: bool,
    /// Captured parameters, in declaration order.
    pub params: Vec<ParamId>,
    /// Captured locals, in order of first declaration.
    pub locals: Vec<CapturedLocal>,
}

/// Compute the capture set for `body`.
///
/// Locals are captured iff they are accessed at a strictly greater suspend
/// count than the one at their declaration. Parameters follow the
/// always-proxy rule: every parameter in iterable mode (each activation
/// forwards them into a possibly fresh instance), every referenced
/// parameter in iterator mode (the dispatch body executes entirely inside
/// the generated type). The receiver of an instance method is proxied in
/// iterable mode, and in iterator mode whenever the body references it.
pub fn analyze(method: &MethodDescriptor, body: &[Stmt], mode: LifecycleMode) -> CaptureSet {
    let mut analyzer = Analyzer::default();
    analyzer.walk_stmts(body);

    let params = match mode {
        LifecycleMode::Iterable => method.param_ids().collect(),
        LifecycleMode::Iterator => method
            .param_ids()
            .filter(|id| analyzer.params_referenced.contains(id))
            .collect(),
    };

    let receiver = !method.is_static
        && (mode == LifecycleMode::Iterable || analyzer.receiver_referenced);

    let locals = analyzer
        .local_order
        .iter()
        .filter(|local| analyzer.captured_locals.contains(&local.id))
        .copied()
        .collect();

    CaptureSet {
        receiver,
        params,
        locals,
    }
}

#[derive(Default)]
struct Analyzer {
    suspends_seen: u32,
    decl_at: FxHashMap<LocalId, u32>,
    local_order: Vec<CapturedLocal>,
    captured_locals: FxHashSet<LocalId>,
    params_referenced: FxHashSet<ParamId>,
    receiver_referenced: bool,
}

impl Analyzer {
    fn walk_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Block(stmts) => self.walk_stmts(stmts),
            Stmt::Local { id, name, ty, init } => {
                if let Some(init) = init {
                    self.walk_expr(init);
                }
                if !self.decl_at.contains_key(id) {
                    self.local_order.push(CapturedLocal {
                        id: *id,
                        name: *name,
                        ty: *ty,
                    });
                }
                self.decl_at.insert(*id, self.suspends_seen);
            }
            Stmt::Assign { target, value } => {
                self.walk_expr(value);
                match target {
                    AssignTarget::Local(id) => self.note_local(*id),
                    AssignTarget::Param(id) => self.note_param(*id),
                }
            }
            Stmt::Eval(expr) | Stmt::Raise(expr) => self.walk_expr(expr),
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                self.walk_expr(cond);
                self.walk_stmts(then_body);
                self.walk_stmts(else_body);
            }
            Stmt::While { cond, body } => {
                // Walk the loop twice when it suspends: an access textually
                // before a suspend still crosses it via the back edge.
                let before = self.suspends_seen;
                self.walk_expr(cond);
                self.walk_stmts(body);
                if self.suspends_seen > before {
                    self.walk_expr(cond);
                    self.walk_stmts(body);
                }
            }
            Stmt::TryFinally { body, finally } => {
                self.walk_stmts(body);
                self.walk_stmts(finally);
            }
            Stmt::Suspend { value, .. } => {
                self.walk_expr(value);
                self.suspends_seen += 1;
            }
            Stmt::Finish => {}
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Literal(_) => {}
            Expr::Local(id) => self.note_local(*id),
            Expr::Param(id) => self.note_param(*id),
            Expr::Receiver => self.receiver_referenced = true,
            Expr::Unary(_, operand) => self.walk_expr(operand),
            Expr::Binary { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
        }
    }

    fn note_local(&mut self, id: LocalId) {
        let declared = self.decl_at.get(&id).copied().unwrap_or(0);
        if self.suspends_seen > declared {
            self.captured_locals.insert(id);
        }
    }

    fn note_param(&mut self, id: ParamId) {
        self.params_referenced.insert(id);
    }
}
