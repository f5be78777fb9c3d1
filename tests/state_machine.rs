// tests/state_machine.rs
//! End-to-end behavior of lowered iterator state machines, driven through
//! the runtime interpreter.

use std::cell::Cell;
use std::rc::Rc;

use rill::errors::Diagnostics;
use rill::ir::{
    AssignTarget, BinaryOp, Expr, Interner, LocalId, MethodDescriptor, ParamDef, ParamId,
    ReturnShape, Span, Stmt, Ty,
};
use rill::lower::{
    FINISHED_STATE, FieldKind, LowerCtx, LoweredIterator, lower_iterator,
};
use rill::runtime::{Machine, MachineError, MachineRef, RuntimeEnv, ThreadIdSource, Value};
use rill::well_known::WellKnownMembers;

struct Fixture {
    interner: Interner,
    well_known: WellKnownMembers,
}

impl Fixture {
    fn new() -> Fixture {
        let mut interner = Interner::new();
        let mut well_known = WellKnownMembers::new();
        well_known.populate(&mut interner);
        Fixture {
            interner,
            well_known,
        }
    }

    fn without_thread_identity() -> Fixture {
        let mut interner = Interner::new();
        let well_known = WellKnownMembers::without_thread_identity(&mut interner);
        Fixture {
            interner,
            well_known,
        }
    }

    fn method(&mut self, params: &[(&str, Ty)], shape: ReturnShape) -> MethodDescriptor {
        MethodDescriptor {
            name: self.interner.intern("m"),
            declaring_type: self.interner.intern("Sequences"),
            params: params
                .iter()
                .map(|(name, ty)| ParamDef {
                    name: self.interner.intern(name),
                    ty: *ty,
                })
                .collect(),
            is_static: true,
            receiver_ty: None,
            element_ty: Some(Ty::I64),
            return_shape: shape,
            span: Span::default(),
        }
    }

    fn local(&mut self, id: u32, name: &str, ty: Ty, init: Expr) -> Stmt {
        Stmt::Local {
            id: LocalId(id),
            name: self.interner.intern(name),
            ty,
            init: Some(init),
        }
    }

    fn lower(&mut self, method: &MethodDescriptor, body: &[Stmt]) -> LoweredIterator {
        let mut ctx = LowerCtx::new(&mut self.interner);
        let mut diags = Diagnostics::new();
        let lowered = lower_iterator(method, body, &self.well_known, &mut ctx, &mut diags);
        assert!(diags.is_empty(), "unexpected diagnostics: {}", diags.render());
        lowered.expect("lowering succeeds")
    }
}

fn suspend(value: Expr) -> Stmt {
    Stmt::Suspend {
        value,
        span: Span::default(),
    }
}

fn pull(machine: &MachineRef) -> bool {
    machine.pull_next().expect("pull_next succeeds")
}

fn current_int(machine: &MachineRef) -> i64 {
    machine
        .current()
        .expect("current succeeds")
        .as_int()
        .expect("current is an integer")
}

#[test]
fn yields_one_then_two_then_exhausts() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = vec![suspend(Expr::int(1)), suspend(Expr::int(2))];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(pull(&machine));
    assert_eq!(current_int(&machine), 1);
    assert!(pull(&machine));
    assert_eq!(current_int(&machine), 2);
    assert!(!pull(&machine));
    // Exhaustion leaves the published value untouched.
    assert_eq!(current_int(&machine), 2);
    assert_eq!(machine.state(), FINISHED_STATE as i64);

    machine.dispose().unwrap();
    assert_eq!(machine.state(), FINISHED_STATE as i64);
    assert!(!pull(&machine));
}

#[test]
fn dispose_before_exhaustion_ends_the_sequence() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = vec![suspend(Expr::int(1)), suspend(Expr::int(2))];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(pull(&machine));
    machine.dispose().unwrap();
    assert!(!pull(&machine));
}

#[test]
fn dispose_is_idempotent() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = vec![suspend(Expr::int(1))];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    machine.dispose().unwrap();
    let state_after_first = machine.state();
    machine.dispose().unwrap();
    assert_eq!(machine.state(), state_after_first);
    assert_eq!(machine.state(), FINISHED_STATE as i64);
}

#[test]
fn zero_suspend_method_is_immediately_exhausted() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = vec![Stmt::Eval(Expr::int(7))];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(!pull(&machine));
    assert_eq!(machine.state(), FINISHED_STATE as i64);
    machine.dispose().unwrap();
    assert!(!pull(&machine));
}

#[test]
fn captured_local_round_trips_across_a_resume() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    // let x = 10; x = x + 32; yield 0; yield x
    let body = vec![
        fx.local(0, "x", Ty::I64, Expr::int(10)),
        Stmt::Assign {
            target: AssignTarget::Local(LocalId(0)),
            value: Expr::binary(BinaryOp::Add, Expr::local(LocalId(0)), Expr::int(32)),
        },
        suspend(Expr::int(0)),
        suspend(Expr::local(LocalId(0))),
    ];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(pull(&machine));
    assert_eq!(current_int(&machine), 0);
    assert!(pull(&machine));
    assert_eq!(current_int(&machine), 42);
}

#[test]
fn counting_loop_yields_each_value() {
    let mut fx = Fixture::new();
    let m = fx.method(&[("n", Ty::I64)], ReturnShape::Iterator);
    // let i = 0; while i < n { yield i; i = i + 1 }
    let body = vec![
        fx.local(0, "i", Ty::I64, Expr::int(0)),
        Stmt::While {
            cond: Expr::binary(BinaryOp::Lt, Expr::local(LocalId(0)), Expr::param(ParamId(0))),
            body: vec![
                suspend(Expr::local(LocalId(0))),
                Stmt::Assign {
                    target: AssignTarget::Local(LocalId(0)),
                    value: Expr::binary(BinaryOp::Add, Expr::local(LocalId(0)), Expr::int(1)),
                },
            ],
        },
    ];
    let lowered = fx.lower(&m, &body);
    let machine = Machine::instantiate(
        &lowered,
        &[Value::Int(3)],
        None,
        RuntimeEnv::with_os_threads(),
    )
    .unwrap();

    let mut collected = Vec::new();
    while pull(&machine) {
        collected.push(current_int(&machine));
    }
    assert_eq!(collected, vec![0, 1, 2]);
    assert!(!pull(&machine));
}

fn n_then_n_plus_one(fx: &mut Fixture) -> LoweredIterator {
    let m = fx.method(&[("n", Ty::I64)], ReturnShape::Iterable);
    // yield n; n = n + 1; yield n
    let body = vec![
        suspend(Expr::param(ParamId(0))),
        Stmt::Assign {
            target: AssignTarget::Param(ParamId(0)),
            value: Expr::binary(BinaryOp::Add, Expr::param(ParamId(0)), Expr::int(1)),
        },
        suspend(Expr::param(ParamId(0))),
    ];
    fx.lower(&m, &body)
}

#[test]
fn independent_enumerators_forward_the_original_argument() {
    let mut fx = Fixture::new();
    let lowered = n_then_n_plus_one(&mut fx);
    let enumerable = Machine::instantiate(
        &lowered,
        &[Value::Int(5)],
        None,
        RuntimeEnv::with_os_threads(),
    )
    .unwrap();

    let first = enumerable.get_enumerator().unwrap();
    let second = enumerable.get_enumerator().unwrap();
    assert!(!Rc::ptr_eq(&first, &second));

    // Interleaved pulls: each cursor mutates only its own proxy.
    assert!(pull(&first));
    assert_eq!(current_int(&first), 5);
    assert!(pull(&second));
    assert_eq!(current_int(&second), 5);
    assert!(pull(&first));
    assert_eq!(current_int(&first), 6);
    assert!(pull(&second));
    assert_eq!(current_int(&second), 6);
    assert!(!pull(&first));
    assert!(!pull(&second));
}

#[test]
fn first_same_thread_activation_reuses_the_template() {
    let mut fx = Fixture::new();
    let lowered = n_then_n_plus_one(&mut fx);
    let enumerable = Machine::instantiate(
        &lowered,
        &[Value::Int(5)],
        None,
        RuntimeEnv::with_os_threads(),
    )
    .unwrap();

    let first = enumerable.get_enumerator().unwrap();
    assert!(Rc::ptr_eq(&enumerable, &first), "fast path must not allocate");

    // Drain it; the template's working proxy is now mutated.
    assert!(pull(&first) && pull(&first) && !pull(&first));

    // A second activation clones from the preserved initial values.
    let second = enumerable.get_enumerator().unwrap();
    assert!(!Rc::ptr_eq(&enumerable, &second));
    assert!(pull(&second));
    assert_eq!(current_int(&second), 5);
    assert!(pull(&second));
    assert_eq!(current_int(&second), 6);
}

#[test]
fn cross_thread_activation_always_allocates() {
    let mut fx = Fixture::new();
    let lowered = n_then_n_plus_one(&mut fx);

    // A switchable identity source stands in for real threads; execution
    // itself stays single-threaded.
    let thread = Rc::new(Cell::new(1));
    let source = {
        let thread = thread.clone();
        ThreadIdSource::new(move || thread.get())
    };
    let enumerable = Machine::instantiate(
        &lowered,
        &[Value::Int(5)],
        None,
        RuntimeEnv::with_thread_ids(source),
    )
    .unwrap();

    thread.set(2);
    let from_elsewhere = enumerable.get_enumerator().unwrap();
    assert!(!Rc::ptr_eq(&enumerable, &from_elsewhere));
    assert!(pull(&from_elsewhere));
    assert_eq!(current_int(&from_elsewhere), 5);

    // Back on the constructing thread the untouched template still takes
    // the fast path.
    thread.set(1);
    let local = enumerable.get_enumerator().unwrap();
    assert!(Rc::ptr_eq(&enumerable, &local));
}

#[test]
fn missing_thread_identity_degrades_to_always_allocate() {
    let mut fx = Fixture::without_thread_identity();
    let lowered = n_then_n_plus_one(&mut fx);
    assert!(lowered.state_machine.thread_field.is_none());

    let enumerable = Machine::instantiate(
        &lowered,
        &[Value::Int(5)],
        None,
        RuntimeEnv::without_thread_identity(),
    )
    .unwrap();

    let first = enumerable.get_enumerator().unwrap();
    assert!(!Rc::ptr_eq(&enumerable, &first));
    assert!(pull(&first));
    assert_eq!(current_int(&first), 5);
}

#[test]
fn untyped_views_delegate_to_the_typed_ones() {
    let mut fx = Fixture::new();
    let lowered = n_then_n_plus_one(&mut fx);
    let enumerable = Machine::instantiate(
        &lowered,
        &[Value::Int(5)],
        None,
        RuntimeEnv::with_os_threads(),
    )
    .unwrap();

    let cursor = enumerable.get_enumerator_untyped().unwrap();
    assert!(Rc::ptr_eq(&enumerable, &cursor));
    assert!(pull(&cursor));
    assert_eq!(cursor.current_untyped().unwrap(), cursor.current().unwrap());
}

#[test]
fn iterator_mode_has_no_enumerable_view() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = vec![suspend(Expr::int(1))];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert_eq!(
        machine.get_enumerator().err(),
        Some(MachineError::Unsupported("get_enumerator"))
    );
}

#[test]
fn reset_is_always_unsupported() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = vec![suspend(Expr::int(1))];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert_eq!(
        machine.reset().err(),
        Some(MachineError::Unsupported("reset"))
    );
    assert!(pull(&machine));
    assert_eq!(
        machine.reset().err(),
        Some(MachineError::Unsupported("reset"))
    );
}

fn guarded_body(fx: &mut Fixture, inner: Vec<Stmt>) -> Vec<Stmt> {
    // let done = false; try { ...inner } finally { done = true }
    vec![
        fx.local(0, "done", Ty::Bool, Expr::bool(false)),
        Stmt::TryFinally {
            body: inner,
            finally: vec![Stmt::Assign {
                target: AssignTarget::Local(LocalId(0)),
                value: Expr::bool(true),
            }],
        },
    ]
}

fn done_flag(lowered: &LoweredIterator, machine: &MachineRef) -> bool {
    let field = lowered
        .state_machine
        .find_field(FieldKind::Local(LocalId(0)))
        .expect("the flag local is captured");
    machine.field(field).as_bool().expect("flag is a bool")
}

#[test]
fn dispose_mid_iteration_runs_the_enclosing_finally() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = guarded_body(&mut fx, vec![suspend(Expr::int(1)), suspend(Expr::int(2))]);
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(pull(&machine));
    assert!(!done_flag(&lowered, &machine));

    machine.dispose().unwrap();
    assert!(done_flag(&lowered, &machine), "finally must run on dispose");
    assert_eq!(machine.state(), FINISHED_STATE as i64);
    assert!(!pull(&machine));
}

#[test]
fn normal_exhaustion_runs_the_finally_exactly_once() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    // let runs = 0; try { yield 1 } finally { runs = runs + 1 }
    let body = vec![
        fx.local(0, "runs", Ty::I64, Expr::int(0)),
        Stmt::TryFinally {
            body: vec![suspend(Expr::int(1))],
            finally: vec![Stmt::Assign {
                target: AssignTarget::Local(LocalId(0)),
                value: Expr::binary(BinaryOp::Add, Expr::local(LocalId(0)), Expr::int(1)),
            }],
        },
    ];
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();
    let runs_field = lowered
        .state_machine
        .find_field(FieldKind::Local(LocalId(0)))
        .unwrap();

    assert!(pull(&machine));
    assert!(!pull(&machine));
    assert_eq!(machine.field(runs_field).as_int(), Some(1));

    // Disposing an exhausted machine must not run the finally again.
    machine.dispose().unwrap();
    assert_eq!(machine.field(runs_field).as_int(), Some(1));
    assert_eq!(machine.state(), FINISHED_STATE as i64);
}

#[test]
fn raise_after_a_suspend_unwinds_through_the_finally_and_poisons() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = guarded_body(
        &mut fx,
        vec![suspend(Expr::int(1)), Stmt::Raise(Expr::str("boom"))],
    );
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(pull(&machine));
    let error = machine.pull_next().expect_err("the raise must surface");
    assert_eq!(error, MachineError::Raised(Value::Str(Rc::from("boom"))));

    assert!(done_flag(&lowered, &machine), "finally must run on unwind");
    assert_eq!(machine.state(), FINISHED_STATE as i64);
    // A poisoned machine reports exhaustion instead of resuming.
    assert!(!pull(&machine));
    machine.dispose().unwrap();
}

#[test]
fn early_finish_runs_the_finally_and_exhausts() {
    let mut fx = Fixture::new();
    let m = fx.method(&[], ReturnShape::Iterator);
    let body = guarded_body(
        &mut fx,
        vec![suspend(Expr::int(1)), Stmt::Finish, suspend(Expr::int(99))],
    );
    let lowered = fx.lower(&m, &body);
    let machine =
        Machine::instantiate(&lowered, &[], None, RuntimeEnv::with_os_threads()).unwrap();

    assert!(pull(&machine));
    assert_eq!(current_int(&machine), 1);
    assert!(!pull(&machine), "finish ends the sequence");
    assert!(done_flag(&lowered, &machine));
    assert_eq!(machine.state(), FINISHED_STATE as i64);
    assert!(!pull(&machine));
}

#[test]
fn instance_receiver_is_forwarded_to_every_cursor() {
    let mut fx = Fixture::new();
    let mut m = fx.method(&[], ReturnShape::Iterable);
    m.is_static = false;
    m.receiver_ty = Some(Ty::Str);
    m.element_ty = Some(Ty::Str);
    let body = vec![suspend(Expr::Receiver)];
    let lowered = fx.lower(&m, &body);

    let receiver = Value::Str(Rc::from("abc"));
    let enumerable = Machine::instantiate(
        &lowered,
        &[],
        Some(receiver.clone()),
        RuntimeEnv::with_os_threads(),
    )
    .unwrap();

    let first = enumerable.get_enumerator().unwrap();
    assert!(pull(&first));
    assert_eq!(first.current().unwrap(), receiver);

    let second = enumerable.get_enumerator().unwrap();
    assert!(!Rc::ptr_eq(&first, &second));
    assert!(pull(&second));
    assert_eq!(second.current().unwrap(), receiver);
}

#[test]
fn missing_dispose_member_reports_e4002_and_emits_nothing() {
    let mut interner = Interner::new();
    let m = MethodDescriptor {
        name: interner.intern("m"),
        declaring_type: interner.intern("Sequences"),
        params: Vec::new(),
        is_static: true,
        receiver_ty: None,
        element_ty: Some(Ty::I64),
        return_shape: ReturnShape::Iterator,
        span: Span::default(),
    };
    let body = vec![suspend(Expr::int(1))];
    let well_known = WellKnownMembers::new();
    let mut ctx = LowerCtx::new(&mut interner);
    let mut diags = Diagnostics::new();

    let lowered = lower_iterator(&m, &body, &well_known, &mut ctx, &mut diags);
    assert!(lowered.is_none());
    assert_eq!(diags.len(), 1);
    assert!(diags.render().contains("E4002"));
}
