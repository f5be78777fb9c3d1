// src/runtime/machine.rs
//! Interpreter for generated state machine descriptors.
//!
//! A [`Machine`] is one instance of a generated type: the descriptor, a
//! field block, and the runtime environment it was constructed in.
//! Protocol operations execute the corresponding generated body. Execution
//! is strictly single-threaded and non-reentrant, matching the protocol
//! contract; pull-next calls must be sequential.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::ir::code::{Body, CodeExpr, FieldId, Instr, LabelId, Place};
use crate::ir::tree::{BinaryOp, Literal, UnaryOp};
use crate::lower::{FINISHED_STATE, ForwardSource, LoweredIterator, StateMachine};
use crate::runtime::thread::ThreadIdSource;
use crate::runtime::value::Value;

/// Capabilities a machine executes against.
#[derive(Debug, Clone, Default)]
pub struct RuntimeEnv {
    pub thread_ids: Option<ThreadIdSource>,
}

impl RuntimeEnv {
    /// Full environment: real per-OS-thread identities.
    pub fn with_os_threads() -> Self {
        RuntimeEnv {
            thread_ids: Some(ThreadIdSource::os()),
        }
    }

    pub fn with_thread_ids(source: ThreadIdSource) -> Self {
        RuntimeEnv {
            thread_ids: Some(source),
        }
    }

    /// Degraded environment without the thread-identity primitive.
    pub fn without_thread_identity() -> Self {
        RuntimeEnv::default()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MachineError {
    #[error("operation '{0}' is not supported")]
    Unsupported(&'static str),
    #[error("raised: {0:?}")]
    Raised(Value),
    #[error("divide by zero")]
    DivideByZero,
    #[error("type confusion in generated code: expected {expected}, found {found}")]
    TypeConfusion {
        expected: &'static str,
        found: &'static str,
    },
    #[error("thread identity is unavailable on this runtime")]
    NoThreadIdentity,
    #[error("receiver value missing for an instance iterator")]
    MissingReceiver,
    #[error("malformed generated body: {0}")]
    Malformed(&'static str),
}

pub type MachineRef = Rc<Machine>;

#[derive(Debug)]
pub struct Machine {
    desc: Rc<StateMachine>,
    env: RuntimeEnv,
    fields: RefCell<Vec<Value>>,
}

/// What a body run produced.
enum Outcome {
    Bool(bool),
    Value(Value),
    Unit,
}

impl Machine {
    /// Execute the replacement body of a lowered method: construct an
    /// instance with the mode's initial state and forward the arguments
    /// into the descriptor's capture fields.
    pub fn instantiate(
        lowered: &LoweredIterator,
        args: &[Value],
        receiver: Option<Value>,
        env: RuntimeEnv,
    ) -> Result<MachineRef, MachineError> {
        let desc = Rc::new(lowered.state_machine.clone());
        let machine = Machine::construct(desc, &env, lowered.replacement.initial_state)?;
        for forward in &lowered.replacement.forwards {
            let value = match forward.source {
                ForwardSource::Param(p) => args
                    .get(p.0 as usize)
                    .cloned()
                    .ok_or(MachineError::Malformed("missing argument"))?,
                ForwardSource::Receiver => {
                    receiver.clone().ok_or(MachineError::MissingReceiver)?
                }
            };
            machine.fields.borrow_mut()[forward.field.0 as usize] = value;
        }
        Ok(machine)
    }

    /// The constructor of the generated type: default every field, assign
    /// the state field from the single argument, stamp the thread-affinity
    /// field when the descriptor carries one.
    fn construct(
        desc: Rc<StateMachine>,
        env: &RuntimeEnv,
        initial_state: i32,
    ) -> Result<MachineRef, MachineError> {
        let mut fields: Vec<Value> = desc.fields.iter().map(|f| Value::default_for(f.ty)).collect();
        fields[desc.state_field.0 as usize] = Value::Int(initial_state as i64);
        if desc.constructor.stamps_thread {
            let source = env
                .thread_ids
                .as_ref()
                .ok_or(MachineError::NoThreadIdentity)?;
            let thread_field = desc.thread_field.expect("stamping without a thread field");
            fields[thread_field.0 as usize] = Value::Int(source.current());
        }
        Ok(Rc::new(Machine {
            desc,
            env: env.clone(),
            fields: RefCell::new(fields),
        }))
    }

    pub fn descriptor(&self) -> &StateMachine {
        &self.desc
    }

    /// Current state code (observable for tests and debugging).
    pub fn state(&self) -> i64 {
        self.fields.borrow()[self.desc.state_field.0 as usize]
            .as_int()
            .expect("state field holds a non-integer")
    }

    /// Read a field of the instance (observable for tests and debugging).
    pub fn field(&self, id: FieldId) -> Value {
        self.fields.borrow()[id.0 as usize].clone()
    }

    fn set_state(&self, code: i32) {
        self.fields.borrow_mut()[self.desc.state_field.0 as usize] = Value::Int(code as i64);
    }

    /// Advance the machine. An error escaping the body poisons the state
    /// to the finished sentinel before propagating, so a later call
    /// reliably reports exhaustion instead of re-entering a dead resume
    /// target.
    pub fn pull_next(self: &Rc<Self>) -> Result<bool, MachineError> {
        match self.run(&self.desc.methods.pull_next) {
            Ok(Outcome::Bool(available)) => Ok(available),
            Ok(_) => Err(MachineError::Malformed("pull_next must produce a bool")),
            Err(error) => {
                self.set_state(FINISHED_STATE);
                Err(error)
            }
        }
    }

    /// Run pending finally blocks for the suspended position, then mark
    /// the machine finished. Idempotent; a no-op apart from the sentinel
    /// store when the machine never started or already finished.
    pub fn dispose(self: &Rc<Self>) -> Result<(), MachineError> {
        match self.run(&self.desc.methods.dispose) {
            Ok(_) => Ok(()),
            Err(error) => {
                self.set_state(FINISHED_STATE);
                Err(error)
            }
        }
    }

    /// The most recently published element. Stable between pull-next
    /// calls; no side effects.
    pub fn current(self: &Rc<Self>) -> Result<Value, MachineError> {
        self.run_for_value(&self.desc.methods.current)
    }

    pub fn current_untyped(self: &Rc<Self>) -> Result<Value, MachineError> {
        self.run_for_value(&self.desc.methods.current_untyped)
    }

    /// Always fails: mid-flight restart is not part of the protocol.
    pub fn reset(self: &Rc<Self>) -> Result<(), MachineError> {
        self.run(&self.desc.methods.reset).map(|_| ())
    }

    /// Activate an enumeration (iterable mode only).
    pub fn get_enumerator(self: &Rc<Self>) -> Result<MachineRef, MachineError> {
        let Some(body) = self.desc.methods.get_enumerator.as_ref() else {
            return Err(MachineError::Unsupported("get_enumerator"));
        };
        self.run_for_machine(body)
    }

    pub fn get_enumerator_untyped(self: &Rc<Self>) -> Result<MachineRef, MachineError> {
        let Some(body) = self.desc.methods.get_enumerator_untyped.as_ref() else {
            return Err(MachineError::Unsupported("get_enumerator"));
        };
        self.run_for_machine(body)
    }

    fn run_for_value(self: &Rc<Self>, body: &Body) -> Result<Value, MachineError> {
        match self.run(body)? {
            Outcome::Value(value) => Ok(value),
            _ => Err(MachineError::Malformed("body must produce a value")),
        }
    }

    fn run_for_machine(self: &Rc<Self>, body: &Body) -> Result<MachineRef, MachineError> {
        match self.run(body)? {
            Outcome::Value(Value::Machine(machine)) => Ok(machine),
            _ => Err(MachineError::Malformed("body must produce an instance")),
        }
    }

    /// The instruction loop. Cleanup handling mirrors the rewriter's
    /// contract: `EnterCleanup` arms a handler for the current burst,
    /// faults run armed handlers innermost-first and then propagate.
    fn run(self: &Rc<Self>, body: &Body) -> Result<Outcome, MachineError> {
        let targets = body.label_targets();
        let mut slots = vec![Value::Unit; body.slots as usize];
        let mut pc = 0usize;
        let mut armed: Vec<LabelId> = Vec::new();
        let mut calls: Vec<usize> = Vec::new();
        let mut unwinding: Option<MachineError> = None;

        macro_rules! jump {
            ($label:expr) => {
                match targets.get(&$label) {
                    Some(&target) => pc = target,
                    None => return Err(MachineError::Malformed("jump to an unbound label")),
                }
            };
        }
        macro_rules! fault {
            ($error:expr) => {
                match armed.pop() {
                    Some(handler) => {
                        calls.clear();
                        unwinding = Some($error);
                        jump!(handler);
                    }
                    None => return Err($error),
                }
            };
        }

        loop {
            let Some(instr) = body.instrs.get(pc) else {
                return Err(MachineError::Malformed("execution fell off the body"));
            };
            match instr {
                Instr::Label(_) => pc += 1,
                Instr::Jump(label) => jump!(*label),
                Instr::BranchFalse { cond, target } => match self.eval(cond, &slots) {
                    Ok(value) => match value.as_bool() {
                        Some(true) => pc += 1,
                        Some(false) => jump!(*target),
                        None => fault!(MachineError::TypeConfusion {
                            expected: "bool",
                            found: value.type_name(),
                        }),
                    },
                    Err(error) => fault!(error),
                },
                Instr::Dispatch { arms, default } => {
                    let state = self.state();
                    match arms.iter().find(|(code, _)| *code as i64 == state) {
                        Some((_, label)) => jump!(*label),
                        None => jump!(*default),
                    }
                }
                Instr::Store { place, value } => match self.eval(value, &slots) {
                    Ok(value) => match self.store(place, value, &mut slots) {
                        Ok(()) => pc += 1,
                        Err(error) => fault!(error),
                    },
                    Err(error) => fault!(error),
                },
                Instr::Eval(expr) => match self.eval(expr, &slots) {
                    Ok(_) => pc += 1,
                    Err(error) => fault!(error),
                },
                Instr::EnterCleanup(label) => {
                    armed.push(*label);
                    pc += 1;
                }
                Instr::LeaveCleanup => {
                    if armed.pop().is_none() {
                        return Err(MachineError::Malformed("unbalanced LeaveCleanup"));
                    }
                    pc += 1;
                }
                Instr::CallCleanup(label) => {
                    calls.push(pc + 1);
                    jump!(*label);
                }
                Instr::EndCleanup => {
                    if let Some(ret) = calls.pop() {
                        pc = ret;
                    } else if let Some(error) = unwinding.take() {
                        match armed.pop() {
                            Some(handler) => {
                                unwinding = Some(error);
                                jump!(handler);
                            }
                            None => return Err(error),
                        }
                    } else {
                        return Err(MachineError::Malformed("EndCleanup outside a cleanup call"));
                    }
                }
                Instr::ReturnBool(available) => return Ok(Outcome::Bool(*available)),
                Instr::ReturnValue(expr) => match self.eval(expr, &slots) {
                    Ok(value) => return Ok(Outcome::Value(value)),
                    Err(error) => fault!(error),
                },
                Instr::Return => return Ok(Outcome::Unit),
                Instr::Raise(expr) => match self.eval(expr, &slots) {
                    Ok(value) => fault!(MachineError::Raised(value)),
                    Err(error) => fault!(error),
                },
                Instr::Unsupported(op) => return Err(MachineError::Unsupported(*op)),
                Instr::Delegate(role) => {
                    let Some(delegated) = self.desc.methods.body(*role) else {
                        return Err(MachineError::Malformed("delegation to an absent member"));
                    };
                    return self.run(delegated);
                }
            }
        }
    }

    fn eval(self: &Rc<Self>, expr: &CodeExpr, slots: &[Value]) -> Result<Value, MachineError> {
        match expr {
            CodeExpr::Literal(Literal::Int(v)) => Ok(Value::Int(*v)),
            CodeExpr::Literal(Literal::Bool(v)) => Ok(Value::Bool(*v)),
            CodeExpr::Literal(Literal::Str(v)) => Ok(Value::Str(Rc::from(v.as_str()))),
            CodeExpr::Slot(slot) => Ok(slots[slot.0 as usize].clone()),
            CodeExpr::SelfField(field) => Ok(self.fields.borrow()[field.0 as usize].clone()),
            CodeExpr::SelfRef => Ok(Value::Machine(self.clone())),
            CodeExpr::NewInstance { initial_state } => {
                let machine = Machine::construct(self.desc.clone(), &self.env, *initial_state)?;
                Ok(Value::Machine(machine))
            }
            CodeExpr::CurrentThread => {
                let source = self
                    .env
                    .thread_ids
                    .as_ref()
                    .ok_or(MachineError::NoThreadIdentity)?;
                Ok(Value::Int(source.current()))
            }
            CodeExpr::Unary(op, operand) => {
                let value = self.eval(operand, slots)?;
                match op {
                    UnaryOp::Neg => Ok(Value::Int(-expect_int(&value)?)),
                    UnaryOp::Not => Ok(Value::Bool(!expect_bool(&value)?)),
                }
            }
            CodeExpr::Binary { op, left, right } => {
                let left = self.eval(left, slots)?;
                let right = self.eval(right, slots)?;
                binary(*op, left, right)
            }
        }
    }

    fn store(
        &self,
        place: &Place,
        value: Value,
        slots: &mut [Value],
    ) -> Result<(), MachineError> {
        match place {
            Place::Slot(slot) => {
                slots[slot.0 as usize] = value;
                Ok(())
            }
            Place::SelfField(field) => {
                self.fields.borrow_mut()[field.0 as usize] = value;
                Ok(())
            }
            Place::SlotField(slot, field) => match &slots[slot.0 as usize] {
                Value::Machine(machine) => {
                    machine.fields.borrow_mut()[field.0 as usize] = value;
                    Ok(())
                }
                other => Err(MachineError::TypeConfusion {
                    expected: "machine",
                    found: other.type_name(),
                }),
            },
        }
    }
}

fn expect_int(value: &Value) -> Result<i64, MachineError> {
    value.as_int().ok_or(MachineError::TypeConfusion {
        expected: "i64",
        found: value.type_name(),
    })
}

fn expect_bool(value: &Value) -> Result<bool, MachineError> {
    value.as_bool().ok_or(MachineError::TypeConfusion {
        expected: "bool",
        found: value.type_name(),
    })
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, MachineError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Add => Ok(Value::Int(expect_int(&left)? + expect_int(&right)?)),
        BinaryOp::Sub => Ok(Value::Int(expect_int(&left)? - expect_int(&right)?)),
        BinaryOp::Mul => Ok(Value::Int(expect_int(&left)? * expect_int(&right)?)),
        BinaryOp::Div => {
            let divisor = expect_int(&right)?;
            if divisor == 0 {
                return Err(MachineError::DivideByZero);
            }
            Ok(Value::Int(expect_int(&left)? / divisor))
        }
        BinaryOp::Lt => Ok(Value::Bool(expect_int(&left)? < expect_int(&right)?)),
        BinaryOp::Le => Ok(Value::Bool(expect_int(&left)? <= expect_int(&right)?)),
        BinaryOp::Gt => Ok(Value::Bool(expect_int(&left)? > expect_int(&right)?)),
        BinaryOp::Ge => Ok(Value::Bool(expect_int(&left)? >= expect_int(&right)?)),
        BinaryOp::And => Ok(Value::Bool(expect_bool(&left)? && expect_bool(&right)?)),
        BinaryOp::Or => Ok(Value::Bool(expect_bool(&left)? || expect_bool(&right)?)),
    }
}
