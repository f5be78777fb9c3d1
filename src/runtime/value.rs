// src/runtime/value.rs

use std::rc::Rc;

use crate::ir::tree::Ty;
use crate::runtime::machine::Machine;

/// Runtime value of a field, slot, or published element.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    Int(i64),
    Bool(bool),
    Str(Rc<str>),
    Machine(Rc<Machine>),
}

impl Value {
    /// Construction-time default for a field of type `ty`.
    pub fn default_for(ty: Ty) -> Value {
        match ty {
            Ty::I64 => Value::Int(0),
            Ty::Bool => Value::Bool(false),
            Ty::Str => Value::Str(Rc::from("")),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Int(_) => "i64",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Machine(_) => "machine",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Machines compare by identity; everything else by value.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Machine(a), Value::Machine(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}
