// src/ir/method.rs

use crate::ir::intern::Symbol;
use crate::ir::span::Span;
use crate::ir::tree::Ty;

/// Unique identifier for a declared parameter (index into the parameter list)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub u32);

#[derive(Debug, Clone)]
pub struct ParamDef {
    pub name: Symbol,
    pub ty: Ty,
}

/// The protocol view the original method's declared return type requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// Multi-use: each enumeration gets an independent cursor.
    Iterable,
    /// Single-use: the returned value is the cursor itself.
    Iterator,
}

/// Identity of the source method being lowered. Immutable input; the
/// lowering core never mutates it.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: Symbol,
    pub declaring_type: Symbol,
    pub params: Vec<ParamDef>,
    pub is_static: bool,
    /// Type of the receiver; `None` for static methods.
    pub receiver_ty: Option<Ty>,
    /// Element type produced per suspension. `None` when the return shape
    /// fails to name one, which aborts lowering with a diagnostic.
    pub element_ty: Option<Ty>,
    pub return_shape: ReturnShape,
    pub span: Span,
}

impl MethodDescriptor {
    pub fn param(&self, id: ParamId) -> &ParamDef {
        &self.params[id.0 as usize]
    }

    pub fn param_ids(&self) -> impl Iterator<Item = ParamId> + '_ {
        (0..self.params.len() as u32).map(ParamId)
    }
}
