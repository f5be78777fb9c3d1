// src/ir/mod.rs
pub mod code;
pub mod intern;
pub mod method;
pub mod span;
pub mod tree;

pub use code::{Body, BodyBuilder, CodeExpr, FieldId, Instr, LabelId, Place, ProtocolRole, SlotId};
pub use intern::{Interner, Symbol};
pub use method::{MethodDescriptor, ParamDef, ParamId, ReturnShape};
pub use span::Span;
pub use tree::{AssignTarget, BinaryOp, Expr, Literal, LocalId, Stmt, Ty, UnaryOp};
