// src/errors/lower.rs
//! Iterator lowering errors (E4xxx).

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Error, Debug, Diagnostic, Clone)]
pub enum LoweringError {
    #[error("iterator method '{method}' does not declare an element type")]
    #[diagnostic(
        code(E4001),
        help("the declared return shape must name the type produced at each suspension")
    )]
    MissingElementType {
        method: String,
        #[label("cannot determine the yielded element type")]
        span: SourceSpan,
    },

    #[error("required runtime member '{member}' is unavailable")]
    #[diagnostic(
        code(E4002),
        help("the target runtime must provide '{member}' before iterator methods can be lowered")
    )]
    MissingRuntimeMember {
        member: String,
        #[label("method cannot be lowered")]
        span: SourceSpan,
    },
}
