// src/errors/mod.rs
//! Structured error reporting for the lowering core.
//!
//! Lowering never throws across its boundary; detected problems are pushed
//! into a [`Diagnostics`] bag attached to the original method's declaration
//! location, and the caller decides what to do with the un-lowered method.

pub mod lower;
pub mod report;

pub use lower::LoweringError;
pub use report::{render_to_stderr, render_to_string};

/// Ordered sink for lowering diagnostics.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<LoweringError>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: LoweringError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoweringError> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<LoweringError> {
        self.errors
    }

    /// Render every diagnostic without colors, one report after another.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for error in &self.errors {
            out.push_str(&report::render_to_string(error));
        }
        out
    }
}
