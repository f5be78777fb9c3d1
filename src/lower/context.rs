// src/lower/context.rs

use crate::ir::intern::{Interner, Symbol};
use crate::ir::method::MethodDescriptor;

/// Shared synthesis context for a lowering session.
///
/// Carries the interner and the compilation-wide uniqueness counter for
/// generated type names. Constructed explicitly and threaded through the
/// pass; one context per test gives fully reproducible names.
#[derive(Debug)]
pub struct LowerCtx<'a> {
    pub interner: &'a mut Interner,
    generator_count: u32,
}

impl<'a> LowerCtx<'a> {
    pub fn new(interner: &'a mut Interner) -> Self {
        Self {
            interner,
            generator_count: 0,
        }
    }

    /// Synthesize the name of the generated state machine type for `method`.
    ///
    /// Deterministic for a fixed sequence of lowerings: the counter
    /// disambiguates overloads that share a declaring type and name.
    pub fn generator_name(&mut self, method: &MethodDescriptor) -> Symbol {
        let name = format!(
            "__Generator_{}_{}_{}",
            self.interner.resolve(method.declaring_type),
            self.interner.resolve(method.name),
            self.generator_count,
        );
        self.generator_count += 1;
        self.interner.intern(&name)
    }
}
