// src/ir/code.rs
//! Flat generated-code form for state machine method bodies.
//!
//! The resumption rewriter flattens the bound tree into a label/jump
//! instruction sequence so that the dispatch prologue can transfer control
//! into the middle of the original statement structure. Finally blocks
//! become cleanup subroutines invoked with `CallCleanup`/`EndCleanup`,
//! reachable both from normal region exit and from the dispose dispatch.

use rustc_hash::FxHashMap;

use crate::ir::tree::{BinaryOp, Literal, UnaryOp};

/// Jump target, scoped to one `Body`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelId(pub u32);

/// Burst-scoped local slot of a generated body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

/// Field of the generated state machine type (index into its field list)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

/// Protocol member of the generated type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolRole {
    PullNext,
    Dispose,
    Current,
    CurrentUntyped,
    Reset,
    GetEnumerator,
    GetEnumeratorUntyped,
}

/// Expressions appearing in generated bodies. Variable references from the
/// source tree have been rewritten away into slots and fields by this point.
#[derive(Debug, Clone)]
pub enum CodeExpr {
    Literal(Literal),
    Slot(SlotId),
    /// Field of the executing machine instance.
    SelfField(FieldId),
    /// The executing machine instance itself.
    SelfRef,
    /// A fresh instance of the same generated type, constructed with the
    /// given initial state code.
    NewInstance { initial_state: i32 },
    /// Identity of the calling thread. Emitted only when the well-known
    /// thread-identity member was available at lowering time.
    CurrentThread,
    Unary(UnaryOp, Box<CodeExpr>),
    Binary {
        op: BinaryOp,
        left: Box<CodeExpr>,
        right: Box<CodeExpr>,
    },
}

impl CodeExpr {
    pub fn int(v: i64) -> CodeExpr {
        CodeExpr::Literal(Literal::Int(v))
    }

    pub fn state(code: i32) -> CodeExpr {
        CodeExpr::Literal(Literal::Int(code as i64))
    }

    pub fn binary(op: BinaryOp, left: CodeExpr, right: CodeExpr) -> CodeExpr {
        CodeExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

/// Storage targets of generated bodies
#[derive(Debug, Clone)]
pub enum Place {
    Slot(SlotId),
    SelfField(FieldId),
    /// Field of the machine instance held in a slot.
    SlotField(SlotId, FieldId),
}

#[derive(Debug, Clone)]
pub enum Instr {
    Label(LabelId),
    Jump(LabelId),
    /// Fall through when the condition holds, jump otherwise.
    BranchFalse { cond: CodeExpr, target: LabelId },
    /// Multi-way branch on the machine's state field. Unlisted codes
    /// (including the finished sentinel) go to `default`.
    Dispatch {
        arms: Vec<(i32, LabelId)>,
        default: LabelId,
    },
    Store { place: Place, value: CodeExpr },
    /// Evaluate for effect only.
    Eval(CodeExpr),
    /// Arm the cleanup subroutine for the enclosing region: it will run if
    /// evaluation faults before the matching `LeaveCleanup`.
    EnterCleanup(LabelId),
    LeaveCleanup,
    /// Run a cleanup subroutine and continue at the next instruction.
    CallCleanup(LabelId),
    /// Terminator of a cleanup subroutine.
    EndCleanup,
    ReturnBool(bool),
    ReturnValue(CodeExpr),
    Return,
    Raise(CodeExpr),
    /// The unsupported-operation trap (reset).
    Unsupported(&'static str),
    /// Tail-delegate to another protocol member of the same instance.
    Delegate(ProtocolRole),
}

/// An immutable generated method body.
#[derive(Debug, Clone, Default)]
pub struct Body {
    pub instrs: Vec<Instr>,
    pub slots: u32,
}

impl Body {
    /// Resolve each label to the index of its `Label` instruction.
    pub fn label_targets(&self) -> FxHashMap<LabelId, usize> {
        let mut targets = FxHashMap::default();
        for (pc, instr) in self.instrs.iter().enumerate() {
            if let Instr::Label(label) = instr {
                targets.insert(*label, pc);
            }
        }
        targets
    }

    /// The dispatch prologue, if the body starts with one.
    pub fn dispatch(&self) -> Option<(&[(i32, LabelId)], LabelId)> {
        match self.instrs.first() {
            Some(Instr::Dispatch { arms, default }) => Some((arms, *default)),
            _ => None,
        }
    }
}

/// Single-writer accumulator for a `Body`, frozen with [`BodyBuilder::finish`].
#[derive(Debug, Default)]
pub struct BodyBuilder {
    instrs: Vec<Instr>,
    slots: u32,
    next_label: u32,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_label(&mut self) -> LabelId {
        let label = LabelId(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn alloc_slot(&mut self) -> SlotId {
        let slot = SlotId(self.slots);
        self.slots += 1;
        slot
    }

    pub fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn bind(&mut self, label: LabelId) {
        self.instrs.push(Instr::Label(label));
    }

    /// Number of instructions emitted so far (for later patching).
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Replace a previously emitted placeholder instruction.
    pub fn patch(&mut self, index: usize, instr: Instr) {
        self.instrs[index] = instr;
    }

    pub fn finish(self) -> Body {
        Body {
            instrs: self.instrs,
            slots: self.slots,
        }
    }
}
