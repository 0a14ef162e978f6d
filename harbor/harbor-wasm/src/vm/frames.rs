//! Call and control frames used by the interpreter.

use crate::model::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Block,
    Loop,
    If,
    Function,
}

/// A branch target.
#[derive(Debug, Clone, Copy)]
pub struct Label {
    pub kind: BlockKind,
    /// Value stack height below the block's parameters.
    pub height: usize,
    /// Values carried by a branch to this label (params for loops, results otherwise).
    pub branch_arity: usize,
    /// Values left on the stack when the block ends normally.
    pub end_arity: usize,
    /// Where a branch continues: loop body start, or just past the matching `end`.
    pub continuation: usize,
}

#[derive(Debug)]
pub struct CallFrame {
    /// Index into `Module::codes`.
    pub code: usize,
    pub pc: usize,
    pub locals: Vec<Value>,
    pub labels: Vec<Label>,
}

impl CallFrame {
    pub fn new(code: usize, locals: Vec<Value>, height: usize, results: usize, body_len: usize) -> Self {
        let function = Label {
            kind: BlockKind::Function,
            height,
            branch_arity: results,
            end_arity: results,
            continuation: body_len,
        };
        Self { code, pc: 0, locals, labels: vec![function] }
    }
}
