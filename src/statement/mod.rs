//! Statement classification, compilation and binding.

mod kind;
mod program;

pub use kind::{statement_start_index, StatementKind};
pub use program::{Program, Statement, StatementInfo};
