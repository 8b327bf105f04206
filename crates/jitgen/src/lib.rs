#![allow(
    clippy::cast_possible_truncation, // intentional: frame indices and smi payloads are narrowed to machine words
    clippy::cast_possible_wrap, // intentional: addresses are u32 but branch and field offsets are i32
    clippy::cast_sign_loss, // intentional: tagged words are reinterpreted between i32 and u32
    clippy::too_many_lines, // statement and expression lowering follow the AST variants one to one
    clippy::missing_errors_doc // every walker returns the crate Result
)]

pub mod ast;
pub mod codegen;
pub mod error;
pub mod layout;
pub mod machine;
pub mod options;
pub mod runtime;

#[cfg(feature = "frontend")]
pub mod frontend;

#[cfg(feature = "simulator")]
pub mod sim;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled, and needs both the frontend and the
/// simulator.
#[cfg(all(
    feature = "frontend",
    feature = "simulator",
    any(test, feature = "test-harness")
))]
pub mod test_harness;

pub use codegen::compile;
pub use error::{Error, Result};
pub use machine::{Code, Instruction, Opcode};
pub use options::CompileOptions;
