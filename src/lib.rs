//! Parashade — ahead-of-time compiler, bytecode VM, and NASM emitter for the
//! Parashade surface language.
//!
//! Pipeline:
//! - long-form phrases normalize to the core dialect (`frontend::normalize_longform`)
//! - core text is lexed, parsed, and lowered to a stack IR with constant
//!   folding of the superlative intrinsics (`frontend::compile_module`)
//! - branch targets finalize to absolute byte offsets (`parx_format::finalize`)
//! - the finalized buffer is interpreted (`parx_vm::run`) or re-emitted as
//!   x86-64 Windows assembly plus a build script (`nasm`)
//! - locals and warnings serialize to a JSON sidecar (`meta`)
//!
//! The interpreter and the assembly backend share local-index assignment,
//! operand-stack discipline, and branch-target resolution, so a program
//! returns the same value from both.

pub mod capsule;
pub mod frontend;
pub mod meta;
pub mod nasm;
pub mod parx_format;
pub mod parx_vm;

pub use frontend::{compile_module, Compilation, CompileError};
