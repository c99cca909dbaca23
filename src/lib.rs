#![warn(clippy::all)]

//! sago is an execution engine for SSA programs of a statically-typed
//! procedural language. It consumes a fully type-checked program
//! (packages, functions, basic blocks, typed instructions) plus a
//! registry of native packages, and executes it with source-language
//! semantics: arithmetic, control flow, method dispatch, deferred
//! calls, panic/recover, goroutine concurrency, channel operations,
//! map/slice/struct/interface operations, and a curated set of
//! built-ins.
//!
//! The pipeline: a front end builds an [`ssa::Program`] and registers
//! native packages in a [`Registry`]; [`Interp::new`] compiles every
//! reachable function into pre-resolved register-addressed steps and
//! runs the init chain; [`Interp::run`] executes an entry function and
//! maps uncaught panics to exit codes.

pub mod bridge;
pub mod builtins;
pub mod chan;
mod compile;
pub mod error;
mod interp;
mod loader;
pub mod ops;
pub mod ssa;
pub mod types;
pub mod value;

pub use bridge::{
    HostFunc, Loader, NamedTypeRec, Package, Registry, RtMethod, Rtype, TypesRecord, UntypedConst,
    UntypedKind,
};
pub use builtins::{capture_output, take_captured, write_output};
pub use error::{Error, Panic, PlainError, RuntimeError};
pub use interp::{DebugInfo, Interp, Mode};
pub use value::Value;
