//! An x86-64 code generator for a typed linear IR.  This crate is the
//! lowering backend of a larger toolchain: producing the IR, checking its
//! types, and assembling the emitted text are jobs of external collaborators.
//! See `src/bin` for the demo driver using this library.

pub mod common;
pub mod ir;
pub mod back;
