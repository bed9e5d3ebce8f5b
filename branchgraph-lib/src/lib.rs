//! Core functionality for branchgraph: a reactive memoization kernel, a
//! branch/commit model layered on top of it, and a DAG layout engine.
//!
//! This crate deliberately knows nothing about terminal rendering, CLI
//! argument parsing, or CI status providers; those are external
//! collaborators invoked through narrow interfaces (see [`ci`] and the
//! `branchgraph` binary crate).

#![warn(missing_docs)]
#![warn(
    clippy::all,
    clippy::as_conversions,
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro
)]
#![allow(clippy::too_many_arguments)]

pub mod ci;
pub mod git;
pub mod kernel;
pub mod layout;
pub mod process;
pub mod util;
