//! Shallow call instrumentation.
//!
//! Rewrites the calls made directly inside a function, and only that
//! function, into calls bracketed by a user-supplied wrapper. The rewrite runs
//! at build time, either from the `#[wrap_calls]`/`#[profile]` attribute
//! macros (see `shallow-runtime`) or from the `shallow` CLI on a staged copy
//! of a project.

#[cfg(feature = "cli")]
pub mod build;
pub mod config;
pub mod error;
pub mod instrument;
pub mod name;
pub mod profile;
#[cfg(feature = "cli")]
pub mod resolve;
pub mod rewrite;
pub mod transform;
pub mod wrap;
