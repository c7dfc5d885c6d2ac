//! Call-time support for functions rewritten by shallow.
//!
//! A rewritten call `EXPR` reads
//!
//! ```text
//! ::shallow_runtime::finish(WRAPPER(&SITE), EXPR)
//! ```
//!
//! `WRAPPER` is any function taking `&'static CallSite`. Calling it is the
//! before-action, and dropping what it returns is the after-action, which
//! therefore also runs when the call panics or an early `?` leaves the
//! enclosing expression.
//!
//! ```
//! use shallow_runtime::{CallSite, Defer, defer};
//!
//! fn log_call(site: &'static CallSite) -> Defer<impl FnOnce()> {
//!     eprintln!("-> {site}");
//!     defer(move || eprintln!("<- {}", site.name()))
//! }
//!
//! #[shallow_runtime::wrap_calls(wrapper = log_call)]
//! fn total(n: u64) -> u64 {
//!     (0..n).map(|v| v * 2).sum()
//! }
//! # assert_eq!(total(3), 6);
//! ```

use std::fmt;

pub mod profile;

#[cfg(feature = "macros")]
pub use shallow_macros::{profile, wrap_calls};

/// One rewritten call expression, as written in source.
#[derive(Debug)]
pub struct CallSite {
    name: &'static str,
    function: &'static str,
    file: &'static str,
    line: u32,
    end_line: u32,
    column: u32,
    snippet: &'static str,
}

impl CallSite {
    #[doc(hidden)]
    pub const fn new(
        name: &'static str,
        function: &'static str,
        file: &'static str,
        line: u32,
        end_line: u32,
        column: u32,
        snippet: &'static str,
    ) -> Self {
        Self {
            name,
            function,
            file,
            line,
            end_line,
            column,
            snippet,
        }
    }

    /// Canonical name of the call target, e.g. `self.client.send` or
    /// `handlers[*]`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The rewritten function the call is made from.
    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Last line of a call spanning several lines.
    pub fn end_line(&self) -> u32 {
        self.end_line
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    /// Whitespace-normalised source of the call, truncated to 80 chars.
    pub fn snippet(&self) -> &'static str {
        self.snippet
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}:{}) `{}`",
            self.name, self.file, self.line, self.column, self.snippet
        )
    }
}

/// Drop `guard`, then hand back `result`.
#[doc(hidden)]
#[inline(always)]
pub fn finish<G, R>(guard: G, result: R) -> R {
    drop(guard);
    result
}

/// Run `f` when the returned guard drops.
pub fn defer<F: FnOnce()>(f: F) -> Defer<F> {
    Defer(Some(f))
}

#[must_use = "the closure runs when the guard drops; binding it to `_` runs it immediately"]
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Emitted for `rewrite_details = NAME`: the function before and after the
/// rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RewriteDetails {
    pub function: &'static str,
    pub original_source: &'static str,
    pub new_source: &'static str,
}

/// Install a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
/// (default `info`). Does nothing if a global subscriber is already set.
#[cfg(feature = "subscriber")]
pub fn install_default_subscriber() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
