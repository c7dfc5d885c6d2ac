//! Attribute macros for shallow call instrumentation.
//!
//! Use them through `shallow-runtime`, which re-exports both and provides the
//! items the expansion refers to.

use proc_macro::TokenStream;
use shallow::rewrite::{Marker, expand_marker};

/// Wrap every call made directly in the function body.
///
/// ```text
/// #[wrap_calls(wrapper = PATH, ignore_builtins, blacklist = [..] | whitelist = [..],
///              rewrite_details = IDENT)]
/// ```
///
/// `PATH` is called as `PATH(&'static CallSite)` before each call; the value it
/// returns is dropped once the call completes, unwinds, or is left by `?`.
#[proc_macro_attribute]
pub fn wrap_calls(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand_marker(Marker::WrapCalls, attr.into(), item.into()).into()
}

/// Time every call made directly in the function body and report each
/// invocation against a time limit.
///
/// ```text
/// #[profile(time_limit = SECS, below = PATH | none, above = PATH | none,
///           ignore_builtins, blacklist = [..] | whitelist = [..], rewrite_details = IDENT)]
/// ```
#[proc_macro_attribute]
pub fn profile(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand_marker(Marker::Profile, attr.into(), item.into()).into()
}
