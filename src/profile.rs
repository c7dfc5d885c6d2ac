//! The shallow profiler's rewrite.
//!
//! Calls are wrapped with `::shallow_runtime::profile::time` by the ordinary
//! call-wrap rewrite; this transform then opens the body with a per-function
//! `Profile` static and a per-invocation guard:
//!
//! ```text
//! static __SHALLOW_PROFILE: Profile = Profile::new("f", LIMIT, BELOW, ABOVE);
//! let __shallow_profile = Invocation::start(&__SHALLOW_PROFILE);
//! ```
//!
//! The guard owns the invocation's call records and dispatches the report
//! when it drops, on return and on unwind alike.
//!
//! An `async fn` body may be suspended while other invocations run on the
//! same thread, so it is moved into a future entered on every poll:
//!
//! ```text
//! let __shallow_profile = Invocation::new(&__SHALLOW_PROFILE);
//! scope(&__shallow_profile, async move { let __shallow_return: T = { BODY }; __shallow_return }).await
//! ```

use proc_macro2::{TokenStream, TokenTree};
use quote::{ToTokens, quote};

use crate::config::ProfileConfig;
use crate::error::RewriteError;
use crate::rewrite::FnSource;
use crate::transform::{Transform, allow_unreachable_code};

pub struct ProfilePrologue {
    secs: u64,
    nanos: u32,
    below: TokenStream,
    above: TokenStream,
}

impl ProfilePrologue {
    pub fn new(config: &ProfileConfig) -> Self {
        Self {
            secs: config.time_limit.as_secs(),
            nanos: config.time_limit.subsec_nanos(),
            below: callback(config.below.as_ref()),
            above: callback(config.above.as_ref()),
        }
    }
}

fn callback(path: Option<&syn::Path>) -> TokenStream {
    match path {
        Some(path) => quote! {
            ::core::option::Option::Some(#path as ::shallow_runtime::profile::Callback)
        },
        None => quote!(::core::option::Option::None),
    }
}

/// The declared return type, if it can annotate a `let`.
///
/// Pins the async block's output so `?` in the body still knows its error
/// type. `impl Trait` is not allowed on a `let`, so those are left inferred.
fn let_type(output: &syn::ReturnType) -> Option<&syn::Type> {
    match output {
        syn::ReturnType::Type(_, ty) if !mentions_impl(ty.to_token_stream()) => Some(ty),
        _ => None,
    }
}

fn mentions_impl(tokens: TokenStream) -> bool {
    tokens.into_iter().any(|tt| match tt {
        TokenTree::Ident(ident) => ident == "impl",
        TokenTree::Group(group) => mentions_impl(group.stream()),
        _ => false,
    })
}

impl Transform for ProfilePrologue {
    fn name(&self) -> &'static str {
        "profile"
    }

    fn apply(&mut self, item: &mut FnSource, function: &str) -> Result<usize, RewriteError> {
        if item.sig.constness.is_some() {
            return Err(RewriteError::ConstFn);
        }
        let Some(block) = item.block.as_mut() else {
            return Ok(0);
        };
        let Self {
            secs,
            nanos,
            below,
            above,
        } = self;
        let profile = quote! {
            static __SHALLOW_PROFILE: ::shallow_runtime::profile::Profile =
                ::shallow_runtime::profile::Profile::new(
                    #function,
                    ::core::time::Duration::new(#secs, #nanos),
                    #below,
                    #above,
                );
        };

        if item.sig.asyncness.is_none() {
            let prologue: syn::Block = syn::parse_quote! {{
                #profile
                let __shallow_profile = ::shallow_runtime::profile::Invocation::start(&__SHALLOW_PROFILE);
            }};
            block.stmts.splice(0..0, prologue.stmts);
            return Ok(0);
        }

        let stmts = std::mem::take(&mut block.stmts);
        let body = match let_type(&item.sig.output) {
            Some(ty) => quote! {
                let __shallow_return: #ty = { #(#stmts)* };
                __shallow_return
            },
            None => quote!(#(#stmts)*),
        };
        let scoped: syn::Block = syn::parse_quote! {{
            #profile
            let __shallow_profile = ::shallow_runtime::profile::Invocation::new(&__SHALLOW_PROFILE);
            ::shallow_runtime::profile::scope(&__shallow_profile, async move { #body }).await
        }};
        block.stmts = scoped.stmts;
        // A body that always returns early leaves `__shallow_return` unreachable.
        allow_unreachable_code(item);
        Ok(0)
    }
}
