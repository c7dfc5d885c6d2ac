//! The call-wrap rewrite.
//!
//! Every accepted call `EXPR` becomes
//!
//! ```text
//! ::shallow_runtime::finish(WRAPPER(&SITE), EXPR)
//! ```
//!
//! `WRAPPER(&SITE)` is the before-action and returns a guard whose drop is the
//! after-action. The original expression is kept exactly as written, so its
//! target, receiver and arguments are evaluated once and in their original
//! order. The guard is a temporary of the enclosing expression, so it drops
//! on every exit path: normal return, `?` inside the arguments, or unwinding.
//!
//! A rewritten function is marked `#[allow(unreachable_code)]`: wrapping a
//! diverging call makes the `finish` call itself unreachable.

use quote::ToTokens;
use syn::Expr;

use crate::config::RewriteConfig;
use crate::error::RewriteError;
use crate::name::is_intrinsic;
use crate::rewrite::FnSource;
use crate::transform::{CallSite, CallStrategy, Transform, allow_unreachable_code, walk_calls};

pub struct WrapCalls {
    config: RewriteConfig,
}

impl WrapCalls {
    pub fn new(config: RewriteConfig) -> Self {
        Self { config }
    }
}

impl CallStrategy for WrapCalls {
    fn accepts(&mut self, site: &CallSite) -> bool {
        if self.config.ignore_builtins && is_intrinsic(&site.target) {
            return false;
        }
        self.config.filter.allows(&site.target)
    }

    fn rewrite(&mut self, site: &CallSite, call: Expr) -> Expr {
        let wrapper = &self.config.wrapper;
        let site_ref = site.to_static();
        let call = call.into_token_stream();
        syn::parse_quote_spanned! {site.span=>
            ::shallow_runtime::finish(#wrapper(#site_ref), #call)
        }
    }
}

impl Transform for WrapCalls {
    fn name(&self) -> &'static str {
        "wrap_calls"
    }

    fn apply(&mut self, item: &mut FnSource, function: &str) -> Result<usize, RewriteError> {
        if item.sig.constness.is_some() {
            return Err(RewriteError::ConstFn);
        }
        let Some(block) = item.block.as_mut() else {
            return Ok(0);
        };
        let wrapped = walk_calls(block, function, self);
        if wrapped > 0 {
            allow_unreachable_code(item);
        }
        Ok(wrapped)
    }
}
