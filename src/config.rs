//! Rewrite options, parsed from marker attribute arguments or built by the CLI.
//!
//! ```text
//! #[wrap_calls(wrapper = log_call, ignore_builtins, blacklist = ["cache[*]"])]
//! #[profile(time_limit = 0.25, above = report_slow, below = none)]
//! ```
//!
//! All validation happens here, once per marker, so a bad option surfaces as
//! a compile error at the attribute instead of a failure at call time.

use std::time::Duration;

use proc_macro2::{Span, TokenStream};
use syn::meta::ParseNestedMeta;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Ident, Lit, LitStr, Token, parse_quote};

use crate::name::{CallFilter, NamePattern};
use crate::rewrite::Marker;

/// Options shared by every call-wrapping rewrite.
#[derive(Debug, Clone)]
pub struct RewriteConfig {
    /// Called as `wrapper(&'static CallSite)` before each call; its return
    /// value is dropped after the call.
    pub wrapper: syn::Path,
    pub ignore_builtins: bool,
    pub filter: CallFilter,
    /// Name of a `RewriteDetails` const to emit next to the function.
    pub rewrite_details: Option<Ident>,
}

impl RewriteConfig {
    pub fn new(wrapper: syn::Path) -> Self {
        Self {
            wrapper,
            ignore_builtins: false,
            filter: CallFilter::All,
            rewrite_details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileConfig {
    pub calls: RewriteConfig,
    pub time_limit: Duration,
    /// `None` disables the callback.
    pub below: Option<syn::Path>,
    pub above: Option<syn::Path>,
}

impl ProfileConfig {
    pub fn new(time_limit: Duration) -> Self {
        Self {
            calls: RewriteConfig::new(parse_quote!(::shallow_runtime::profile::time)),
            time_limit,
            below: Some(parse_quote!(::shallow_runtime::profile::log_below)),
            above: Some(parse_quote!(::shallow_runtime::profile::log_above)),
        }
    }
}

/// A fully validated rewrite request.
#[derive(Debug, Clone)]
pub enum Plan {
    WrapCalls(RewriteConfig),
    Profile(ProfileConfig),
}

impl Plan {
    /// Parse marker arguments (the tokens inside `#[marker(...)]`).
    pub fn parse(marker: Marker, args: TokenStream) -> syn::Result<Self> {
        match marker {
            Marker::WrapCalls => parse_wrap_calls(args).map(Plan::WrapCalls),
            Marker::Profile => parse_profile(args).map(Plan::Profile),
        }
    }

    /// Parse the arguments of a marker attribute found in a source file.
    pub fn from_attr(marker: Marker, attr: &syn::Attribute) -> syn::Result<Self> {
        let args = match &attr.meta {
            syn::Meta::Path(_) => TokenStream::new(),
            syn::Meta::List(list) => list.tokens.clone(),
            syn::Meta::NameValue(nv) => {
                return Err(syn::Error::new(
                    nv.span(),
                    format!("expected `#[{}(...)]`", marker.name()),
                ));
            }
        };
        Self::parse(marker, args)
    }

    pub fn calls(&self) -> &RewriteConfig {
        match self {
            Plan::WrapCalls(config) => config,
            Plan::Profile(config) => &config.calls,
        }
    }
}

/// Options accepted by both markers.
#[derive(Default)]
struct CommonArgs {
    ignore_builtins: Option<bool>,
    blacklist: Option<(Span, Vec<NamePattern>)>,
    whitelist: Option<(Span, Vec<NamePattern>)>,
    rewrite_details: Option<Ident>,
}

impl CommonArgs {
    /// Try to consume one option. Returns `false` if the key is not a common one.
    fn parse(&mut self, meta: &ParseNestedMeta<'_>) -> syn::Result<bool> {
        let span = meta.path.span();
        if meta.path.is_ident("ignore_builtins") {
            let value = if meta.input.peek(Token![=]) {
                meta.value()?.parse::<syn::LitBool>()?.value
            } else {
                true
            };
            set_once(&mut self.ignore_builtins, value, meta)?;
        } else if meta.path.is_ident("blacklist") {
            set_once(&mut self.blacklist, (span, parse_patterns(meta)?), meta)?;
        } else if meta.path.is_ident("whitelist") {
            set_once(&mut self.whitelist, (span, parse_patterns(meta)?), meta)?;
        } else if meta.path.is_ident("rewrite_details") {
            let ident: Ident = meta.value()?.parse()?;
            set_once(&mut self.rewrite_details, ident, meta)?;
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn apply(self, config: &mut RewriteConfig) -> syn::Result<()> {
        config.ignore_builtins = self.ignore_builtins.unwrap_or(false);
        config.rewrite_details = self.rewrite_details;
        config.filter = match (self.blacklist, self.whitelist) {
            (Some(_), Some((span, _))) => {
                return Err(syn::Error::new(
                    span,
                    "`blacklist` and `whitelist` are mutually exclusive",
                ));
            }
            (Some((_, patterns)), None) => CallFilter::Blacklist(patterns),
            (None, Some((_, patterns))) => CallFilter::Whitelist(patterns),
            (None, None) => CallFilter::All,
        };
        Ok(())
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, meta: &ParseNestedMeta<'_>) -> syn::Result<()> {
    if slot.is_some() {
        return Err(meta.error("duplicate option"));
    }
    *slot = Some(value);
    Ok(())
}

/// `["a.b", "c[*]"]`
fn parse_patterns(meta: &ParseNestedMeta<'_>) -> syn::Result<Vec<NamePattern>> {
    let input = meta.value()?;
    let content;
    syn::bracketed!(content in input);
    let literals = Punctuated::<LitStr, Token![,]>::parse_terminated(&content)?;
    literals
        .iter()
        .map(|lit| {
            lit.value()
                .parse::<NamePattern>()
                .map_err(|e| syn::Error::new(lit.span(), e))
        })
        .collect()
}

/// `path` or `none`.
fn parse_callback(meta: &ParseNestedMeta<'_>) -> syn::Result<Option<syn::Path>> {
    let path: syn::Path = meta.value()?.parse()?;
    Ok(if path.is_ident("none") { None } else { Some(path) })
}

pub fn parse_wrap_calls(args: TokenStream) -> syn::Result<RewriteConfig> {
    let mut common = CommonArgs::default();
    let mut wrapper: Option<syn::Path> = None;

    let parser = syn::meta::parser(|meta| {
        if common.parse(&meta)? {
            Ok(())
        } else if meta.path.is_ident("wrapper") {
            let path = meta.value()?.parse()?;
            set_once(&mut wrapper, path, &meta)
        } else {
            Err(meta.error("unsupported `wrap_calls` option"))
        }
    });
    parser.parse2(args)?;

    let wrapper = wrapper.ok_or_else(|| {
        syn::Error::new(
            Span::call_site(),
            "missing required option `wrapper = path::to::function`",
        )
    })?;
    let mut config = RewriteConfig::new(wrapper);
    common.apply(&mut config)?;
    Ok(config)
}

pub fn parse_profile(args: TokenStream) -> syn::Result<ProfileConfig> {
    let mut common = CommonArgs::default();
    let mut time_limit: Option<Duration> = None;
    let mut below: Option<Option<syn::Path>> = None;
    let mut above: Option<Option<syn::Path>> = None;

    let parser = syn::meta::parser(|meta| {
        if common.parse(&meta)? {
            Ok(())
        } else if meta.path.is_ident("time_limit") {
            let lit: Lit = meta.value()?.parse()?;
            set_once(&mut time_limit, parse_time_limit(&lit)?, &meta)
        } else if meta.path.is_ident("below") {
            let callback = parse_callback(&meta)?;
            set_once(&mut below, callback, &meta)
        } else if meta.path.is_ident("above") {
            let callback = parse_callback(&meta)?;
            set_once(&mut above, callback, &meta)
        } else {
            Err(meta.error("unsupported `profile` option"))
        }
    });
    parser.parse2(args)?;

    let time_limit = time_limit.ok_or_else(|| {
        syn::Error::new(
            Span::call_site(),
            "missing required option `time_limit = <seconds>`",
        )
    })?;
    let mut config = ProfileConfig::new(time_limit);
    if let Some(below) = below {
        config.below = below;
    }
    if let Some(above) = above {
        config.above = above;
    }
    if config.below.is_none() && config.above.is_none() {
        return Err(syn::Error::new(
            Span::call_site(),
            "at least one of `below` and `above` must be a callback",
        ));
    }
    common.apply(&mut config.calls)?;
    Ok(config)
}

fn parse_time_limit(lit: &Lit) -> syn::Result<Duration> {
    let seconds = match lit {
        Lit::Float(f) => f.base10_parse::<f64>()?,
        Lit::Int(i) => i.base10_parse::<f64>()?,
        _ => {
            return Err(syn::Error::new(
                lit.span(),
                "`time_limit` must be a number of seconds",
            ));
        }
    };
    time_limit_from_secs(seconds).map_err(|msg| syn::Error::new(lit.span(), msg))
}

/// Validate a time limit given in seconds.
pub fn time_limit_from_secs(seconds: f64) -> Result<Duration, &'static str> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err("`time_limit` must be a finite, non-negative number of seconds");
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| "`time_limit` is too large")
}

/// Build a filter from CLI-style pattern lists.
pub fn filter_from_lists(blacklist: &[String], whitelist: &[String]) -> syn::Result<CallFilter> {
    let parse = |list: &[String]| -> syn::Result<Vec<NamePattern>> {
        list.iter()
            .map(|s| {
                s.parse::<NamePattern>()
                    .map_err(|e| syn::Error::new(Span::call_site(), e))
            })
            .collect()
    };
    match (blacklist.is_empty(), whitelist.is_empty()) {
        (false, false) => Err(syn::Error::new(
            Span::call_site(),
            "`blacklist` and `whitelist` are mutually exclusive",
        )),
        (false, true) => Ok(CallFilter::Blacklist(parse(blacklist)?)),
        (true, false) => Ok(CallFilter::Whitelist(parse(whitelist)?)),
        (true, true) => Ok(CallFilter::All),
    }
}
