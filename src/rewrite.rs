//! The per-function rewrite pipeline.
//!
//! A function moves through [`Stage`]s in order. Any failure stops the
//! pipeline and is reported as [`Error::RewriteFailed`] tagged with the stage
//! it happened in; the caller then keeps (or re-emits) the original item, so
//! a half-rewritten function is never produced.

use std::fmt;

use proc_macro2::TokenStream;
use quote::{ToTokens, quote};
use syn::parse::{Parse, ParseStream};
use syn::visit::Visit;
use syn::{Attribute, Block, Ident, Signature, Token, UseTree, Visibility, parse_quote};

use crate::config::Plan;
use crate::error::{Error, RewriteError};
use crate::profile::ProfilePrologue;
use crate::transform::Transform;
use crate::wrap::WrapCalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SourceFound,
    TreeBuilt,
    DecoratorStripped,
    Transformed,
    Recompiled,
    Bound,
    Swapped,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::SourceFound => "finding source",
            Stage::TreeBuilt => "parsing",
            Stage::DecoratorStripped => "stripping marker",
            Stage::Transformed => "transforming",
            Stage::Recompiled => "recompiling",
            Stage::Bound => "binding",
            Stage::Swapped => "swapping",
        };
        f.write_str(name)
    }
}

/// The attributes that trigger a rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    WrapCalls,
    Profile,
}

impl Marker {
    pub fn name(self) -> &'static str {
        match self {
            Marker::WrapCalls => "wrap_calls",
            Marker::Profile => "profile",
        }
    }

    /// Recognise `#[wrap_calls]`, `#[shallow_runtime::profile]` and friends
    /// by path alone. File mode goes through [`MarkerImports::marker`].
    pub fn of(attr: &Attribute) -> Option<Self> {
        let segments: Vec<String> = attr
            .path()
            .segments
            .iter()
            .map(|s| s.ident.to_string())
            .collect();
        let (last, prefix) = segments.split_last()?;
        let known_prefix = match prefix {
            [] => true,
            [krate] => is_marker_crate(krate),
            _ => false,
        };
        if !known_prefix {
            return None;
        }
        match last.as_str() {
            "wrap_calls" => Some(Marker::WrapCalls),
            "profile" => Some(Marker::Profile),
            _ => None,
        }
    }
}

fn is_marker_crate(name: &str) -> bool {
    matches!(name, "shallow_runtime" | "shallow_macros" | "shallow")
}

/// Which bare marker names a source file has in scope.
///
/// `profile` is a common attribute name, so a bare `#[profile]` only counts
/// when the file imports it from one of our crates. `wrap_calls` is always
/// recognised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerImports {
    profile: bool,
}

impl MarkerImports {
    pub fn of_file(file: &syn::File) -> Self {
        let mut imports = Self::default();
        imports.visit_file(file);
        imports
    }

    pub fn marker(&self, attr: &Attribute) -> Option<Marker> {
        let marker = Marker::of(attr)?;
        let bare = attr.path().segments.len() == 1;
        (!bare || marker != Marker::Profile || self.profile).then_some(marker)
    }
}

impl<'ast> Visit<'ast> for MarkerImports {
    fn visit_item_use(&mut self, node: &'ast syn::ItemUse) {
        self.profile |= imports_profile(&node.tree, false);
    }
}

/// `use shallow_runtime::profile;`, a group naming it, or a glob.
fn imports_profile(tree: &UseTree, in_crate: bool) -> bool {
    match tree {
        UseTree::Path(path) => {
            !in_crate && is_marker_crate(&path.ident.to_string()) && imports_profile(&path.tree, true)
        }
        UseTree::Name(name) => in_crate && name.ident == "profile",
        UseTree::Glob(_) => in_crate,
        UseTree::Group(group) => group.items.iter().any(|tree| imports_profile(tree, in_crate)),
        UseTree::Rename(_) => false,
    }
}

/// A function item: free fn, inherent or trait method, or a trait method
/// declaration without a body.
#[derive(Debug, Clone)]
pub struct FnSource {
    pub attrs: Vec<Attribute>,
    pub vis: Visibility,
    pub sig: Signature,
    pub block: Option<Block>,
}

impl Parse for FnSource {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut attrs = input.call(Attribute::parse_outer)?;
        let vis: Visibility = input.parse()?;
        let sig: Signature = input.parse()?;
        if input.peek(Token![;]) {
            input.parse::<Token![;]>()?;
            return Ok(Self {
                attrs,
                vis,
                sig,
                block: None,
            });
        }
        let content;
        let brace_token = syn::braced!(content in input);
        // `#![..]` inside the body applies to the whole fn.
        attrs.extend(
            content
                .call(Attribute::parse_inner)?
                .into_iter()
                .map(|mut attr| {
                    attr.style = syn::AttrStyle::Outer;
                    attr
                }),
        );
        let stmts = content.call(Block::parse_within)?;
        Ok(Self {
            attrs,
            vis,
            sig,
            block: Some(Block { brace_token, stmts }),
        })
    }
}

impl ToTokens for FnSource {
    fn to_tokens(&self, tokens: &mut TokenStream) {
        for attr in &self.attrs {
            attr.to_tokens(tokens);
        }
        self.vis.to_tokens(tokens);
        self.sig.to_tokens(tokens);
        match &self.block {
            Some(block) => block.to_tokens(tokens),
            None => <Token![;]>::default().to_tokens(tokens),
        }
    }
}

impl FnSource {
    pub fn name(&self) -> String {
        self.sig.ident.to_string()
    }

    /// Pretty-printed source text.
    pub fn render(&self) -> String {
        let Some(block) = &self.block else {
            return self.to_token_stream().to_string();
        };
        let item = syn::ItemFn {
            attrs: self.attrs.clone(),
            vis: self.vis.clone(),
            sig: self.sig.clone(),
            block: Box::new(block.clone()),
        };
        prettyplease::unparse(&syn::File {
            shebang: None,
            attrs: Vec::new(),
            items: vec![syn::Item::Fn(item)],
        })
    }

    /// Remove `marker` from the attributes.
    fn strip_marker(&mut self, marker: &Attribute) -> Result<(), RewriteError> {
        let position = self
            .attrs
            .iter()
            .position(|attr| attr == marker)
            .ok_or_else(|| RewriteError::MarkerNotFound(Marker::of(marker).map_or("marker", Marker::name)))?;
        self.attrs.remove(position);
        Ok(())
    }
}

/// What a successful rewrite produced.
#[derive(Debug, Clone)]
pub struct RewriteResult {
    /// Stands in for the original callable.
    pub function: String,
    pub original_source: String,
    pub new_source: String,
    pub item: FnSource,
    /// The `rewrite_details` const, when requested.
    pub details: Option<syn::ItemConst>,
    pub calls_wrapped: usize,
    /// Whether the profiler prologue was added.
    pub profiled: bool,
}

impl RewriteResult {
    /// The replacement tokens, emitted where the original item was.
    pub fn into_tokens(self) -> TokenStream {
        let item = &self.item;
        let details = &self.details;
        quote!(#item #details)
    }
}

fn transforms_for(plan: &Plan) -> Vec<Box<dyn Transform>> {
    match plan {
        Plan::WrapCalls(config) => vec![Box::new(WrapCalls::new(config.clone()))],
        Plan::Profile(config) => vec![
            Box::new(WrapCalls::new(config.calls.clone())),
            Box::new(ProfilePrologue::new(config)),
        ],
    }
}

/// Run the pipeline on one function.
///
/// `marker` is the attribute to strip from `item`. Pass `None` when the
/// compiler already consumed it (attribute macros) or when the function was
/// selected without one.
pub fn rewrite(
    mut item: FnSource,
    function: &str,
    plan: &Plan,
    marker: Option<&Attribute>,
) -> Result<RewriteResult, Error> {
    let failed = |stage: Stage| {
        move |cause: RewriteError| Error::RewriteFailed {
            function: function.to_owned(),
            stage,
            cause,
        }
    };

    if item.block.is_none() {
        return Err(Error::SourceUnavailable {
            function: function.to_owned(),
            reason: "it has no body".into(),
        });
    }
    let original_source = item.render();
    tracing::debug!(function, stage = %Stage::SourceFound, "rewriting");

    if let Some(marker) = marker {
        item.strip_marker(marker)
            .map_err(failed(Stage::DecoratorStripped))?;
    }

    let mut calls_wrapped = 0;
    for mut transform in transforms_for(plan) {
        let count = transform
            .apply(&mut item, function)
            .map_err(failed(Stage::Transformed))?;
        tracing::trace!(function, transform = transform.name(), count, "applied");
        calls_wrapped += count;
    }

    // The emitted tokens, not the in-memory tree, are what the compiler sees.
    let item: FnSource = syn::parse2(item.to_token_stream())
        .map_err(|err| failed(Stage::Recompiled)(err.into()))?;
    let new_source = item.render();

    let details = plan.calls().rewrite_details.as_ref().map(|ident| {
        details_const(ident, &item.vis, function, &original_source, &new_source)
    });

    tracing::debug!(function, calls_wrapped, stage = %Stage::Swapped, "rewritten");
    Ok(RewriteResult {
        function: function.to_owned(),
        original_source,
        new_source,
        item,
        details,
        calls_wrapped,
        profiled: matches!(plan, Plan::Profile(_)),
    })
}

fn details_const(
    ident: &Ident,
    vis: &Visibility,
    function: &str,
    original_source: &str,
    new_source: &str,
) -> syn::ItemConst {
    parse_quote! {
        #[allow(dead_code)]
        #vis const #ident: ::shallow_runtime::RewriteDetails = ::shallow_runtime::RewriteDetails {
            function: #function,
            original_source: #original_source,
            new_source: #new_source,
        };
    }
}

/// Attribute-macro entry point: `args` are the marker's arguments, `item` the
/// annotated function. On failure the original item is emitted unchanged next
/// to a `compile_error!`.
pub fn expand_marker(marker: Marker, args: TokenStream, item: TokenStream) -> TokenStream {
    match expand(marker, args, item.clone()) {
        Ok(tokens) => tokens,
        Err(err) => {
            let error = err.to_compile_error();
            quote!(#error #item)
        }
    }
}

fn expand(marker: Marker, args: TokenStream, item: TokenStream) -> Result<TokenStream, Error> {
    let plan = Plan::parse(marker, args).map_err(Error::Configuration)?;
    let item: FnSource = syn::parse2(item).map_err(|err| Error::RewriteFailed {
        function: format!("#[{}] item", marker.name()),
        stage: Stage::TreeBuilt,
        cause: err.into(),
    })?;
    let function = item.name();
    Ok(rewrite(item, &function, &plan, None)?.into_tokens())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewriteConfig;

    fn wrap_plan() -> Plan {
        Plan::WrapCalls(RewriteConfig::new(parse_quote!(log_call)))
    }

    #[test]
    fn recognises_marker_paths() {
        let cases: [(Attribute, Option<Marker>); 6] = [
            (parse_quote!(#[wrap_calls(wrapper = w)]), Some(Marker::WrapCalls)),
            (parse_quote!(#[profile(time_limit = 1)]), Some(Marker::Profile)),
            (parse_quote!(#[shallow_runtime::profile]), Some(Marker::Profile)),
            (parse_quote!(#[shallow::wrap_calls]), Some(Marker::WrapCalls)),
            (parse_quote!(#[other::profile]), None),
            (parse_quote!(#[inline]), None),
        ];
        for (attr, expected) in cases {
            assert_eq!(Marker::of(&attr), expected, "{}", attr.to_token_stream());
        }
    }

    #[test]
    fn bare_profile_needs_an_import() {
        let bare: Attribute = parse_quote!(#[profile(time_limit = 1)]);
        let qualified: Attribute = parse_quote!(#[shallow_runtime::profile(time_limit = 1)]);
        let wrap: Attribute = parse_quote!(#[wrap_calls(wrapper = w)]);

        let foreign = MarkerImports::of_file(&parse_quote!(use other_crate::profile;));
        assert_eq!(foreign.marker(&bare), None);
        assert_eq!(foreign.marker(&qualified), Some(Marker::Profile));
        assert_eq!(foreign.marker(&wrap), Some(Marker::WrapCalls));

        for file in [
            quote!(use shallow_runtime::profile;),
            quote!(use shallow_runtime::{CallSite, profile};),
            quote!(mod jobs { use shallow_runtime::*; }),
        ] {
            let imports = MarkerImports::of_file(&syn::parse2(file.clone()).unwrap());
            assert_eq!(imports.marker(&bare), Some(Marker::Profile), "{file}");
        }

        let module_only = MarkerImports::of_file(&parse_quote!(use shallow_runtime::profile::Report;));
        assert_eq!(module_only.marker(&bare), None);
    }

    #[test]
    fn parses_bodiless_declarations_and_inner_attributes() {
        let decl: FnSource = parse_quote!(fn run(&self) -> u8;);
        assert!(decl.block.is_none());
        assert_eq!(decl.to_token_stream().to_string(), "fn run (& self) -> u8 ;");

        let item: FnSource = syn::parse_str("pub async fn f() { #![allow(unused)] g().await }").unwrap();
        assert_eq!(item.attrs.len(), 1);
        assert!(item.render().contains("#[allow(unused)]"));
    }

    #[test]
    fn rewrite_keeps_other_attributes_and_strips_only_the_marker() {
        let item: FnSource = syn::parse_str(
            "#[inline]\n#[wrap_calls(wrapper = log_call)]\n#[profile(time_limit = 1)]\nfn f() { g() }",
        )
        .unwrap();
        let marker: Attribute = parse_quote!(#[wrap_calls(wrapper = log_call)]);
        let result = rewrite(item, "f", &wrap_plan(), Some(&marker)).unwrap();
        let out = &result.new_source;
        assert!(out.contains("#[inline]"), "Got:\n{out}");
        assert!(out.contains("#[profile(time_limit = 1)]"), "Got:\n{out}");
        assert!(!out.contains("wrap_calls"), "Got:\n{out}");
        assert!(out.contains("::shallow_runtime::finish("), "Got:\n{out}");
        assert!(result.original_source.contains("#[wrap_calls"), "Got:\n{}", result.original_source);
        assert_eq!(result.calls_wrapped, 1);
    }

    #[test]
    fn missing_marker_fails_at_strip_stage() {
        let item: FnSource = parse_quote!(fn f() { g() });
        let marker: Attribute = parse_quote!(#[profile(time_limit = 1)]);
        let err = rewrite(item, "f", &wrap_plan(), Some(&marker)).unwrap_err();
        match err {
            Error::RewriteFailed { stage, cause, .. } => {
                assert_eq!(stage, Stage::DecoratorStripped);
                assert!(matches!(cause, RewriteError::MarkerNotFound("profile")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bodiless_function_has_no_source() {
        let item: FnSource = parse_quote!(fn f(&self););
        let err = rewrite(item, "Tr::f", &wrap_plan(), None).unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }), "{err}");
        assert!(err.to_string().contains("`Tr::f`"), "{err}");
    }

    #[test]
    fn const_fn_fails_at_transform_stage() {
        let item: FnSource = parse_quote!(const fn f() -> u8 { g() });
        let err = rewrite(item, "f", &wrap_plan(), None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to rewrite `f` (transforming): calls inside a `const fn` cannot be wrapped"
        );
    }

    #[test]
    fn rewrite_details_const_follows_the_function() {
        let mut config = RewriteConfig::new(parse_quote!(log_call));
        config.rewrite_details = Some(parse_quote!(F_DETAILS));
        let item: FnSource = parse_quote!(pub fn f() { g() });
        let result = rewrite(item, "f", &Plan::WrapCalls(config), None).unwrap();
        let details = result.details.clone().unwrap().to_token_stream().to_string();
        assert!(
            details.contains("pub const F_DETAILS : :: shallow_runtime :: RewriteDetails"),
            "Got:\n{details}"
        );
        assert!(details.contains("function : \"f\""), "Got:\n{details}");
        let tokens = result.into_tokens().to_string();
        assert!(tokens.find("fn f").unwrap() < tokens.find("F_DETAILS").unwrap());
    }

    #[test]
    fn expand_reports_bad_arguments_and_keeps_the_item() {
        let out = expand_marker(
            Marker::WrapCalls,
            quote!(wrapper = w, blacklist = ["a"], whitelist = ["b"]),
            quote!(fn f() { g() }),
        )
        .to_string();
        assert!(out.contains("compile_error"), "Got:\n{out}");
        assert!(out.contains("mutually exclusive"), "Got:\n{out}");
        assert!(out.contains("fn f () { g () }"), "Got:\n{out}");
    }

    #[test]
    fn expand_rejects_non_function_items() {
        let out = expand_marker(Marker::WrapCalls, quote!(wrapper = w), quote!(struct S;)).to_string();
        assert!(out.contains("compile_error"), "Got:\n{out}");
        assert!(out.contains("struct S ;"), "Got:\n{out}");
    }

    #[test]
    fn expand_wraps_the_function_in_place() {
        let out = expand_marker(
            Marker::WrapCalls,
            quote!(wrapper = log_call),
            quote!(fn f(x: u8) -> u8 { inc(x) }),
        )
        .to_string();
        assert!(out.starts_with("# [allow (unreachable_code)] fn f (x : u8) -> u8"), "Got:\n{out}");
        assert!(out.contains(":: shallow_runtime :: finish (log_call"), "Got:\n{out}");
        assert!(out.contains("inc (x))"), "Got:\n{out}");
    }
}
