//! Call-site discovery shared by every rewrite.
//!
//! [`walk_calls`] visits each call expression in a function body once, in
//! source order, and asks a [`CallStrategy`] whether and how to replace it.
//! The walker knows nothing about names, filters or wrappers; strategies
//! supply all of that.
//!
//! Scope is shallow: nested items are not entered, while closures, async
//! blocks and the arguments of std expression macros are, since they run as
//! part of the function itself.

use proc_macro2::{Span, TokenStream, TokenTree};
use quote::{ToTokens, quote, quote_spanned};
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::visit_mut::{self, VisitMut};
use syn::{Expr, Token};

use crate::error::RewriteError;
use crate::name::CallTarget;
use crate::rewrite::FnSource;

/// Longest snippet carried in call-site metadata.
const SNIPPET_MAX_CHARS: usize = 80;

/// A whole-function rewrite step, applied by the orchestrator in sequence.
pub trait Transform {
    fn name(&self) -> &'static str;

    /// Rewrite `item` in place. Returns the number of calls rewritten.
    fn apply(&mut self, item: &mut FnSource, function: &str) -> Result<usize, RewriteError>;
}

/// Per-call decisions delegated by [`walk_calls`].
pub trait CallStrategy {
    fn accepts(&mut self, site: &CallSite) -> bool;

    /// Produce the replacement for `call`. Only called for accepted sites,
    /// after calls nested inside `call` have been handled.
    fn rewrite(&mut self, site: &CallSite, call: Expr) -> Expr;
}

/// One call expression as written in source.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub target: CallTarget,
    /// Canonical name, e.g. `client.get().send`.
    pub name: String,
    /// Enclosing function, e.g. `Worker::run`.
    pub function: String,
    /// 1-based lines and column; 0 when the tokens carry no location.
    pub line: usize,
    pub end_line: usize,
    pub column: usize,
    pub snippet: String,
    /// First and last token of the call.
    pub span: Span,
    pub end_span: Span,
    pub awaited: bool,
}

impl CallSite {
    /// Describe `expr` if it is a call, or the `.await` of a call.
    pub fn of(expr: &Expr, function: &str) -> Option<Self> {
        let (call, awaited) = match expr {
            Expr::Await(awaited) if matches!(*awaited.base, Expr::Call(_) | Expr::MethodCall(_)) => {
                (&*awaited.base, true)
            }
            Expr::Call(_) | Expr::MethodCall(_) => (expr, false),
            _ => return None,
        };
        let target = CallTarget::of_call(call)?;

        let tokens = expr.to_token_stream();
        let span = tokens
            .clone()
            .into_iter()
            .next()
            .map_or_else(Span::call_site, |tt| tt.span());
        let end_span = tokens.into_iter().last().map_or(span, |tt| match tt {
            TokenTree::Group(group) => group.span_close(),
            other => other.span(),
        });

        Some(Self {
            name: target.to_string(),
            target,
            function: function.to_owned(),
            line: span.start().line,
            end_line: end_span.end().line,
            column: span.start().column + 1,
            snippet: snippet(expr),
            span,
            end_span,
            awaited,
        })
    }

    /// An expression evaluating to `&'static ::shallow_runtime::CallSite`.
    ///
    /// Locations come from the parsed source when known. Otherwise (inside a
    /// proc macro on stable) `line!()`/`column!()` are spanned at the call so
    /// the compiler fills them in.
    pub fn to_static(&self) -> TokenStream {
        let name = &self.name;
        let function = &self.function;
        let snippet = &self.snippet;
        let (line, end_line, column) = if self.line > 0 {
            let line = self.line as u32;
            let end_line = self.end_line.max(self.line) as u32;
            let column = self.column as u32;
            (quote!(#line), quote!(#end_line), quote!(#column))
        } else {
            (
                quote_spanned!(self.span=> ::core::line!()),
                quote_spanned!(self.end_span=> ::core::line!()),
                quote_spanned!(self.span=> ::core::column!()),
            )
        };
        quote! {{
            static __SHALLOW_SITE: ::shallow_runtime::CallSite = ::shallow_runtime::CallSite::new(
                #name,
                #function,
                ::core::file!(),
                #line,
                #end_line,
                #column,
                #snippet,
            );
            &__SHALLOW_SITE
        }}
    }
}

/// Single-line, whitespace-normalised rendering of `expr`.
fn snippet(expr: &Expr) -> String {
    let file: syn::File = syn::parse_quote!(const _: () = #expr;);
    let rendered = prettyplease::unparse(&file);
    let body = rendered
        .trim()
        .strip_prefix("const _: () =")
        .and_then(|s| s.strip_suffix(';'))
        .unwrap_or(&rendered);
    let mut text = body.split_whitespace().collect::<Vec<_>>().join(" ");
    // Undo the line-break artifacts of method chains and argument lists.
    for (from, to) in [("( ", "("), (" )", ")"), (" .", ".")] {
        text = text.replace(from, to);
    }
    if text.chars().count() > SNIPPET_MAX_CHARS {
        text = text.chars().take(SNIPPET_MAX_CHARS - 3).collect::<String>() + "...";
    }
    text
}

/// Std macros whose arguments are plain comma-separated expressions.
const EXPRESSION_MACROS: &[&str] = &[
    "assert",
    "assert_eq",
    "assert_ne",
    "dbg",
    "debug_assert",
    "debug_assert_eq",
    "debug_assert_ne",
    "eprint",
    "eprintln",
    "format",
    "format_args",
    "panic",
    "print",
    "println",
    "todo",
    "unimplemented",
    "unreachable",
    "vec",
    "write",
    "writeln",
];

fn is_expression_macro(path: &syn::Path) -> bool {
    let segments: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
    match segments.as_slice() {
        [name] => EXPRESSION_MACROS.contains(&name.as_str()),
        [krate, name] if krate == "std" || krate == "core" || krate == "alloc" => {
            EXPRESSION_MACROS.contains(&name.as_str())
        }
        _ => false,
    }
}

/// Mark `item` `#[allow(unreachable_code)]`.
///
/// `finish(guard, abort())` is an unreachable call where `abort()` alone was
/// not, so the rewrite must not turn a clean build into a warning.
pub fn allow_unreachable_code(item: &mut FnSource) {
    let allow: syn::Attribute = syn::parse_quote!(#[allow(unreachable_code)]);
    if !item.attrs.contains(&allow) {
        item.attrs.push(allow);
    }
}

/// The generated call in `expr`, looking through a trailing `.await`.
fn generated_call(expr: &mut Expr) -> Option<(&mut syn::ExprCall, String)> {
    let call = match expr {
        Expr::Call(call) => call,
        Expr::Await(awaited) => match &mut *awaited.base {
            Expr::Call(call) => call,
            _ => return None,
        },
        _ => return None,
    };
    let name = runtime_call(call)?;
    Some((call, name))
}

/// Whether `call` is `::shallow_runtime::<fn>(..)`, emitted by an earlier rewrite.
fn runtime_call(call: &syn::ExprCall) -> Option<String> {
    let Expr::Path(path) = &*call.func else {
        return None;
    };
    let path = &path.path;
    let mut segments = path.segments.iter();
    let is_runtime = path.leading_colon.is_some()
        && segments.next().is_some_and(|s| s.ident == "shallow_runtime");
    is_runtime.then(|| {
        segments
            .map(|s| s.ident.to_string())
            .collect::<Vec<_>>()
            .join("::")
    })
}

/// Visit every call in `block` and let `strategy` rewrite the accepted ones.
/// Returns the number of rewritten calls.
pub fn walk_calls(block: &mut syn::Block, function: &str, strategy: &mut dyn CallStrategy) -> usize {
    let mut walker = CallWalker {
        function,
        strategy,
        rewritten: 0,
    };
    walker.visit_block_mut(block);
    walker.rewritten
}

struct CallWalker<'a> {
    function: &'a str,
    strategy: &'a mut dyn CallStrategy,
    rewritten: usize,
}

impl VisitMut for CallWalker<'_> {
    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        match expr {
            // Const contexts cannot call a runtime wrapper.
            Expr::Const(_) => return,
            Expr::Repeat(repeat) => {
                self.visit_expr_mut(&mut repeat.expr);
                return;
            }
            _ => {}
        }
        if let Some((call, name)) = generated_call(expr) {
            // finish(guard, original) and scope(&invocation, async move { body }):
            // only the last argument is user code.
            if matches!(name.as_str(), "finish" | "profile::scope") {
                if let Some(original) = call.args.last_mut() {
                    self.visit_expr_mut(original);
                }
            }
            return;
        }

        let Some(site) = CallSite::of(expr, self.function) else {
            visit_mut::visit_expr_mut(self, expr);
            return;
        };

        // Decide in source order, before any nested call is seen.
        let accepted = self.strategy.accepts(&site);
        match expr {
            Expr::Await(awaited) => visit_mut::visit_expr_mut(self, &mut awaited.base),
            _ => visit_mut::visit_expr_mut(self, expr),
        }
        if accepted {
            let call = std::mem::replace(expr, Expr::Verbatim(TokenStream::new()));
            *expr = self.strategy.rewrite(&site, call);
            self.rewritten += 1;
            tracing::trace!(function = self.function, call = %site.name, "wrapped call");
        }
    }

    fn visit_macro_mut(&mut self, mac: &mut syn::Macro) {
        if !is_expression_macro(&mac.path) {
            return;
        }
        let Ok(mut args) = Punctuated::<Expr, Token![,]>::parse_terminated.parse2(mac.tokens.clone())
        else {
            // `vec![x; n]` and other non-list forms are left alone.
            return;
        };
        for arg in args.iter_mut() {
            self.visit_expr_mut(arg);
        }
        mac.tokens = args.into_token_stream();
    }

    fn visit_item_mut(&mut self, _: &mut syn::Item) {}

    fn visit_type_mut(&mut self, _: &mut syn::Type) {}

    fn visit_generic_argument_mut(&mut self, _: &mut syn::GenericArgument) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every site it is asked about and rewrites accepted ones to
    /// `seen(<call>)` so nesting is visible in the output.
    #[derive(Default)]
    struct Recorder {
        names: Vec<String>,
        reject: Vec<&'static str>,
    }

    impl CallStrategy for Recorder {
        fn accepts(&mut self, site: &CallSite) -> bool {
            self.names.push(site.name.clone());
            !self.reject.contains(&site.name.as_str())
        }

        fn rewrite(&mut self, _site: &CallSite, call: Expr) -> Expr {
            syn::parse_quote!(seen(#call))
        }
    }

    fn walk(body: &str, strategy: &mut Recorder) -> String {
        let mut block: syn::Block = syn::parse_str(body).unwrap();
        walk_calls(&mut block, "f", strategy);
        block.to_token_stream().to_string()
    }

    #[test]
    fn visits_calls_once_in_source_order() {
        let mut rec = Recorder::default();
        walk("{ let x = a(b(1), c()); d(x).e(); }", &mut rec);
        assert_eq!(rec.names, ["a", "b", "c", "d().e", "d"]);
    }

    #[test]
    fn rewrites_inner_calls_before_outer() {
        let mut rec = Recorder::default();
        let out = walk("{ a(b()) }", &mut rec);
        assert_eq!(out, "{ seen (a (seen (b ()))) }");
    }

    #[test]
    fn rejected_calls_stay_but_children_are_still_visited() {
        let mut rec = Recorder {
            reject: vec!["a"],
            ..Default::default()
        };
        let out = walk("{ a(b()) }", &mut rec);
        assert_eq!(out, "{ a (seen (b ())) }");
    }

    #[test]
    fn descends_into_closures_and_async_blocks() {
        let mut rec = Recorder::default();
        walk("{ xs.iter().map(|v| conv(v)); async { fetch().await }; }", &mut rec);
        assert_eq!(rec.names, ["xs.iter().map", "xs.iter", "conv", "fetch"]);
    }

    #[test]
    fn skips_nested_items_and_const_contexts() {
        let mut rec = Recorder::default();
        walk(
            "{ fn inner() { hidden(); } const N: usize = size(); let a = [fill(); LEN]; \
             let b: [u8; width()] = make(); const { konst() }; }",
            &mut rec,
        );
        assert_eq!(rec.names, ["fill", "make"]);
    }

    #[test]
    fn rewrites_std_macro_arguments() {
        let mut rec = Recorder::default();
        let out = walk(
            r#"{ println!("{} {}", name(), x = count()); other!(skip()); vec![zero(); 3]; }"#,
            &mut rec,
        );
        assert_eq!(rec.names, ["name", "count"]);
        assert!(out.contains("seen (name ())"), "Got:\n{out}");
        assert!(out.contains("other ! (skip ())"), "Got:\n{out}");
    }

    #[test]
    fn awaited_calls_are_wrapped_whole() {
        let mut rec = Recorder::default();
        let out = walk("{ client.send(req).await }", &mut rec);
        assert_eq!(rec.names, ["client.send"]);
        assert_eq!(out, "{ seen (client . send (req) . await) }");
    }

    #[test]
    fn generated_runtime_calls_are_not_rewrapped() {
        let mut rec = Recorder::default();
        let out = walk(
            "{ ::shallow_runtime::finish(w(&SITE), run(x)); ::shallow_runtime::profile::reset(); }",
            &mut rec,
        );
        assert_eq!(rec.names, ["run"]);
        assert!(out.contains("finish (w (& SITE) , seen (run (x)))"), "Got:\n{out}");
    }

    #[test]
    fn scoped_async_body_is_still_user_code() {
        let mut rec = Recorder::default();
        let out = walk(
            "{ let __shallow_profile = ::shallow_runtime::profile::Invocation::new(&P); \
             ::shallow_runtime::profile::scope(&__shallow_profile, async move { load().await }).await }",
            &mut rec,
        );
        assert_eq!(rec.names, ["load"]);
        assert!(out.contains("async move { seen (load () . await) }"), "Got:\n{out}");
    }

    #[test]
    fn unreachable_code_is_allowed_once() {
        let mut item: FnSource = syn::parse_quote!(fn f() -> u8 { abort() });
        allow_unreachable_code(&mut item);
        allow_unreachable_code(&mut item);
        let out = item.to_token_stream().to_string();
        assert_eq!(out.matches("allow (unreachable_code)").count(), 1, "Got:\n{out}");
    }

    #[test]
    fn site_metadata_from_parsed_source() {
        let block: syn::Block = syn::parse_str("{\n    let r = conn\n        .query(sql,\n  args);\n}").unwrap();
        let syn::Stmt::Local(local) = &block.stmts[0] else {
            panic!("expected let");
        };
        let expr = &local.init.as_ref().unwrap().expr;
        let site = CallSite::of(expr, "Db::load").unwrap();
        assert_eq!(site.name, "conn.query");
        assert_eq!(site.function, "Db::load");
        assert_eq!(site.line, 2);
        assert_eq!(site.end_line, 4);
        assert_eq!(site.column, 13);
        assert_eq!(site.snippet, "conn.query(sql, args)");
        assert!(!site.awaited);
    }

    #[test]
    fn long_snippets_are_truncated() {
        let expr: Expr = syn::parse_str(&format!("run({})", "argument_name, ".repeat(10))).unwrap();
        let text = snippet(&expr);
        assert_eq!(text.chars().count(), SNIPPET_MAX_CHARS);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn static_site_uses_literal_lines_when_known() {
        let expr: Expr = syn::parse_str("run(1)").unwrap();
        let site = CallSite::of(&expr, "f").unwrap();
        let out = site.to_static().to_string();
        assert!(out.contains("static __SHALLOW_SITE"), "Got:\n{out}");
        assert!(out.contains("\"run\" , \"f\" , :: core :: file ! () , 1u32 , 1u32 , 1u32"), "Got:\n{out}");
    }
}
