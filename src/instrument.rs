use std::collections::HashSet;
use std::path::Path;

use syn::visit_mut::VisitMut;
use syn::{Attribute, Block, Item, Signature, Visibility};

use crate::config::Plan;
use crate::error::Error;
use crate::rewrite::{FnSource, MarkerImports, RewriteResult, rewrite};

/// Result of instrumenting a source file.
#[derive(Debug)]
pub struct InstrumentResult {
    pub source: String,
    /// One entry per rewrite, in file order. A function carrying stacked
    /// markers appears once per marker.
    pub rewritten: Vec<RewriteResult>,
}

/// Rewrite every marked function in `source`, plus every unmarked function
/// whose (qualified) name is in `targets` when a `plan` is given.
///
/// Top-level functions match by bare name (e.g. "walk"). Impl methods match by
/// "Type::method". Trait default methods match by "Trait::method".
///
/// Markers are removed from the output, so instrumenting the result again
/// rewrites nothing new.
pub fn instrument_source(
    path: &Path,
    source: &str,
    targets: &HashSet<String>,
    plan: Option<&Plan>,
) -> Result<InstrumentResult, Error> {
    let mut file: syn::File = syn::parse_str(source).map_err(|source| Error::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    let mut instrumenter = Instrumenter {
        imports: MarkerImports::of_file(&file),
        targets,
        plan,
        current_impl: None,
        current_trait: None,
        rewritten: Vec::new(),
        error: None,
    };
    instrumenter.visit_file_mut(&mut file);
    if let Some(err) = instrumenter.error {
        return Err(err);
    }

    let rewritten = instrumenter.rewritten;
    tracing::debug!(path = %path.display(), rewrites = rewritten.len(), "instrumented file");
    let mut output = generated_header(&rewritten);
    output.push_str(&prettyplease::unparse(&file));
    Ok(InstrumentResult {
        source: output,
        rewritten,
    })
}

fn generated_header(rewritten: &[RewriteResult]) -> String {
    if rewritten.is_empty() {
        return String::new();
    }
    let mut names: Vec<&str> = rewritten.iter().map(|r| r.function.as_str()).collect();
    names.dedup();
    format!(
        "// @generated by shallow: call sites rewritten in {}\n",
        names.join(", ")
    )
}

struct Instrumenter<'a> {
    imports: MarkerImports,
    targets: &'a HashSet<String>,
    plan: Option<&'a Plan>,
    current_impl: Option<String>,
    current_trait: Option<String>,
    rewritten: Vec<RewriteResult>,
    /// First failure; later functions are left alone once set.
    error: Option<Error>,
}

impl Instrumenter<'_> {
    /// Rewrite one function in place. Returns the `rewrite_details` consts
    /// to place after it.
    fn process(
        &mut self,
        attrs: &mut Vec<Attribute>,
        vis: &Visibility,
        sig: &mut Signature,
        block: Option<&mut Block>,
        function: &str,
    ) -> Vec<syn::ItemConst> {
        let marked = attrs.iter().any(|attr| self.imports.marker(attr).is_some());
        let selected = self.plan.is_some() && self.targets.contains(function);
        if self.error.is_some() || !(marked || selected) {
            return Vec::new();
        }
        let item = FnSource {
            attrs: attrs.clone(),
            vis: vis.clone(),
            sig: sig.clone(),
            block: block.as_deref().cloned(),
        };
        match self.rewrite_fn(item, function, marked) {
            Ok((item, details)) => {
                *attrs = item.attrs;
                *sig = item.sig;
                if let (Some(slot), Some(body)) = (block, item.block) {
                    *slot = body;
                }
                details
            }
            Err(err) => {
                self.error = Some(err);
                Vec::new()
            }
        }
    }

    fn rewrite_fn(
        &mut self,
        mut item: FnSource,
        function: &str,
        marked: bool,
    ) -> Result<(FnSource, Vec<syn::ItemConst>), Error> {
        let mut details = Vec::new();

        if !marked {
            // Selected from the command line.
            if let Some(plan) = self.plan {
                let result = rewrite(item, function, plan, None)?;
                item = result.item.clone();
                details.extend(result.details.clone());
                self.rewritten.push(result);
            }
            return Ok((item, details));
        }

        // Outermost marker first, the same order attribute macros expand in.
        loop {
            let found = item
                .attrs
                .iter()
                .find_map(|attr| self.imports.marker(attr).map(|marker| (marker, attr.clone())));
            let Some((marker, attr)) = found else {
                break;
            };
            let plan = Plan::from_attr(marker, &attr).map_err(Error::Configuration)?;
            let result = rewrite(item, function, &plan, Some(&attr))?;
            item = result.item.clone();
            details.extend(result.details.clone());
            self.rewritten.push(result);
        }
        Ok((item, details))
    }

    fn rewrite_items(&mut self, items: &mut Vec<Item>) {
        let mut out = Vec::with_capacity(items.len());
        for mut item in items.drain(..) {
            let details = match &mut item {
                Item::Fn(func) => {
                    let name = func.sig.ident.to_string();
                    self.process(
                        &mut func.attrs,
                        &func.vis,
                        &mut func.sig,
                        Some(&mut *func.block),
                        &name,
                    )
                }
                Item::Mod(node) => {
                    self.visit_item_mod_mut(node);
                    Vec::new()
                }
                Item::Impl(node) => {
                    self.visit_item_impl_mut(node);
                    Vec::new()
                }
                Item::Trait(node) => {
                    self.visit_item_trait_mut(node);
                    Vec::new()
                }
                _ => Vec::new(),
            };
            out.push(item);
            out.extend(details.into_iter().map(Item::Const));
        }
        *items = out;
    }
}

impl VisitMut for Instrumenter<'_> {
    fn visit_file_mut(&mut self, node: &mut syn::File) {
        self.rewrite_items(&mut node.items);
    }

    fn visit_item_mod_mut(&mut self, node: &mut syn::ItemMod) {
        if let Some((_, items)) = &mut node.content {
            self.rewrite_items(items);
        }
    }

    fn visit_item_impl_mut(&mut self, node: &mut syn::ItemImpl) {
        let type_name = type_name(&node.self_ty);
        let prev = self.current_impl.replace(type_name);
        let trait_impl = node.trait_.is_some();

        let mut out = Vec::with_capacity(node.items.len());
        for mut item in node.items.drain(..) {
            let details = match &mut item {
                syn::ImplItem::Fn(method) => {
                    let name = match &self.current_impl {
                        Some(ty) => format!("{ty}::{}", method.sig.ident),
                        None => method.sig.ident.to_string(),
                    };
                    self.process(
                        &mut method.attrs,
                        &method.vis,
                        &mut method.sig,
                        Some(&mut method.block),
                        &name,
                    )
                }
                _ => Vec::new(),
            };
            out.push(item);
            if trait_impl {
                for dropped in details {
                    tracing::warn!(
                        details = %dropped.ident,
                        "rewrite_details cannot be added to a trait impl; skipped"
                    );
                }
            } else {
                out.extend(details.into_iter().map(impl_const));
            }
        }
        node.items = out;

        self.current_impl = prev;
    }

    fn visit_item_trait_mut(&mut self, node: &mut syn::ItemTrait) {
        let trait_name = node.ident.to_string();
        let prev = self.current_trait.replace(trait_name);
        for item in &mut node.items {
            if let syn::TraitItem::Fn(method) = item {
                let name = match &self.current_trait {
                    Some(trait_name) => format!("{trait_name}::{}", method.sig.ident),
                    None => method.sig.ident.to_string(),
                };
                let details = self.process(
                    &mut method.attrs,
                    &Visibility::Inherited,
                    &mut method.sig,
                    method.default.as_mut(),
                    &name,
                );
                for dropped in details {
                    tracing::warn!(
                        details = %dropped.ident,
                        "rewrite_details cannot be added to a trait; skipped"
                    );
                }
            }
        }
        self.current_trait = prev;
    }
}

fn impl_const(item: syn::ItemConst) -> syn::ImplItem {
    syn::ImplItem::Const(syn::ImplItemConst {
        attrs: item.attrs,
        vis: item.vis,
        defaultness: None,
        const_token: item.const_token,
        ident: item.ident,
        generics: item.generics,
        colon_token: item.colon_token,
        ty: *item.ty,
        eq_token: item.eq_token,
        expr: *item.expr,
        semi_token: item.semi_token,
    })
}

/// Insert `::shallow_runtime::install_default_subscriber()` at the top of
/// `fn main`, so the default profiler callbacks have somewhere to log.
pub fn inject_subscriber(source: &str) -> Result<String, syn::Error> {
    let mut file: syn::File = syn::parse_str(source)?;
    SubscriberInjector.visit_file_mut(&mut file);
    Ok(prettyplease::unparse(&file))
}

struct SubscriberInjector;

impl VisitMut for SubscriberInjector {
    fn visit_item_fn_mut(&mut self, node: &mut syn::ItemFn) {
        if node.sig.ident == "main" {
            let stmt: syn::Stmt = syn::parse_quote! {
                ::shallow_runtime::install_default_subscriber();
            };
            node.block.stmts.insert(0, stmt);
        }
    }
}

/// Last path segment of an impl's self type (`Walker` for
/// `crate::walk::Walker<T>`), or `_`.
pub(crate) fn type_name(ty: &syn::Type) -> String {
    match ty {
        syn::Type::Path(path) => path
            .path
            .segments
            .last()
            .map_or_else(|| "_".to_owned(), |segment| segment.ident.to_string()),
        _ => "_".to_owned(),
    }
}
