//! Which functions `shallow build` rewrites.
//!
//! Every function carrying a marker is rewritten with the marker's own
//! options. `--fn`, `--file` and `--mod` select more functions for the
//! options given on the command line.

use std::fmt;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use syn::visit::Visit;

use crate::error::Error;
use crate::instrument::type_name;
use crate::rewrite::MarkerImports;

/// A command-line selection.
#[derive(Debug, Clone)]
pub enum TargetSpec {
    /// `--fn`: the bare name (after any `Type::`) contains the pattern.
    Fn(String),
    /// `--file`: every function in files whose path ends with this one.
    File(PathBuf),
    /// `--mod`: every function in `NAME.rs` or under a `NAME/` directory.
    Mod(String),
}

impl TargetSpec {
    pub fn selects(&self, file: &Path, function: &str) -> bool {
        match self {
            TargetSpec::Fn(pattern) => {
                let bare = function.rsplit("::").next().unwrap_or(function);
                bare.contains(pattern.as_str())
            }
            TargetSpec::File(path) => file.ends_with(path),
            TargetSpec::Mod(module) => {
                let in_dir = file
                    .parent()
                    .and_then(Path::file_name)
                    .is_some_and(|dir| dir == module.as_str());
                in_dir || file.file_stem().is_some_and(|stem| stem == module.as_str())
            }
        }
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSpec::Fn(pattern) => write!(f, "--fn {pattern}"),
            TargetSpec::File(path) => write!(f, "--file {}", path.display()),
            TargetSpec::Mod(module) => write!(f, "--mod {module}"),
        }
    }
}

/// The functions to rewrite in one file.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub file: PathBuf,
    /// Selected on the command line, rewritten with its options.
    pub functions: Vec<String>,
    /// Carrying a `#[wrap_calls]` or `#[profile]` marker.
    pub marked: Vec<String>,
}

/// Scan every `.rs` file under `src_dir` once and collect marked and
/// selected functions, in file path order. Errors when nothing is found.
pub fn resolve_targets(src_dir: &Path, specs: &[TargetSpec]) -> Result<Vec<ResolvedTarget>, Error> {
    let mut results = Vec::new();
    for file in rs_files(src_dir)? {
        let found = read_functions(&file)?;
        let mut marked: Vec<String> = found
            .iter()
            .filter(|f| f.marked)
            .map(|f| f.name.clone())
            .collect();
        let mut functions: Vec<String> = found
            .into_iter()
            .filter(|f| specs.iter().any(|spec| spec.selects(&file, &f.name)))
            .map(|f| f.name)
            .collect();
        if marked.is_empty() && functions.is_empty() {
            continue;
        }
        marked.sort();
        marked.dedup();
        functions.sort();
        functions.dedup();
        results.push(ResolvedTarget {
            file,
            functions,
            marked,
        });
    }

    if results.is_empty() {
        let wanted = if specs.is_empty() {
            "no #[wrap_calls] or #[profile] markers found".to_owned()
        } else {
            specs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        return Err(Error::NoTargetsFound(wanted));
    }
    tracing::debug!(files = results.len(), "resolved targets");
    Ok(results)
}

fn rs_files(src_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut files = Vec::new();
    for entry in WalkBuilder::new(src_dir).build() {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let is_file = entry.file_type().is_some_and(|ft| ft.is_file());
        if is_file && entry.path().extension().is_some_and(|ext| ext == "rs") {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// A function found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFn {
    /// `walk`, `Walker::walk` or `Trait::method`.
    pub name: String,
    pub marked: bool,
}

fn read_functions(file: &Path) -> Result<Vec<FoundFn>, Error> {
    let source = std::fs::read_to_string(file).map_err(|source| Error::ReadError {
        path: file.to_path_buf(),
        source,
    })?;
    extract_functions(&source, file)
}

/// The functions of one file that can be rewritten, named the way file mode
/// names them. Bodies are not searched, so nested functions are skipped.
pub fn extract_functions(source: &str, path: &Path) -> Result<Vec<FoundFn>, Error> {
    let file = syn::parse_file(source).map_err(|source| Error::ParseError {
        path: path.to_path_buf(),
        source,
    })?;
    let mut collector = FnCollector {
        imports: MarkerImports::of_file(&file),
        scope: None,
        found: Vec::new(),
    };
    collector.visit_file(&file);
    Ok(collector.found)
}

struct FnCollector {
    imports: MarkerImports,
    /// Impl type or trait the visitor is inside.
    scope: Option<String>,
    found: Vec<FoundFn>,
}

impl FnCollector {
    fn push(&mut self, ident: &syn::Ident, attrs: &[syn::Attribute]) {
        let name = match &self.scope {
            Some(scope) => format!("{scope}::{ident}"),
            None => ident.to_string(),
        };
        let marked = self.is_marked(attrs);
        self.found.push(FoundFn { name, marked });
    }

    fn is_marked(&self, attrs: &[syn::Attribute]) -> bool {
        attrs.iter().any(|attr| self.imports.marker(attr).is_some())
    }

    fn within(&mut self, scope: String, visit: impl FnOnce(&mut Self)) {
        let outer = self.scope.replace(scope);
        visit(self);
        self.scope = outer;
    }
}

impl<'ast> Visit<'ast> for FnCollector {
    fn visit_item_fn(&mut self, node: &'ast syn::ItemFn) {
        self.push(&node.sig.ident, &node.attrs);
    }

    fn visit_item_impl(&mut self, node: &'ast syn::ItemImpl) {
        self.within(type_name(&node.self_ty), |c| syn::visit::visit_item_impl(c, node));
    }

    fn visit_impl_item_fn(&mut self, node: &'ast syn::ImplItemFn) {
        self.push(&node.sig.ident, &node.attrs);
    }

    fn visit_item_trait(&mut self, node: &'ast syn::ItemTrait) {
        self.within(node.ident.to_string(), |c| syn::visit::visit_item_trait(c, node));
    }

    fn visit_trait_item_fn(&mut self, node: &'ast syn::TraitItemFn) {
        // A marked declaration is kept so the rewrite can report its missing body.
        if node.default.is_some() || self.is_marked(&node.attrs) {
            self.push(&node.sig.ident, &node.attrs);
        }
    }
}
