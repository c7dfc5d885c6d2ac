//! Canonical call names and the patterns matched against them.
//!
//! A call's name is derived from the shape of its target expression only:
//! `a.b[c].d` names the same thing no matter what `a` is at runtime. Paths
//! join with `::`, fields and methods with `.`, subscripts render their key
//! when it is a string or number literal and `*` otherwise, and a call
//! result in the middle of a chain renders as `name()`.

use std::fmt;
use std::str::FromStr;

use syn::{Expr, Lit};

/// The syntactic shape of a call target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// A path such as `run`, `Vec::new` or `self`.
    Name(String),
    /// Field access or method lookup: `base.member`.
    Member {
        base: Box<CallTarget>,
        member: String,
    },
    /// Subscript: `base[key]`.
    Index { base: Box<CallTarget>, key: Key },
    /// The result of calling `base`: `base()`.
    Call(Box<CallTarget>),
    /// Anything else (closures, blocks, casts). Renders as `_`.
    Opaque,
}

/// A subscript key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// A string or number literal, rendered without quotes or suffix.
    Literal(String),
    /// A non-literal key. In a pattern, this is the `[*]` wildcard.
    Any,
}

impl CallTarget {
    /// Resolve the target of a call expression. Returns `None` when `expr` is
    /// not a call.
    pub fn of_call(expr: &Expr) -> Option<Self> {
        match expr {
            Expr::Call(call) => Some(Self::of_expr(&call.func)),
            Expr::MethodCall(call) => Some(Self::Member {
                base: Box::new(Self::of_expr(&call.receiver)),
                member: call.method.to_string(),
            }),
            _ => None,
        }
    }

    /// Resolve any expression appearing in callee position.
    pub fn of_expr(expr: &Expr) -> Self {
        match expr {
            Expr::Path(path) => Self::Name(path_name(&path.path)),
            Expr::Field(field) => Self::Member {
                base: Box::new(Self::of_expr(&field.base)),
                member: match &field.member {
                    syn::Member::Named(ident) => ident.to_string(),
                    syn::Member::Unnamed(index) => index.index.to_string(),
                },
            },
            Expr::Index(index) => Self::Index {
                base: Box::new(Self::of_expr(&index.expr)),
                key: Key::of_expr(&index.index),
            },
            Expr::Call(_) | Expr::MethodCall(_) => match Self::of_call(expr) {
                Some(inner) => Self::Call(Box::new(inner)),
                None => Self::Opaque,
            },
            Expr::Paren(paren) => Self::of_expr(&paren.expr),
            Expr::Group(group) => Self::of_expr(&group.expr),
            Expr::Reference(reference) => Self::of_expr(&reference.expr),
            _ => Self::Opaque,
        }
    }

    /// The last name segment: the method, field, or final path segment.
    pub fn last_segment(&self) -> Option<&str> {
        match self {
            Self::Name(path) => path.rsplit("::").next(),
            Self::Member { member, .. } => Some(member.as_str()),
            _ => None,
        }
    }
}

impl Key {
    fn of_expr(expr: &Expr) -> Self {
        match expr {
            Expr::Lit(lit) => match &lit.lit {
                Lit::Str(s) => Self::Literal(s.value()),
                Lit::Int(i) => Self::Literal(i.base10_digits().to_owned()),
                Lit::Float(f) => Self::Literal(f.base10_digits().to_owned()),
                _ => Self::Any,
            },
            Expr::Paren(paren) => Self::of_expr(&paren.expr),
            Expr::Group(group) => Self::of_expr(&group.expr),
            _ => Self::Any,
        }
    }
}

/// Join path segments with `::`, dropping generic arguments and any leading `::`.
fn path_name(path: &syn::Path) -> String {
    path.segments
        .iter()
        .map(|seg| seg.ident.to_string())
        .collect::<Vec<_>>()
        .join("::")
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(path) => f.write_str(path),
            Self::Member { base, member } => write!(f, "{base}.{member}"),
            Self::Index { base, key } => write!(f, "{base}[{key}]"),
            Self::Call(base) => write!(f, "{base}()"),
            Self::Opaque => f.write_str("_"),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(text) => f.write_str(text),
            Self::Any => f.write_str("*"),
        }
    }
}

/// A blacklist/whitelist entry, written in the same form as canonical names.
///
/// `"a[*]"` matches `a[0]`, `a["key"]` and `a[i]`. String keys are written
/// without quotes: `"a[b]"` matches `a["b"]`. `"a.b"` never matches `a["b"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    source: String,
    target: CallTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid call name pattern `{pattern}`: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: &'static str,
}

impl NamePattern {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &CallTarget) -> bool {
        target_matches(&self.target, name)
    }
}

fn target_matches(pattern: &CallTarget, name: &CallTarget) -> bool {
    match (pattern, name) {
        (CallTarget::Name(p), CallTarget::Name(n)) => p == n,
        (
            CallTarget::Member { base: pb, member: pm },
            CallTarget::Member { base: nb, member: nm },
        ) => pm == nm && target_matches(pb, nb),
        (CallTarget::Index { base: pb, key: pk }, CallTarget::Index { base: nb, key: nk }) => {
            (*pk == Key::Any || pk == nk) && target_matches(pb, nb)
        }
        (CallTarget::Call(p), CallTarget::Call(n)) => target_matches(p, n),
        (CallTarget::Opaque, CallTarget::Opaque) => true,
        _ => false,
    }
}

impl FromStr for NamePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| PatternError {
            pattern: s.to_owned(),
            reason,
        };
        let mut rest = s.trim();
        if rest.is_empty() {
            return Err(fail("pattern is empty"));
        }

        let mut path = vec![take_ident(&mut rest).ok_or_else(|| fail("expected a name"))?];
        while let Some(after) = rest.strip_prefix("::") {
            rest = after;
            path.push(take_ident(&mut rest).ok_or_else(|| fail("expected a name after `::`"))?);
        }
        let mut target = if path == ["_"] {
            CallTarget::Opaque
        } else {
            CallTarget::Name(path.join("::"))
        };

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                rest = after;
                let member =
                    take_ident(&mut rest).ok_or_else(|| fail("expected a name after `.`"))?;
                target = CallTarget::Member {
                    base: Box::new(target),
                    member: member.to_owned(),
                };
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| fail("unclosed `[`"))?;
                let raw = after[..end].trim();
                rest = &after[end + 1..];
                let key = match raw {
                    "" => return Err(fail("empty subscript")),
                    "*" => Key::Any,
                    _ => Key::Literal(unquote(raw).to_owned()),
                };
                target = CallTarget::Index {
                    base: Box::new(target),
                    key,
                };
            } else if let Some(after) = rest.strip_prefix("()") {
                rest = after;
                target = CallTarget::Call(Box::new(target));
            } else {
                return Err(fail("expected `.`, `[` or `()`"));
            }
        }

        Ok(Self {
            source: s.trim().to_owned(),
            target,
        })
    }
}

fn take_ident<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let (ident, after) = rest.split_at(end);
    *rest = after;
    Some(ident)
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
}

/// Which calls a rewrite is allowed to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CallFilter {
    #[default]
    All,
    /// Wrap everything except matching names.
    Blacklist(Vec<NamePattern>),
    /// Wrap only matching names.
    Whitelist(Vec<NamePattern>),
}

impl CallFilter {
    pub fn allows(&self, name: &CallTarget) -> bool {
        match self {
            Self::All => true,
            Self::Blacklist(patterns) => !patterns.iter().any(|p| p.matches(name)),
            Self::Whitelist(patterns) => patterns.iter().any(|p| p.matches(name)),
        }
    }
}

/// Callables that are always in scope without an import. Compared after
/// stripping a leading `std::`, `core::` or `alloc::`.
const INTRINSIC_PATHS: &[&str] = &[
    "Some",
    "Ok",
    "Err",
    "Option::Some",
    "Result::Ok",
    "Result::Err",
    "drop",
    "mem::drop",
    "mem::take",
    "mem::replace",
    "mem::swap",
    "Box::new",
    "Box::pin",
    "Vec::new",
    "Vec::with_capacity",
    "String::new",
    "String::with_capacity",
    "String::from",
    "Default::default",
    "Rc::new",
    "Rc::clone",
    "Arc::new",
    "Arc::clone",
    "Cell::new",
    "RefCell::new",
];

/// Methods of prelude traits and of the prelude's own types.
const INTRINSIC_METHODS: &[&str] = &[
    // Clone, ToString, ToOwned, From/Into, AsRef/AsMut, Default
    "clone",
    "clone_from",
    "to_string",
    "to_owned",
    "from",
    "into",
    "try_from",
    "try_into",
    "as_ref",
    "as_mut",
    "default",
    // PartialEq, PartialOrd, Ord
    "eq",
    "ne",
    "cmp",
    "partial_cmp",
    "lt",
    "le",
    "gt",
    "ge",
    "max",
    "min",
    "clamp",
    // Iterator, IntoIterator, DoubleEndedIterator, ExactSizeIterator, Extend
    "into_iter",
    "next",
    "next_back",
    "len",
    "extend",
    "map",
    "filter",
    "filter_map",
    "flat_map",
    "flatten",
    "collect",
    "sum",
    "product",
    "count",
    "fold",
    "for_each",
    "enumerate",
    "zip",
    "unzip",
    "rev",
    "chain",
    "take",
    "skip",
    "take_while",
    "skip_while",
    "step_by",
    "peekable",
    "cloned",
    "copied",
    "any",
    "all",
    "find",
    "position",
    "last",
    "nth",
    "inspect",
    "partition",
    "by_ref",
    "max_by",
    "min_by",
    "max_by_key",
    "min_by_key",
    // Option, Result, Vec, String, slices
    "unwrap",
    "expect",
    "unwrap_or",
    "unwrap_or_else",
    "unwrap_or_default",
    "ok",
    "err",
    "ok_or",
    "ok_or_else",
    "map_err",
    "and_then",
    "is_some",
    "is_none",
    "is_ok",
    "is_err",
    "as_deref",
    "iter",
    "iter_mut",
    "push",
    "push_str",
    "pop",
    "insert",
    "remove",
    "get",
    "get_mut",
    "contains",
    "is_empty",
    "as_str",
    "as_slice",
    "as_bytes",
    "to_vec",
];

/// Whether `target` names a prelude intrinsic that `ignore_builtins` skips.
///
/// Purely syntactic: a user method called `len` is treated like `Vec::len`.
pub fn is_intrinsic(target: &CallTarget) -> bool {
    match target {
        CallTarget::Name(path) => {
            let path = ["std::", "core::", "alloc::"]
                .iter()
                .find_map(|prefix| path.strip_prefix(prefix))
                .unwrap_or(path);
            if INTRINSIC_PATHS.contains(&path) {
                return true;
            }
            // `u64::from`, `Iterator::next`, `T::default`
            path.contains("::")
                && target
                    .last_segment()
                    .is_some_and(|last| INTRINSIC_METHODS.contains(&last))
        }
        CallTarget::Member { member, .. } => INTRINSIC_METHODS.contains(&member.as_str()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_of(src: &str) -> CallTarget {
        let expr: Expr = syn::parse_str(src).unwrap();
        CallTarget::of_call(&expr).unwrap()
    }

    fn name_of(src: &str) -> String {
        target_of(src).to_string()
    }

    fn pattern(s: &str) -> NamePattern {
        s.parse().unwrap()
    }

    #[test]
    fn plain_and_path_names() {
        assert_eq!(name_of("run()"), "run");
        assert_eq!(name_of("Vec::<u8>::with_capacity(4)"), "Vec::with_capacity");
        assert_eq!(name_of("::std::mem::take(&mut x)"), "std::mem::take");
    }

    #[test]
    fn members_and_methods_chain_left_to_right() {
        assert_eq!(name_of("self.client.send(req)"), "self.client.send");
        assert_eq!(name_of("(self.callback)(1)"), "self.callback");
        assert_eq!(name_of("(self.handlers.0)()"), "self.handlers.0");
        assert_eq!(name_of("client.get().send()"), "client.get().send");
        assert_eq!(name_of("make()()"), "make()");
    }

    #[test]
    fn literal_subscripts_render_their_value() {
        assert_eq!(name_of(r#"handlers["save"]()"#), "handlers[save]");
        assert_eq!(name_of("table[0]()"), "table[0]");
        assert_eq!(name_of("table[1usize].run()"), "table[1].run");
    }

    #[test]
    fn non_literal_subscripts_render_as_wildcard() {
        assert_eq!(name_of("a.b[c].d()"), "a.b[*].d");
        assert_eq!(name_of("table[i + 1]()"), "table[*]");
    }

    #[test]
    fn opaque_targets_render_as_underscore() {
        assert_eq!(name_of("(|x| x)(1)"), "_");
        assert_eq!(name_of("(a as Box<dyn Run>).run()"), "_.run");
    }

    #[test]
    fn wildcard_pattern_matches_any_subscript() {
        let p = pattern("a[*]");
        assert!(p.matches(&target_of("a[0]()")));
        assert!(p.matches(&target_of(r#"a["key"]()"#)));
        assert!(p.matches(&target_of("a[val]()")));
        assert!(!p.matches(&target_of("a.b()")));
        assert!(!p.matches(&target_of("a()")));
    }

    #[test]
    fn member_pattern_never_matches_subscript() {
        let p = pattern("a.b");
        assert!(p.matches(&target_of("a.b()")));
        assert!(!p.matches(&target_of(r#"a["b"]()"#)));
    }

    #[test]
    fn literal_pattern_does_not_match_non_literal_key() {
        let p = pattern("a[0]");
        assert!(p.matches(&target_of("a[0]()")));
        assert!(!p.matches(&target_of("a[i]()")));
        assert!(pattern(r#"a["b"]"#).matches(&target_of(r#"a["b"]()"#)));
    }

    #[test]
    fn no_partial_matching() {
        assert!(!pattern("run").matches(&target_of("run_all()")));
        assert!(!pattern("client").matches(&target_of("client.get()")));
    }

    #[test]
    fn pattern_round_trips_canonical_names() {
        for src in ["a.b[*].d", "client.get().send", "Vec::new", "table[0]"] {
            assert_eq!(pattern(src).target.to_string(), src);
        }
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for bad in ["", "a.", "a[", "a[]", "a b", ".a"] {
            let err = bad.parse::<NamePattern>().unwrap_err();
            assert_eq!(err.pattern, bad);
        }
    }

    #[test]
    fn filters() {
        let black = CallFilter::Blacklist(vec![pattern("log"), pattern("cache[*]")]);
        assert!(!black.allows(&target_of("log()")));
        assert!(!black.allows(&target_of("cache[k]()")));
        assert!(black.allows(&target_of("fetch()")));

        let white = CallFilter::Whitelist(vec![pattern("fetch")]);
        assert!(white.allows(&target_of("fetch()")));
        assert!(!white.allows(&target_of("log()")));

        assert!(CallFilter::All.allows(&target_of("anything()")));
    }

    #[test]
    fn intrinsics() {
        assert!(is_intrinsic(&target_of("Some(1)")));
        assert!(is_intrinsic(&target_of("std::mem::take(&mut v)")));
        assert!(is_intrinsic(&target_of("u64::from(x)")));
        assert!(is_intrinsic(&target_of("items.iter()")));
        assert!(is_intrinsic(&target_of("range(n).map(f)")));
        assert!(!is_intrinsic(&target_of("range(n)")));
        assert!(!is_intrinsic(&target_of("from(x)")));
        assert!(!is_intrinsic(&target_of("client.send()")));
    }
}
