use std::path::PathBuf;

use proc_macro2::{Span, TokenStream};

use crate::rewrite::Stage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no source available for `{function}`: {reason}")]
    SourceUnavailable { function: String, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(syn::Error),

    #[error("failed to rewrite `{function}` ({stage}): {cause}")]
    RewriteFailed {
        function: String,
        stage: Stage,
        #[source]
        cause: RewriteError,
    },

    #[error("no functions matched {0}")]
    NoTargetsFound(String),

    #[error("failed to parse {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: syn::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("run failed: {0}")]
    RunFailed(String),

    #[error("no instrumented binary found -- run `shallow build` first")]
    NoBinary,

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Why a pipeline stage could not complete.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error(transparent)]
    Syntax(#[from] syn::Error),

    #[error("marker `#[{0}]` not found on the function")]
    MarkerNotFound(&'static str),

    #[error("calls inside a `const fn` cannot be wrapped")]
    ConstFn,
}

impl Error {
    /// Render as a `compile_error!`, spanned at the offending tokens when the
    /// error carries a span.
    pub fn to_compile_error(&self) -> TokenStream {
        let span = match self {
            Error::Configuration(err) => return err.to_compile_error(),
            Error::RewriteFailed {
                cause: RewriteError::Syntax(err),
                ..
            } => err.span(),
            _ => Span::call_site(),
        };
        syn::Error::new(span, self).to_compile_error()
    }
}
