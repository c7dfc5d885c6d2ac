use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Args, Parser, Subcommand};
use proc_macro2::Span;
use tracing_subscriber::EnvFilter;

use shallow::build::{RuntimeSource, StagedProject, latest_binary};
use shallow::config::{Plan, ProfileConfig, RewriteConfig, filter_from_lists, time_limit_from_secs};
use shallow::error::Error;
use shallow::instrument::instrument_source;
use shallow::resolve::{TargetSpec, extract_functions, resolve_targets};

#[derive(Parser)]
#[command(
    name = "shallow",
    about = "Wrap or time the calls made directly inside chosen Rust functions",
    version,
    after_help = "Functions carrying #[wrap_calls] or #[profile] are always rewritten with \
                  their own options; --fn/--file/--mod select more functions for the \
                  command-line options."
)]
struct Cli {
    /// Log engine internals to stderr.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the rewritten source of a single file.
    Expand {
        /// File to rewrite.
        file: PathBuf,

        /// Also rewrite unmarked functions whose name contains PATTERN
        /// (repeatable). Needs --wrapper or --time-limit.
        #[arg(long = "fn", value_name = "PATTERN")]
        fn_patterns: Vec<String>,

        /// Write the result here instead of stdout.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        #[command(flatten)]
        rewrite: RewriteArgs,
    },
    /// Rewrite a staged copy of the project and build it.
    Build {
        #[command(flatten)]
        build: BuildArgs,
    },
    /// Execute the last-built rewritten binary.
    /// Pass arguments to the binary after --.
    Run {
        /// Project root (defaults to current directory).
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Arguments to pass to the binary (after --).
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Rewrite functions whose name contains PATTERN (repeatable).
    /// e.g. --fn parse matches parse, parse_line, MyStruct::try_parse.
    #[arg(long = "fn", value_name = "PATTERN")]
    fn_patterns: Vec<String>,

    /// Rewrite all functions in a file (repeatable).
    #[arg(long = "file", value_name = "PATH")]
    file_patterns: Vec<PathBuf>,

    /// Rewrite all functions in a module (repeatable).
    #[arg(long = "mod", value_name = "NAME")]
    mod_patterns: Vec<String>,

    /// Project root (defaults to current directory).
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Path to shallow-runtime source (for development before publishing).
    #[arg(long)]
    runtime_path: Option<PathBuf>,

    #[command(flatten)]
    rewrite: RewriteArgs,
}

/// Options for functions selected on the command line.
#[derive(Args)]
struct RewriteArgs {
    /// Wrap each call with PATH, called as PATH(&'static CallSite).
    #[arg(long, value_name = "PATH", conflicts_with = "time_limit")]
    wrapper: Option<String>,

    /// Profile instead, reporting invocations against SECS.
    #[arg(long, value_name = "SECS")]
    time_limit: Option<f64>,

    /// Skip calls to prelude functions and std methods.
    #[arg(long)]
    ignore_builtins: bool,

    /// Do not wrap calls matching NAME (repeatable; `[*]` matches any index).
    #[arg(long, value_name = "NAME", conflicts_with = "whitelist")]
    blacklist: Vec<String>,

    /// Wrap only calls matching NAME (repeatable; `[*]` matches any index).
    #[arg(long, value_name = "NAME")]
    whitelist: Vec<String>,
}

impl RewriteArgs {
    /// The plan for selected functions, or `None` when neither `--wrapper`
    /// nor `--time-limit` was given.
    fn plan(&self) -> Result<Option<Plan>, Error> {
        let has_options =
            self.ignore_builtins || !self.blacklist.is_empty() || !self.whitelist.is_empty();
        let mut calls = match (&self.wrapper, self.time_limit) {
            (Some(wrapper), None) => {
                let path: syn::Path = syn::parse_str(wrapper).map_err(|e| {
                    configuration(format!("`--wrapper {wrapper}` is not a path: {e}"))
                })?;
                RewriteConfig::new(path)
            }
            (None, Some(_)) => ProfileConfig::new(std::time::Duration::ZERO).calls,
            (Some(_), Some(_)) => {
                return Err(configuration("--wrapper and --time-limit are mutually exclusive"));
            }
            (None, None) if has_options => {
                return Err(configuration("call options need --wrapper or --time-limit"));
            }
            (None, None) => return Ok(None),
        };
        calls.ignore_builtins = self.ignore_builtins;
        calls.filter =
            filter_from_lists(&self.blacklist, &self.whitelist).map_err(Error::Configuration)?;

        Ok(Some(match self.time_limit {
            Some(secs) => {
                let time_limit = time_limit_from_secs(secs).map_err(configuration)?;
                let mut config = ProfileConfig::new(time_limit);
                config.calls = calls;
                Plan::Profile(config)
            }
            None => Plan::WrapCalls(calls),
        }))
    }
}

fn configuration(message: impl std::fmt::Display) -> Error {
    Error::Configuration(syn::Error::new(Span::call_site(), message))
}

fn main() {
    let cli = Cli::parse();
    if cli.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Expand {
            file,
            fn_patterns,
            output,
            rewrite,
        } => cmd_expand(&file, &fn_patterns, output.as_deref(), &rewrite),
        Commands::Build { build } => cmd_build(build),
        Commands::Run { project, args } => cmd_run(&project, args),
    }
}

fn cmd_expand(
    file: &Path,
    fn_patterns: &[String],
    output: Option<&Path>,
    rewrite: &RewriteArgs,
) -> Result<(), Error> {
    let plan = rewrite.plan()?;
    if !fn_patterns.is_empty() && plan.is_none() {
        return Err(configuration("--fn needs --wrapper or --time-limit"));
    }
    let source = std::fs::read_to_string(file).map_err(|source| Error::ReadError {
        path: file.to_path_buf(),
        source,
    })?;

    let specs: Vec<TargetSpec> = fn_patterns.iter().cloned().map(TargetSpec::Fn).collect();
    let targets: HashSet<String> = extract_functions(&source, file)?
        .into_iter()
        .map(|f| f.name)
        .filter(|name| specs.iter().any(|spec| spec.selects(file, name)))
        .collect();
    if !specs.is_empty() && targets.is_empty() {
        let desc = specs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::NoTargetsFound(desc));
    }

    let result = instrument_source(file, &source, &targets, plan.as_ref())?;
    for rewritten in &result.rewritten {
        eprintln!(
            "  {}: {} call(s) wrapped",
            rewritten.function, rewritten.calls_wrapped
        );
    }
    match output {
        Some(path) => std::fs::write(path, &result.source)?,
        None => print!("{}", result.source),
    }
    Ok(())
}

fn cmd_build(args: BuildArgs) -> Result<(), Error> {
    let binary = build_project(args)?;
    let display_name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());
    eprintln!("built: {display_name}");
    if !std::io::stdout().is_terminal() {
        println!("{}", binary.display());
    }
    Ok(())
}

/// Stage, rewrite and build the project. Returns the binary path.
fn build_project(args: BuildArgs) -> Result<PathBuf, Error> {
    let BuildArgs {
        fn_patterns,
        file_patterns,
        mod_patterns,
        project,
        runtime_path,
        rewrite,
    } = args;

    if !project.exists() {
        return Err(Error::BuildFailed(format!(
            "project directory does not exist: {}",
            project.display()
        )));
    }
    let project = std::fs::canonicalize(&project)?;

    let mut specs: Vec<TargetSpec> = Vec::new();
    specs.extend(fn_patterns.into_iter().map(TargetSpec::Fn));
    specs.extend(file_patterns.into_iter().map(TargetSpec::File));
    specs.extend(mod_patterns.into_iter().map(TargetSpec::Mod));

    let plan = rewrite.plan()?;
    if !specs.is_empty() && plan.is_none() {
        return Err(configuration(
            "--fn, --file and --mod need --wrapper or --time-limit",
        ));
    }

    let src_dir = project.join("src");
    if !src_dir.is_dir() {
        return Err(Error::BuildFailed(format!(
            "no src/ directory found in {} -- is this a Rust project?",
            project.display()
        )));
    }
    let targets = resolve_targets(&src_dir, &specs)?;

    let total_fns: usize = targets
        .iter()
        .map(|t| t.functions.len() + t.marked.len())
        .sum();
    eprintln!(
        "found {} function(s) across {} file(s)",
        total_fns,
        targets.len()
    );
    for target in &targets {
        let relative = target.file.strip_prefix(&src_dir).unwrap_or(&target.file);
        eprintln!("  {}:", relative.display());
        for f in &target.marked {
            eprintln!("    {f} (marked)");
        }
        for f in &target.functions {
            eprintln!("    {f}");
        }
    }

    let staged = StagedProject::copy(&project)?;

    let mut profiled = false;
    for target in &targets {
        let target_set: HashSet<String> = target.functions.iter().cloned().collect();
        let relative = target.file.strip_prefix(&project).unwrap_or(&target.file);
        let staged_file = staged.path(relative);
        let source =
            std::fs::read_to_string(&staged_file).map_err(|source| Error::ReadError {
                path: relative.to_path_buf(),
                source,
            })?;

        let result = instrument_source(relative, &source, &target_set, plan.as_ref())?;
        let calls: usize = result.rewritten.iter().map(|r| r.calls_wrapped).sum();
        tracing::debug!(file = %relative.display(), calls, "rewrote file");
        profiled |= result.rewritten.iter().any(|r| r.profiled);
        std::fs::write(&staged_file, result.source)?;
    }

    let features: &[&str] = if profiled { &["subscriber"] } else { &[] };
    let runtime_path = runtime_path.map(std::fs::canonicalize).transpose()?;
    let source = match &runtime_path {
        Some(path) => RuntimeSource::Path(path),
        None => RuntimeSource::Version(env!("SHALLOW_RUNTIME_VERSION")),
    };
    staged.add_runtime(source, features)?;
    // The default profiler callbacks log through tracing.
    if profiled {
        staged.enable_logging()?;
    }

    let target_dir = project.join("target").join("shallow");
    std::fs::create_dir_all(&target_dir)?;
    staged.compile(&target_dir)
}

fn cmd_run(project: &Path, args: Vec<String>) -> Result<(), Error> {
    let binary = latest_binary(&project.join("target").join("shallow"))?;
    eprintln!("running: {}", binary.display());

    let status = std::process::Command::new(&binary)
        .args(&args)
        .status()
        .map_err(|e| Error::RunFailed(format!("failed to run {}: {e}", binary.display())))?;

    process::exit(status.code().unwrap_or(1));
}
