//! `shallow build`: rewrite a throwaway copy of a project and compile it.
//!
//! The user's tree is never written to. A [`StagedProject`] lives in a
//! temporary directory; the CLI rewrites sources inside it, adds the runtime
//! dependency, and compiles it into the project's own `target/shallow`.

use std::path::{Path, PathBuf};
use std::process::Command;

use ignore::WalkBuilder;
use toml_edit::{Array, DocumentMut, InlineTable, Item, Table, Value};

use crate::error::Error;

/// Where the staged manifest takes `shallow-runtime` from.
#[derive(Debug, Clone, Copy)]
pub enum RuntimeSource<'a> {
    Version(&'a str),
    /// A local checkout, for working on shallow itself.
    Path(&'a Path),
}

/// A copy of a project, deleted on drop.
#[derive(Debug)]
pub struct StagedProject {
    dir: tempfile::TempDir,
    /// The package being rewritten, inside `dir`.
    member: PathBuf,
    /// Set when a whole workspace was staged, for `cargo build -p`.
    package: Option<String>,
}

impl StagedProject {
    /// Copy `project`, honouring ignore files and leaving out its `target/`.
    ///
    /// A workspace member is staged together with its workspace, so inherited
    /// manifest keys and path dependencies on sibling members still resolve.
    pub fn copy(project: &Path) -> Result<Self, Error> {
        let project = project.canonicalize()?;
        let (root, package) = match enclosing_workspace(&project) {
            Some(root) => (root, Some(package_name(&project)?)),
            None => (project.to_path_buf(), None),
        };
        let dir = tempfile::tempdir()?;
        copy_tree(&root, dir.path())?;

        let relative = project
            .strip_prefix(&root)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let member = dir.path().join(relative);
        tracing::debug!(staging = %dir.path().display(), package = ?package, "staged project");
        Ok(Self {
            dir,
            member,
            package,
        })
    }

    /// The staged copy of `relative`, a path inside the rewritten package.
    pub fn path(&self, relative: &Path) -> PathBuf {
        self.member.join(relative)
    }

    /// Add `shallow-runtime` to the package's `[dependencies]`.
    ///
    /// A package using the marker attributes already depends on the runtime:
    /// its `default-features` and `features` are kept, `features` extended.
    pub fn add_runtime(&self, source: RuntimeSource<'_>, features: &[&str]) -> Result<(), Error> {
        let manifest = self.member.join("Cargo.toml");
        let mut doc = read_manifest(&manifest)?;
        if !doc.contains_table("dependencies") {
            doc["dependencies"] = Item::Table(Table::new());
        }
        let dependency = runtime_dependency(doc["dependencies"].get("shallow-runtime"), source, features);
        doc["dependencies"]["shallow-runtime"] = dependency;
        std::fs::write(&manifest, doc.to_string())?;
        Ok(())
    }

    /// Make the binary install a log subscriber first thing in `main`, so
    /// the default profiler callbacks are visible. Returns the rewritten
    /// entry point, or `None` for a package without one.
    pub fn enable_logging(&self) -> Result<Option<PathBuf>, Error> {
        let Some(entry) = self.bin_entry()? else {
            tracing::warn!("no binary entry point; profiler reports need a subscriber");
            return Ok(None);
        };
        let staged = self.member.join(&entry);
        let source = std::fs::read_to_string(&staged).map_err(|source| Error::ReadError {
            path: entry.clone(),
            source,
        })?;
        let rewritten = crate::instrument::inject_subscriber(&source).map_err(|source| Error::ParseError {
            path: entry.clone(),
            source,
        })?;
        std::fs::write(&staged, rewritten)?;
        Ok(Some(entry))
    }

    /// The first `[[bin]]` with an explicit `path`, else `src/main.rs`.
    fn bin_entry(&self) -> Result<Option<PathBuf>, Error> {
        let doc = read_manifest(&self.member.join("Cargo.toml"))?;
        let declared = doc
            .get("bin")
            .and_then(Item::as_array_of_tables)
            .and_then(|bins| bins.iter().find_map(|bin| bin.get("path")?.as_str()))
            .map(PathBuf::from);
        let entry = declared.unwrap_or_else(|| PathBuf::from("src").join("main.rs"));
        Ok(self.member.join(&entry).is_file().then_some(entry))
    }

    /// `cargo build` the staged copy into `target_dir`. Returns the last
    /// executable cargo reports, which is the package's own binary.
    pub fn compile(&self, target_dir: &Path) -> Result<PathBuf, Error> {
        let mut cargo = Command::new("cargo");
        cargo
            .args(["build", "--message-format=json"])
            .env("CARGO_TARGET_DIR", target_dir)
            // Let the project's rust-toolchain.toml pick the toolchain.
            .env_remove("RUSTUP_TOOLCHAIN")
            .current_dir(self.dir.path());
        if let Some(package) = &self.package {
            cargo.args(["-p", package]);
        }
        tracing::debug!(?cargo, "compiling staged project");
        let output = cargo.output()?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let messages = CargoMessages::parse(&stdout);
        if !output.status.success() {
            let detail = if messages.errors.is_empty() {
                String::from_utf8_lossy(&output.stderr).into_owned()
            } else {
                messages.errors.concat()
            };
            return Err(Error::BuildFailed(detail));
        }
        messages
            .executable
            .ok_or_else(|| Error::BuildFailed("cargo reported no executable".into()))
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), Error> {
    let walker = WalkBuilder::new(from)
        .hidden(false)
        .require_git(false)
        .follow_links(true)
        .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != "target")
        .build();
    for entry in walker {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let dest = to.join(relative);
        match entry.file_type() {
            Some(ft) if ft.is_dir() => std::fs::create_dir_all(&dest)?,
            Some(ft) if ft.is_file() => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &dest)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<DocumentMut, Error> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    text.parse()
        .map_err(|e| Error::BuildFailed(format!("{} is not valid TOML: {e}", path.display())))
}

fn runtime_dependency(existing: Option<&Item>, source: RuntimeSource<'_>, features: &[&str]) -> Item {
    let mut all_features: Vec<String> = existing
        .and_then(|dep| dep.get("features"))
        .and_then(Item::as_array)
        .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    for feature in features {
        if !all_features.iter().any(|f| f == feature) {
            all_features.push((*feature).to_owned());
        }
    }
    let default_features = existing
        .and_then(|dep| dep.get("default-features"))
        .and_then(Item::as_bool);

    if let RuntimeSource::Version(version) = source
        && all_features.is_empty()
        && default_features.is_none()
    {
        return toml_edit::value(version);
    }
    let mut table = InlineTable::new();
    match source {
        RuntimeSource::Version(version) => table.insert("version", version.into()),
        RuntimeSource::Path(path) => table.insert("path", path.to_string_lossy().as_ref().into()),
    };
    if let Some(enabled) = default_features {
        table.insert("default-features", enabled.into());
    }
    if !all_features.is_empty() {
        table.insert("features", Value::Array(all_features.iter().map(String::as_str).collect::<Array>()));
    }
    Item::Value(Value::InlineTable(table))
}

/// The nearest ancestor of `project` whose manifest has a `[workspace]`.
fn enclosing_workspace(project: &Path) -> Option<PathBuf> {
    project.ancestors().skip(1).find_map(|dir| {
        let text = std::fs::read_to_string(dir.join("Cargo.toml")).ok()?;
        let doc: DocumentMut = text.parse().ok()?;
        doc.contains_key("workspace").then(|| dir.to_path_buf())
    })
}

fn package_name(project: &Path) -> Result<String, Error> {
    let doc = read_manifest(&project.join("Cargo.toml"))?;
    doc.get("package")
        .and_then(|package| package.get("name"))
        .and_then(Item::as_str)
        .map(String::from)
        .ok_or_else(|| Error::BuildFailed(format!("{} has no package.name", project.display())))
}

/// What `cargo build --message-format=json` said.
#[derive(Debug, Default)]
struct CargoMessages {
    /// Rendered compiler diagnostics, in order.
    errors: Vec<String>,
    executable: Option<PathBuf>,
}

impl CargoMessages {
    fn parse(stdout: &str) -> Self {
        let mut messages = Self::default();
        for line in stdout.lines() {
            let Ok(msg) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            match msg.get("reason").and_then(|r| r.as_str()) {
                Some("compiler-message") => {
                    if let Some(rendered) = msg.pointer("/message/rendered").and_then(|r| r.as_str()) {
                        messages.errors.push(rendered.to_owned());
                    }
                }
                Some("compiler-artifact") => {
                    if let Some(exe) = msg.get("executable").and_then(|e| e.as_str()) {
                        messages.executable = Some(PathBuf::from(exe));
                    }
                }
                _ => {}
            }
        }
        messages
    }
}

/// The newest executable in `target_dir/debug`, left there by `shallow build`.
pub fn latest_binary(target_dir: &Path) -> Result<PathBuf, Error> {
    let dir = target_dir.join("debug");
    if !dir.is_dir() {
        return Err(Error::NoBinary);
    }
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        // Build scripts' outputs and `.d` files sit next to the binaries.
        if !path.is_file() || path.extension().is_some() {
            continue;
        }
        let metadata = entry.metadata()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                continue;
            }
        }
        let modified = metadata.modified()?;
        if newest.as_ref().is_none_or(|(time, _)| modified > *time) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| path).ok_or(Error::NoBinary)
}
