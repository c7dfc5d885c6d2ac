use std::path::Path;

fn main() {
    // The CLI injects shallow-runtime into staged projects, so it needs the
    // runtime's version rather than its own package version.
    let runtime_cargo = Path::new("shallow-runtime").join("Cargo.toml");
    println!("cargo::rerun-if-changed={}", runtime_cargo.display());

    let version = match std::fs::read_to_string(&runtime_cargo) {
        Ok(contents) => contents
            .parse::<toml_edit::DocumentMut>()
            .expect("failed to parse shallow-runtime/Cargo.toml")
            .get("package")
            .and_then(|p| p.get("version"))
            .and_then(|v| v.as_str())
            .expect("missing [package].version in shallow-runtime/Cargo.toml")
            .to_owned(),
        // Installed from crates.io: the workspace sibling is absent and the
        // versions are published in lockstep.
        Err(_) => std::env::var("CARGO_PKG_VERSION").expect("CARGO_PKG_VERSION not set"),
    };

    println!("cargo::rustc-env=SHALLOW_RUNTIME_VERSION={version}");
}
