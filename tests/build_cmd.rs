//! End-to-end: `shallow build` stages, rewrites and compiles a project, and
//! `shallow run` executes the result.

use std::fs;
use std::path::Path;
use std::process::Command;

fn create_mini_project(dir: &Path) {
    fs::create_dir_all(dir.join("src")).unwrap();

    fs::write(
        dir.join("Cargo.toml"),
        r#"[package]
name = "mini"
version = "0.1.0"
edition = "2024"

[[bin]]
name = "mini"
path = "src/main.rs"
"#,
    )
    .unwrap();

    fs::write(
        dir.join("src").join("main.rs"),
        r#"fn main() {
    let result = work(1000);
    println!("result: {result}");
}

fn work(n: u64) -> u64 {
    (0..n).map(step).sum()
}

fn step(i: u64) -> u64 {
    let _ = square(i);
    i
}

fn square(i: u64) -> u64 {
    i * i
}
"#,
    )
    .unwrap();
}

fn runtime_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("shallow-runtime")
}

#[test]
#[ignore = "compiles a staged project with cargo"]
fn build_profiles_selected_functions() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("mini");
    create_mini_project(&project_dir);

    let shallow_bin = env!("CARGO_BIN_EXE_shallow");
    let output = Command::new(shallow_bin)
        .args(["build", "--fn", "step", "--time-limit", "0", "--project"])
        .arg(&project_dir)
        .arg("--runtime-path")
        .arg(runtime_path())
        .output()
        .expect("failed to run shallow build");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "shallow build failed:\n{stderr}");
    assert!(stderr.contains("found 1 function(s) across 1 file(s)"), "got: {stderr}");
    assert!(stderr.contains("built: mini"), "got: {stderr}");

    // The original project is untouched.
    let original = fs::read_to_string(project_dir.join("src/main.rs")).unwrap();
    assert!(!original.contains("shallow_runtime"));

    let output = Command::new(shallow_bin)
        .args(["run", "--project"])
        .arg(&project_dir)
        .env("RUST_LOG", "info")
        .output()
        .expect("failed to run shallow run");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "shallow run failed:\n{stderr}");
    assert!(stdout.contains("result: 499500"), "got: {stdout}");
    assert!(stderr.contains("step finished in"), "got: {stderr}");
    assert!(stderr.contains("above limit of"), "got: {stderr}");
    assert!(stderr.contains("square:"), "got: {stderr}");
}

#[test]
#[ignore = "compiles a staged project with cargo"]
fn build_honours_markers_without_selection() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("marked");
    fs::create_dir_all(project_dir.join("src")).unwrap();
    fs::write(
        project_dir.join("Cargo.toml"),
        format!(
            r#"[package]
name = "marked"
version = "0.1.0"
edition = "2024"

[dependencies]
shallow-runtime = {{ path = "{}" }}
"#,
            runtime_path().display()
        ),
    )
    .unwrap();
    fs::write(
        project_dir.join("src").join("main.rs"),
        r#"use shallow_runtime::{CallSite, wrap_calls};

fn log_call(site: &'static CallSite) {
    println!("call {}", site.name());
}

#[wrap_calls(wrapper = log_call)]
fn work() -> u64 {
    double(2)
}

fn double(v: u64) -> u64 {
    v * 2
}

fn main() {
    println!("result: {}", work());
}
"#,
    )
    .unwrap();

    let shallow_bin = env!("CARGO_BIN_EXE_shallow");
    let output = Command::new(shallow_bin)
        .args(["build", "--project"])
        .arg(&project_dir)
        .arg("--runtime-path")
        .arg(runtime_path())
        .output()
        .expect("failed to run shallow build");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "shallow build failed:\n{stderr}");
    assert!(stderr.contains("work (marked)"), "got: {stderr}");

    let binary = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let run = Command::new(&binary).output().unwrap();
    let stdout = String::from_utf8_lossy(&run.stdout);
    assert_eq!(stdout, "call double\nresult: 4\n");
}

#[test]
fn run_without_a_build_reports_missing_binary() {
    let tmp = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_shallow"))
        .args(["run", "--project"])
        .arg(tmp.path())
        .output()
        .expect("failed to run shallow run");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(stderr.contains("no instrumented binary found"), "got: {stderr}");
}

#[test]
fn build_without_markers_or_selection_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("mini");
    create_mini_project(&project_dir);

    let output = Command::new(env!("CARGO_BIN_EXE_shallow"))
        .args(["build", "--project"])
        .arg(&project_dir)
        .output()
        .expect("failed to run shallow build");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(
        stderr.contains("no #[wrap_calls] or #[profile] markers found"),
        "got: {stderr}"
    );
}
