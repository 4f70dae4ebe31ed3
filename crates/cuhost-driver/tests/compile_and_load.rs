//! Integration test: compile a source file with an external program, load
//! the produced image, and clean it up.
//!
//! A shell script stands in for `nvcc` so the test runs without a toolkit.
//!
//! Run with: cargo test -p cuhost-driver --test compile_and_load -- --nocapture

#![cfg(unix)]

mod common;

use std::path::Path;

use common::ADD_PTX;
use cuhost_driver::status::CUDA_ERROR_INVALID_IMAGE;
use cuhost_driver::{CuError, Module, NvccCompiler};

/// `sh -c '<script>' <source>`: the script sees the source path as `$0`.
fn fake_nvcc(work_dir: &Path, script: &str) -> NvccCompiler {
    NvccCompiler::default()
        .program("sh")
        .args(["-c", script])
        .work_dir(work_dir)
}

fn write_source(dir: &Path) -> std::path::PathBuf {
    let source = dir.join("add.cu");
    std::fs::write(&source, ADD_PTX).unwrap();
    source
}

#[test]
fn test_compile_load_and_remove_image() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path());

    let nvcc = fake_nvcc(out_dir.path(), r#"cp "$0" "$(basename "$0" .cu).ptx""#);
    let module = Module::compile_and_load(&ctx, &source, &nvcc).unwrap();
    assert!(module.function("add").is_ok());
    assert!(!out_dir.path().join("add.ptx").exists());
}

#[test]
fn test_keep_image() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path());

    let nvcc = fake_nvcc(out_dir.path(), r#"cp "$0" add.ptx"#).keep(true);
    let _module = Module::compile_and_load(&ctx, &source, &nvcc).unwrap();
    assert!(out_dir.path().join("add.ptx").is_file());
}

#[test]
fn test_image_removed_when_load_fails() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let src_dir = tempfile::tempdir().unwrap();
    let out_dir = tempfile::tempdir().unwrap();
    let source = write_source(src_dir.path());

    let nvcc = fake_nvcc(out_dir.path(), "echo garbage > add.ptx");
    let err = Module::compile_and_load(&ctx, &source, &nvcc).unwrap_err();
    assert!(err.is_driver(CUDA_ERROR_INVALID_IMAGE));
    assert!(!out_dir.path().join("add.ptx").exists());
    assert_eq!(emu.live_modules(), 0);
}

#[test]
fn test_compiler_failure_is_surfaced() {
    let emu = common::emulator();
    let ctx = common::context(&emu);
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path());

    let nvcc = fake_nvcc(dir.path(), "echo \"$0(1): error: expected a ';'\" >&2; exit 1");
    let res = Module::compile_and_load(&ctx, &source, &nvcc);
    match res {
        Err(CuError::Compile { program, stderr, .. }) => {
            println!("{}: {}", program, stderr);
            assert_eq!(program, "sh");
            assert!(stderr.contains("expected a ';'"));
        }
        other => panic!("expected compile error, got {:?}", other),
    }
}
