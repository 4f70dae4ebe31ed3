//! Config file loading against real files on disk.
//!
//! Run with: cargo test -p cuhost-core --test config_file -- --nocapture

use std::io::Write;

use cuhost_core::config::SchedulePolicy;
use cuhost_core::{CoreError, CuhostConfig};

#[test]
fn test_load_full_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cuhost.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[driver]
library_path = "/opt/cuda/lib64/libcuda.so.1"
init_flags = 0

[context]
device = 1
schedule = "yield"

[compiler]
program = "/usr/local/cuda/bin/nvcc"
args = ["--ptx", "-arch=sm_80"]
work_dir = "/tmp/kernels"
keep_image = true
"#
    )
    .unwrap();

    let config = CuhostConfig::load(&path).unwrap();
    assert_eq!(
        config.driver.library_path.as_deref(),
        Some("/opt/cuda/lib64/libcuda.so.1")
    );
    assert_eq!(config.context.device, 1);
    assert_eq!(config.context.schedule, SchedulePolicy::Yield);
    assert_eq!(config.context.flags_bits(), 0x02);
    assert_eq!(config.compiler.args.len(), 2);
    assert_eq!(config.compiler.image_extension, "ptx");
    assert!(config.compiler.keep_image);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = CuhostConfig::load_or_default(dir.path().join("absent.toml"));
    assert_eq!(config.compiler.program, "nvcc");
}

#[test]
fn test_malformed_file_reports_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[context]\ndevice = \"zero\"\n").unwrap();

    match CuhostConfig::load(&path) {
        Err(CoreError::Parse(e)) => println!("parse error as expected: {}", e),
        other => panic!("expected parse error, got {:?}", other),
    }
    // load_or_default swallows the error
    assert_eq!(CuhostConfig::load_or_default(&path).context.device, 0);
}
