use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::tempdir;
use upscaler_core::logging::{install_crash_hook, CrashHook, CRASH_DIR_NAME, LOG_DIR_NAME};

const CHILD_MODE: &str = "UPSCALER_CRASH_CHILD_MODE";
const CHILD_DATA_DIR: &str = "UPSCALER_CRASH_CHILD_DATA_DIR";

fn run_child(mode: &str, data_dir: &Path) -> std::process::Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .arg("crash_child_entrypoint")
        .arg("--exact")
        .arg("--nocapture")
        .env(CHILD_MODE, mode)
        .env(CHILD_DATA_DIR, data_dir)
        .output()
        .expect("run crash hook child")
}

fn crash_reports(crash_dir: &Path) -> Vec<PathBuf> {
    let mut paths = fs::read_dir(crash_dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

#[test]
fn crash_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR).expect("child data dir"));

    assert!(matches!(
        install_crash_hook(Some(&data_dir)),
        CrashHook::Installed { .. } | CrashHook::AlreadyInstalled { .. }
    ));
    assert!(matches!(
        install_crash_hook(Some(&data_dir)),
        CrashHook::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "panic" => panic!("tile worker exploded"),
        "blocked" => {
            let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
            fs::remove_dir_all(&crash_dir).expect("remove crash dir");
            fs::write(&crash_dir, b"in the way").expect("block crash dir");
            panic!("panic with blocked crash dir");
        }
        other => panic!("unknown child mode: {other}"),
    }
}

#[test]
fn crash_hook_writes_report() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_child("panic", data_dir.path());
    assert!(!output.status.success());

    let reports = crash_reports(&data_dir.path().join(LOG_DIR_NAME).join(CRASH_DIR_NAME));
    let newest = reports.last().expect("a crash report");
    let contents = fs::read_to_string(newest).expect("read crash report");
    assert!(contents.contains("time="));
    assert!(contents.contains("message=tile worker exploded"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace_status="));
}

#[test]
fn crash_hook_warns_when_report_cannot_be_written() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_child("blocked", data_dir.path());
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("panic with blocked crash dir"));
    assert!(stderr.contains("Warning: could not write crash report"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
