//! CLI-surface tests that don't require a real copy-tool binary on `PATH`:
//! help text, config validation, profile-selection errors, and `--dry-run`
//! against real temporary directories.

use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

#[cfg(unix)]
use std::thread;
#[cfg(unix)]
use std::time::Duration;

fn robocurse() -> Command {
    Command::cargo_bin("robocurse").unwrap()
}

#[test]
fn help_describes_the_tool() {
    robocurse()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("directory-replication"));
}

#[test]
fn missing_config_flag_is_a_usage_error() {
    robocurse().arg("--all-profiles").assert().failure();
}

#[test]
fn config_path_with_shell_metacharacter_is_rejected() {
    robocurse()
        .args(["--config", "foo.toml; rm -rf /", "--all-profiles"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("disallowed character"));
}

#[test]
fn missing_profile_selection_is_rejected() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("robocurse.toml");
    fs::write(&config_path, "").unwrap();

    robocurse()
        .args(["--config", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("--profile"));
}

#[test]
fn unknown_profile_name_is_rejected() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("robocurse.toml");
    fs::write(&config_path, "").unwrap();

    robocurse()
        .args(["--config", config_path.to_str().unwrap(), "--profile", "NoSuchProfile"])
        .assert()
        .failure()
        .code(2)
        .stderr(contains("no profile named"));
}

#[test]
fn dry_run_enumerates_chunks_without_copying_or_invoking_a_copy_tool() {
    let source_dir = tempdir().unwrap();
    let dest_dir = tempdir().unwrap();
    fs::create_dir_all(source_dir.path().join("sub")).unwrap();
    fs::write(source_dir.path().join("sub/file.bin"), vec![0u8; 2048]).unwrap();

    let log_dir = tempdir().unwrap();
    let config_dir = tempdir().unwrap();
    let config_path = config_dir.path().join("robocurse.toml");
    fs::write(
        &config_path,
        format!(
            r#"
            [settings]
            log_root = "{log_root}"

            [[profile]]
            name = "Demo"
            source = "{source}"
            destination = "{destination}"
            "#,
            log_root = log_dir.path().display(),
            source = source_dir.path().display(),
            destination = dest_dir.path().display(),
        ),
    )
    .unwrap();

    robocurse()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "--profile",
            "Demo",
            "--dry-run",
        ])
        .assert()
        .success()
        .stderr(contains("dry-run: would copy chunk"));

    // dry-run must enumerate without actually copying anything into the
    // destination beyond the directory `resolve_destination` creates.
    let copied: Vec<_> = fs::read_dir(dest_dir.path()).unwrap().collect();
    assert!(copied.is_empty());
}

// S8 — two real processes contending for the same profile's lock.
#[test]
#[cfg(unix)]
fn second_process_against_same_profile_is_rejected_while_first_runs() {
    let source_dir = tempdir().unwrap();
    for name in ["a", "b", "c", "d", "e"] {
        fs::create_dir_all(source_dir.path().join(name)).unwrap();
        fs::write(source_dir.path().join(name).join("file.bin"), vec![0u8; 64]).unwrap();
    }
    let dest_dir = tempdir().unwrap();
    let log_dir = tempdir().unwrap();
    let config_dir = tempdir().unwrap();
    let config_path = config_dir.path().join("robocurse.toml");
    fs::write(
        &config_path,
        format!(
            r#"
            [settings]
            log_root = "{log_root}"
            max_concurrent_jobs = 1
            copy_tool_program = "true"

            [[profile]]
            name = "Contended"
            source = "{source}"
            destination = "{destination}"
            chunk_max_files = 1
            "#,
            log_root = log_dir.path().display(),
            source = source_dir.path().display(),
            destination = dest_dir.path().display(),
        ),
    )
    .unwrap();

    // Process A: a multi-chunk, single-concurrency run against "true" as the
    // copy tool, slow enough (one tick per chunk) to stay alive while
    // process B attempts to start against the same profile.
    let mut process_a = std::process::Command::new(assert_cmd::cargo::cargo_bin("robocurse"))
        .args(["--config", config_path.to_str().unwrap(), "--profile", "Contended"])
        .spawn()
        .unwrap();

    thread::sleep(Duration::from_millis(150));

    robocurse()
        .args(["--config", config_path.to_str().unwrap(), "--profile", "Contended"])
        .assert()
        .failure()
        .stderr(contains("locked by another process"));

    let status_a = process_a.wait().unwrap();
    assert!(status_a.success(), "first process should complete successfully: {status_a:?}");
}
