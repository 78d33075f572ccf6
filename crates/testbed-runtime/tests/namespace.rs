//! Tests against a real bubblewrap sandbox.
//!
//! These tests are `#[ignore]` by default because they require:
//! - Linux with unprivileged user namespace support
//! - `bwrap` and `nsenter` installed
//!
//! Run with: `cargo test -p testbed-runtime --test namespace -- --ignored`

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use testbed_runtime::{
    check_namespace_prereqs, format_missing, Environment, EnvironmentGuard, Invocation,
    NamespaceBackend, ProcessState, RuntimeError, Workspace,
};
use testbed_schema::{MountMode, MountSpec, NamespaceSection};

fn prereqs_available() -> bool {
    let missing = check_namespace_prereqs("bwrap");
    if !missing.is_empty() {
        let msg = format_missing(&missing);
        assert!(
            std::env::var("CI").is_err(),
            "CI FATAL: sandbox prerequisites missing, tests cannot silently skip in CI.\n{msg}"
        );
        eprintln!("skipping sandbox tests: {msg}");
        return false;
    }
    true
}

fn section(sysroot: &Path) -> NamespaceSection {
    for dir in ["tmp", "proc", "dev", "etc", "opt/app"] {
        fs::create_dir_all(sysroot.join(dir)).unwrap();
    }
    NamespaceSection {
        sysroot: sysroot.to_path_buf(),
        tool: "bwrap".to_owned(),
        host_system_dirs: true,
        persistent: None,
        artifacts: None,
        device_passthrough: true,
        anchor_command: vec!["sleep".to_owned(), "infinity".to_owned()],
        mounts: Vec::new(),
        env: [("ECU_VARIANT".to_owned(), "b2".to_owned())].into(),
        run_under: None,
    }
}

fn sandbox(config: NamespaceSection) -> EnvironmentGuard<NamespaceBackend> {
    let workspace = Workspace::resolve(None).unwrap();
    EnvironmentGuard::acquire(NamespaceBackend::new(
        config,
        workspace,
        Duration::from_secs(2),
    ))
    .unwrap()
}

fn install_script(sysroot: &Path, guest: &str, body: &str) {
    let host = sysroot.join(guest.trim_start_matches('/'));
    fs::write(&host, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&host, fs::Permissions::from_mode(0o755)).unwrap();
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn runs_inside_pid_namespace() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    install_script(sysroot.path(), "/opt/app/whoami", "echo pid=$$; echo variant=$ECU_VARIANT");
    let mut env = sandbox(section(sysroot.path()));

    let handle = env.execute(Invocation::new("/opt/app/whoami")).unwrap();
    assert_eq!(env.wait(&handle, Duration::from_secs(10)), Some(0));
    let out = handle.stdout_lossy();
    assert!(out.contains("variant=b2"), "{out}");
    let pid: u32 = out
        .lines()
        .find_map(|l| l.strip_prefix("pid="))
        .unwrap()
        .parse()
        .unwrap();
    assert!(pid < 100, "expected a small namespace pid, got {pid}");
    assert!(env.root_pid().is_some());
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn echo_matches_direct_backend() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let mut env = sandbox(section(sysroot.path()));
    let handle = env.execute(Invocation::new("/bin/echo").arg("hello")).unwrap();
    assert_eq!(env.wait(&handle, Duration::from_secs(10)), Some(0));
    assert_eq!(handle.stdout(), b"hello\n");
    assert_eq!(handle.state(), ProcessState::Exited);
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn workspace_is_visible_at_tmp() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let mut env = sandbox(section(sysroot.path()));

    let handle = env
        .execute(Invocation::new("/bin/sh").args(["-c", "echo report > /tmp/result.txt"]))
        .unwrap();
    assert_eq!(env.wait(&handle, Duration::from_secs(10)), Some(0));
    let written = fs::read_to_string(env.workspace_root().join("result.txt")).unwrap();
    assert_eq!(written, "report\n");
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn missing_binary_is_execution_error() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let mut env = sandbox(section(sysroot.path()));
    let err = env
        .execute(Invocation::new("/opt/app/not-installed"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Execution(_)));
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn stop_terminates_process_inside() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let mut env = sandbox(section(sysroot.path()));
    let handle = env.execute(Invocation::new("/bin/sleep").arg("60")).unwrap();
    assert!(env.is_process_running(&handle));

    let code = env.stop_process(&handle, Duration::from_secs(2)).unwrap();
    assert_ne!(code, 0);
    assert_ne!(handle.state(), ProcessState::Running);
    assert_eq!(env.stop_process(&handle, Duration::from_secs(2)).unwrap(), code);
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn stop_reaches_children_of_term_ignoring_shell() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let mut env = sandbox(section(sysroot.path()));
    let handle = env
        .execute(Invocation::new("/bin/sh").args(["-c", "trap '' TERM; sleep 61"]))
        .unwrap();

    let started = Instant::now();
    let code = env.stop_process(&handle, Duration::from_secs(1)).unwrap();
    assert_ne!(code, 0);
    assert_eq!(handle.state(), ProcessState::Killed);
    assert!(started.elapsed() < Duration::from_secs(6));

    let check = env
        .execute(Invocation::new("/bin/sh").args([
            "-c",
            "cat /proc/[0-9]*/cmdline 2>/dev/null | tr '\\0' ' ' | grep -c 'sleep 6[1]' || true",
        ]))
        .unwrap();
    assert_eq!(env.wait(&check, Duration::from_secs(10)), Some(0));
    assert_eq!(check.stdout_lossy().trim(), "0");
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn sandbox_defaults_and_artifacts_are_visible() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let mut config = section(sysroot.path());
    config.artifacts = Some(artifacts.path().to_path_buf());
    let mut env = sandbox(config);

    let handle = env
        .execute(Invocation::new("/bin/sh").args([
            "-c",
            "echo $SCTF $TEST_PREMATURE_EXIT_FILE; echo kept > /tmp/artifacts/run.log; test -e /dev/null",
        ]))
        .unwrap();
    assert_eq!(env.wait(&handle, Duration::from_secs(10)), Some(0));
    assert_eq!(
        handle.stdout_lossy(),
        "SCTF /tmp/gtest.exited_prematurely\n"
    );
    assert_eq!(
        fs::read_to_string(artifacts.path().join("run.log")).unwrap(),
        "kept\n"
    );
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn read_only_mount_rejects_copy_in() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let calib = tempfile::tempdir().unwrap();
    fs::write(calib.path().join("table.bin"), [1u8, 2, 3]).unwrap();
    let mut config = section(sysroot.path());
    config
        .mounts
        .push(MountSpec::new(calib.path(), "/etc/calib", MountMode::ReadOnly));
    let env = sandbox(config);

    let out = tempfile::tempdir().unwrap();
    env.copy_from(Path::new("/etc/calib/table.bin"), &out.path().join("t.bin"))
        .unwrap();
    assert_eq!(fs::read(out.path().join("t.bin")).unwrap(), [1u8, 2, 3]);

    let err = env
        .copy_to(&out.path().join("t.bin"), Path::new("/etc/calib/new.bin"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Transfer(_)));
}

#[test]
#[ignore = "requires Linux user namespaces, bwrap and nsenter"]
fn teardown_kills_sandbox() {
    if !prereqs_available() {
        return;
    }
    let sysroot = tempfile::tempdir().unwrap();
    let mut env = sandbox(section(sysroot.path()));
    let root = env.root_pid().unwrap();
    let handle = env.execute(Invocation::new("/bin/sleep").arg("60")).unwrap();

    let report = env.finish();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert!(!handle.is_running());
    let deadline = Instant::now() + Duration::from_secs(5);
    while sandbox_alive(root) {
        assert!(Instant::now() < deadline, "sandbox pid {root} survived teardown");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn sandbox_alive(pid: u32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let rest = &stat[stat.rfind(')')? + 1..];
            rest.split_whitespace().next().map(|state| state != "Z")
        })
        .unwrap_or(false)
}
