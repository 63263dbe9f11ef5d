//! End-to-end supervision scenarios against stock system binaries.
//! These run the tracer core directly (no namespace bootstrap) so they work
//! without extra privileges.

mod common;

use std::fs;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::{Duration, Instant};

use corral::tracer::{self, kill};
use corral::{RunnerError, Violation};
use nix::unistd::Pid;

#[test]
fn true_exits_cleanly() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["-x", "/bin/true"]);
    let verdict = tracer::run(&cfg, None).unwrap();

    assert_eq!(verdict.exit_code, 0);
    assert!(verdict.error.is_none());
}

#[test]
fn exit_code_is_propagated_with_x() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["-x", "/bin/false"]);
    let verdict = tracer::run(&cfg, None).unwrap();
    assert_eq!(verdict.exit_code, 1);
    assert!(verdict.error.is_none());
}

#[test]
fn exit_code_is_swallowed_without_x() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["/bin/false"]);
    let verdict = tracer::run(&cfg, None).unwrap();
    assert_eq!(verdict.exit_code, 0);
}

#[test]
fn real_time_limit_kills_a_sleeping_tracee() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["-t", "500ms", "-x", "/bin/sleep", "60"]);
    let started = Instant::now();
    let verdict = tracer::run(&cfg, None).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(verdict.exit_code, 2);
    assert!(matches!(
        verdict.error,
        Some(RunnerError::Violation(Violation::RealTime))
    ));
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);
}

#[test]
fn process_creation_is_forbidden_by_default() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["-x", "/bin/sh", "-c", "/bin/true"]);
    let verdict = tracer::run(&cfg, None).unwrap();

    assert_eq!(verdict.exit_code, 6);
    assert!(matches!(
        verdict.error,
        Some(RunnerError::Violation(Violation::ProcessCreation))
    ));
}

#[test]
fn process_creation_can_be_allowed() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&[
        "--allow-create-processes",
        "-x",
        "/bin/sh",
        "-c",
        "/bin/true",
    ]);
    let verdict = tracer::run(&cfg, None).unwrap();

    assert_eq!(verdict.exit_code, 0);
    assert!(verdict.error.is_none());
}

#[test]
fn rusage_memory_ceiling_fires_in_band() {
    common::init();
    let _guard = common::tracer_lock();

    // Any fresh process already holds more than a kilobyte of RSS, so the
    // very first rusage check trips.
    let cfg = common::config(&["-m", "1024", "-x", "/bin/true"]);
    let verdict = tracer::run(&cfg, None).unwrap();

    assert_eq!(verdict.exit_code, 3);
    assert!(matches!(
        verdict.error,
        Some(RunnerError::Violation(Violation::Memory))
    ));
}

#[test]
fn cpu_time_limit_stops_a_busy_loop() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&[
        "--cpu-time-limit",
        "300ms",
        "-x",
        "/bin/sh",
        "-c",
        "while :; do :; done",
    ]);
    let started = Instant::now();
    let verdict = tracer::run(&cfg, None).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(verdict.exit_code, 4);
    assert!(matches!(
        verdict.error,
        Some(RunnerError::Violation(Violation::CpuTime))
    ));
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
}

#[test]
fn idle_tracee_hits_the_idle_limit() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["-y", "1s", "-r", "90%", "-x", "/bin/sleep", "30"]);
    let started = Instant::now();
    let verdict = tracer::run(&cfg, None).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(verdict.exit_code, 5);
    assert!(matches!(
        verdict.error,
        Some(RunnerError::Violation(Violation::Idle))
    ));
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
}

#[test]
fn statistics_rows_are_written_while_supervising() {
    common::init();
    let _guard = common::tracer_lock();

    let dir = tempfile::tempdir().unwrap();
    let csv = dir.path().join("stats.csv");

    let cfg = common::config(&[
        "-s",
        csv.to_str().unwrap(),
        "-x",
        "/bin/sleep",
        "2",
    ]);
    let verdict = tracer::run(&cfg, None).unwrap();
    assert_eq!(verdict.exit_code, 0);

    let content = fs::read_to_string(&csv).unwrap();
    assert!(!content.is_empty());
    for row in content.lines() {
        assert_eq!(row.matches(',').count(), 2, "bad row: {:?}", row);
    }
}

#[test]
fn stdout_redirection_captures_tracee_output() {
    common::init();
    let _guard = common::tracer_lock();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");

    let cfg = common::config(&[
        "-o",
        out.to_str().unwrap(),
        "-x",
        "/bin/sh",
        "-c",
        "echo hello",
    ]);
    let verdict = tracer::run(&cfg, None).unwrap();
    assert_eq!(verdict.exit_code, 0);

    assert_eq!(fs::read_to_string(&out).unwrap(), "hello\n");
}

#[test]
fn environment_overrides_reach_the_tracee() {
    common::init();
    let _guard = common::tracer_lock();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("env.txt");

    let cfg = common::config(&[
        "-D",
        "CORRAL_PROBE=42",
        "-o",
        out.to_str().unwrap(),
        "-x",
        "/bin/sh",
        "-c",
        "echo $CORRAL_PROBE",
    ]);
    let verdict = tracer::run(&cfg, None).unwrap();
    assert_eq!(verdict.exit_code, 0);

    assert_eq!(fs::read_to_string(&out).unwrap(), "42\n");
}

#[test]
fn launch_failures_are_reported_before_tracing() {
    common::init();
    let _guard = common::tracer_lock();

    let cfg = common::config(&["/nonexistent/corral-test-binary"]);
    let err = tracer::run(&cfg, None).unwrap_err();
    assert!(err.to_string().contains("failed to launch"), "{:#}", err);
}

#[test]
fn group_termination_is_idempotent() {
    common::init();
    let _guard = common::tracer_lock();

    // The victim gets its own process group so the group kill cannot reach
    // the test harness itself.
    let mut cmd = Command::new("/bin/sleep");
    cmd.arg("30");
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = cmd.spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    kill::terminate(pid, pid);
    kill::terminate(pid, pid);

    // killed and eventually reaped: nothing in the group stays runnable
    let deadline = Instant::now() + Duration::from_secs(5);
    while nix::sys::signal::kill(pid, None).is_ok() {
        assert!(Instant::now() < deadline, "victim survived the group kill");
        std::thread::sleep(Duration::from_millis(10));
        kill::terminate(pid, pid);
    }
}
