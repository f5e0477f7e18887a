#![cfg(windows)]

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use prochost::{
    launch, live_resource_count, CancellationEvent, Error, LaunchDescriptor, TIMEOUT_EXIT_CODE,
};

const CMD: &str = "C:\\Windows\\System32\\cmd.exe";

// Launch tests share the process-wide live-handle counter, so they run one
// at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    match SERIAL.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn capture(command: &str) -> LaunchDescriptor {
    LaunchDescriptor::builder(CMD)
        .arg("/c")
        .arg(command)
        .hide_window(true)
        .redirect_output(true)
        .merge_streams(true)
        .build()
        .unwrap()
}

#[test]
fn captures_stdout_lines_in_order() {
    let _guard = serial();
    let descriptor = capture("echo A&&echo B");
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");
    let result = handle.wait().unwrap();

    assert_eq!(result.exit_code(), Some(0));
    assert!(!result.timed_out());
    assert_eq!(result.stdout(), ["A", "B"]);
    assert!(result.stderr().is_empty());
    assert_eq!(result.interleaved(), ["A", "B"]);
}

#[test]
fn stderr_is_kept_separate_and_merged_chronologically() {
    let _guard = serial();
    let descriptor = capture("echo OUT&&echo ERR 1>&2");
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");
    let result = handle.wait().unwrap();

    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.stdout(), ["OUT"]);
    assert_eq!(result.stderr(), ["ERR"]);
    // Cross-stream ordering depends on pipe scheduling; membership does not.
    assert_eq!(result.interleaved().len(), 2);
    assert!(result.interleaved().contains(&"OUT".to_string()));
    assert!(result.interleaved().contains(&"ERR".to_string()));
}

#[test]
fn cancellation_kills_the_tree_with_the_sentinel_code() {
    let _guard = serial();
    let cancel = CancellationEvent::new().unwrap();
    // The sleeper would run for roughly three seconds on its own.
    let descriptor = LaunchDescriptor::builder(CMD)
        .arg("/c")
        .arg("ping -n 4 127.0.0.1 >NUL")
        .hide_window(true)
        .redirect_output(true)
        .cancellation(cancel.clone())
        .build()
        .unwrap();

    let started = Instant::now();
    cancel.cancel_after(Duration::from_millis(400));
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");
    let result = handle.wait().unwrap();

    assert_eq!(result.exit_code(), Some(TIMEOUT_EXIT_CODE));
    assert!(result.timed_out());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "kill took {:?}",
        started.elapsed()
    );
}

#[test]
fn wait_resolves_exactly_once() {
    let _guard = serial();
    let descriptor = capture("echo once");
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");

    let first = handle.wait();
    let second = handle.wait();
    assert_eq!(first, second);
    assert_eq!(first.unwrap().stdout(), ["once"]);
}

#[test]
fn disabled_termination_abandons_the_wait() {
    let _guard = serial();
    let cancel = CancellationEvent::new().unwrap();
    let descriptor = LaunchDescriptor::builder(CMD)
        .arg("/c")
        .arg("ping -n 3 127.0.0.1 >NUL")
        .hide_window(true)
        .terminate_on_timeout(false)
        .kill_tree_on_close(true)
        .cancellation(cancel.clone())
        .build()
        .unwrap();

    cancel.cancel_after(Duration::from_millis(300));
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");
    let started = Instant::now();
    let result = handle.wait().unwrap();

    assert_eq!(result.exit_code(), None);
    assert!(!result.timed_out());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn wait_for_children_outlives_the_direct_child() {
    let _guard = serial();
    // start /b detaches the sleeper from cmd; the job still tracks it.
    let descriptor = LaunchDescriptor::builder(CMD)
        .arg("/c")
        .arg("start /b ping -n 2 127.0.0.1 >NUL")
        .hide_window(true)
        .wait_for_children(true)
        .build()
        .unwrap();

    let started = Instant::now();
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");
    let result = handle.wait().unwrap();

    assert_eq!(result.exit_code(), Some(0));
    assert!(
        started.elapsed() >= Duration::from_millis(500),
        "resolved before the grandchild exited: {:?}",
        started.elapsed()
    );
}

#[test]
fn successful_launch_releases_every_resource() {
    let _guard = serial();
    let before = live_resource_count();

    let descriptor = capture("echo done");
    let handle = launch(&descriptor).unwrap().expect("a process to wait on");
    let result = handle.wait().unwrap();
    assert_eq!(result.exit_code(), Some(0));

    assert_eq!(live_resource_count(), before);
}

#[test]
fn failed_launch_releases_every_resource() {
    let _guard = serial();
    let before = live_resource_count();

    // Passes validation (absolute path), fails at process creation.
    let descriptor = LaunchDescriptor::builder("C:\\Windows\\System32\\prochost_missing_tool.exe")
        .redirect_output(true)
        .hide_window(true)
        .build()
        .unwrap();
    let err = launch(&descriptor).unwrap_err();
    assert!(err.is_launch_failure(), "{err:?}");
    assert!(matches!(err, Error::Launch { .. }));

    assert_eq!(live_resource_count(), before);
}
