//! Autospawn: the daemon binary is forked at most once when the
//! candidate list runs dry, then the per-user sockets are retried.
//!
//! Mutates process environment variables, so it lives alone in its own
//! binary.

mod common;

use std::os::unix::fs::PermissionsExt;

use common::*;
use pulsenative::{ConnectFlags, Context, ContextState, ErrorCode, Mainloop, Proplist};

/// These tests rewrite `PULSE_RUNTIME_PATH`; they must not interleave.
static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}

#[test]
fn autospawn_runs_the_daemon_binary_once() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = dir.path().join("pulse");
    unsafe {
        std::env::set_var("PULSE_RUNTIME_PATH", &runtime);
        std::env::remove_var("PULSE_SERVER");
        std::env::remove_var("DISPLAY");
    }

    // The starter records its argument vector and "succeeds" without
    // bringing up a daemon, so the retried candidates fail again.
    let marker = dir.path().join("marker");
    let starter = write_script(
        dir.path(),
        "starter-ok",
        &format!("#!/bin/sh\necho \"$@\" >> {}\nexit 0\n", marker.display()),
    );

    let ml = Mainloop::new();
    let mut conf = test_config();
    conf.autospawn = true;
    conf.daemon_binary = starter;
    conf.extra_arguments = Some("--log-target=file:/dev/null".to_string());
    let ctx = Context::new_with_config(&ml, Some("spawned"), Proplist::new(), conf)
        .expect("context");

    ctx.connect(None, ConnectFlags::NONE, None)
        .expect_err("no daemon appears even after the spawn");
    assert_eq!(ctx.state(), ContextState::Failed);
    assert_eq!(ctx.errno(), ErrorCode::ConnectionRefused);

    let recorded = std::fs::read_to_string(&marker).expect("starter ran");
    // Spawned exactly once, with --start plus the configured extras.
    assert_eq!(recorded.lines().count(), 1);
    assert!(recorded.starts_with("--start "));
    assert!(recorded.contains("--log-target=file:/dev/null"));
}

#[test]
fn failing_starter_refuses_the_connection() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = dir.path().join("pulse2");
    unsafe {
        std::env::set_var("PULSE_RUNTIME_PATH", &runtime);
        std::env::remove_var("PULSE_SERVER");
    }

    let starter = write_script(dir.path(), "starter-bad", "#!/bin/sh\nexit 3\n");

    let ml = Mainloop::new();
    let mut conf = test_config();
    conf.autospawn = true;
    conf.daemon_binary = starter;
    conf.extra_arguments = None;
    let ctx = Context::new_with_config(&ml, Some("spawned"), Proplist::new(), conf)
        .expect("context");

    ctx.connect(None, ConnectFlags::NONE, None)
        .expect_err("starter exit status fails the attempt");
    assert_eq!(ctx.errno(), ErrorCode::ConnectionRefused);
}

#[test]
fn spawn_hooks_run_around_the_fork() {
    let _env = ENV_LOCK.lock().expect("env lock");
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = dir.path().join("pulse3");
    unsafe {
        std::env::set_var("PULSE_RUNTIME_PATH", &runtime);
        std::env::remove_var("PULSE_SERVER");
    }

    let starter = write_script(dir.path(), "starter-hooks", "#!/bin/sh\nexit 0\n");

    let ml = Mainloop::new();
    let mut conf = test_config();
    conf.autospawn = true;
    conf.daemon_binary = starter;
    conf.extra_arguments = None;
    let ctx = Context::new_with_config(&ml, Some("spawned"), Proplist::new(), conf)
        .expect("context");

    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let (o1, o2) = (std::rc::Rc::clone(&order), std::rc::Rc::clone(&order));
    let api = pulsenative::SpawnApi {
        prefork: Some(Box::new(move || o1.borrow_mut().push("prefork"))),
        atfork: None,
        postfork: Some(Box::new(move || o2.borrow_mut().push("postfork"))),
        close_from: None,
    };

    let _ = ctx.connect(None, ConnectFlags::NONE, Some(api));
    assert_eq!(*order.borrow(), vec!["prefork", "postfork"]);
}
