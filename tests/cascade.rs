//! Candidate cascade: fallback across dead endpoints, exhaustion, and
//! input validation.

mod common;

use common::*;
use pulsenative::{ConnectFlags, ContextState, ErrorCode, Mainloop};

#[test]
fn missing_sockets_fall_through_to_live_one() {
    let server = StubServer::start(StubConfig::default());
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    let list = format!(
        "unix:/nonexistent/a unix:/nonexistent/b {}",
        server.server_string()
    );
    ctx.connect(Some(&list), ConnectFlags::NOAUTOSPAWN, None)
        .expect("connect");
    wait_for(&ml, "READY", || ctx.state() == ContextState::Ready);

    assert_eq!(ctx.server().expect("server"), server.server_string());
}

#[test]
fn refused_tcp_falls_through_to_unix() {
    // Grab a loopback port nothing listens on.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = probe.local_addr().expect("addr").port();
    drop(probe);

    let server = StubServer::start(StubConfig::default());
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    let list = format!("tcp4:127.0.0.1:{port} {}", server.server_string());
    ctx.connect(Some(&list), ConnectFlags::NOAUTOSPAWN, None)
        .expect("connect");
    wait_for(&ml, "READY", || ctx.state() == ContextState::Ready);

    assert!(ctx.is_local().expect("locality"));
}

#[test]
fn exhausted_list_fails_with_connection_refused() {
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    ctx.connect(
        Some("unix:/nonexistent/a unix:/nonexistent/b"),
        ConnectFlags::NOAUTOSPAWN,
        None,
    )
    .expect_err("no candidate can answer");
    assert_eq!(ctx.state(), ContextState::Failed);
    assert_eq!(ctx.errno(), ErrorCode::ConnectionRefused);
}

#[test]
fn default_server_from_config_counts_as_specified() {
    let ml = Mainloop::new();
    let mut conf = test_config();
    conf.default_server = Some("unix:/nonexistent/configured".to_string());
    let ctx = pulsenative::Context::new_with_config(
        &ml,
        Some("stub-tests"),
        pulsenative::Proplist::new(),
        conf,
    )
    .expect("context");

    // NOFAIL does not apply to explicitly configured servers; the
    // exhausted list fails immediately.
    ctx.connect(None, ConnectFlags::NOAUTOSPAWN | ConnectFlags::NOFAIL, None)
        .expect_err("configured server is down");
    assert_eq!(ctx.state(), ContextState::Failed);
    assert_eq!(ctx.errno(), ErrorCode::ConnectionRefused);
}

#[test]
fn empty_server_string_is_invalid() {
    let ml = Mainloop::new();
    let ctx = new_context(&ml);
    assert_eq!(
        ctx.connect(Some(""), ConnectFlags::NONE, None),
        Err(ErrorCode::Invalid)
    );
    assert_eq!(ctx.state(), ContextState::Unconnected);
}

#[test]
fn whitespace_server_string_is_invalid_server() {
    let ml = Mainloop::new();
    let ctx = new_context(&ml);
    assert_eq!(
        ctx.connect(Some("   "), ConnectFlags::NONE, None),
        Err(ErrorCode::InvalidServer)
    );
    assert_eq!(ctx.state(), ContextState::Failed);
}

#[test]
fn second_connect_is_bad_state() {
    let server = StubServer::start(StubConfig::default());
    let ml = Mainloop::new();
    let ctx = connect_ready(&ml, &server);

    assert_eq!(
        ctx.connect(Some(&server.server_string()), ConnectFlags::NONE, None),
        Err(ErrorCode::BadState)
    );
    assert_eq!(ctx.state(), ContextState::Ready);
}
