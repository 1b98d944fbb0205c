//! Connection handshake: state trace, version negotiation, shared-memory
//! gating, authentication failure.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;
use pulsenative::{Command, ConnectFlags, ContextState, ErrorCode, Mainloop, PROTOCOL_VERSION};

#[test]
fn happy_path_walks_all_states() {
    let server = StubServer::start(StubConfig::default());
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    let trace: Rc<RefCell<Vec<ContextState>>> = Rc::new(RefCell::new(Vec::new()));
    let trace2 = Rc::clone(&trace);
    ctx.set_state_callback(Some(Box::new(move |c| {
        trace2.borrow_mut().push(c.state());
    })));

    ctx.connect(
        Some(&server.server_string()),
        ConnectFlags::NOAUTOSPAWN,
        None,
    )
    .expect("connect");
    wait_for(&ml, "READY", || ctx.state() == ContextState::Ready);

    assert_eq!(
        *trace.borrow(),
        vec![
            ContextState::Connecting,
            ContextState::Authorizing,
            ContextState::SettingName,
            ContextState::Ready,
        ]
    );
    assert_eq!(ctx.protocol_version(), PROTOCOL_VERSION);
    assert_eq!(ctx.server_protocol_version().expect("version"), 30);
    assert!(ctx.is_local().expect("locality"));
    assert!(ctx.shm_negotiated());
    assert_eq!(ctx.index().expect("client index"), 7);
    assert_eq!(ctx.errno(), ErrorCode::Ok);
}

#[test]
fn server_version_7_is_rejected_before_naming() {
    let server = StubServer::start(StubConfig {
        version_word: 7,
        ..StubConfig::default()
    });
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    ctx.connect(
        Some(&server.server_string()),
        ConnectFlags::NOAUTOSPAWN,
        None,
    )
    .expect("connect");
    wait_for(&ml, "FAILED", || ctx.state() == ContextState::Failed);

    assert_eq!(ctx.errno(), ErrorCode::Version);
    assert!(!server.saw_command(Command::SetClientName));
}

#[test]
fn server_version_12_never_gets_shm_even_with_bit() {
    let server = StubServer::start(StubConfig {
        version_word: 12 | SHM_BIT,
        ..StubConfig::default()
    });
    let ml = Mainloop::new();
    let ctx = connect_ready(&ml, &server);

    assert_eq!(ctx.server_protocol_version().expect("version"), 12);
    assert!(!ctx.shm_negotiated());
    // Pre-13 peers have no client index to give out.
    assert_eq!(ctx.index(), Err(ErrorCode::NotSupported));
}

#[test]
fn server_version_13_without_bit_gets_no_shm() {
    let server = StubServer::start(StubConfig {
        version_word: 13,
        ..StubConfig::default()
    });
    let ml = Mainloop::new();
    let ctx = connect_ready(&ml, &server);

    assert_eq!(ctx.server_protocol_version().expect("version"), 13);
    assert!(!ctx.shm_negotiated());
    assert_eq!(ctx.index().expect("client index"), 7);
}

#[test]
fn auth_error_fails_with_server_code() {
    let server = StubServer::start(StubConfig {
        auth_error: Some(ErrorCode::AuthKey.to_wire()),
        ..StubConfig::default()
    });
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    ctx.connect(
        Some(&server.server_string()),
        ConnectFlags::NOAUTOSPAWN,
        None,
    )
    .expect("connect");
    wait_for(&ml, "FAILED", || ctx.state() == ContextState::Failed);

    assert_eq!(ctx.errno(), ErrorCode::AuthKey);
    assert!(!server.saw_command(Command::SetClientName));
}

#[test]
fn server_string_tag_prefix_is_stripped() {
    let server = StubServer::start(StubConfig::default());
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    let tagged = format!("{{0123abcd}}{}", server.server_string());
    ctx.connect(Some(&tagged), ConnectFlags::NOAUTOSPAWN, None)
        .expect("connect");
    wait_for(&ml, "READY", || ctx.state() == ContextState::Ready);

    assert_eq!(ctx.server().expect("server"), server.server_string());
}

#[test]
fn terminal_failure_is_absorbing() {
    let server = StubServer::start(StubConfig {
        version_word: 7,
        ..StubConfig::default()
    });
    let ml = Mainloop::new();
    let ctx = new_context(&ml);

    ctx.connect(
        Some(&server.server_string()),
        ConnectFlags::NOAUTOSPAWN,
        None,
    )
    .expect("connect");
    wait_for(&ml, "FAILED", || ctx.state() == ContextState::Failed);

    // No call moves a failed context anywhere else.
    assert_eq!(
        ctx.connect(Some("unix:/tmp/x"), ConnectFlags::NONE, None),
        Err(ErrorCode::BadState)
    );
    ctx.disconnect();
    assert_eq!(ctx.state(), ContextState::Failed);
}
