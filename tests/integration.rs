//! Integration tests for lualink.
//!
//! These drive a full [`Session`] against the scripted mock transport:
//! connection retries, the transmission-size handshake, command round
//! trips, file uploads, and disconnect handling.
//!
//! Run with `RUST_LOG=lualink=trace` to see the session's tracing output.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lualink::connection::RetryPolicy;
use lualink::protocol::{
    BINARY_TAG, BREAK_SIGNAL, FILE_CLOSE_COMMAND, FILE_OPEN_PREFIX, FILE_OPEN_SUFFIX,
    FILE_WRITE_PREFIX, FILE_WRITE_SUFFIX, MTU_QUERY_COMMAND, RESET_SIGNAL,
};
use lualink::transport::{MockHandle, MockTransport};
use lualink::{DeviceSelector, LinkError, LinkState, Session, SessionConfig};

const SHORT: Duration = Duration::from_millis(200);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config(attempts: u32, retry_delay: Duration) -> SessionConfig {
    SessionConfig {
        retry: RetryPolicy::new(attempts, retry_delay),
        response_timeout: Duration::from_secs(2),
        settle_delay: Duration::from_millis(1),
    }
}

async fn open_session(mtu: usize) -> (Session<MockTransport>, MockHandle) {
    init_logging();
    let (transport, handle) = MockTransport::with_mtu("hub-01", mtu);
    let mut session = Session::with_config(transport, fast_config(1, SHORT));
    session
        .open(&DeviceSelector::Name("hub-01".into()))
        .await
        .expect("open failed");
    (session, handle)
}

/// Replies "1" to every file command, echoes binary writes as acks.
fn file_ok_responder(handle: &MockHandle) {
    handle.respond_with(|bytes| {
        if bytes.first() == Some(&BINARY_TAG) {
            return vec![Bytes::from_static(&[BINARY_TAG, 0x06])];
        }
        match std::str::from_utf8(bytes) {
            Ok(cmd)
                if cmd.starts_with(FILE_OPEN_PREFIX)
                    || cmd.starts_with(FILE_WRITE_PREFIX)
                    || cmd == FILE_CLOSE_COMMAND =>
            {
                vec![Bytes::from_static(b"1")]
            }
            _ => Vec::new(),
        }
    });
}

#[tokio::test]
async fn test_open_negotiates_transmission_ceiling() {
    let (session, handle) = open_session(128).await;

    assert_eq!(session.state(), LinkState::Ready);
    assert_eq!(session.max_payload(), 128);

    // break signal then handshake query, in order
    let writes = handle.writes();
    assert_eq!(writes[0], vec![BREAK_SIGNAL]);
    assert_eq!(writes[1], MTU_QUERY_COMMAND.as_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_open_retries_transient_failures_with_delay() {
    init_logging();
    let (transport, handle) = MockTransport::with_mtu("hub-01", 64);
    handle.fail_next_connect(LinkError::Connection("connection attempt failed".into()));
    handle.fail_next_connect(LinkError::Connection(
        "GATT operation failed for unknown reason".into(),
    ));

    let delay = Duration::from_millis(25);
    let mut session = Session::with_config(transport, fast_config(3, delay));

    let start = tokio::time::Instant::now();
    let device = session
        .open(&DeviceSelector::ServiceOnly)
        .await
        .expect("third attempt should succeed");

    assert_eq!(device, "hub-01");
    assert_eq!(handle.connect_attempts(), 3);
    // exactly two retry delays on the virtual clock (plus the settle delay)
    assert!(start.elapsed() >= delay * 2);
    assert!(start.elapsed() < delay * 3);
}

#[tokio::test]
async fn test_open_aborts_on_non_matching_error_without_retry() {
    init_logging();
    let (transport, handle) = MockTransport::with_mtu("hub-01", 64);
    handle.fail_next_connect(LinkError::Connection("bonding rejected by peer".into()));

    let mut session = Session::with_config(transport, fast_config(5, Duration::from_millis(5)));
    let err = session
        .open(&DeviceSelector::ServiceOnly)
        .await
        .expect_err("fatal error must not be retried");

    assert!(matches!(err, LinkError::Connection(_)));
    assert_eq!(handle.connect_attempts(), 1);
    assert_eq!(session.state(), LinkState::Idle);
    // exhausted open leaves no held peripheral
    assert!(!handle.holds_device());
}

#[tokio::test]
async fn test_open_fails_on_selection_error_immediately() {
    init_logging();
    let (transport, handle) = MockTransport::with_mtu("other-device", 64);
    let mut session = Session::with_config(transport, fast_config(5, Duration::from_millis(5)));

    let err = session
        .open(&DeviceSelector::Name("hub-01".into()))
        .await
        .expect_err("selector matches nothing");

    assert!(matches!(err, LinkError::SelectionFailed(_)));
    assert_eq!(handle.connect_attempts(), 1);
}

#[tokio::test]
async fn test_handshake_rejects_non_numeric_response() {
    init_logging();
    let (transport, handle) = MockTransport::new("hub-01");
    handle.respond_with(|bytes| {
        if bytes == MTU_QUERY_COMMAND.as_bytes() {
            vec![Bytes::from_static(b"not a number")]
        } else {
            Vec::new()
        }
    });

    let mut session = Session::with_config(transport, fast_config(1, SHORT));
    let err = session
        .open(&DeviceSelector::ServiceOnly)
        .await
        .expect_err("handshake must fail");
    assert!(matches!(err, LinkError::Protocol(_)));
    assert_eq!(session.state(), LinkState::Idle);
}

#[tokio::test]
async fn test_handshake_rejects_zero_transmission_size() {
    init_logging();
    let (transport, handle) = MockTransport::with_mtu("hub-01", 0);
    let _ = handle;
    let mut session = Session::with_config(transport, fast_config(1, SHORT));
    let err = session.open(&DeviceSelector::ServiceOnly).await.unwrap_err();
    assert!(matches!(err, LinkError::Protocol(_)));
}

#[tokio::test]
async fn test_execute_returns_interpreter_output() {
    let (mut session, handle) = open_session(64).await;
    handle.respond_with(|bytes| {
        if bytes == b"print('hi')" {
            vec![Bytes::from_static(b"hi")]
        } else {
            Vec::new()
        }
    });

    let reply = session.execute("print('hi')", SHORT).await.unwrap();
    assert_eq!(reply, "hi");
}

#[tokio::test]
async fn test_execute_times_out_and_leaves_channel_free() {
    let (mut session, handle) = open_session(64).await;
    // responder stays silent for the first command
    handle.respond_with(|bytes| {
        if bytes == b"print(2)" {
            vec![Bytes::from_static(b"2")]
        } else {
            Vec::new()
        }
    });

    let err = session
        .execute("print(1)", Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Timeout));

    // no stuck waiter: the next awaited call works
    let reply = session.execute("print(2)", SHORT).await.unwrap();
    assert_eq!(reply, "2");
}

#[tokio::test]
async fn test_oversized_command_fails_fast_without_transmission() {
    let (mut session, handle) = open_session(16).await;
    let writes_before = handle.writes().len();

    let long_command = "print('aaaaaaaaaaaaaaaaaaaaaaaa')";
    let err = session.execute(long_command, SHORT).await.unwrap_err();

    assert!(matches!(err, LinkError::PayloadTooLarge { .. }));
    assert_eq!(handle.writes().len(), writes_before, "nothing was sent");
}

#[tokio::test]
async fn test_send_payload_prefixes_binary_tag() {
    let (mut session, handle) = open_session(64).await;
    handle.respond_with(|bytes| {
        if bytes.first() == Some(&BINARY_TAG) {
            vec![Bytes::from_static(&[BINARY_TAG, 0xAB])]
        } else {
            Vec::new()
        }
    });

    let ack = session.send_payload(&[1, 2, 3], SHORT).await.unwrap();
    assert_eq!(&ack[..], &[0xAB]);

    let last = handle.writes().pop().unwrap();
    assert_eq!(last, vec![BINARY_TAG, 1, 2, 3]);
}

#[tokio::test]
async fn test_send_payload_respects_reduced_binary_ceiling() {
    let (mut session, _handle) = open_session(8).await;
    // ceiling is max - 1 because of the tag byte
    let err = session.send_payload(&[0u8; 8], SHORT).await.unwrap_err();
    assert!(matches!(err, LinkError::PayloadTooLarge { max: 7, size: 8 }));
}

#[tokio::test]
async fn test_send_large_payload_sends_acknowledged_chunks_in_order() {
    let (mut session, handle) = open_session(8).await; // first cap 4, rest cap 6
    handle.respond_with(|bytes| {
        if bytes.first() == Some(&BINARY_TAG) {
            vec![Bytes::from_static(&[BINARY_TAG])]
        } else {
            Vec::new()
        }
    });

    let payload: Vec<u8> = (0..10).collect();
    session.send_large_payload(9, &payload, SHORT).await.unwrap();

    let writes = handle.writes();
    let binary_writes: Vec<_> = writes
        .iter()
        .filter(|w| w.first() == Some(&BINARY_TAG))
        .collect();
    assert_eq!(binary_writes.len(), 2);
    // first chunk: tag, code, 2-byte total, 4 payload bytes
    assert_eq!(binary_writes[0].as_slice(), &[BINARY_TAG, 9, 0, 10, 0, 1, 2, 3]);
    // second chunk: tag, code, remaining 6 bytes
    assert_eq!(binary_writes[1].as_slice(), &[BINARY_TAG, 9, 4, 5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn test_send_large_payload_rejects_tiny_negotiated_ceiling() {
    let (mut session, _handle) = open_session(4).await;
    let err = session
        .send_large_payload(5, &[0u8; 10], SHORT)
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Configuration(_)));
}

#[tokio::test]
async fn test_break_and_reset_are_single_unawaited_bytes() {
    let (mut session, handle) = open_session(64).await;
    let before = handle.writes().len();

    session.send_break().await.unwrap();
    session.send_reset().await.unwrap();

    let writes = handle.writes();
    assert_eq!(writes[before], vec![BREAK_SIGNAL]);
    assert_eq!(writes[before + 1], vec![RESET_SIGNAL]);
}

#[tokio::test]
async fn test_write_remote_file_issues_open_write_close_in_order() {
    let (mut session, handle) = open_session(64).await;
    file_ok_responder(&handle);
    let before = handle.writes().len();

    session
        .write_remote_file("hello\nworld", "x.lua")
        .await
        .unwrap();

    let writes = handle.writes()[before..].to_vec();
    let commands: Vec<String> = writes
        .iter()
        .map(|w| String::from_utf8(w.clone()).unwrap())
        .collect();

    assert_eq!(commands.len(), 3, "open, one write, close");
    assert_eq!(
        commands[0],
        format!("{FILE_OPEN_PREFIX}x.lua{FILE_OPEN_SUFFIX}")
    );
    assert_eq!(
        commands[1],
        format!("{FILE_WRITE_PREFIX}hello\\nworld{FILE_WRITE_SUFFIX}")
    );
    assert_eq!(commands[2], FILE_CLOSE_COMMAND);
}

#[tokio::test]
async fn test_write_remote_file_chunks_large_content() {
    let (mut session, handle) = open_session(48).await;
    file_ok_responder(&handle);
    let before = handle.writes().len();

    let content = "abcdefghij".repeat(10);
    session.write_remote_file(&content, "big.lua").await.unwrap();

    let commands: Vec<String> = handle.writes()[before..]
        .iter()
        .map(|w| String::from_utf8(w.clone()).unwrap())
        .collect();

    assert!(commands.len() > 3, "content must span several writes");
    // every write command stays under the negotiated ceiling
    for cmd in &commands {
        assert!(cmd.len() <= 48);
    }
    // reassembling the chunk bodies yields the original content
    let body: String = commands[1..commands.len() - 1]
        .iter()
        .map(|cmd| {
            cmd.strip_prefix(FILE_WRITE_PREFIX)
                .unwrap()
                .strip_suffix(FILE_WRITE_SUFFIX)
                .unwrap()
        })
        .collect();
    assert_eq!(body, content);
}

#[tokio::test]
async fn test_write_remote_file_closes_handle_after_rejected_chunk() {
    let (mut session, handle) = open_session(64).await;
    handle.respond_with(|bytes| match std::str::from_utf8(bytes) {
        Ok(cmd) if cmd.starts_with(FILE_OPEN_PREFIX) => vec![Bytes::from_static(b"1")],
        Ok(cmd) if cmd.starts_with(FILE_WRITE_PREFIX) => vec![Bytes::from_static(b"0")],
        Ok(cmd) if cmd == FILE_CLOSE_COMMAND => vec![Bytes::from_static(b"1")],
        _ => Vec::new(),
    });

    let err = session
        .write_remote_file("content", "f.lua")
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::RemoteWrite(_)));

    let last = handle.writes().pop().unwrap();
    assert_eq!(last, FILE_CLOSE_COMMAND.as_bytes());
}

#[tokio::test]
async fn test_write_remote_file_fails_when_open_is_refused() {
    let (mut session, handle) = open_session(64).await;
    handle.respond_with(|bytes| match std::str::from_utf8(bytes) {
        Ok(cmd) if cmd.starts_with(FILE_OPEN_PREFIX) => vec![Bytes::from_static(b"0")],
        _ => Vec::new(),
    });

    let err = session
        .write_remote_file("content", "f.lua")
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::RemoteWrite(_)));
}

#[tokio::test]
async fn test_observers_see_unsolicited_notifications() {
    let (session, handle) = open_session(64).await;

    let texts = Arc::new(AtomicUsize::new(0));
    let binaries = Arc::new(AtomicUsize::new(0));

    let counter = texts.clone();
    session.set_text_observer(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let counter = binaries.clone();
    session.set_binary_observer(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    handle.push_notification(Bytes::from_static(b"printed line")).await;
    handle
        .push_notification(Bytes::from_static(&[BINARY_TAG, 1, 2]))
        .await;

    // give the pump a moment to dispatch
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(texts.load(Ordering::SeqCst), 1);
    assert_eq!(binaries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_external_disconnect_fails_pending_waiter_and_notifies() {
    let (mut session, handle) = open_session(64).await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    session.set_disconnect_observer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let dropper = handle.clone();
    let (result, ()) = tokio::join!(
        session.execute("print('never answered')", Duration::from_secs(5)),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            dropper.trigger_disconnect().await;
        }
    );

    assert!(matches!(result, Err(LinkError::Disconnected)));
    assert_eq!(session.state(), LinkState::Idle);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_requested_close_drives_the_same_disconnect_path() {
    let (mut session, _handle) = open_session(64).await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    session.set_disconnect_observer(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.close().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.state(), LinkState::Idle);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reopen_after_close_reuses_the_held_peripheral() {
    let (mut session, handle) = open_session(64).await;

    session.close().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(handle.connect_attempts(), 1);
    assert!(handle.holds_device());

    // reconnect-same-device: selection is skipped
    session
        .open(&DeviceSelector::Name("hub-01".into()))
        .await
        .unwrap();
    assert_eq!(handle.connect_attempts(), 1);
    assert_eq!(session.state(), LinkState::Ready);
}

#[tokio::test]
async fn test_commands_require_an_open_session() {
    init_logging();
    let (transport, _handle) = MockTransport::with_mtu("hub-01", 64);
    let mut session = Session::new(transport);

    assert!(session.execute("print(1)", SHORT).await.is_err());
    assert!(session.send_payload(&[1], SHORT).await.is_err());
    assert!(session
        .write_remote_file("content", "f.lua")
        .await
        .is_err());
}
