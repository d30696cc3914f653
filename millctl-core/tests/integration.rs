//! Integration tests — full connection lifecycle against scripted
//! relay and proxy peers on localhost, including reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use millctl_core::{
    Axis, ClientOptions, ControlClient, MillClient, MillError, ReconnectPolicy,
    ReconnectStatus, ReconnectSupervisor, wire,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ── Helpers ──────────────────────────────────────────────────────

async fn ephemeral_listener() -> (TcpListener, String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr.ip().to_string(), addr.port())
}

/// Accept one connection and run the relay side of the handshake:
/// send a 4-digit descriptor, then read back the auth token and the
/// padded channel id. The client starts writing the instant it is
/// ready, so anything past the reply is returned for the caller to
/// process.
async fn relay_accept(listener: &TcpListener, expect_reply: &[u8]) -> (TcpStream, Vec<u8>) {
    let (mut sock, _) = listener.accept().await.unwrap();
    sock.write_all(b"4-ignored").await.unwrap();

    let mut got: Vec<u8> = Vec::new();
    let mut buf = [0u8; 64];
    while got.len() < expect_reply.len() {
        let n = sock.read(&mut buf).await.unwrap();
        assert!(n > 0, "peer closed mid-handshake");
        got.extend_from_slice(&buf[..n]);
    }
    let extra = got.split_off(expect_reply.len());
    assert_eq!(&got, expect_reply);
    (sock, extra)
}

/// Read from `sock` until `expected` appears in the accumulated
/// non-ping bytes, consuming through the end of the match. `carry`
/// holds bytes left over from the handshake or a previous call; ping
/// requests are timer-driven and may interleave with command bytes,
/// so they are filtered out.
async fn read_command(sock: &mut TcpStream, carry: &mut Vec<u8>, expected: &[u8]) {
    let mut buf = [0u8; 64];
    loop {
        if let Some(pos) = carry.windows(expected.len()).position(|w| w == expected) {
            carry.drain(..pos + expected.len());
            return;
        }
        let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
            .await
            .expect("timed out waiting for command")
            .unwrap();
        assert!(n > 0, "peer closed while waiting for command");
        carry.extend(buf[..n].iter().filter(|&&b| b != wire::PING_REQUEST));
    }
}

/// Seed a command carry buffer from handshake leftovers.
fn command_carry(extra: Vec<u8>) -> Vec<u8> {
    extra
        .into_iter()
        .filter(|&b| b != wire::PING_REQUEST)
        .collect()
}

async fn wait_until_ready(client: &ControlClient) {
    let mut status = client.status_watch();
    loop {
        {
            let s = status.borrow_and_update();
            if s.active && s.ready {
                return;
            }
        }
        tokio::time::timeout(Duration::from_secs(5), status.changed())
            .await
            .expect("timed out waiting for ready")
            .unwrap();
    }
}

// ── Relay handshake ──────────────────────────────────────────────

#[tokio::test]
async fn handshake_replies_auth_then_padded_channel() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move { relay_accept(&listener, b"hi0000").await });

    let client = MillClient::new(ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL)));
    client.connect().await.unwrap();
    assert!(client.is_connection_ready());

    let _sock = server.await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn video_channel_pads_to_descriptor_width() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move { relay_accept(&listener, b"hi0001").await });

    let client = MillClient::new(ClientOptions::new(host, port, Some(wire::VIDEO_CHANNEL)));
    client.connect().await.unwrap();

    let _sock = server.await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn garbage_descriptor_fails_handshake() {
    let (listener, host, port) = ephemeral_listener().await;

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(b"no separator here").await.unwrap();
        // Hold the socket open; the client must fail on its own.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let client = MillClient::new(ClientOptions::new(host, port, Some(0)));
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, MillError::RelayHandshakeFailed(_)));
    assert!(!client.is_connection_active());
    assert!(client.close_reason().is_some());
}

// ── Proxy tunneling ──────────────────────────────────────────────

#[tokio::test]
async fn proxy_connect_then_relay_handshake() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        // Proxy leg: read the CONNECT request up to the blank line.
        let mut req = Vec::new();
        let mut buf = [0u8; 256];
        while !req.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = sock.read(&mut buf).await.unwrap();
            req.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("CONNECT localhost:7000 HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Connection: Keep-Alive"));

        sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();

        // Relay leg.
        sock.write_all(b"4-ignored").await.unwrap();
        let mut got = Vec::new();
        while got.len() < 6 {
            let n = sock.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&got, b"hi0000");
        sock
    });

    let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL))
        .with_proxy(true)
        .with_internal_port(7000);
    let client = MillClient::new(options);
    client.connect().await.unwrap();
    assert!(client.is_connection_ready());

    let _sock = server.await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn proxy_refusal_fails_before_relay_handshake() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = sock.read(&mut buf).await.unwrap();
        sock.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await.unwrap();

        // The relay handshake must never start: no auth bytes arrive.
        let n = tokio::time::timeout(Duration::from_millis(300), sock.read(&mut buf)).await;
        matches!(n, Ok(Ok(0)) | Err(_))
    });

    let options = ClientOptions::new(host, port, Some(0)).with_proxy(true);
    let client = MillClient::new(options);
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, MillError::ProxyNegotiationFailed(_)));
    assert!(!client.is_connection_ready());
    assert!(server.await.unwrap());
}

// ── Control channel ──────────────────────────────────────────────

#[tokio::test]
async fn ping_answered_by_peer_marks_mill_accessible() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, extra) = relay_accept(&listener, b"hi0000").await;
        // Answer every ping, including any that coalesced into the
        // handshake read.
        for &b in &extra {
            if b == wire::PING_REQUEST {
                sock.write_all(&[wire::PING_RESPONSE]).await.unwrap();
            }
        }
        let mut buf = [0u8; 16];
        loop {
            let n = match sock.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for &b in &buf[..n] {
                if b == wire::PING_REQUEST
                    && sock.write_all(&[wire::PING_RESPONSE]).await.is_err()
                {
                    return;
                }
            }
        }
    });

    let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL));
    let client = ControlClient::with_options(options, Duration::from_millis(50));
    client.connect().await.unwrap();

    let mut accessible = client.subscribe_accessibility();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !*accessible.borrow_and_update() {
            accessible.changed().await.unwrap();
        }
    })
    .await
    .expect("mill never became accessible");
    assert!(client.is_mill_accessible());

    client.disconnect().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn peer_ping_request_elicits_one_pong() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, _extra) = relay_accept(&listener, b"hi0000").await;
        sock.write_all(&[wire::PING_REQUEST]).await.unwrap();

        // Exactly one pong within the window; the client's own pings
        // may interleave.
        let mut pongs = 0usize;
        let mut buf = [0u8; 16];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
        loop {
            tokio::select! {
                n = sock.read(&mut buf) => {
                    let n = match n { Ok(0) | Err(_) => break, Ok(n) => n };
                    pongs += buf[..n].iter().filter(|&&b| b == wire::PING_RESPONSE).count();
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        pongs
    });

    let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL));
    let client = ControlClient::with_options(options, Duration::from_secs(60));
    client.connect().await.unwrap();

    assert_eq!(server.await.unwrap(), 1);
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn commands_reach_the_wire_in_order() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, extra) = relay_accept(&listener, b"hi0000").await;
        let mut carry = command_carry(extra);
        read_command(&mut sock, &mut carry, &[wire::AXIS, 2]).await;
        read_command(&mut sock, &mut carry, &[wire::SPEED, 10]).await;
        read_command(&mut sock, &mut carry, &[wire::JOG, 1]).await;
        read_command(&mut sock, &mut carry, &[wire::STOP]).await;
    });

    let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL));
    let client = ControlClient::with_options(options, Duration::from_secs(60));
    client.connect().await.unwrap();
    wait_until_ready(&client).await;

    client.set_axis(Axis::Z).await.unwrap();
    client.set_speed(10).await.unwrap();
    client.jog_mill(42).await.unwrap(); // any positive magnitude is +1
    client.stop_mill().await.unwrap();

    server.await.unwrap();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_sends_no_further_pings() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        let (mut sock, extra) = relay_accept(&listener, b"hi0000").await;

        // With a long interval the only ping is the one fired at
        // activation; collect it, whether coalesced or not.
        let mut pings = extra
            .iter()
            .filter(|&&b| b == wire::PING_REQUEST)
            .count();
        let mut buf = [0u8; 16];
        while pings == 0 {
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed before the activation ping");
            pings += buf[..n].iter().filter(|&&b| b == wire::PING_REQUEST).count();
        }

        // Everything from here to EOF must be ping-free: the monitor
        // is halted before the transport is torn down.
        let mut tail = 0usize;
        loop {
            let n = match sock.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            tail += buf[..n].iter().filter(|&&b| b == wire::PING_REQUEST).count();
        }
        tail
    });

    let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL));
    let client = ControlClient::with_options(options, Duration::from_secs(60));
    client.connect().await.unwrap();

    // Give the activation ping time to hit the wire, then close.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.disconnect().await.unwrap();

    assert_eq!(server.await.unwrap(), 0, "ping sent during teardown");
}

// ── Reconnection ─────────────────────────────────────────────────

#[tokio::test]
async fn unexpected_close_triggers_reconnect_and_speed_restore() {
    let (listener, host, port) = ephemeral_listener().await;

    let server = tokio::spawn(async move {
        // First connection: handshake, take a speed command, drop.
        let (mut sock, extra) = relay_accept(&listener, b"hi0000").await;
        let mut carry = command_carry(extra);
        read_command(&mut sock, &mut carry, &[wire::SPEED, 7]).await;
        drop(sock);

        // The supervisor reconnects; the speed must be replayed.
        let (mut sock, extra) = relay_accept(&listener, b"hi0000").await;
        let mut carry = command_carry(extra);
        read_command(&mut sock, &mut carry, &[wire::SPEED, 7]).await;
        sock
    });

    let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL));
    let client = ControlClient::with_options(options, Duration::from_secs(60));
    let supervisor = ReconnectSupervisor::spawn(
        client.connection(),
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
        },
    );

    client.connect().await.unwrap();
    wait_until_ready(&client).await;
    client.set_speed(7).await.unwrap();

    // The server task only completes if the reconnect and the replay
    // both happened.
    let _sock = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("reconnect or speed restore never happened")
        .unwrap();

    supervisor.shutdown();
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn cancelled_episode_stops_retrying() {
    let (listener, host, port) = ephemeral_listener().await;
    let accepts = Arc::new(AtomicUsize::new(0));

    let server = {
        let accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            // One good connection, then the port goes dead.
            let (sock, _extra) = relay_accept(&listener, b"hi0000").await;
            accepts.fetch_add(1, Ordering::SeqCst);
            drop(sock);
            drop(listener);
        })
    };

    let client = Arc::new(MillClient::new(ClientOptions::new(host, port, Some(0))));
    let supervisor = ReconnectSupervisor::spawn(
        Arc::clone(&client),
        ReconnectPolicy {
            base_delay: Duration::from_millis(5),
        },
    );

    client.connect().await.unwrap();
    server.await.unwrap();

    // Wait until the episode has failed a few attempts.
    let mut status = supervisor.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ReconnectStatus::Trying { try_count, .. } = *status.borrow_and_update() {
                if try_count >= 3 {
                    break;
                }
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("episode never reached three attempts");

    supervisor.cancel_episode();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *status.borrow_and_update() != ReconnectStatus::Idle {
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("episode never went idle after cancellation");

    // No new episode without a new unexpected close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(supervisor.status(), ReconnectStatus::Idle);
    assert!(!client.is_connection_active());
}

#[tokio::test]
async fn backoff_delays_double_between_attempts() {
    // Dead port: bind then drop so connects are refused quickly.
    let (listener, host, port) = ephemeral_listener().await;
    drop(listener);

    let client = Arc::new(MillClient::new(ClientOptions::new(host, port, Some(0))));
    // Simulate an unexpected close so the supervisor opens an episode.
    client.state().reset_for_connect(false);
    client.state().transport_down(false, "test-induced loss");

    let supervisor = ReconnectSupervisor::spawn(
        Arc::clone(&client),
        ReconnectPolicy {
            base_delay: Duration::from_millis(10),
        },
    );

    // Observe the advertised delays climbing: 10, 20, 40, ... The
    // watch may coalesce intermediate values, so only require that
    // every observed delay is the base times a power of two and that
    // the sequence strictly increases.
    let mut status = supervisor.subscribe();
    let mut last_delay = Duration::ZERO;
    let mut seen = 0usize;
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen < 3 {
            if let ReconnectStatus::Trying { next_delay, .. } = *status.borrow_and_update() {
                if next_delay > last_delay {
                    let ratio = next_delay.as_millis() / 10;
                    assert_eq!(next_delay.as_millis() % 10, 0);
                    assert!(ratio.is_power_of_two(), "delay {next_delay:?}");
                    last_delay = next_delay;
                    seen += 1;
                }
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("never observed three doubling delays");

    supervisor.shutdown();
}

// ── Disconnect semantics ─────────────────────────────────────────

#[tokio::test]
async fn requested_disconnect_is_not_unexpected() {
    let (listener, host, port) = ephemeral_listener().await;
    let server = tokio::spawn(async move { relay_accept(&listener, b"hi0000").await });

    let client = MillClient::new(ClientOptions::new(host, port, Some(0)));
    client.connect().await.unwrap();
    let _sock = server.await.unwrap();

    client.disconnect().await.unwrap();
    assert!(!client.is_connection_active());
    assert!(!client.is_unexpected_close());

    // Idempotent.
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn server_drop_is_recorded_as_unexpected() {
    let (listener, host, port) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (sock, _extra) = relay_accept(&listener, b"hi0000").await;
        drop(sock);
    });

    let client = MillClient::new(ClientOptions::new(host, port, Some(0)));
    client.connect().await.unwrap();
    server.await.unwrap();

    let mut status = client.status_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        while status.borrow_and_update().active {
            status.changed().await.unwrap();
        }
    })
    .await
    .expect("close never observed");

    assert!(client.is_unexpected_close());
    assert!(client.close_reason().is_some());
}
