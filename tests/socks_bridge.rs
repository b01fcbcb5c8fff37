//! Giver-side data plane: SOCKS session machine driving a real forwarding
//! socket against live local listeners.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use zorkd::forward::{ForwardEvent, ForwardingSocket};
use zorkd::socks::{self, LegacyRequest, SocksAction, SocksSession, SocksState};

async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    port
}

#[tokio::test]
async fn socks_session_relays_through_a_forwarding_socket() {
    let port = spawn_echo_server().await;

    let mut session = SocksSession::new("zc0:s1".to_string(), false);
    let actions = session
        .handle_data_from_socks_client(&[0x05, 0x01, 0x00])
        .unwrap();
    assert_eq!(actions, vec![SocksAction::Reply(vec![0x05, 0x00])]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    let actions = session.handle_data_from_socks_client(&request).unwrap();
    let SocksAction::Connect { host, port } = &actions[0] else {
        panic!("expected connect action, got {actions:?}");
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut socket = ForwardingSocket::connect(host, *port, move |event| {
        let _ = tx.send(event);
    })
    .await
    .unwrap();

    let actions = session.on_forward_connected();
    assert_eq!(actions, vec![SocksAction::Reply(socks::success_reply())]);
    assert_eq!(session.state(), SocksState::Connected);

    let actions = session.handle_data_from_socks_client(b"round trip").unwrap();
    let SocksAction::Forward(data) = &actions[0] else {
        panic!("expected forward action, got {actions:?}");
    };
    socket.write(data).await.unwrap();

    match timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(ForwardEvent::Data(data))) => assert_eq!(data, b"round trip"),
        other => panic!("expected echoed data, got {other:?}"),
    }
}

#[tokio::test]
async fn pipelined_payload_is_flushed_once_the_socket_connects() {
    let port = spawn_echo_server().await;

    let mut session = SocksSession::new("zc0:s2".to_string(), true);
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(b"early bytes");

    let actions = session.handle_data_from_socks_client(&request).unwrap();
    let SocksAction::Connect { host, port } = &actions[0] else {
        panic!("expected connect action, got {actions:?}");
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut socket = ForwardingSocket::connect(host, *port, move |event| {
        let _ = tx.send(event);
    })
    .await
    .unwrap();

    let actions = session.on_forward_connected();
    assert_eq!(actions[0], SocksAction::Reply(socks::success_reply()));
    let SocksAction::Forward(data) = &actions[1] else {
        panic!("expected flushed payload, got {actions:?}");
    };
    socket.write(data).await.unwrap();

    match timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(ForwardEvent::Data(data))) => assert_eq!(data, b"early bytes"),
        other => panic!("expected echoed data, got {other:?}"),
    }
}

#[tokio::test]
async fn refused_connect_maps_to_a_socks_error_reply() {
    // Bind then drop so the port is (almost certainly) dead.
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let err = ForwardingSocket::connect("127.0.0.1", port, |_| {})
        .await
        .expect_err("connect should fail");
    let code = match err.kind() {
        std::io::ErrorKind::ConnectionRefused => socks::REPLY_CONNECTION_REFUSED,
        _ => socks::REPLY_HOST_UNREACHABLE,
    };

    let mut session = SocksSession::new("zc0:s3".to_string(), true);
    session
        .handle_data_from_socks_client(&socks::encode_request(&LegacyRequest {
            host: "127.0.0.1".to_string(),
            port,
        }))
        .unwrap();
    let actions = session.on_forward_failed(code);
    let SocksAction::Reply(reply) = &actions[0] else {
        panic!("expected reply action, got {actions:?}");
    };
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], code);
}

#[test]
fn legacy_frames_drive_the_session_machine() {
    let frame = socks::parse_legacy_frame(r#"{"data":{"host":"127.0.0.1","port":80}}"#).unwrap();
    let request = socks::request_from_value(&frame.data.unwrap()).unwrap();

    // Legacy channels skip method negotiation entirely.
    let mut session = SocksSession::new("zc1:pool-3".to_string(), true);
    assert_eq!(session.state(), SocksState::AwaitingRequest);
    let actions = session
        .handle_data_from_socks_client(&socks::encode_request(&request))
        .unwrap();
    assert_eq!(
        actions,
        vec![SocksAction::Connect {
            host: "127.0.0.1".to_string(),
            port: 80
        }]
    );

    // The first packet back is the response, re-framed as a text message.
    let reply_actions = session.on_forward_connected();
    let SocksAction::Reply(bytes) = &reply_actions[0] else {
        panic!("expected reply action, got {reply_actions:?}");
    };
    let response = socks::decode_response(bytes).unwrap();
    assert_eq!(response.reply, socks::REPLY_SUCCEEDED);
    let text = socks::legacy_data_frame(&response);
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    let inner = value["data"].as_str().expect("stringified response");
    assert!(inner.contains("\"reply\":0"));
}
