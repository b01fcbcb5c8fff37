//! Giver-side SOCKS5 session machine (RFC 1928, CONNECT only, NO AUTH)
//! plus the legacy per-channel text frames.
//!
//! The machine is byte-in/action-out: it parses whatever the proxy data
//! channel delivers and tells the owning session loop what to do (reply to
//! the client, open a forwarding socket, relay payload bytes). It owns no
//! sockets and does no I/O, which keeps one session's state confined to its
//! event loop.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0}")]
    Version(u8),
    #[error("session is no longer usable")]
    Closed,
}

/// Where the session is in the SOCKS5 exchange. Legacy channels skip the
/// method negotiation: their peer completed it before tunneling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksState {
    AwaitingAuths,
    AwaitingRequest,
    Connecting,
    Connected,
    Failed,
}

/// Instruction for the owning event loop.
#[derive(Debug, PartialEq, Eq)]
pub enum SocksAction {
    /// Send these bytes back toward the SOCKS client.
    Reply(Vec<u8>),
    /// Open a forwarding socket to this destination.
    Connect { host: String, port: u16 },
    /// Relay these bytes to the forwarding socket.
    Forward(Vec<u8>),
}

/// One SOCKS5 session, keyed `"<client_id>:<channel_label>"`, living exactly
/// as long as its proxy data channel.
#[derive(Debug)]
pub struct SocksSession {
    key: String,
    state: SocksState,
    buffer: Vec<u8>,
    /// Payloads that raced the forwarding connect; relayed once it lands.
    pending: Vec<Vec<u8>>,
}

impl SocksSession {
    pub fn new(key: String, legacy: bool) -> Self {
        let state = if legacy {
            SocksState::AwaitingRequest
        } else {
            SocksState::AwaitingAuths
        };
        Self {
            key,
            state,
            buffer: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SocksState {
        self.state
    }

    /// Feeds bytes received from the SOCKS client side of the tunnel.
    pub fn handle_data_from_socks_client(
        &mut self,
        bytes: &[u8],
    ) -> Result<Vec<SocksAction>, SocksError> {
        let mut actions = Vec::new();
        match self.state {
            SocksState::Connected => {
                actions.push(SocksAction::Forward(bytes.to_vec()));
                return Ok(actions);
            }
            SocksState::Connecting => {
                self.pending.push(bytes.to_vec());
                return Ok(actions);
            }
            SocksState::Failed => return Err(SocksError::Closed),
            SocksState::AwaitingAuths | SocksState::AwaitingRequest => {}
        }

        self.buffer.extend_from_slice(bytes);
        loop {
            match self.state {
                SocksState::AwaitingAuths => {
                    if !self.drive_auths(&mut actions)? {
                        break;
                    }
                }
                SocksState::AwaitingRequest => {
                    self.drive_request(&mut actions)?;
                    break;
                }
                _ => break,
            }
        }
        Ok(actions)
    }

    fn drive_auths(&mut self, actions: &mut Vec<SocksAction>) -> Result<bool, SocksError> {
        if self.buffer.len() < 2 {
            return Ok(false);
        }
        let version = self.buffer[0];
        if version != SOCKS_VERSION {
            self.state = SocksState::Failed;
            return Err(SocksError::Version(version));
        }
        let nmethods = self.buffer[1] as usize;
        if self.buffer.len() < 2 + nmethods {
            return Ok(false);
        }
        let methods = &self.buffer[2..2 + nmethods];
        if !methods.contains(&AUTH_NONE) {
            self.state = SocksState::Failed;
            actions.push(SocksAction::Reply(vec![SOCKS_VERSION, AUTH_NO_ACCEPTABLE]));
            return Ok(false);
        }
        self.buffer.drain(..2 + nmethods);
        self.state = SocksState::AwaitingRequest;
        actions.push(SocksAction::Reply(vec![SOCKS_VERSION, AUTH_NONE]));
        Ok(true)
    }

    fn drive_request(&mut self, actions: &mut Vec<SocksAction>) -> Result<(), SocksError> {
        if self.buffer.len() < 4 {
            return Ok(());
        }
        let version = self.buffer[0];
        if version != SOCKS_VERSION {
            self.state = SocksState::Failed;
            return Err(SocksError::Version(version));
        }
        if self.buffer[1] != CMD_CONNECT {
            self.state = SocksState::Failed;
            actions.push(SocksAction::Reply(error_reply(REPLY_COMMAND_NOT_SUPPORTED)));
            self.buffer.clear();
            return Ok(());
        }

        let (host, consumed) = match self.buffer[3] {
            ATYP_IPV4 => {
                if self.buffer.len() < 10 {
                    return Ok(());
                }
                let octets: [u8; 4] = self.buffer[4..8].try_into().unwrap_or_default();
                (Ipv4Addr::from(octets).to_string(), 10)
            }
            ATYP_DOMAIN => {
                if self.buffer.len() < 5 {
                    return Ok(());
                }
                let len = self.buffer[4] as usize;
                if self.buffer.len() < 5 + len + 2 {
                    return Ok(());
                }
                match String::from_utf8(self.buffer[5..5 + len].to_vec()) {
                    Ok(domain) => (domain, 5 + len + 2),
                    Err(_) => {
                        self.state = SocksState::Failed;
                        actions.push(SocksAction::Reply(error_reply(REPLY_GENERAL_FAILURE)));
                        self.buffer.clear();
                        return Ok(());
                    }
                }
            }
            ATYP_IPV6 => {
                if self.buffer.len() < 22 {
                    return Ok(());
                }
                let octets: [u8; 16] = self.buffer[4..20].try_into().unwrap_or_default();
                (Ipv6Addr::from(octets).to_string(), 22)
            }
            _ => {
                self.state = SocksState::Failed;
                actions.push(SocksAction::Reply(error_reply(REPLY_ATYP_NOT_SUPPORTED)));
                self.buffer.clear();
                return Ok(());
            }
        };

        let port = u16::from_be_bytes([self.buffer[consumed - 2], self.buffer[consumed - 1]]);
        self.buffer.drain(..consumed);
        self.state = SocksState::Connecting;
        // Anything the client pipelined behind the request waits for the
        // forwarding socket.
        if !self.buffer.is_empty() {
            self.pending.push(std::mem::take(&mut self.buffer));
        }
        actions.push(SocksAction::Connect { host, port });
        Ok(())
    }

    /// The forwarding socket connected; reply success and flush anything the
    /// client sent in the meantime.
    pub fn on_forward_connected(&mut self) -> Vec<SocksAction> {
        self.state = SocksState::Connected;
        let mut actions = vec![SocksAction::Reply(success_reply())];
        actions.extend(self.pending.drain(..).map(SocksAction::Forward));
        actions
    }

    pub fn on_forward_failed(&mut self, reply_code: u8) -> Vec<SocksAction> {
        self.state = SocksState::Failed;
        self.pending.clear();
        vec![SocksAction::Reply(error_reply(reply_code))]
    }
}

pub fn success_reply() -> Vec<u8> {
    error_reply(REPLY_SUCCEEDED)
}

fn error_reply(code: u8) -> Vec<u8> {
    vec![SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// Legacy per-channel text frame: either a pool-control message or a
/// JSON-encoded SOCKS request.
#[derive(Debug, Default, Deserialize)]
pub struct LegacyFrame {
    #[serde(default)]
    pub control: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

pub fn parse_legacy_frame(text: &str) -> Result<LegacyFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// SOCKS request as legacy peers encode it inside `.data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyRequest {
    pub host: String,
    pub port: u16,
}

/// `.data` arrives either as an object or as a stringified object.
pub fn request_from_value(value: &Value) -> Result<LegacyRequest, serde_json::Error> {
    match value {
        Value::String(text) => serde_json::from_str(text),
        other => serde_json::from_value(other.clone()),
    }
}

/// Re-serializes a legacy request as the binary RFC 1928 CONNECT frame the
/// session machine expects.
pub fn encode_request(request: &LegacyRequest) -> Vec<u8> {
    // The domain length field is a single byte.
    let host = &request.host.as_bytes()[..request.host.len().min(255)];
    let mut frame = vec![
        SOCKS_VERSION,
        CMD_CONNECT,
        0x00,
        ATYP_DOMAIN,
        host.len() as u8,
    ];
    frame.extend_from_slice(host);
    frame.extend_from_slice(&request.port.to_be_bytes());
    frame
}

/// First-packet SOCKS response, re-framed as text for legacy peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyResponse {
    pub version: u8,
    pub reply: u8,
    pub host: String,
    pub port: u16,
}

/// Parses a binary SOCKS reply so it can be stringified for a legacy peer.
pub fn decode_response(bytes: &[u8]) -> Option<LegacyResponse> {
    if bytes.len() < 10 || bytes[0] != SOCKS_VERSION || bytes[3] != ATYP_IPV4 {
        return None;
    }
    let octets: [u8; 4] = bytes[4..8].try_into().ok()?;
    Some(LegacyResponse {
        version: bytes[0],
        reply: bytes[1],
        host: Ipv4Addr::from(octets).to_string(),
        port: u16::from_be_bytes([bytes[8], bytes[9]]),
    })
}

/// Wraps the stringified response in the `{data:…}` text frame legacy peers
/// expect for the first packet of every session.
pub fn legacy_data_frame(response: &LegacyResponse) -> String {
    let inner = serde_json::to_string(response).unwrap_or_default();
    serde_json::json!({ "data": inner }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_request(host: &str, port: u16) -> Vec<u8> {
        encode_request(&LegacyRequest {
            host: host.to_string(),
            port,
        })
    }

    #[test]
    fn full_handshake_reaches_connecting() {
        let mut session = SocksSession::new("zc0:s1".to_string(), false);
        assert_eq!(session.state(), SocksState::AwaitingAuths);

        let actions = session
            .handle_data_from_socks_client(&[0x05, 0x01, 0x00])
            .unwrap();
        assert_eq!(actions, vec![SocksAction::Reply(vec![0x05, 0x00])]);
        assert_eq!(session.state(), SocksState::AwaitingRequest);

        let actions = session
            .handle_data_from_socks_client(&connect_request("example.com", 443))
            .unwrap();
        assert_eq!(
            actions,
            vec![SocksAction::Connect {
                host: "example.com".to_string(),
                port: 443
            }]
        );
        assert_eq!(session.state(), SocksState::Connecting);
    }

    #[test]
    fn greeting_and_request_may_share_a_packet() {
        let mut session = SocksSession::new("zc0:s1".to_string(), false);
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&connect_request("example.com", 80));

        let actions = session.handle_data_from_socks_client(&bytes).unwrap();
        assert_eq!(
            actions,
            vec![
                SocksAction::Reply(vec![0x05, 0x00]),
                SocksAction::Connect {
                    host: "example.com".to_string(),
                    port: 80
                },
            ]
        );
    }

    #[test]
    fn partial_request_waits_for_more_bytes() {
        let mut session = SocksSession::new("zc0:s1".to_string(), true);
        let request = connect_request("example.com", 80);

        let actions = session
            .handle_data_from_socks_client(&request[..6])
            .unwrap();
        assert!(actions.is_empty());
        let actions = session
            .handle_data_from_socks_client(&request[6..])
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], SocksAction::Connect { .. }));
    }

    #[test]
    fn ipv4_request_parses_dotted_quad() {
        let mut session = SocksSession::new("zc0:s1".to_string(), true);
        let bytes = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90];
        let actions = session.handle_data_from_socks_client(&bytes).unwrap();
        assert_eq!(
            actions,
            vec![SocksAction::Connect {
                host: "127.0.0.1".to_string(),
                port: 8080
            }]
        );
    }

    #[test]
    fn non_connect_command_is_rejected() {
        let mut session = SocksSession::new("zc0:s1".to_string(), true);
        // BIND
        let bytes = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        let actions = session.handle_data_from_socks_client(&bytes).unwrap();
        assert_eq!(
            actions,
            vec![SocksAction::Reply(error_reply(
                REPLY_COMMAND_NOT_SUPPORTED
            ))]
        );
        assert_eq!(session.state(), SocksState::Failed);
    }

    #[test]
    fn unknown_address_type_is_rejected() {
        let mut session = SocksSession::new("zc0:s1".to_string(), true);
        let bytes = [0x05, 0x01, 0x00, 0x09, 0, 0, 0, 0, 0, 0];
        let actions = session.handle_data_from_socks_client(&bytes).unwrap();
        assert_eq!(
            actions,
            vec![SocksAction::Reply(error_reply(REPLY_ATYP_NOT_SUPPORTED))]
        );
    }

    #[test]
    fn no_acceptable_auth_method_fails_the_session() {
        let mut session = SocksSession::new("zc0:s1".to_string(), false);
        let actions = session
            .handle_data_from_socks_client(&[0x05, 0x01, 0x02])
            .unwrap();
        assert_eq!(actions, vec![SocksAction::Reply(vec![0x05, 0xFF])]);
        assert_eq!(session.state(), SocksState::Failed);
    }

    #[test]
    fn payload_during_connect_is_flushed_after_success() {
        let mut session = SocksSession::new("zc0:s1".to_string(), true);
        session
            .handle_data_from_socks_client(&connect_request("example.com", 80))
            .unwrap();

        assert!(session
            .handle_data_from_socks_client(b"GET / HTTP/1.0\r\n")
            .unwrap()
            .is_empty());

        let actions = session.on_forward_connected();
        assert_eq!(
            actions,
            vec![
                SocksAction::Reply(success_reply()),
                SocksAction::Forward(b"GET / HTTP/1.0\r\n".to_vec()),
            ]
        );
        assert_eq!(session.state(), SocksState::Connected);

        let actions = session.handle_data_from_socks_client(b"more").unwrap();
        assert_eq!(actions, vec![SocksAction::Forward(b"more".to_vec())]);
    }

    #[test]
    fn connect_failure_replies_with_the_given_code() {
        let mut session = SocksSession::new("zc0:s1".to_string(), true);
        session
            .handle_data_from_socks_client(&connect_request("example.com", 80))
            .unwrap();
        let actions = session.on_forward_failed(REPLY_CONNECTION_REFUSED);
        assert_eq!(
            actions,
            vec![SocksAction::Reply(error_reply(REPLY_CONNECTION_REFUSED))]
        );
        assert!(session.handle_data_from_socks_client(b"x").is_err());
    }

    #[test]
    fn legacy_frame_variants_parse() {
        let open = parse_legacy_frame(r#"{"control":"OPEN"}"#).unwrap();
        assert_eq!(open.control.as_deref(), Some("OPEN"));

        let data = parse_legacy_frame(r#"{"data":{"host":"example.com","port":80}}"#).unwrap();
        let request = request_from_value(&data.data.unwrap()).unwrap();
        assert_eq!(
            request,
            LegacyRequest {
                host: "example.com".to_string(),
                port: 80
            }
        );
    }

    #[test]
    fn stringified_legacy_request_parses() {
        let frame =
            parse_legacy_frame(r#"{"data":"{\"host\":\"example.com\",\"port\":443}"}"#).unwrap();
        let request = request_from_value(&frame.data.unwrap()).unwrap();
        assert_eq!(request.port, 443);
    }

    #[test]
    fn response_round_trips_into_the_legacy_data_frame() {
        let response = decode_response(&success_reply()).unwrap();
        assert_eq!(response.reply, REPLY_SUCCEEDED);
        assert_eq!(response.host, "0.0.0.0");

        let frame = legacy_data_frame(&response);
        let value: Value = serde_json::from_str(&frame).unwrap();
        let inner: LegacyResponse =
            serde_json::from_str(value["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner, response);
    }
}
