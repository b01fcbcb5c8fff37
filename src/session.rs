//! Per-connection session state machine and data-plane bridge.
//!
//! One Zork control connection gets one session. Every callback the WebRTC
//! stack or a forwarding socket fires is converted into a [`SessionEvent`]
//! and consumed by a single event-loop task, so all per-session state lives
//! on one logical executor and mode guards never race.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::command::{self, Command};
use crate::forward::{self, ForwardEvent, ForwardingSocket};
use crate::framing::LineFramer;
use crate::heartbeat::{self, HeartbeatMonitor, HEARTBEAT_LABEL, HEARTBEAT_PAYLOAD};
use crate::peer::{self, PendingIce};
use crate::registry::Registry;
use crate::signaling::{self, CandidatePayload, SdpPayload, SignalIn};
use crate::socks::{self, SocksAction, SocksSession, SocksState};

/// Runtime knobs shared by every session.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Port the first getter's local SOCKS listener binds; later getters
    /// bind an ephemeral one.
    pub socks_port: u16,
}

/// Mode latch. Transitions at most once and never back to `Unset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Mode {
    #[default]
    Unset,
    Give,
    Get,
}

/// Stashed `transform` configuration. Recorded, never consumed.
#[derive(Debug, Default)]
struct TransformerConfig {
    name: Option<String>,
    raw: Option<String>,
}

enum SessionEvent {
    LocalCandidate(CandidatePayload),
    RemoteChannelOpen(Arc<RTCDataChannel>),
    ChannelMessage {
        label: String,
        data: Vec<u8>,
        is_string: bool,
    },
    ChannelClosed {
        label: String,
    },
    HeartbeatChannelOpen,
    SocksAccepted(TcpStream),
    Forward {
        label: String,
        event: ForwardEvent,
    },
    ForwardConnected {
        label: String,
        socket: ForwardingSocket,
    },
    ForwardFailed {
        label: String,
        error: io::Error,
    },
    PeerState(RTCPeerConnectionState),
}

/// Giver-side bridge state for one proxy data channel.
struct ProxyChannel {
    channel: Arc<RTCDataChannel>,
    socks: SocksSession,
    forward: Option<ForwardingSocket>,
    drain_active: Arc<AtomicBool>,
    sent_first_packet: bool,
}

/// Runs one Zork session to completion. `stream` is the control transport;
/// tests drive this with an in-memory duplex instead of a TCP socket.
pub async fn run<S>(stream: S, registry: Arc<Registry>, config: BrokerConfig)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let client_id = registry.next_client_id();
    info!(target: "session", client_id, "zork client connected");

    let (reader, writer) = tokio::io::split(stream);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut session = SessionState {
        client_id: client_id.clone(),
        registry,
        config,
        events: events_tx,
        writer: Some(writer),
        mode: Mode::Unset,
        legacy: false,
        remote_received: false,
        pending_ice: PendingIce::default(),
        transformer: TransformerConfig::default(),
        pc: None,
        heartbeat_channel: None,
        heartbeat_sender: None,
        monitor: None,
        getter_accounted: Arc::new(AtomicBool::new(true)),
        proxies: HashMap::new(),
        accept_task: None,
        conn_tasks: Vec::new(),
        next_stream: 0,
        handoff: false,
        control_closed: false,
        finished: false,
    };

    session.drive(reader, events_rx).await;
    session.teardown().await;
    info!(target: "session", client_id, "session ended");
}

struct SessionState<W> {
    client_id: String,
    registry: Arc<Registry>,
    config: BrokerConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    writer: Option<W>,
    mode: Mode,
    /// Latched on the first legacy-enveloped signaling message.
    legacy: bool,
    remote_received: bool,
    pending_ice: PendingIce,
    transformer: TransformerConfig,
    pc: Option<Arc<RTCPeerConnection>>,
    heartbeat_channel: Option<Arc<RTCDataChannel>>,
    heartbeat_sender: Option<JoinHandle<()>>,
    monitor: Option<HeartbeatMonitor>,
    /// Guards the getter count so watchdog expiry and teardown cannot both
    /// decrement for the same tunnel.
    getter_accounted: Arc<AtomicBool>,
    proxies: HashMap<String, ProxyChannel>,
    accept_task: Option<JoinHandle<()>>,
    conn_tasks: Vec<JoinHandle<()>>,
    next_stream: u64,
    handoff: bool,
    control_closed: bool,
    finished: bool,
}

impl<W> SessionState<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn drive<R>(&mut self, mut reader: R, mut events: mpsc::UnboundedReceiver<SessionEvent>)
    where
        R: AsyncRead + Unpin,
    {
        let mut framer = LineFramer::new();
        let mut buf = vec![0u8; 4096];
        while !self.finished {
            tokio::select! {
                read = reader.read(&mut buf), if !self.control_closed => match read {
                    Ok(0) | Err(_) => self.control_gone(),
                    Ok(n) => {
                        for line in framer.push(&buf[..n]) {
                            self.handle_line(&line).await;
                            if self.finished || self.control_closed {
                                break;
                            }
                        }
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
    }

    fn control_gone(&mut self) {
        self.control_closed = true;
        self.writer = None;
        if self.handoff {
            debug!(
                target: "session",
                client_id = %self.client_id,
                "control transport closed after handoff, tunnel stays up"
            );
        } else {
            debug!(
                target: "session",
                client_id = %self.client_id,
                "control transport closed, ending session"
            );
            self.finished = true;
        }
    }

    async fn reply(&mut self, line: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let mut message = Vec::with_capacity(line.len() + 1);
        message.extend_from_slice(line.as_bytes());
        message.push(b'\n');
        if let Err(err) = writer.write_all(&message).await {
            warn!(
                target: "session",
                client_id = %self.client_id,
                error = %err,
                "control write failed"
            );
            self.control_gone();
        }
    }

    async fn close_control(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.control_closed = true;
    }

    async fn handle_line(&mut self, line: &str) {
        if self.mode == Mode::Unset {
            self.handle_command(line).await;
        } else {
            self.handle_signal(line).await;
        }
    }

    async fn handle_command(&mut self, line: &str) {
        match command::parse(line) {
            Command::Ping => self.reply("ping").await,
            Command::Xyzzy => self.reply(command::XYZZY_REPLY).await,
            Command::Version => self.reply(command::VERSION_REPLY).await,
            Command::Quit => {
                debug!(target: "session", client_id = %self.client_id, "client quit");
                self.close_control().await;
                self.finished = true;
            }
            Command::Getters => {
                let count = self.registry.getters().to_string();
                self.reply(&count).await;
            }
            Command::TransformWith { name } => {
                self.transformer.name = Some(name);
                debug!(
                    target: "session",
                    client_id = %self.client_id,
                    transformer = ?self.transformer,
                    "transformer recorded"
                );
            }
            Command::TransformConfig { raw } => {
                self.transformer.raw = Some(raw);
                debug!(
                    target: "session",
                    client_id = %self.client_id,
                    transformer = ?self.transformer,
                    "transformer config recorded"
                );
            }
            Command::TransformUsage => self.reply(command::TRANSFORM_USAGE).await,
            Command::Give => self.start_give().await,
            Command::Get => self.start_get().await,
            Command::Unknown { verb } => self.reply(&command::unknown_reply(&verb)).await,
            Command::Empty => {}
        }
    }

    async fn start_give(&mut self) {
        self.mode = Mode::Give;
        info!(target: "session", client_id = %self.client_id, "give: waiting for an offer");
        let pc = match peer::build_peer_connection().await {
            Ok(pc) => pc,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    error = %err,
                    "peer connection setup failed"
                );
                self.finished = true;
                return;
            }
        };
        self.wire_peer_connection(&pc);
        self.pc = Some(pc);
    }

    async fn start_get(&mut self) {
        self.mode = Mode::Get;

        // First getter claims the configured port; everyone after gets an
        // OS-assigned one.
        let claimed = self.registry.claim_socks_port();
        let port = if claimed { self.config.socks_port } else { 0 };
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    port,
                    error = %err,
                    "failed to bind local socks server"
                );
                if claimed {
                    self.registry.release_socks_port();
                }
                self.finished = true;
                return;
            }
        };
        if let Ok(addr) = listener.local_addr() {
            info!(
                target: "session",
                client_id = %self.client_id,
                %addr,
                "local socks server listening"
            );
        }

        let pc = match peer::build_peer_connection().await {
            Ok(pc) => pc,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    error = %err,
                    "peer connection setup failed"
                );
                self.finished = true;
                return;
            }
        };
        self.wire_peer_connection(&pc);

        // ICE will not progress unless at least one data channel exists
        // before the offer is created.
        let heartbeat = match pc.create_data_channel(HEARTBEAT_LABEL, None).await {
            Ok(dc) => dc,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    error = %err,
                    "heartbeat channel create failed"
                );
                self.finished = true;
                return;
            }
        };
        wire_heartbeat_channel(&heartbeat, &self.events);
        self.heartbeat_channel = Some(heartbeat);

        let offer = match pc.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    error = %err,
                    "create_offer failed"
                );
                self.finished = true;
                return;
            }
        };
        let sdp = offer.sdp.clone();
        if let Err(err) = pc.set_local_description(offer).await {
            error!(
                target: "session",
                client_id = %self.client_id,
                error = %err,
                "set_local_description failed"
            );
            self.finished = true;
            return;
        }

        let accept_events = self.events.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(target: "session", %peer, "socks client accepted");
                        if accept_events.send(SessionEvent::SocksAccepted(stream)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target: "session", error = %err, "socks accept failed");
                    }
                }
            }
        }));

        self.pc = Some(pc);
        let line = signaling::encode_offer(&SdpPayload {
            kind: "offer".to_string(),
            sdp,
        });
        self.reply(&line).await;
    }

    fn wire_peer_connection(&self, pc: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(SessionEvent::LocalCandidate(CandidatePayload {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        warn!(target: "peer", error = %err, "failed to serialize local candidate");
                    }
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = events.send(SessionEvent::PeerState(state));
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            wire_remote_channel(&dc, &events);
            Box::pin(async {})
        }));
    }

    async fn handle_signal(&mut self, line: &str) {
        match signaling::parse_line(line) {
            Err(err) if err.is_fatal() => {
                error!(
                    target: "signaling",
                    client_id = %self.client_id,
                    error = %err,
                    "fatal protocol error"
                );
                self.finished = true;
            }
            Err(err) => {
                warn!(
                    target: "signaling",
                    client_id = %self.client_id,
                    error = %err,
                    "ignoring bad signaling line"
                );
            }
            Ok(None) => {
                debug!(
                    target: "signaling",
                    client_id = %self.client_id,
                    "ignoring unrecognized signaling message"
                );
            }
            Ok(Some(parsed)) => {
                if parsed.legacy && !self.legacy {
                    debug!(
                        target: "signaling",
                        client_id = %self.client_id,
                        "legacy envelope detected"
                    );
                    self.legacy = true;
                }
                match (parsed.signal, self.mode) {
                    (SignalIn::Candidate(candidate), _) => self.remote_candidate(candidate).await,
                    (SignalIn::Offer(offer), Mode::Give) => self.remote_offer(offer).await,
                    (SignalIn::Answer(answer), Mode::Get) => self.remote_answer(answer).await,
                    (_, mode) => {
                        debug!(
                            target: "signaling",
                            client_id = %self.client_id,
                            ?mode,
                            "signal does not apply in this mode"
                        );
                    }
                }
            }
        }
    }

    async fn remote_candidate(&mut self, candidate: CandidatePayload) {
        if !self.remote_received {
            self.pending_ice.push(candidate);
            trace!(
                target: "signaling",
                client_id = %self.client_id,
                queued = self.pending_ice.len(),
                "buffering candidate until the remote description arrives"
            );
            return;
        }
        if let Some(pc) = &self.pc {
            peer::apply_candidate(pc, &candidate).await;
        }
    }

    async fn remote_offer(&mut self, offer: SdpPayload) {
        let Some(pc) = self.pc.clone() else {
            return;
        };
        let description = match RTCSessionDescription::offer(offer.sdp) {
            Ok(description) => description,
            Err(err) => {
                error!(
                    target: "signaling",
                    client_id = %self.client_id,
                    error = %err,
                    "offer did not parse"
                );
                return;
            }
        };
        if let Err(err) = pc.set_remote_description(description).await {
            error!(
                target: "signaling",
                client_id = %self.client_id,
                error = %err,
                "set_remote_description failed"
            );
            return;
        }
        self.remote_received = true;
        self.flush_pending_ice(&pc).await;

        let answer = match pc.create_answer(None).await {
            Ok(answer) => answer,
            Err(err) => {
                error!(
                    target: "signaling",
                    client_id = %self.client_id,
                    error = %err,
                    "create_answer failed"
                );
                return;
            }
        };
        let sdp = answer.sdp.clone();
        if let Err(err) = pc.set_local_description(answer).await {
            error!(
                target: "signaling",
                client_id = %self.client_id,
                error = %err,
                "set_local_description failed"
            );
            return;
        }
        let payload = SdpPayload {
            kind: "answer".to_string(),
            sdp,
        };
        let line = signaling::encode_answer(&payload, self.legacy);
        self.reply(&line).await;
    }

    async fn remote_answer(&mut self, answer: SdpPayload) {
        let Some(pc) = self.pc.clone() else {
            return;
        };
        let description = match RTCSessionDescription::answer(answer.sdp) {
            Ok(description) => description,
            Err(err) => {
                error!(
                    target: "signaling",
                    client_id = %self.client_id,
                    error = %err,
                    "answer did not parse"
                );
                return;
            }
        };
        if let Err(err) = pc.set_remote_description(description).await {
            error!(
                target: "signaling",
                client_id = %self.client_id,
                error = %err,
                "set_remote_description failed"
            );
            return;
        }
        self.remote_received = true;
        self.flush_pending_ice(&pc).await;
    }

    async fn flush_pending_ice(&mut self, pc: &Arc<RTCPeerConnection>) {
        let queued = self.pending_ice.drain();
        if queued.is_empty() {
            return;
        }
        debug!(
            target: "signaling",
            client_id = %self.client_id,
            count = queued.len(),
            "flushing buffered candidates"
        );
        for candidate in &queued {
            peer::apply_candidate(pc, candidate).await;
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                if self.control_closed {
                    trace!(
                        target: "signaling",
                        client_id = %self.client_id,
                        "dropping local candidate, control transport is gone"
                    );
                    return;
                }
                let line = signaling::encode_candidate(&candidate, self.legacy);
                self.reply(&line).await;
            }
            SessionEvent::RemoteChannelOpen(dc) => self.remote_channel_open(dc).await,
            SessionEvent::ChannelMessage {
                label,
                data,
                is_string,
            } => self.channel_message(label, data, is_string).await,
            SessionEvent::ChannelClosed { label } => {
                if self.proxies.remove(&label).is_some() {
                    debug!(
                        target: "session",
                        client_id = %self.client_id,
                        label,
                        "proxy channel closed"
                    );
                } else if label == HEARTBEAT_LABEL {
                    debug!(
                        target: "session",
                        client_id = %self.client_id,
                        "heartbeat channel closed"
                    );
                }
            }
            SessionEvent::HeartbeatChannelOpen => {
                info!(
                    target: "session",
                    client_id = %self.client_id,
                    "heartbeat channel open, tunnel established"
                );
                self.handoff = true;
                if self.heartbeat_sender.is_none() {
                    if let Some(channel) = &self.heartbeat_channel {
                        self.heartbeat_sender = Some(heartbeat::spawn_sender(channel.clone()));
                    }
                }
            }
            SessionEvent::SocksAccepted(stream) => self.socks_accepted(stream).await,
            SessionEvent::Forward { label, event } => self.forward_event(label, event).await,
            SessionEvent::ForwardConnected { label, socket } => {
                self.forward_connected(label, socket).await;
            }
            SessionEvent::ForwardFailed { label, error } => {
                self.forward_failed(label, error).await;
            }
            SessionEvent::PeerState(state) => self.peer_state(state),
        }
    }

    async fn remote_channel_open(&mut self, dc: Arc<RTCDataChannel>) {
        let label = dc.label().to_string();
        if self.mode == Mode::Get {
            // Getters own channel creation; a giver-created channel is a
            // protocol violation.
            error!(
                target: "session",
                client_id = %self.client_id,
                label,
                "unexpected giver-created channel, closing it"
            );
            let _ = dc.close().await;
            return;
        }
        if label == HEARTBEAT_LABEL {
            self.heartbeat_open().await;
            return;
        }

        info!(
            target: "session",
            client_id = %self.client_id,
            label,
            "proxy channel open"
        );
        if self.proxies.contains_key(&label) {
            error!(
                target: "session",
                client_id = %self.client_id,
                label,
                "duplicate proxy channel label, replacing its session"
            );
        }
        let key = format!("{}:{}", self.client_id, label);
        self.proxies.insert(
            label,
            ProxyChannel {
                channel: dc,
                socks: SocksSession::new(key, self.legacy),
                forward: None,
                drain_active: Arc::new(AtomicBool::new(false)),
                sent_first_packet: false,
            },
        );
    }

    async fn heartbeat_open(&mut self) {
        if self.monitor.is_some() {
            error!(
                target: "session",
                client_id = %self.client_id,
                "second heartbeat channel ignored"
            );
            return;
        }
        // Signaling is done; the control socket's job ends here.
        self.close_control().await;
        self.handoff = true;
        let count = self.registry.getter_opened();
        info!(
            target: "session",
            client_id = %self.client_id,
            getters = count,
            "heartbeat channel open, control handed off"
        );

        let accounted = Arc::new(AtomicBool::new(false));
        self.getter_accounted = accounted.clone();
        let registry = self.registry.clone();
        let client_id = self.client_id.clone();
        self.monitor = Some(HeartbeatMonitor::start(move || {
            if !accounted.swap(true, Ordering::SeqCst) {
                let remaining = registry.getter_lost();
                warn!(
                    target: "session",
                    client_id = %client_id,
                    getters = remaining,
                    "heartbeat timed out"
                );
            }
        }));
    }

    async fn channel_message(&mut self, label: String, data: Vec<u8>, is_string: bool) {
        if label == HEARTBEAT_LABEL {
            if let Some(monitor) = &self.monitor {
                monitor.beat();
            }
            return;
        }
        if self.mode != Mode::Give {
            return;
        }
        if self.legacy && is_string {
            self.legacy_channel_text(&label, data).await;
            return;
        }
        let actions = {
            let Some(proxy) = self.proxies.get_mut(&label) else {
                warn!(
                    target: "session",
                    client_id = %self.client_id,
                    label,
                    "message for unknown channel"
                );
                return;
            };
            match proxy.socks.handle_data_from_socks_client(&data) {
                Ok(actions) => actions,
                Err(err) => {
                    warn!(
                        target: "socks",
                        key = proxy.socks.key(),
                        error = %err,
                        "socks session fault"
                    );
                    return;
                }
            }
        };
        self.run_socks_actions(&label, actions).await;
    }

    async fn legacy_channel_text(&mut self, label: &str, data: Vec<u8>) {
        let text = String::from_utf8_lossy(&data).into_owned();
        if text == HEARTBEAT_PAYLOAD {
            // Per-channel keepalive; echo it, the socks session never sees it.
            if let Some(proxy) = self.proxies.get(label) {
                if let Err(err) = proxy.channel.send_text(HEARTBEAT_PAYLOAD.to_string()).await {
                    debug!(
                        target: "session",
                        label,
                        error = %err,
                        "per-channel heartbeat reply failed"
                    );
                }
            }
            return;
        }

        let frame = match socks::parse_legacy_frame(&text) {
            Ok(frame) => frame,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    label,
                    error = %err,
                    "bad legacy channel frame"
                );
                return;
            }
        };

        if let Some(control) = frame.control {
            match control.as_str() {
                "OPEN" => {
                    // Channel pools recycle: same slot, fresh session.
                    debug!(
                        target: "session",
                        client_id = %self.client_id,
                        label,
                        "legacy OPEN, resetting socks session"
                    );
                    let key = format!("{}:{}", self.client_id, label);
                    if let Some(proxy) = self.proxies.get_mut(label) {
                        proxy.socks = SocksSession::new(key, true);
                        proxy.forward = None;
                        proxy.sent_first_packet = false;
                        proxy.drain_active = Arc::new(AtomicBool::new(false));
                    }
                }
                "CLOSE" => {}
                other => {
                    error!(
                        target: "session",
                        client_id = %self.client_id,
                        label,
                        control = other,
                        "unknown legacy control"
                    );
                }
            }
            return;
        }

        if let Some(value) = frame.data {
            let request = match socks::request_from_value(&value) {
                Ok(request) => request,
                Err(err) => {
                    error!(
                        target: "session",
                        client_id = %self.client_id,
                        label,
                        error = %err,
                        "bad legacy socks request"
                    );
                    return;
                }
            };
            let bytes = socks::encode_request(&request);
            let actions = {
                let Some(proxy) = self.proxies.get_mut(label) else {
                    return;
                };
                match proxy.socks.handle_data_from_socks_client(&bytes) {
                    Ok(actions) => actions,
                    Err(err) => {
                        warn!(
                            target: "socks",
                            key = proxy.socks.key(),
                            error = %err,
                            "socks session fault"
                        );
                        return;
                    }
                }
            };
            self.run_socks_actions(label, actions).await;
        }
    }

    async fn run_socks_actions(&mut self, label: &str, actions: Vec<SocksAction>) {
        for action in actions {
            match action {
                SocksAction::Reply(bytes) => self.send_to_client(label, bytes).await,
                SocksAction::Connect { host, port } => self.open_forward(label, host, port),
                SocksAction::Forward(bytes) => {
                    let Some(proxy) = self.proxies.get_mut(label) else {
                        return;
                    };
                    if let Some(forward) = proxy.forward.as_mut() {
                        if let Err(err) = forward.write(&bytes).await {
                            debug!(
                                target: "forward",
                                label,
                                error = %err,
                                "forward write failed"
                            );
                            proxy.forward = None;
                        }
                    }
                }
            }
        }
    }

    async fn send_to_client(&mut self, label: &str, bytes: Vec<u8>) {
        let legacy = self.legacy;
        let (channel, text_frame) = {
            let Some(proxy) = self.proxies.get_mut(label) else {
                return;
            };
            let mut text_frame = None;
            if legacy && !proxy.sent_first_packet {
                // First outbound packet of a legacy session is the SOCKS
                // response, re-framed as text.
                if let Some(response) = socks::decode_response(&bytes) {
                    text_frame = Some(socks::legacy_data_frame(&response));
                } else {
                    warn!(
                        target: "session",
                        client_id = %self.client_id,
                        label,
                        "first legacy packet is not a socks response, sending raw"
                    );
                }
                proxy.sent_first_packet = true;
            }
            (proxy.channel.clone(), text_frame)
        };

        let sent = match text_frame {
            Some(frame) => channel.send_text(frame).await,
            None => channel.send(&Bytes::from(bytes)).await,
        };
        if let Err(err) = sent {
            warn!(
                target: "session",
                client_id = %self.client_id,
                label,
                error = %err,
                "channel send failed"
            );
            return;
        }
        self.after_channel_send(label).await;
    }

    async fn after_channel_send(&mut self, label: &str) {
        let Some(proxy) = self.proxies.get(label) else {
            return;
        };
        let Some(forward) = proxy.forward.as_ref() else {
            return;
        };
        forward::apply_backpressure(
            proxy.channel.clone(),
            forward.gate(),
            proxy.drain_active.clone(),
        )
        .await;
    }

    fn open_forward(&mut self, label: &str, host: String, port: u16) {
        debug!(
            target: "session",
            client_id = %self.client_id,
            label,
            host = %host,
            port,
            "connecting forwarding socket"
        );
        let events = self.events.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            let data_events = events.clone();
            let data_label = label.clone();
            let connected = ForwardingSocket::connect(&host, port, move |event| {
                let _ = data_events.send(SessionEvent::Forward {
                    label: data_label.clone(),
                    event,
                });
            })
            .await;
            match connected {
                Ok(socket) => {
                    let _ = events.send(SessionEvent::ForwardConnected { label, socket });
                }
                Err(error) => {
                    let _ = events.send(SessionEvent::ForwardFailed { label, error });
                }
            }
        });
    }

    async fn forward_connected(&mut self, label: String, socket: ForwardingSocket) {
        let actions = {
            let Some(proxy) = self.proxies.get_mut(&label) else {
                // The channel went away while the connect was in flight.
                return;
            };
            if proxy.socks.state() != SocksState::Connecting {
                // A legacy OPEN reset the slot in the meantime.
                debug!(target: "session", label, "discarding stale forwarding socket");
                return;
            }
            proxy.forward = Some(socket);
            proxy.socks.on_forward_connected()
        };
        self.run_socks_actions(&label, actions).await;
    }

    async fn forward_failed(&mut self, label: String, error: io::Error) {
        let code = match error.kind() {
            io::ErrorKind::ConnectionRefused => socks::REPLY_CONNECTION_REFUSED,
            _ => socks::REPLY_HOST_UNREACHABLE,
        };
        warn!(
            target: "session",
            client_id = %self.client_id,
            label,
            error = %error,
            "forwarding connect failed"
        );
        let actions = {
            let Some(proxy) = self.proxies.get_mut(&label) else {
                return;
            };
            if proxy.socks.state() != SocksState::Connecting {
                return;
            }
            proxy.socks.on_forward_failed(code)
        };
        self.run_socks_actions(&label, actions).await;
    }

    async fn forward_event(&mut self, label: String, event: ForwardEvent) {
        match event {
            ForwardEvent::Data(data) => self.send_to_client(&label, data).await,
            ForwardEvent::Closed => {
                // Closing the channel stays the getter's call; only the
                // socket goes away.
                if let Some(proxy) = self.proxies.get_mut(&label) {
                    debug!(
                        target: "session",
                        client_id = %self.client_id,
                        label,
                        "forwarding socket closed"
                    );
                    proxy.forward = None;
                }
            }
        }
    }

    fn peer_state(&mut self, state: RTCPeerConnectionState) {
        info!(
            target: "session",
            client_id = %self.client_id,
            ?state,
            "peer connection state changed"
        );
        if matches!(
            state,
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
        ) {
            self.finished = true;
        }
    }

    async fn socks_accepted(&mut self, stream: TcpStream) {
        let Some(pc) = self.pc.clone() else {
            return;
        };
        self.next_stream += 1;
        let label = format!("{}-s{}", self.client_id, self.next_stream);
        let dc = match pc.create_data_channel(&label, None).await {
            Ok(dc) => dc,
            Err(err) => {
                error!(
                    target: "session",
                    client_id = %self.client_id,
                    error = %err,
                    "data channel create failed"
                );
                return;
            }
        };
        debug!(
            target: "session",
            client_id = %self.client_id,
            label,
            "proxy channel created for socks client"
        );
        self.conn_tasks
            .push(tokio::spawn(pump_socks_client(stream, dc, label)));
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for task in self.conn_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.heartbeat_sender.take() {
            task.abort();
        }
        // Cancelling the watchdog must not leak tunnel accounting.
        if let Some(monitor) = self.monitor.take() {
            drop(monitor);
            if !self.getter_accounted.swap(true, Ordering::SeqCst) {
                self.registry.getter_lost();
            }
        }
        self.proxies.clear();
        if let Some(pc) = self.pc.take() {
            let _ = pc.close().await;
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

fn wire_remote_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<SessionEvent>) {
    let open_events = events.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(SessionEvent::RemoteChannelOpen(open_dc.clone()));
        Box::pin(async {})
    }));

    let label = dc.label().to_string();
    let message_events = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let _ = message_events.send(SessionEvent::ChannelMessage {
            label: label.clone(),
            data: message.data.to_vec(),
            is_string: message.is_string,
        });
        Box::pin(async {})
    }));

    let label = dc.label().to_string();
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let _ = close_events.send(SessionEvent::ChannelClosed {
            label: label.clone(),
        });
        Box::pin(async {})
    }));
}

fn wire_heartbeat_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<SessionEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(SessionEvent::HeartbeatChannelOpen);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |message: DataChannelMessage| {
        // Givers may echo beats; presence is all that matters.
        trace!(target: "heartbeat", bytes = message.data.len(), "beat echo");
        Box::pin(async {})
    }));
}

/// Getter-side byte pump between one local SOCKS client and its data
/// channel. The getter alone creates and closes proxy channels; a local
/// disconnect is logged and deliberately leaves the channel open, because
/// giver-side closes interact badly with legacy channel pools.
async fn pump_socks_client(stream: TcpStream, channel: Arc<RTCDataChannel>, label: String) {
    let ready = Arc::new(Notify::new());
    let notify = ready.clone();
    channel.on_open(Box::new(move || {
        notify.notify_waiters();
        notify.notify_one();
        Box::pin(async {})
    }));

    let (from_channel_tx, mut from_channel) = mpsc::unbounded_channel::<Vec<u8>>();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let _ = from_channel_tx.send(message.data.to_vec());
        Box::pin(async {})
    }));

    if channel.ready_state() != RTCDataChannelState::Open {
        ready.notified().await;
    }

    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let write_label = label.clone();
    let writer = tokio::spawn(async move {
        while let Some(data) = from_channel.recv().await {
            if let Err(err) = tcp_write.write_all(&data).await {
                debug!(
                    target: "session",
                    label = %write_label,
                    error = %err,
                    "socks client write failed"
                );
                break;
            }
        }
    });

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match tcp_read.read(&mut buf).await {
            Ok(0) => {
                debug!(
                    target: "session",
                    label,
                    "socks client disconnected; the channel stays open"
                );
                break;
            }
            Ok(n) => {
                if let Err(err) = channel.send(&Bytes::copy_from_slice(&buf[..n])).await {
                    debug!(target: "session", label, error = %err, "channel send failed");
                    break;
                }
            }
            Err(err) => {
                debug!(target: "session", label, error = %err, "socks client read failed");
                break;
            }
        }
    }
    writer.abort();
}
