//! Outbound forwarding sockets and the data-channel backpressure that
//! throttles them.
//!
//! Backpressure runs in one direction only: when a proxy channel's outbound
//! buffer climbs past the high-water mark, the forwarding socket stops
//! reading from the Internet until a drain timer sees the buffer fall back
//! under the mark.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;

/// Outbound buffer level at which the forwarding socket is paused.
pub const HIGH_WATER_MARK: usize = 500_000;

/// Level the drain timer waits for before resuming. Equal to the high mark;
/// the drain dwell is the only hysteresis.
pub const LOW_WATER_MARK: usize = 500_000;

/// Drain timer period.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

const READ_BUFFER: usize = 16 * 1024;

/// Pause/resume gate shared between a forwarding read loop and the drain
/// timer.
#[derive(Debug, Clone)]
pub struct PauseGate {
    state: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(false).0),
        }
    }

    pub fn pause(&self) {
        let _ = self.state.send(true);
    }

    pub fn resume(&self) {
        let _ = self.state.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the gate is open.
    pub async fn ready(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the gate closes. Pends forever if it never does.
    pub async fn paused(&self) {
        let mut rx = self.state.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What a forwarding read loop reports back to its session.
#[derive(Debug)]
pub enum ForwardEvent {
    Data(Vec<u8>),
    Closed,
}

/// Giver-side outbound TCP socket, one per SOCKS session. The write half is
/// driven by the session event loop; the read loop runs gated so a paused
/// socket propagates TCP backpressure to the remote server.
#[derive(Debug)]
pub struct ForwardingSocket {
    writer: OwnedWriteHalf,
    gate: PauseGate,
    reader: JoinHandle<()>,
}

impl ForwardingSocket {
    pub async fn connect<F>(host: &str, port: u16, on_event: F) -> io::Result<Self>
    where
        F: Fn(ForwardEvent) + Send + Sync + 'static,
    {
        let stream = TcpStream::connect((host, port)).await?;
        let (mut read_half, writer) = stream.into_split();
        let gate = PauseGate::new();

        let loop_gate = gate.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                loop_gate.ready().await;
                tokio::select! {
                    // Re-park without reading if the gate closes mid-wait.
                    _ = loop_gate.paused() => continue,
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => on_event(ForwardEvent::Data(buf[..n].to_vec())),
                        Err(err) => {
                            debug!(target: "forward", error = %err, "forwarding read failed");
                            break;
                        }
                    },
                }
            }
            on_event(ForwardEvent::Closed);
        });

        Ok(Self {
            writer,
            gate,
            reader,
        })
    }

    pub fn gate(&self) -> PauseGate {
        self.gate.clone()
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data).await
    }
}

impl Drop for ForwardingSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Runs after every send on a proxy channel. Crossing the high-water mark
/// pauses the forwarding socket and starts the drain timer; the timer
/// resumes the socket once the buffer is back under the low mark and then
/// clears itself.
pub async fn apply_backpressure(
    channel: Arc<RTCDataChannel>,
    gate: PauseGate,
    drain_active: Arc<AtomicBool>,
) {
    if channel.buffered_amount().await < HIGH_WATER_MARK {
        return;
    }
    if drain_active.swap(true, Ordering::SeqCst) {
        return;
    }
    debug!(
        target: "forward",
        label = channel.label(),
        "outbound buffer crossed the high-water mark, pausing forwarding socket"
    );
    gate.pause();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
        loop {
            ticker.tick().await;
            if channel.buffered_amount().await < LOW_WATER_MARK {
                gate.resume();
                drain_active.store(false, Ordering::SeqCst);
                debug!(
                    target: "forward",
                    label = channel.label(),
                    "outbound buffer drained, forwarding socket resumed"
                );
                break;
            }
        }
    });
}
