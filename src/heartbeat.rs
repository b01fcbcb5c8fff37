//! The heartbeat channel doubles as liveness probe and active-getter
//! accounting signal. The getter beats every five seconds; the giver arms a
//! fifteen-second deadline that every inbound beat re-arms.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;

/// Reserved label distinguishing the liveness channel from proxy channels.
pub const HEARTBEAT_LABEL: &str = "HEARTBEAT";

/// Payload the getter sends on every beat. Receivers only care that a
/// message arrived at all.
pub const HEARTBEAT_PAYLOAD: &str = "heartbeat";

/// Getter-side send period.
pub const SEND_INTERVAL: Duration = Duration::from_secs(5);

/// Giver-side liveness deadline.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(15);

/// Spawns the getter-side beat sender. Runs until aborted at session
/// teardown.
pub fn spawn_sender(channel: Arc<RTCDataChannel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SEND_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = channel.send_text(HEARTBEAT_PAYLOAD.to_string()).await {
                debug!(target: "heartbeat", error = %err, "beat send failed");
            }
        }
    })
}

/// Giver-side liveness watchdog. Single-shot: once the deadline expires the
/// hook runs and the monitor is spent.
pub struct HeartbeatMonitor {
    rearm: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start<F>(on_expiry: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (rearm, mut beats) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match tokio::time::timeout(LIVENESS_TIMEOUT, beats.recv()).await {
                    // Beat observed, re-arm.
                    Ok(Some(())) => continue,
                    // Monitor dropped.
                    Ok(None) => return,
                    // Deadline expired.
                    Err(_) => break,
                }
            }
            on_expiry();
        });
        Self { rearm, task }
    }

    /// Records one inbound beat; the deadline restarts.
    pub fn beat(&self) {
        let _ = self.rearm.send(());
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
