//! zorkd multiplexes SOCKS5 client traffic over WebRTC data channels
//! between two cooperating peers: a *getter* that exposes a local SOCKS5
//! server and tunnels traffic out, and a *giver* that forwards tunneled
//! traffic to the open Internet. A line-oriented "Zork" control channel
//! bootstraps each session and carries WebRTC signaling until the
//! heartbeat data channel takes over.

pub mod command;
pub mod forward;
pub mod framing;
pub mod heartbeat;
pub mod peer;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod socks;
