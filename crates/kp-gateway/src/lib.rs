//! kp-gateway: Kubernetes stream multiplexing gateway
//!
//! The gateway sits between a web console and any number of Kubernetes API
//! servers. The console opens a single WebSocket and asks for watch, log or
//! exec streams over it. The gateway dials one upstream WebSocket per stream,
//! relays frames in both directions, keeps each stream alive with heartbeats
//! and reconnects, and tears everything down when the console goes away.

pub mod error;
pub mod multiplexer;
pub mod resolver;
pub mod server;
pub mod state;

pub use multiplexer::Multiplexer;
pub use state::GatewayState;
