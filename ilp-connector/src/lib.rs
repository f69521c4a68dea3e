//! The ILP connector node: configuration, peer registry, packet
//! forwarding, hop-trace loop detection, and node lifecycle.

pub mod config;
pub mod errors;
pub mod handler;
pub mod node;
pub mod registry;
pub mod telemetry;
pub mod trace;

pub use config::Config;
pub use errors::NodeError;
pub use handler::ForwardingHandler;
pub use node::ConnectorNode;
pub use registry::{PeerRegistry, PeerStatus};
pub use telemetry::{HealthStatus, Sink, TelemetryBus, TelemetryEvent};
pub use trace::HopTrace;
