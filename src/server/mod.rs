// src/server/mod.rs
pub mod broadcast;
pub mod handler;
pub mod health;
pub mod message;
pub mod middleware;
pub mod registry;
pub mod relay;
pub mod session;

// Re-export public components
pub use health::HealthMetrics;
pub use message::{MessageFlags, MessageFrame, ProtocolError};
pub use middleware::rate_limit::ConnectionRateLimiter;
pub use registry::Registry;
pub use relay::{Relay, RelayEvent};
pub use session::{DisplayName, Session, SessionId};
