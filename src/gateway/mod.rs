//! Gateway configuration and runtime.
//!
//! [`GatewayConfig`] is always available. With the `transport` feature,
//! [`Gateway`] runs the link and the learn controller on tokio tasks and
//! hands out a cloneable [`GatewayHandle`].

mod config;
#[cfg(feature = "transport")]
mod runtime;

pub use config::{GatewayConfig, GatewayConfigBuilder, LearnConfig, LinkConfig, SecurityConfig};
#[cfg(feature = "transport")]
pub use runtime::{Gateway, GatewayEvent, GatewayHandle, GatewayStatus, open_store};
