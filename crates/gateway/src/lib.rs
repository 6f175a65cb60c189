//! OpenAI-compatible upstream gateway core: a three-layer account
//! scheduler, a stateful WebSocket ingress proxy, and the sticky-state
//! store tying turns of the same conversation back to the same account
//! and, where possible, the same live upstream connection.
//!
//! This crate is the proxying core only — request auth, rate limiting, and
//! any CLI/admin HTTP surface belong to the embedding application.

pub mod concurrency;
pub mod dialer;
pub mod disconnect;
pub mod ingress;
pub mod metrics_facade;
pub mod metrics_facade_dialer;
pub mod normalize;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod sticky;

pub use concurrency::LocalConcurrencyBroker;
pub use dialer::{DialError, UpstreamConnection, WsDialer};
pub use ingress::{GatewayCore, UpstreamRegistry, handle_connection};
pub use scheduler::{Scheduler, SelectOutcome};
pub use server::{build_router, run};
pub use stats::RuntimeStats;
pub use sticky::StickyStore;
