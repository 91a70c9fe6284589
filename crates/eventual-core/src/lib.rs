//! # eventual-core
//!
//! Broker internals for the eventual realtime event broker.
//!
//! - **Registry** - channels, their subscribers, and federation peers
//! - **ReplayQueue** - short-lived per-channel history
//! - **WorkerPool** - executes subscribe/unsubscribe/publish/history requests
//! - **EventQueue** - batches local publishes for delivery to peer brokers
//! - **TokenAuthority** - verifies and signs bearer tokens
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│ WorkerPool  │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │    │
//!        └───── events ──────┘    ├──────▶ ReplayQueue
//!                                 ▼
//!                          ┌─────────────┐
//!                          │ EventQueue  │────▶ peer publisher
//!                          └─────────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod federation;
pub mod peer;
pub mod pool;
pub mod profile;
pub mod registry;
pub mod replay;
pub mod session;

pub use auth::{AuthError, JwtAuthority, TokenAuthority};
pub use channel::{Channel, ChannelId, Subscriber, SubscriptionId, GLOBAL_CHANNEL};
pub use federation::{
    EventQueue, FederationConfig, OutboundEvent, PeerEvent, PeerRequest, RelayGuard,
};
pub use peer::{Peer, PeerKind};
pub use pool::{Origin, PoolConfig, PoolError, PoolHandle, WorkerPool};
pub use registry::{Registry, RegistryConfig, RegistryStats};
pub use replay::{ReplayConfig, ReplayError, ReplayQueue};
pub use session::{DeliveryError, Outbound, SessionHandle, SessionId, SessionState};
