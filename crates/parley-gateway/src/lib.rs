//! Real-time routing core: who is online, which connections are in which
//! rooms, and how a message gets from one connection to the others.

pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod presence;
pub mod rooms;
pub mod router;
pub mod store;

pub use auth::{IdentityVerifier, JwtVerifier};
pub use config::GatewayConfig;
pub use error::{AuthError, GatewayError, StoreError};
pub use lifecycle::{ConnectionHandle, Gateway};
pub use store::{DurableStore, SqliteStore};
