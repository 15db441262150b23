//! Typed client and session state for the storefront service

pub mod client;
pub mod error;
pub mod session;

pub use client::StorefrontClient;
pub use error::ClientError;
pub use session::{DeltaToken, PendingDelta, SessionController, SessionSnapshot};
