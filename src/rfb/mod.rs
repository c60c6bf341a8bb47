//! RFB client core: wire codec, DES authenticator, protocol state
//! machine, session controller, event bus, and the transport seam.

pub mod auth;
pub mod events;
pub mod machine;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

// Re-export top-level items for convenience.
pub use session::RfbSession;
pub use types::*;
