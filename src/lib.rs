//! RFB (VNC) client core over a WebSocket transport.
//!
//! Speaks RFB 3.8 (RFC 6143) to a server fronted by a
//! WebSocket-to-TCP bridge, in the noVNC/websockify convention: each
//! WebSocket frame carries raw RFB bytes with no added framing. The
//! crate negotiates the handshake (optionally with VNC DES
//! authentication), then runs as a message pump: keyboard and pointer
//! input out, framebuffer updates and side-channel events in.
//!
//! Framebuffer payloads are surfaced opaquely; pixel decoding and
//! presentation belong to the caller.
//!
//! ```no_run
//! use wsrfb::{Event, RfbSession, SessionOptions};
//!
//! # async fn run() -> Result<(), wsrfb::RfbError> {
//! let session = RfbSession::new(SessionOptions {
//!     endpoint: "ws://localhost:5901".into(),
//!     password: Some("secret".into()),
//!     ..SessionOptions::default()
//! });
//!
//! let mut events = session.subscribe().await?;
//! session.connect().await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         Event::FramebufferUpdate { payload } => drop(payload),
//!         Event::Disconnected => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod rfb;

pub use rfb::events::{EventBus, EventReceiver};
pub use rfb::machine::{ProtocolMachine, StepOutput};
pub use rfb::session::{RfbSession, TEARDOWN_GRACE};
pub use rfb::transport::{Connect, TransportEvent, TransportHandle, WireCommand, WsConnector};
pub use rfb::types::{
    close_code_message, Event, KeyInput, Modifiers, PixelFormat, PointerInput, ProtocolPhase,
    RfbError, RfbErrorKind, ServerInit, SessionOptions, SessionState, SessionStats,
};
