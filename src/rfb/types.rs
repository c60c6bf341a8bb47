//! RFB client types: configuration, session state, events, errors, and
//! wire-level constants.

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Protocol version ────────────────────────────────────────────────────

/// The 12-byte version banner this client always answers with.
///
/// Version negotiation is pinned to RFB 3.8; servers advertising 3.3/3.7
/// are answered with 3.8 regardless (see RFC 6143 §7.1.1).
pub const CLIENT_VERSION: &[u8; 12] = b"RFB 003.008\n";

// ── Security types ──────────────────────────────────────────────────────

/// RFB security types this client understands (RFC 6143 §7.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SecurityType {
    /// No authentication required.
    None = 1,
    /// VNC authentication (DES challenge-response).
    VncAuthentication = 2,
}

impl SecurityType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::None),
            2 => Some(Self::VncAuthentication),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::VncAuthentication => "VNC Authentication",
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Pixel format ────────────────────────────────────────────────────────

/// RFB pixel format descriptor (RFC 6143 §7.4), 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelFormat {
    /// Bits per pixel (8, 16, or 32).
    pub bits_per_pixel: u8,
    /// Number of useful bits in each pixel value.
    pub depth: u8,
    /// Non-zero = most significant byte first.
    pub big_endian: bool,
    /// Non-zero = true colour (as opposed to colour-map).
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// The 32-bit true-colour format this client offers by default.
    pub fn client_default() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian: false,
            true_colour: true,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// Serialize to the 16-byte wire format.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0] = self.bits_per_pixel;
        buf[1] = self.depth;
        buf[2] = u8::from(self.big_endian);
        buf[3] = u8::from(self.true_colour);
        buf[4..6].copy_from_slice(&self.red_max.to_be_bytes());
        buf[6..8].copy_from_slice(&self.green_max.to_be_bytes());
        buf[8..10].copy_from_slice(&self.blue_max.to_be_bytes());
        buf[10] = self.red_shift;
        buf[11] = self.green_shift;
        buf[12] = self.blue_shift;
        // 13..16 = padding
        buf
    }

    /// Parse from the 16-byte wire format.
    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        Self {
            bits_per_pixel: buf[0],
            depth: buf[1],
            big_endian: buf[2] != 0,
            true_colour: buf[3] != 0,
            red_max: u16::from_be_bytes([buf[4], buf[5]]),
            green_max: u16::from_be_bytes([buf[6], buf[7]]),
            blue_max: u16::from_be_bytes([buf[8], buf[9]]),
            red_shift: buf[10],
            green_shift: buf[11],
            blue_shift: buf[12],
        }
    }

    /// Bytes per pixel (1, 2, or 4).
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize + 7) / 8
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::client_default()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}bpp depth={} R:{}/{} G:{}/{} B:{}/{} {}",
            self.bits_per_pixel,
            self.depth,
            self.red_max,
            self.red_shift,
            self.green_max,
            self.green_shift,
            self.blue_max,
            self.blue_shift,
            if self.big_endian { "BE" } else { "LE" }
        )
    }
}

// ── ServerInit ──────────────────────────────────────────────────────────

/// The ServerInit record (RFC 6143 §7.3.2): framebuffer geometry, the
/// server's native pixel format, and the desktop name.
///
/// Populated exactly once, at handshake completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
}

// ── Wire message type codes ─────────────────────────────────────────────

/// Client-to-server message type codes (RFC 6143 §7.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientMessageType {
    SetPixelFormat = 0,
    SetEncodings = 2,
    FramebufferUpdateRequest = 3,
    KeyEvent = 4,
    PointerEvent = 5,
}

/// Server-to-client message type codes (RFC 6143 §7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerMessageType {
    FramebufferUpdate = 0,
    SetColourMapEntries = 1,
    Bell = 2,
    ServerCutText = 3,
}

impl ServerMessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::FramebufferUpdate),
            1 => Some(Self::SetColourMapEntries),
            2 => Some(Self::Bell),
            3 => Some(Self::ServerCutText),
            _ => None,
        }
    }
}

// ── Encodings ───────────────────────────────────────────────────────────

/// RFB encoding identifiers (RFC 6143 §7.7).
///
/// Only Raw pixel data is requested; the pseudo-encodings are understood
/// for framing so server messages can be delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    Raw,
    CopyRect,
    CursorPseudo,
    DesktopSizePseudo,
    LastRectPseudo,
    Other(i32),
}

impl EncodingType {
    pub fn to_i32(self) -> i32 {
        match self {
            Self::Raw => 0,
            Self::CopyRect => 1,
            Self::CursorPseudo => -239,
            Self::DesktopSizePseudo => -223,
            Self::LastRectPseudo => -224,
            Self::Other(v) => v,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            0 => Self::Raw,
            1 => Self::CopyRect,
            -239 => Self::CursorPseudo,
            -223 => Self::DesktopSizePseudo,
            -224 => Self::LastRectPseudo,
            other => Self::Other(other),
        }
    }
}

// ── Protocol phase ──────────────────────────────────────────────────────

/// The internal handshake stage of the protocol state machine, distinct
/// from the externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolPhase {
    AwaitVersion,
    AwaitSecurityTypes,
    AwaitAuthChallenge,
    AwaitAuthResult,
    AwaitServerInit,
    Connected,
}

impl fmt::Display for ProtocolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitVersion => "AwaitVersion",
            Self::AwaitSecurityTypes => "AwaitSecurityTypes",
            Self::AwaitAuthChallenge => "AwaitAuthChallenge",
            Self::AwaitAuthResult => "AwaitAuthResult",
            Self::AwaitServerInit => "AwaitServerInit",
            Self::Connected => "Connected",
        };
        write!(f, "{}", s)
    }
}

// ── Configuration ───────────────────────────────────────────────────────

/// Immutable configuration for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// WebSocket endpoint. Only `ws` and `wss` schemes are accepted.
    pub endpoint: String,
    /// Password, used only if the server offers VNC authentication.
    pub password: Option<String>,
    /// View-only mode; input-send operations become no-ops.
    #[serde(default)]
    pub view_only: bool,
    /// Pointer coordinate divisor, clamped to 0.1–2.0 at use.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Connect deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Enables byte-level trace logging.
    #[serde(default)]
    pub debug: bool,
    /// Reconnect attempts after an abnormal (1006) close.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

fn default_scale() -> f64 {
    1.0
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_max_reconnect_attempts() -> u32 {
    3
}

impl SessionOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// The scale factor actually applied to pointer coordinates.
    pub fn effective_scale(&self) -> f64 {
        self.scale.clamp(0.1, 2.0)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            password: None,
            view_only: false,
            scale: default_scale(),
            timeout_ms: default_timeout_ms(),
            debug: false,
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

// ── Input records ───────────────────────────────────────────────────────

/// Modifier state accompanying a key event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default)]
    pub shift: bool,
    #[serde(default)]
    pub control: bool,
    #[serde(default)]
    pub alt: bool,
    #[serde(default)]
    pub meta: bool,
}

/// A keyboard event as delivered by the input frontend.
///
/// `key` carries the logical key value ("a", "Enter", "ArrowLeft", ...);
/// `code` the physical key, kept for observers that care about layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInput {
    pub key: String,
    #[serde(default)]
    pub code: String,
    pub down: bool,
    #[serde(default)]
    pub modifiers: Modifiers,
}

/// A pointer event in client (unscaled) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointerInput {
    pub x: f64,
    pub y: f64,
    pub button_mask: u8,
}

// ── Observable state ────────────────────────────────────────────────────

/// Snapshot of the externally visible session state.
///
/// `connecting` and `connected` are mutually exclusive; `error` holds the
/// last failure message across reconnect attempts and clears on the next
/// user-initiated connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub connected: bool,
    pub connecting: bool,
    pub error: Option<String>,
    pub server_name: Option<String>,
    pub width: u16,
    pub height: u16,
}

/// Byte and frame counters for a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// FramebufferUpdate messages received.
    pub frame_count: u64,
    /// ISO-8601 timestamp of the last successful handshake.
    pub connected_at: Option<String>,
    /// ISO-8601 timestamp of the last wire activity.
    pub last_activity: Option<String>,
}

// ── Events ──────────────────────────────────────────────────────────────

/// Semantic events surfaced to observers, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Connecting,
    Connected {
        width: u16,
        height: u16,
        server_name: String,
    },
    Disconnected,
    Error {
        message: String,
    },
    /// A complete FramebufferUpdate message body; rectangles are not
    /// decoded here.
    FramebufferUpdate {
        payload: Vec<u8>,
    },
    /// Server clipboard bytes, surfaced opaquely.
    ServerCutText {
        payload: Vec<u8>,
    },
    Bell,
    /// Framebuffer geometry change (DesktopSize pseudo-rectangle).
    Resize {
        width: u16,
        height: u16,
    },
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfbErrorKind {
    /// Endpoint scheme or URL rejected before any transport open.
    InvalidEndpoint,
    /// `connect()` while already connecting or connected.
    AlreadyActive,
    /// Connect deadline elapsed in a non-terminal phase.
    Timeout,
    /// Transport closed or failed to open.
    TransportClosed,
    /// Malformed inbound record or unsupportable security offer.
    ProtocolError,
    /// Server demands VNC authentication but no password is configured.
    AuthRequired,
    /// VNC authentication result was non-zero.
    AuthFailed,
    /// The session task is gone.
    SessionGone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RfbError {
    pub kind: RfbErrorKind,
    pub message: String,
}

impl RfbError {
    pub fn new(kind: RfbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_endpoint(msg: impl Into<String>) -> Self {
        Self::new(RfbErrorKind::InvalidEndpoint, msg)
    }
    pub fn already_active() -> Self {
        Self::new(
            RfbErrorKind::AlreadyActive,
            "connect while already connecting or connected",
        )
    }
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(RfbErrorKind::Timeout, msg)
    }
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(RfbErrorKind::TransportClosed, msg)
    }
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(RfbErrorKind::ProtocolError, msg)
    }
    pub fn auth_required() -> Self {
        Self::new(
            RfbErrorKind::AuthRequired,
            "server requires VNC authentication but no password is configured",
        )
    }
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(RfbErrorKind::AuthFailed, msg)
    }
    pub fn session_gone() -> Self {
        Self::new(RfbErrorKind::SessionGone, "session task is gone")
    }

    /// Build a `TransportClosed` error from a WebSocket close code, using
    /// the stable code-to-message table. Returns `None` for a normal close.
    pub fn from_close_code(code: u16, reason: &str) -> Option<Self> {
        close_code_message(code, reason).map(Self::transport)
    }
}

impl fmt::Display for RfbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RfbError {}

impl From<std::io::Error> for RfbError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(e.to_string()),
            _ => Self::transport(e.to_string()),
        }
    }
}

/// The user-visible message for a WebSocket close code.
///
/// This table is a stable contract; `None` means "closed normally".
pub fn close_code_message(code: u16, reason: &str) -> Option<String> {
    match code {
        1000 => None,
        1006 => Some("connection lost unexpectedly".into()),
        1002 => Some("protocol error".into()),
        1003 => Some("server rejected connection (invalid data)".into()),
        1008 => Some("rejected by policy".into()),
        1011 => Some("server internal error".into()),
        other => Some(format!("closed with code {}: {}", other, reason)),
    }
}

// ── Keysyms (X11 subset) ────────────────────────────────────────────────

/// X11 keysym values carried in KeyEvent messages.
pub mod keysym {
    pub const BACKSPACE: u32 = 0xFF08;
    pub const TAB: u32 = 0xFF09;
    pub const RETURN: u32 = 0xFF0D;
    pub const ESCAPE: u32 = 0xFF1B;
    pub const INSERT: u32 = 0xFF63;
    pub const DELETE: u32 = 0xFFFF;
    pub const HOME: u32 = 0xFF50;
    pub const END: u32 = 0xFF57;
    pub const PAGE_UP: u32 = 0xFF55;
    pub const PAGE_DOWN: u32 = 0xFF56;
    pub const LEFT: u32 = 0xFF51;
    pub const UP: u32 = 0xFF52;
    pub const RIGHT: u32 = 0xFF53;
    pub const DOWN: u32 = 0xFF54;
    pub const SPACE: u32 = 0x20;
    pub const F1: u32 = 0xFFBE;
    pub const F2: u32 = 0xFFBF;
    pub const F3: u32 = 0xFFC0;
    pub const F4: u32 = 0xFFC1;
    pub const F5: u32 = 0xFFC2;
    pub const F6: u32 = 0xFFC3;
    pub const F7: u32 = 0xFFC4;
    pub const F8: u32 = 0xFFC5;
    pub const F9: u32 = 0xFFC6;
    pub const F10: u32 = 0xFFC7;
    pub const F11: u32 = 0xFFC8;
    pub const F12: u32 = 0xFFC9;
    pub const SHIFT_L: u32 = 0xFFE1;
    pub const CONTROL_L: u32 = 0xFFE3;
    pub const ALT_L: u32 = 0xFFE9;
    pub const META_L: u32 = 0xFFE7;
    pub const SUPER_L: u32 = 0xFFEB;
    pub const CAPS_LOCK: u32 = 0xFFE5;
    pub const NUM_LOCK: u32 = 0xFF7F;
    pub const SCROLL_LOCK: u32 = 0xFF14;
}

/// Mouse button mask bits for PointerEvent messages.
pub mod mouse_button {
    pub const LEFT: u8 = 1;
    pub const MIDDLE: u8 = 2;
    pub const RIGHT: u8 = 4;
    pub const SCROLL_UP: u8 = 8;
    pub const SCROLL_DOWN: u8 = 16;
}
