//! RFB wire codec: stateless builders and parsers for the messages this
//! client speaks (RFC 6143). Big-endian throughout.

use crate::rfb::types::{
    keysym, ClientMessageType, EncodingType, PixelFormat, RfbError, ServerInit,
    ServerMessageType,
};

// ── Client → Server builders ────────────────────────────────────────────

/// ClientInit (§7.3.1): one byte, non-zero = share the desktop.
pub fn build_client_init(shared: bool) -> Vec<u8> {
    vec![u8::from(shared)]
}

/// SetPixelFormat (§7.5.1): type + 3 padding + 16-byte pixel format.
pub fn build_set_pixel_format(pf: &PixelFormat) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.push(ClientMessageType::SetPixelFormat as u8);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&pf.to_bytes());
    buf
}

/// SetEncodings (§7.5.2): type + padding + count + 4 bytes per encoding.
pub fn build_set_encodings(encodings: &[EncodingType]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + encodings.len() * 4);
    buf.push(ClientMessageType::SetEncodings as u8);
    buf.push(0);
    buf.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for enc in encodings {
        buf.extend_from_slice(&enc.to_i32().to_be_bytes());
    }
    buf
}

/// FramebufferUpdateRequest (§7.5.3), 10 bytes.
pub fn build_fb_update_request(incremental: bool, x: u16, y: u16, width: u16, height: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(ClientMessageType::FramebufferUpdateRequest as u8);
    buf.push(u8::from(incremental));
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf.extend_from_slice(&width.to_be_bytes());
    buf.extend_from_slice(&height.to_be_bytes());
    buf
}

/// KeyEvent (§7.5.4), 8 bytes.
pub fn build_key_event(down: bool, keysym: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(ClientMessageType::KeyEvent as u8);
    buf.push(u8::from(down));
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(&keysym.to_be_bytes());
    buf
}

/// PointerEvent (§7.5.5), 6 bytes.
pub fn build_pointer_event(button_mask: u8, x: u16, y: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6);
    buf.push(ClientMessageType::PointerEvent as u8);
    buf.push(button_mask);
    buf.extend_from_slice(&x.to_be_bytes());
    buf.extend_from_slice(&y.to_be_bytes());
    buf
}

// ── Handshake records ───────────────────────────────────────────────────

/// Validate the 12-byte server version banner.
pub fn parse_version(buf: &[u8]) -> Result<String, RfbError> {
    if buf.len() < 12 {
        return Err(RfbError::protocol("version banner too short"));
    }
    if !buf.starts_with(b"RFB ") {
        return Err(RfbError::protocol(format!(
            "not an RFB server (banner {:?})",
            String::from_utf8_lossy(&buf[..12])
        )));
    }
    Ok(String::from_utf8_lossy(&buf[..12]).trim().to_string())
}

/// Parse a complete ServerInit record (§7.3.2).
///
/// The buffer must contain the 24-byte header and the full desktop name.
pub fn parse_server_init(buf: &[u8]) -> Result<ServerInit, RfbError> {
    if buf.len() < 24 {
        return Err(RfbError::protocol(format!(
            "ServerInit too short: {} bytes",
            buf.len()
        )));
    }
    let width = u16::from_be_bytes([buf[0], buf[1]]);
    let height = u16::from_be_bytes([buf[2], buf[3]]);

    let mut pf_bytes = [0u8; 16];
    pf_bytes.copy_from_slice(&buf[4..20]);
    let pixel_format = PixelFormat::from_bytes(&pf_bytes);

    let name_len = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]) as usize;
    if buf.len() < 24 + name_len {
        return Err(RfbError::protocol("ServerInit name truncated"));
    }
    let name = String::from_utf8_lossy(&buf[24..24 + name_len]).into_owned();

    Ok(ServerInit {
        width,
        height,
        pixel_format,
        name,
    })
}

/// Build a ServerInit record. The inverse of [`parse_server_init`]; used
/// by tests and mock servers.
pub fn build_server_init(init: &ServerInit) -> Vec<u8> {
    let name = init.name.as_bytes();
    let mut buf = Vec::with_capacity(24 + name.len());
    buf.extend_from_slice(&init.width.to_be_bytes());
    buf.extend_from_slice(&init.height.to_be_bytes());
    buf.extend_from_slice(&init.pixel_format.to_bytes());
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name);
    buf
}

// ── Connected-phase message scanning ────────────────────────────────────

/// One rectangle header inside a FramebufferUpdate (§7.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub encoding: EncodingType,
}

/// A delimited server message, with payloads left opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerWireMessage {
    /// Message body after the type byte, plus the parsed rectangle
    /// headers (parsed for framing only; pixel data is not decoded).
    FramebufferUpdate {
        payload: Vec<u8>,
        rects: Vec<RectHeader>,
    },
    ColourMapEntries {
        first_colour: u16,
        count: u16,
    },
    Bell,
    /// The clipboard bytes (§7.6.4), without padding or length prefix.
    ServerCutText {
        payload: Vec<u8>,
    },
    /// Unrecognised message type byte.
    Unknown(u8),
}

/// Result of a successful scan: the message and how many buffered bytes
/// it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessageScan {
    pub consumed: usize,
    pub message: ServerWireMessage,
}

/// Try to delimit one complete server message at the head of `buf`.
///
/// Returns `Ok(None)` while the buffer holds only a prefix of the next
/// message. WebSocket frame boundaries carry no meaning, so headers and
/// lengths must be walked even though payloads stay opaque. The pixel
/// format is needed to size Raw and cursor rectangles.
pub fn scan_server_message(
    buf: &[u8],
    pf: &PixelFormat,
) -> Result<Option<ServerMessageScan>, RfbError> {
    let Some(&msg_type) = buf.first() else {
        return Ok(None);
    };

    match ServerMessageType::from_byte(msg_type) {
        None => Ok(Some(ServerMessageScan {
            consumed: 1,
            message: ServerWireMessage::Unknown(msg_type),
        })),
        Some(ServerMessageType::FramebufferUpdate) => scan_fb_update(buf, pf),
        Some(ServerMessageType::SetColourMapEntries) => {
            // 1 type + 1 padding + 2 first-colour + 2 count, then 6 bytes
            // (three u16 channels) per colour.
            if buf.len() < 6 {
                return Ok(None);
            }
            let first_colour = u16::from_be_bytes([buf[2], buf[3]]);
            let count = u16::from_be_bytes([buf[4], buf[5]]);
            let total = 6 + count as usize * 6;
            if buf.len() < total {
                return Ok(None);
            }
            Ok(Some(ServerMessageScan {
                consumed: total,
                message: ServerWireMessage::ColourMapEntries {
                    first_colour,
                    count,
                },
            }))
        }
        Some(ServerMessageType::Bell) => Ok(Some(ServerMessageScan {
            consumed: 1,
            message: ServerWireMessage::Bell,
        })),
        Some(ServerMessageType::ServerCutText) => {
            // 1 type + 3 padding + 4 length, then the text.
            if buf.len() < 8 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            let total = 8 + len;
            if buf.len() < total {
                return Ok(None);
            }
            Ok(Some(ServerMessageScan {
                consumed: total,
                message: ServerWireMessage::ServerCutText {
                    payload: buf[8..total].to_vec(),
                },
            }))
        }
    }
}

fn scan_fb_update(
    buf: &[u8],
    pf: &PixelFormat,
) -> Result<Option<ServerMessageScan>, RfbError> {
    // 1 type + 1 padding + 2 rectangle count.
    if buf.len() < 4 {
        return Ok(None);
    }
    let num_rects = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let mut offset = 4usize;
    let mut rects = Vec::with_capacity(num_rects.min(64));

    for _ in 0..num_rects {
        if buf.len() < offset + 12 {
            return Ok(None);
        }
        let header = RectHeader {
            x: u16::from_be_bytes([buf[offset], buf[offset + 1]]),
            y: u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]),
            width: u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]),
            height: u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]),
            encoding: EncodingType::from_i32(i32::from_be_bytes([
                buf[offset + 8],
                buf[offset + 9],
                buf[offset + 10],
                buf[offset + 11],
            ])),
        };
        offset += 12;

        let body = rect_payload_len(&header, pf)?;
        if buf.len() < offset + body {
            return Ok(None);
        }
        offset += body;

        let last = header.encoding == EncodingType::LastRectPseudo;
        rects.push(header);
        if last {
            break;
        }
    }

    Ok(Some(ServerMessageScan {
        consumed: offset,
        message: ServerWireMessage::FramebufferUpdate {
            payload: buf[1..offset].to_vec(),
            rects,
        },
    }))
}

/// Payload length of one rectangle, by encoding.
///
/// Unknown encodings are unrecoverable: their length cannot be derived,
/// so the stream cannot be resynchronised.
fn rect_payload_len(rect: &RectHeader, pf: &PixelFormat) -> Result<usize, RfbError> {
    let pixels = rect.width as usize * rect.height as usize;
    match rect.encoding {
        EncodingType::Raw => Ok(pixels * pf.bytes_per_pixel()),
        EncodingType::CopyRect => Ok(4),
        EncodingType::CursorPseudo => {
            let mask_row = (rect.width as usize + 7) / 8;
            Ok(pixels * pf.bytes_per_pixel() + mask_row * rect.height as usize)
        }
        EncodingType::DesktopSizePseudo | EncodingType::LastRectPseudo => Ok(0),
        EncodingType::Other(v) => Err(RfbError::protocol(format!(
            "unsupported rectangle encoding {}",
            v
        ))),
    }
}

// ── Keysym mapping ──────────────────────────────────────────────────────

/// Map a logical key value to an X11 keysym.
///
/// Named navigation/editing keys use their canonical keysyms; a single
/// printable character maps to its Unicode code point. Unknown keys
/// return `None` and are dropped before emission.
pub fn lookup_keysym(key: &str) -> Option<u32> {
    let named = match key {
        "Backspace" => Some(keysym::BACKSPACE),
        "Tab" => Some(keysym::TAB),
        "Enter" | "Return" => Some(keysym::RETURN),
        "Escape" | "Esc" => Some(keysym::ESCAPE),
        "Insert" => Some(keysym::INSERT),
        "Delete" => Some(keysym::DELETE),
        "Home" => Some(keysym::HOME),
        "End" => Some(keysym::END),
        "PageUp" => Some(keysym::PAGE_UP),
        "PageDown" => Some(keysym::PAGE_DOWN),
        "ArrowLeft" | "Left" => Some(keysym::LEFT),
        "ArrowUp" | "Up" => Some(keysym::UP),
        "ArrowRight" | "Right" => Some(keysym::RIGHT),
        "ArrowDown" | "Down" => Some(keysym::DOWN),
        "Space" | "Spacebar" => Some(keysym::SPACE),
        "F1" => Some(keysym::F1),
        "F2" => Some(keysym::F2),
        "F3" => Some(keysym::F3),
        "F4" => Some(keysym::F4),
        "F5" => Some(keysym::F5),
        "F6" => Some(keysym::F6),
        "F7" => Some(keysym::F7),
        "F8" => Some(keysym::F8),
        "F9" => Some(keysym::F9),
        "F10" => Some(keysym::F10),
        "F11" => Some(keysym::F11),
        "F12" => Some(keysym::F12),
        "Shift" => Some(keysym::SHIFT_L),
        "Control" => Some(keysym::CONTROL_L),
        "Alt" => Some(keysym::ALT_L),
        "Meta" => Some(keysym::META_L),
        "OS" | "Super" => Some(keysym::SUPER_L),
        "CapsLock" => Some(keysym::CAPS_LOCK),
        "NumLock" => Some(keysym::NUM_LOCK),
        "ScrollLock" => Some(keysym::SCROLL_LOCK),
        _ => None,
    };
    if named.is_some() {
        return named;
    }

    let mut chars = key.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_control() => Some(c as u32),
        _ => None,
    }
}
