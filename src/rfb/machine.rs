//! The RFB protocol state machine.
//!
//! Consumes the inbound byte stream in whatever chunks the transport
//! delivers, buffers until complete records are available, and emits
//! outbound messages plus semantic events. Knows nothing about the
//! transport: WebSocket frame boundaries carry no meaning here.

use log::{debug, warn};

use crate::rfb::auth;
use crate::rfb::protocol::{self, ServerWireMessage};
use crate::rfb::types::{
    EncodingType, Event, PixelFormat, ProtocolPhase, RfbError, SecurityType, ServerInit,
    CLIENT_VERSION,
};

/// Everything one `feed` call produced: messages to put on the wire (one
/// vec per RFB message, sent atomically) and events for observers.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StepOutput {
    pub outbound: Vec<Vec<u8>>,
    pub events: Vec<Event>,
}

/// The handshake and message-pump state machine.
///
/// An error from [`feed`](Self::feed) is terminal; the caller is expected
/// to discard the machine and tear the transport down.
pub struct ProtocolMachine {
    phase: ProtocolPhase,
    buf: Vec<u8>,
    password: Option<String>,
    pixel_format: PixelFormat,
    server_init: Option<ServerInit>,
    debug: bool,
}

impl ProtocolMachine {
    pub fn new(password: Option<String>, debug: bool) -> Self {
        Self {
            phase: ProtocolPhase::AwaitVersion,
            buf: Vec::new(),
            password,
            pixel_format: PixelFormat::client_default(),
            server_init: None,
            debug,
        }
    }

    pub fn phase(&self) -> ProtocolPhase {
        self.phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ProtocolPhase::Connected
    }

    /// The ServerInit record, present from `Connected` entry onward.
    pub fn server_init(&self) -> Option<&ServerInit> {
        self.server_init.as_ref()
    }

    /// Absorb one inbound chunk and run the machine until it needs more
    /// bytes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<StepOutput, RfbError> {
        if self.debug {
            debug!("rx {} bytes in phase {}", chunk.len(), self.phase);
        }
        self.buf.extend_from_slice(chunk);
        let mut out = StepOutput::default();
        while self.step(&mut out)? {}
        Ok(out)
    }

    /// Try to consume one record. `Ok(false)` means the buffer holds only
    /// a prefix of the next record.
    fn step(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        match self.phase {
            ProtocolPhase::AwaitVersion => self.step_version(out),
            ProtocolPhase::AwaitSecurityTypes => self.step_security_types(out),
            ProtocolPhase::AwaitAuthChallenge => self.step_auth_challenge(out),
            ProtocolPhase::AwaitAuthResult => self.step_auth_result(out),
            ProtocolPhase::AwaitServerInit => self.step_server_init(out),
            ProtocolPhase::Connected => self.step_server_message(out),
        }
    }

    fn step_version(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        if self.buf.len() < 12 {
            return Ok(false);
        }
        let banner = protocol::parse_version(&self.buf[..12])?;
        self.consume(12);
        if self.debug {
            debug!("server banner: {}", banner);
        }
        // The version is pinned to 3.8 regardless of the server's offer.
        out.outbound.push(CLIENT_VERSION.to_vec());
        self.set_phase(ProtocolPhase::AwaitSecurityTypes);
        Ok(true)
    }

    fn step_security_types(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        let Some(&count) = self.buf.first() else {
            return Ok(false);
        };

        if count == 0 {
            // The server refused; a reason string follows.
            if self.buf.len() < 5 {
                return Ok(false);
            }
            let reason_len =
                u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if self.buf.len() < 5 + reason_len {
                return Ok(false);
            }
            let reason = String::from_utf8_lossy(&self.buf[5..5 + reason_len]).into_owned();
            return Err(RfbError::protocol(reason));
        }

        let n = count as usize;
        if self.buf.len() < 1 + n {
            return Ok(false);
        }
        let offered = self.buf[1..1 + n].to_vec();
        self.consume(1 + n);

        let selected = auth::select_security_type(&offered, self.password.is_some())?;
        out.outbound.push(vec![selected.to_byte()]);

        match selected {
            SecurityType::VncAuthentication => {
                self.set_phase(ProtocolPhase::AwaitAuthChallenge);
            }
            SecurityType::None => {
                // Always shared: do not evict other viewers.
                out.outbound.push(protocol::build_client_init(true));
                self.set_phase(ProtocolPhase::AwaitServerInit);
            }
        }
        Ok(true)
    }

    fn step_auth_challenge(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        if self.buf.len() < 16 {
            return Ok(false);
        }
        let password = self.password.clone().ok_or_else(RfbError::auth_required)?;
        let mut challenge = [0u8; 16];
        challenge.copy_from_slice(&self.buf[..16]);
        self.consume(16);

        let response = auth::encrypt_challenge(&password, &challenge);
        out.outbound.push(response.to_vec());
        self.set_phase(ProtocolPhase::AwaitAuthResult);
        Ok(true)
    }

    fn step_auth_result(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        if self.buf.len() < 4 {
            return Ok(false);
        }
        let status = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

        if status == 0 {
            self.consume(4);
            out.outbound.push(protocol::build_client_init(true));
            self.set_phase(ProtocolPhase::AwaitServerInit);
            return Ok(true);
        }

        // Failure. A reason string is optional: use it when its bytes are
        // in the buffer or still arriving, fall back to a generic message
        // when the server sent the status alone.
        let rest = self.buf.len() - 4;
        let reason = if rest == 0 {
            None
        } else {
            if rest < 4 {
                return Ok(false);
            }
            let len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if self.buf.len() < 8 + len {
                return Ok(false);
            }
            Some(String::from_utf8_lossy(&self.buf[8..8 + len]).into_owned())
        };

        Err(RfbError::auth_failed(
            reason.unwrap_or_else(|| "authentication failed".into()),
        ))
    }

    fn step_server_init(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        if self.buf.len() < 24 {
            return Ok(false);
        }
        let name_len =
            u32::from_be_bytes([self.buf[20], self.buf[21], self.buf[22], self.buf[23]]) as usize;
        if self.buf.len() < 24 + name_len {
            return Ok(false);
        }

        let init = protocol::parse_server_init(&self.buf[..24 + name_len])?;
        self.consume(24 + name_len);
        if init.width == 0 || init.height == 0 {
            return Err(RfbError::protocol("ServerInit reports zero geometry"));
        }

        out.events.push(Event::Connected {
            width: init.width,
            height: init.height,
            server_name: init.name.clone(),
        });

        // Announce the client's default pixel format, pin the encoding set
        // to Raw, then ask for the first full frame.
        out.outbound
            .push(protocol::build_set_pixel_format(&self.pixel_format));
        out.outbound
            .push(protocol::build_set_encodings(&[EncodingType::Raw]));
        out.outbound.push(protocol::build_fb_update_request(
            false, 0, 0, init.width, init.height,
        ));

        self.server_init = Some(init);
        self.set_phase(ProtocolPhase::Connected);
        Ok(true)
    }

    fn step_server_message(&mut self, out: &mut StepOutput) -> Result<bool, RfbError> {
        let Some(scan) = protocol::scan_server_message(&self.buf, &self.pixel_format)? else {
            return Ok(false);
        };
        self.consume(scan.consumed);

        match scan.message {
            ServerWireMessage::FramebufferUpdate { payload, rects } => {
                for rect in &rects {
                    if rect.encoding == EncodingType::DesktopSizePseudo {
                        if let Some(init) = self.server_init.as_mut() {
                            init.width = rect.width;
                            init.height = rect.height;
                        }
                        out.events.push(Event::Resize {
                            width: rect.width,
                            height: rect.height,
                        });
                    }
                }
                out.events.push(Event::FramebufferUpdate { payload });
            }
            ServerWireMessage::ColourMapEntries { count, .. } => {
                debug!("ignoring SetColourMapEntries ({} colours)", count);
            }
            ServerWireMessage::Bell => out.events.push(Event::Bell),
            ServerWireMessage::ServerCutText { payload } => {
                out.events.push(Event::ServerCutText { payload });
            }
            ServerWireMessage::Unknown(t) => {
                warn!("unknown server message type {}, skipping", t);
            }
        }
        Ok(true)
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
    }

    fn set_phase(&mut self, next: ProtocolPhase) {
        if self.debug {
            debug!("phase {} -> {}", self.phase, next);
        }
        self.phase = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::types::RfbErrorKind;

    fn server_init_bytes(width: u16, height: u16, name: &str) -> Vec<u8> {
        protocol::build_server_init(&ServerInit {
            width,
            height,
            pixel_format: PixelFormat::client_default(),
            name: name.into(),
        })
    }

    fn connect_no_auth(machine: &mut ProtocolMachine) -> StepOutput {
        let mut all = StepOutput::default();
        for chunk in [
            b"RFB 003.008\n".to_vec(),
            vec![1, 1],
            server_init_bytes(800, 600, "Remote"),
        ] {
            let out = machine.feed(&chunk).unwrap();
            all.outbound.extend(out.outbound);
            all.events.extend(out.events);
        }
        all
    }

    // ── Version phase ───────────────────────────────────────────────

    #[test]
    fn replies_with_pinned_version() {
        let mut m = ProtocolMachine::new(None, false);
        let out = m.feed(b"RFB 003.003\n").unwrap();
        assert_eq!(out.outbound, vec![b"RFB 003.008\n".to_vec()]);
        assert_eq!(m.phase(), ProtocolPhase::AwaitSecurityTypes);
    }

    #[test]
    fn waits_for_full_banner() {
        let mut m = ProtocolMachine::new(None, false);
        let out = m.feed(b"RFB 003").unwrap();
        assert!(out.outbound.is_empty());
        assert_eq!(m.phase(), ProtocolPhase::AwaitVersion);
        let out = m.feed(b".008\n").unwrap();
        assert_eq!(out.outbound.len(), 1);
    }

    #[test]
    fn rejects_non_rfb_banner() {
        let mut m = ProtocolMachine::new(None, false);
        let err = m.feed(b"HTTP/1.1 400").unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::ProtocolError);
    }

    // ── Security negotiation ────────────────────────────────────────

    #[test]
    fn picks_none_when_offered() {
        let mut m = ProtocolMachine::new(None, false);
        m.feed(b"RFB 003.008\n").unwrap();
        let out = m.feed(&[1, 1]).unwrap();
        // Selection byte, then ClientInit with the shared flag set.
        assert_eq!(out.outbound, vec![vec![1], vec![1]]);
        assert_eq!(m.phase(), ProtocolPhase::AwaitServerInit);
    }

    #[test]
    fn prefers_vnc_auth_with_password() {
        let mut m = ProtocolMachine::new(Some("secret".into()), false);
        m.feed(b"RFB 003.008\n").unwrap();
        let out = m.feed(&[2, 1, 2]).unwrap();
        assert_eq!(out.outbound, vec![vec![2]]);
        assert_eq!(m.phase(), ProtocolPhase::AwaitAuthChallenge);
    }

    #[test]
    fn vnc_auth_without_password_fails() {
        let mut m = ProtocolMachine::new(None, false);
        m.feed(b"RFB 003.008\n").unwrap();
        let err = m.feed(&[1, 2]).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::AuthRequired);
    }

    #[test]
    fn unsupported_offer_fails() {
        let mut m = ProtocolMachine::new(Some("x".into()), false);
        m.feed(b"RFB 003.008\n").unwrap();
        let err = m.feed(&[2, 16, 19]).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::ProtocolError);
    }

    #[test]
    fn empty_offer_reports_server_reason() {
        let mut m = ProtocolMachine::new(None, false);
        m.feed(b"RFB 003.008\n").unwrap();
        let mut msg = vec![0u8];
        msg.extend_from_slice(&5u32.to_be_bytes());
        msg.extend_from_slice(b"oops!");
        let err = m.feed(&msg).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::ProtocolError);
        assert_eq!(err.message, "oops!");
    }

    #[test]
    fn partial_offer_list_suspends() {
        let mut m = ProtocolMachine::new(None, false);
        m.feed(b"RFB 003.008\n").unwrap();
        let out = m.feed(&[2, 1]).unwrap();
        assert!(out.outbound.is_empty());
        assert_eq!(m.phase(), ProtocolPhase::AwaitSecurityTypes);
        let out = m.feed(&[2]).unwrap();
        assert_eq!(out.outbound[0], vec![1]);
    }

    // ── VNC authentication ──────────────────────────────────────────

    #[test]
    fn encrypts_challenge_and_awaits_result() {
        let mut m = ProtocolMachine::new(Some("secret".into()), false);
        m.feed(b"RFB 003.008\n").unwrap();
        m.feed(&[2, 1, 2]).unwrap();
        let out = m.feed(&[0u8; 16]).unwrap();
        assert_eq!(out.outbound.len(), 1);
        assert_eq!(
            out.outbound[0],
            auth::encrypt_challenge("secret", &[0u8; 16]).to_vec()
        );
        assert_eq!(m.phase(), ProtocolPhase::AwaitAuthResult);
    }

    #[test]
    fn auth_success_sends_client_init() {
        let mut m = ProtocolMachine::new(Some("secret".into()), false);
        m.feed(b"RFB 003.008\n").unwrap();
        m.feed(&[1, 2]).unwrap();
        m.feed(&[0u8; 16]).unwrap();
        let out = m.feed(&0u32.to_be_bytes()).unwrap();
        assert_eq!(out.outbound, vec![vec![1]]);
        assert_eq!(m.phase(), ProtocolPhase::AwaitServerInit);
    }

    #[test]
    fn auth_failure_with_reason() {
        let mut m = ProtocolMachine::new(Some("wrong".into()), false);
        m.feed(b"RFB 003.008\n").unwrap();
        m.feed(&[1, 2]).unwrap();
        m.feed(&[0u8; 16]).unwrap();
        let mut msg = 1u32.to_be_bytes().to_vec();
        msg.extend_from_slice(&12u32.to_be_bytes());
        msg.extend_from_slice(b"Bad password");
        let err = m.feed(&msg).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::AuthFailed);
        assert_eq!(err.message, "Bad password");
    }

    #[test]
    fn auth_failure_without_reason_is_generic() {
        let mut m = ProtocolMachine::new(Some("wrong".into()), false);
        m.feed(b"RFB 003.008\n").unwrap();
        m.feed(&[1, 2]).unwrap();
        m.feed(&[0u8; 16]).unwrap();
        let err = m.feed(&1u32.to_be_bytes()).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::AuthFailed);
        assert_eq!(err.message, "authentication failed");
    }

    // ── ServerInit and Connected entry ──────────────────────────────

    #[test]
    fn happy_path_reaches_connected() {
        let mut m = ProtocolMachine::new(None, false);
        let all = connect_no_auth(&mut m);

        assert!(m.is_connected());
        let init = m.server_init().unwrap();
        assert_eq!((init.width, init.height), (800, 600));
        assert_eq!(init.name, "Remote");

        assert_eq!(
            all.events,
            vec![Event::Connected {
                width: 800,
                height: 600,
                server_name: "Remote".into()
            }]
        );

        // version, selection, ClientInit, SetPixelFormat, SetEncodings,
        // initial full FramebufferUpdateRequest.
        assert_eq!(all.outbound.len(), 6);
        let fbur = all.outbound.last().unwrap();
        assert_eq!(fbur.len(), 10);
        assert_eq!(fbur[0], 3);
        assert_eq!(fbur[1], 0); // non-incremental
        assert_eq!(u16::from_be_bytes([fbur[6], fbur[7]]), 800);
        assert_eq!(u16::from_be_bytes([fbur[8], fbur[9]]), 600);
    }

    #[test]
    fn connected_event_precedes_update_request() {
        let mut m = ProtocolMachine::new(None, false);
        m.feed(b"RFB 003.008\n").unwrap();
        m.feed(&[1, 1]).unwrap();
        let out = m.feed(&server_init_bytes(800, 600, "Remote")).unwrap();
        assert!(matches!(out.events[0], Event::Connected { .. }));
        assert_eq!(out.outbound.len(), 3);
    }

    #[test]
    fn zero_geometry_is_protocol_error() {
        let mut m = ProtocolMachine::new(None, false);
        m.feed(b"RFB 003.008\n").unwrap();
        m.feed(&[1, 1]).unwrap();
        let err = m.feed(&server_init_bytes(0, 600, "bad")).unwrap_err();
        assert_eq!(err.kind, RfbErrorKind::ProtocolError);
    }

    // ── Split delivery equivalence ──────────────────────────────────

    fn no_auth_stream() -> Vec<u8> {
        let mut stream = b"RFB 003.008\n".to_vec();
        stream.extend_from_slice(&[1, 1]);
        stream.extend_from_slice(&server_init_bytes(800, 600, "Remote"));
        stream
    }

    fn run_chunks(chunks: &[&[u8]]) -> (StepOutput, ProtocolPhase) {
        let mut m = ProtocolMachine::new(None, false);
        let mut all = StepOutput::default();
        for chunk in chunks {
            let out = m.feed(chunk).unwrap();
            all.outbound.extend(out.outbound);
            all.events.extend(out.events);
        }
        (all, m.phase())
    }

    #[test]
    fn split_at_every_boundary_matches_contiguous() {
        let stream = no_auth_stream();
        let (reference, ref_phase) = run_chunks(&[&stream[..]]);
        for cut in 1..stream.len() {
            let (split, phase) = run_chunks(&[&stream[..cut], &stream[cut..]]);
            assert_eq!(split, reference, "split at byte {}", cut);
            assert_eq!(phase, ref_phase);
        }
    }

    #[test]
    fn byte_at_a_time_matches_contiguous() {
        let stream = no_auth_stream();
        let (reference, _) = run_chunks(&[&stream[..]]);
        let singles: Vec<&[u8]> = stream.chunks(1).collect();
        let (split, phase) = run_chunks(&singles);
        assert_eq!(split, reference);
        assert_eq!(phase, ProtocolPhase::Connected);
    }

    // ── Connected-phase dispatch ────────────────────────────────────

    fn connected_machine() -> ProtocolMachine {
        let mut m = ProtocolMachine::new(None, false);
        connect_no_auth(&mut m);
        m
    }

    #[test]
    fn bell_is_surfaced() {
        let mut m = connected_machine();
        let out = m.feed(&[2]).unwrap();
        assert_eq!(out.events, vec![Event::Bell]);
    }

    #[test]
    fn cut_text_is_surfaced_opaquely() {
        let mut m = connected_machine();
        let mut msg = vec![3u8, 0, 0, 0];
        msg.extend_from_slice(&2u32.to_be_bytes());
        msg.extend_from_slice(b"hi");
        let out = m.feed(&msg).unwrap();
        assert_eq!(
            out.events,
            vec![Event::ServerCutText {
                payload: b"hi".to_vec()
            }]
        );
    }

    #[test]
    fn framebuffer_update_is_surfaced_opaquely() {
        let mut m = connected_machine();
        let mut msg = vec![0u8, 0];
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0, 0, 1, 0, 1]);
        msg.extend_from_slice(&0i32.to_be_bytes());
        msg.extend_from_slice(&[0xAA; 4]);
        let out = m.feed(&msg).unwrap();
        match &out.events[0] {
            Event::FramebufferUpdate { payload } => {
                assert_eq!(payload.len(), msg.len() - 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn update_split_mid_message_is_buffered() {
        let mut m = connected_machine();
        let mut msg = vec![0u8, 0];
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0, 0, 2, 0, 2]);
        msg.extend_from_slice(&0i32.to_be_bytes());
        msg.extend_from_slice(&[0x55; 16]);

        let out = m.feed(&msg[..7]).unwrap();
        assert!(out.events.is_empty());
        let out = m.feed(&msg[7..]).unwrap();
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn desktop_size_updates_geometry_and_emits_resize() {
        let mut m = connected_machine();
        let mut msg = vec![0u8, 0];
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&1280u16.to_be_bytes());
        msg.extend_from_slice(&1024u16.to_be_bytes());
        msg.extend_from_slice(&(-223i32).to_be_bytes());

        let out = m.feed(&msg).unwrap();
        assert_eq!(
            out.events[0],
            Event::Resize {
                width: 1280,
                height: 1024
            }
        );
        let init = m.server_init().unwrap();
        assert_eq!((init.width, init.height), (1280, 1024));
    }

    #[test]
    fn unknown_message_type_is_skipped() {
        let mut m = connected_machine();
        let out = m.feed(&[0x7F, 2]).unwrap();
        // The unknown byte is dropped; the Bell behind it still lands.
        assert_eq!(out.events, vec![Event::Bell]);
    }

    #[test]
    fn unknown_rect_encoding_is_terminal() {
        let mut m = connected_machine();
        let mut msg = vec![0u8, 0];
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&[0; 8]);
        msg.extend_from_slice(&7i32.to_be_bytes()); // Tight: never requested
        assert!(m.feed(&msg).is_err());
    }

    #[test]
    fn multiple_messages_in_one_chunk() {
        let mut m = connected_machine();
        let mut msg = vec![2u8]; // Bell
        msg.extend_from_slice(&[3, 0, 0, 0]); // ServerCutText
        msg.extend_from_slice(&1u32.to_be_bytes());
        msg.push(b'x');
        msg.push(2); // Bell again
        let out = m.feed(&msg).unwrap();
        assert_eq!(out.events.len(), 3);
        assert_eq!(out.events[0], Event::Bell);
        assert_eq!(out.events[2], Event::Bell);
    }
}
