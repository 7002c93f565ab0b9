use bytes::{Buf, BufMut, BytesMut};

use log::{debug, trace, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::*;
use crate::error::*;

/// A raw SW-P-08 message: the bytes between the frame delimiters after DLE
/// de-escaping, with the byte count and checksum verified and stripped.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub cmd: u8,
    pub data: Vec<u8>,
}

/// Two's-complement checksum over `cmd | data | bytecount`. The high bit is
/// forced clear; the wire carries 7-bit checksums only.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1) & 0x7f
}

impl Frame {
    pub fn new(cmd: u8, data: Vec<u8>) -> Frame {
        Frame { cmd, data }
    }

    /// Serializes the frame into wire bytes: checksummed, DLE-stuffed and
    /// wrapped in `DLE STX` / `DLE ETX`.
    pub fn encode(&self) -> Result<Vec<u8>, FramingError> {
        if self.data.len() > MAX_FRAME_DATA {
            return Err(FramingError::Oversize(self.data.len()));
        }

        let mut body = Vec::with_capacity(self.data.len() + 3);
        body.push(self.cmd);
        body.extend_from_slice(&self.data);
        body.push(self.data.len() as u8 + 2);
        body.push(checksum(&body));

        let mut wire = Vec::with_capacity(body.len() + 6);
        wire.push(DLE);
        wire.push(STX);
        for b in body {
            wire.push(b);
            if b == DLE {
                wire.push(DLE);
            }
        }
        wire.push(DLE);
        wire.push(ETX);
        Ok(wire)
    }
}

/// One decoded unit from the router's byte stream.
#[derive(Clone, Debug, PartialEq)]
pub enum WireEvent {
    Frame(Frame),

    /// The `DLE ACK` short frame. Arrives on its own, between data frames.
    Ack,

    /// The `DLE NAK` short frame.
    Nak,

    /// A complete frame arrived but its byte count or checksum failed
    /// verification. The body is already discarded; whether to answer with
    /// a wire NAK is the link layer's call.
    Corrupt(FramingError),
}

/// One unit for the encoder to put on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum WireCommand {
    Frame(Frame),
    Ack,
    Nak,
}

enum DecodeState {
    /// Between frames. Anything but a DLE is noise.
    Idle,
    /// A DLE was seen between frames; the next byte selects STX/ACK/NAK.
    Lead,
    /// Accumulating an unescaped frame body. `escaped` is set immediately
    /// after an in-body DLE.
    Body { raw: Vec<u8>, escaped: bool },
}

/// Stateful deframer. Accumulates bytes across reads and emits complete
/// [WireEvent]s; output is identical no matter how the input is chunked.
pub struct FrameCodec {
    state: DecodeState,
    discarded: u64,
    framing_errors: u64,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            state: DecodeState::Idle,
            discarded: 0,
            framing_errors: 0,
        }
    }

    /// Running count of frames lost to escape violations, byte count or
    /// checksum mismatches since the codec was created.
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    fn feed(&mut self, byte: u8) -> Option<WireEvent> {
        match std::mem::replace(&mut self.state, DecodeState::Idle) {
            DecodeState::Idle => {
                if byte == DLE {
                    self.state = DecodeState::Lead;
                } else {
                    self.discarded += 1;
                    trace!("Discarding {:#04x} outside frame", byte);
                }
                None
            }
            DecodeState::Lead => match byte {
                STX => {
                    if self.discarded > 0 {
                        debug!("Discarded {} bytes before frame start", self.discarded);
                        self.discarded = 0;
                    }
                    self.state = DecodeState::Body {
                        raw: Vec::new(),
                        escaped: false,
                    };
                    None
                }
                ACK => Some(WireEvent::Ack),
                NAK => Some(WireEvent::Nak),
                DLE => {
                    // The first DLE was noise; this one may lead a frame.
                    self.discarded += 1;
                    self.state = DecodeState::Lead;
                    None
                }
                other => {
                    self.discarded += 2;
                    trace!("Discarding DLE {:#04x} outside frame", other);
                    None
                }
            },
            DecodeState::Body { mut raw, escaped } => {
                // cmd + data + bytecount + checksum
                if raw.len() > MAX_FRAME_DATA + 3 {
                    let err = FramingError::Oversize(raw.len());
                    warn!("{}, resynchronising", err);
                    self.framing_errors += 1;
                    return None;
                }

                if !escaped {
                    if byte == DLE {
                        self.state = DecodeState::Body { raw, escaped: true };
                    } else {
                        raw.push(byte);
                        self.state = DecodeState::Body {
                            raw,
                            escaped: false,
                        };
                    }
                    return None;
                }

                match byte {
                    DLE => {
                        raw.push(DLE);
                        self.state = DecodeState::Body {
                            raw,
                            escaped: false,
                        };
                        None
                    }
                    ETX => self.finish(raw),
                    STX => {
                        warn!("Frame restarted after {} body bytes", raw.len());
                        self.framing_errors += 1;
                        self.state = DecodeState::Body {
                            raw: Vec::new(),
                            escaped: false,
                        };
                        None
                    }
                    ACK => {
                        warn!("ACK inside a frame, dropping {} body bytes", raw.len());
                        self.framing_errors += 1;
                        Some(WireEvent::Ack)
                    }
                    NAK => {
                        warn!("NAK inside a frame, dropping {} body bytes", raw.len());
                        self.framing_errors += 1;
                        Some(WireEvent::Nak)
                    }
                    other => {
                        let err = FramingError::Escape(other);
                        warn!("{}, resynchronising", err);
                        self.framing_errors += 1;
                        None
                    }
                }
            }
        }
    }

    fn finish(&mut self, raw: Vec<u8>) -> Option<WireEvent> {
        if raw.len() < 3 {
            let err = FramingError::Truncated(raw.len());
            warn!("{}, frame discarded", err);
            self.framing_errors += 1;
            return Some(WireEvent::Corrupt(err));
        }

        let declared = raw[raw.len() - 2];
        let received = raw[raw.len() - 1];
        let data_len = raw.len() - 3;

        if declared as usize != data_len + 2 {
            let err = FramingError::ByteCount {
                declared,
                actual: data_len,
            };
            warn!("{}, frame discarded", err);
            self.framing_errors += 1;
            return Some(WireEvent::Corrupt(err));
        }

        let computed = checksum(&raw[..raw.len() - 1]);
        if computed != received {
            let err = FramingError::Checksum { received, computed };
            warn!("{}, frame discarded", err);
            self.framing_errors += 1;
            return Some(WireEvent::Corrupt(err));
        }

        Some(WireEvent::Frame(Frame {
            cmd: raw[0],
            data: raw[1..raw.len() - 2].to_vec(),
        }))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

impl Decoder for FrameCodec {
    type Item = WireEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let byte = src.get_u8();
            if let Some(event) = self.feed(byte) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}

impl Encoder<WireCommand> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: WireCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            WireCommand::Frame(frame) => dst.extend_from_slice(&frame.encode()?),
            WireCommand::Ack => {
                dst.put_u8(DLE);
                dst.put_u8(ACK);
            }
            WireCommand::Nak => {
                dst.put_u8(DLE);
                dst.put_u8(NAK);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut FrameCodec, bytes: &[u8]) -> Vec<WireEvent> {
        let mut src = BytesMut::from(bytes);
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut src).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn encode_connect() {
        let frame = Frame::new(CROSSPOINT_CONNECT, vec![0x00, 0x00, 0x05, 0x0a]);
        assert_eq!(
            frame.encode().unwrap(),
            vec![0x10, 0x02, 0x02, 0x00, 0x00, 0x05, 0x0a, 0x06, 0x69, 0x10, 0x03]
        );
    }

    #[test]
    fn checksum_is_seven_bit_and_cancels() {
        let frame = Frame::new(CROSSPOINT_TALLY, vec![0x11, 0x08, 0x05, 0x00]);
        let wire = frame.encode().unwrap();
        // Strip delimiters, nothing here needs unescaping.
        let body = &wire[2..wire.len() - 2];
        let sum = body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        assert_eq!(sum & 0x7f, 0);
        assert_eq!(body[body.len() - 1] & 0x80, 0);
    }

    #[test]
    fn decode_tally() {
        let mut codec = FrameCodec::new();
        let events = drain(
            &mut codec,
            &[0x10, 0x02, 0x03, 0x11, 0x08, 0x05, 0x00, 0x06, 0x59, 0x10, 0x03],
        );
        assert_eq!(
            events,
            vec![WireEvent::Frame(Frame::new(
                CROSSPOINT_TALLY,
                vec![0x11, 0x08, 0x05, 0x00]
            ))]
        );
    }

    #[test]
    fn dle_transparency() {
        let frame = Frame::new(CROSSPOINT_CONNECT, vec![0x10, 0x10, 0x10, 0x05]);
        let wire = frame.encode().unwrap();
        assert_eq!(
            wire,
            vec![
                0x10, 0x02, 0x02, 0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x05, 0x06, 0x43, 0x10, 0x03
            ]
        );

        let mut codec = FrameCodec::new();
        assert_eq!(drain(&mut codec, &wire), vec![WireEvent::Frame(frame)]);
    }

    #[test]
    fn chunking_is_irrelevant() {
        let frame = Frame::new(CROSSPOINT_CONNECTED, vec![0x21, 0x18, 0x10, 0x7f]);
        let mut wire = vec![0x10, 0x06];
        wire.extend(frame.encode().unwrap());
        wire.extend(&[0x10, 0x15]);

        let mut whole = FrameCodec::new();
        let expected = drain(&mut whole, &wire);
        assert_eq!(
            expected,
            vec![WireEvent::Ack, WireEvent::Frame(frame), WireEvent::Nak]
        );

        let mut trickle = FrameCodec::new();
        let mut events = Vec::new();
        for byte in wire {
            events.extend(drain(&mut trickle, &[byte]));
        }
        assert_eq!(events, expected);
    }

    #[test]
    fn byte_count_mismatch_is_rejected() {
        let mut codec = FrameCodec::new();
        let events = drain(
            &mut codec,
            &[0x10, 0x02, 0x02, 0x00, 0x00, 0x05, 0x0a, 0x07, 0x6a, 0x10, 0x03],
        );
        assert_eq!(
            events,
            vec![WireEvent::Corrupt(FramingError::ByteCount {
                declared: 7,
                actual: 4
            })]
        );
        assert_eq!(codec.framing_errors(), 1);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let frame = Frame::new(CROSSPOINT_TALLY, vec![0x00, 0x00, 0x01, 0x02]);
        let mut wire = frame.encode().unwrap();
        let tampered = wire.len() - 3;
        wire[tampered] ^= 0x01;

        let mut codec = FrameCodec::new();
        let events = drain(&mut codec, &wire);
        assert!(matches!(
            events.as_slice(),
            [WireEvent::Corrupt(FramingError::Checksum { .. })]
        ));
    }

    #[test]
    fn resynchronises_after_garbage() {
        let frame = Frame::new(CROSSPOINT_TALLY, vec![0x00, 0x00, 0x02, 0x03]);
        let mut wire = vec![0x42, 0xff, 0x10, 0x99];
        wire.extend(frame.encode().unwrap());

        let mut codec = FrameCodec::new();
        assert_eq!(drain(&mut codec, &wire), vec![WireEvent::Frame(frame)]);
    }

    #[test]
    fn bad_escape_drops_partial_frame() {
        let good = Frame::new(CROSSPOINT_TALLY, vec![0x00, 0x00, 0x04, 0x05]);
        let mut wire = vec![0x10, 0x02, 0x03, 0x00, 0x10, 0x42];
        wire.extend(good.encode().unwrap());

        let mut codec = FrameCodec::new();
        assert_eq!(drain(&mut codec, &wire), vec![WireEvent::Frame(good)]);
        assert_eq!(codec.framing_errors(), 1);
    }

    #[test]
    fn oversize_data_refused() {
        let frame = Frame::new(CROSSPOINT_TALLY, vec![0u8; MAX_FRAME_DATA + 1]);
        assert_eq!(
            frame.encode(),
            Err(FramingError::Oversize(MAX_FRAME_DATA + 1))
        );
    }

    #[test]
    fn ack_between_partial_frames() {
        // An ACK pair arriving immediately after a frame start is still
        // detected, and the truncated frame is dropped.
        let mut codec = FrameCodec::new();
        let events = drain(&mut codec, &[0x10, 0x02, 0x03, 0x00, 0x10, 0x06]);
        assert_eq!(events, vec![WireEvent::Ack]);
        assert_eq!(codec.framing_errors(), 1);
    }
}
