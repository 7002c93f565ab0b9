use std::fmt;

use nom::combinator::all_consuming;
use nom::multi::many0;
use nom::number::complete::be_u8;
use nom::sequence::{pair, tuple};
use nom::IResult;

use crate::constants::*;
use crate::error::*;
use crate::frame::Frame;

/// One (matrix, level, destination, source) coordinate as carried by tally
/// and connect messages.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Crosspoint {
    pub matrix: u8,
    pub level: u8,
    pub destination: u16,
    pub source: u16,
    /// Bit 3 of the multiplier byte; set by TDM routers.
    pub source_status: bool,
}

impl fmt::Display for Crosspoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "m{} l{} dst {} <- src {}",
            self.matrix, self.level, self.destination, self.source
        )
    }
}

/// One entry of a word-format tally dump block. The destination is
/// reconstructed from the entry's position and the multiplier's high bits,
/// so a block covering destinations 128.. still lands correctly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DumpEntry {
    pub destination: u16,
    pub source: u16,
    pub source_status: bool,
}

/// A single typed SW-P-08 command, to or from the router.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Ask the router for the current source of a destination. The answer
    /// arrives as a [Tally](Message::Tally).
    Interrogate {
        matrix: u8,
        level: u8,
        destination: u16,
    },
    /// Connect a source to a destination on one level.
    Connect {
        matrix: u8,
        level: u8,
        destination: u16,
        source: u16,
    },
    /// Unsolicited report of the current source of a destination.
    Tally(Crosspoint),
    /// The router's confirmation of a connect it has performed.
    Connected(Crosspoint),
    /// Ask for the destination table of one (matrix, level).
    TallyDumpRequest { matrix: u8, level: u8 },
    /// Dump block carrying one 7-bit source per destination, starting at
    /// destination 0. Sources above 127 cannot appear in this form.
    TallyDumpByte {
        matrix: u8,
        level: u8,
        sources: Vec<u8>,
    },
    /// Dump block carrying a (multiplier, source-low) pair per destination.
    TallyDumpWord {
        matrix: u8,
        level: u8,
        entries: Vec<DumpEntry>,
    },
    /// Stage a crosspoint into a salvo group, pending a Go.
    ConnectOnGoGroupSalvo {
        matrix: u8,
        level: u8,
        destination: u16,
        source: u16,
        group: u8,
    },
    /// Fire every crosspoint staged in a salvo group.
    GoGroupSalvo { group: u8 },
    ConnectOnGoAck { group: u8 },
    GoDoneAck { group: u8, status: u8 },
    GroupSalvoInterrogate { group: u8 },
    GroupSalvoTally { group: u8, status: u8 },
    /// Structurally valid frame with a command code outside the dictionary.
    Unknown(Frame),
}

fn matrix_level(matrix: u8, level: u8) -> u8 {
    (matrix & 0x0f) << 4 | (level & 0x0f)
}

/// Packs destination-high (bits 6-4), source status (bit 3) and source-high
/// (bits 2-0) into the multiplier byte.
fn multiplier(destination: u16, source: u16, source_status: bool) -> u8 {
    let dest_high = ((destination >> 7) & 0x07) as u8;
    let src_high = ((source >> 7) & 0x07) as u8;
    dest_high << 4 | (source_status as u8) << 3 | src_high
}

fn low(addr: u16) -> u8 {
    (addr & 0x7f) as u8
}

fn join(high: u8, low: u8) -> u16 {
    ((high & 0x07) as u16) << 7 | (low & 0x7f) as u16
}

fn crosspoint_fields(input: &[u8]) -> IResult<&[u8], Crosspoint> {
    let (input, (ml, mult, dest_low, src_low)) =
        tuple((be_u8, be_u8, be_u8, be_u8))(input)?;
    Ok((
        input,
        Crosspoint {
            matrix: ml >> 4,
            level: ml & 0x0f,
            destination: join(mult >> 4, dest_low),
            source: join(mult, src_low),
            source_status: mult & 0x08 != 0,
        },
    ))
}

fn dump_pair(input: &[u8]) -> IResult<&[u8], (u8, u16, bool)> {
    let (input, (mult, src_low)) = pair(be_u8, be_u8)(input)?;
    Ok((input, (mult >> 4, join(mult, src_low), mult & 0x08 != 0)))
}

impl Message {
    /// Parse a verified frame into a typed message.
    pub fn from_frame(frame: &Frame) -> Result<Message, Error> {
        let data = frame.data.as_slice();
        let message = match frame.cmd {
            CROSSPOINT_INTERROGATE => {
                let (_, (ml, mult, dest_low)) =
                    all_consuming(tuple((be_u8, be_u8, be_u8)))(data)
                        .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::Interrogate {
                    matrix: ml >> 4,
                    level: ml & 0x0f,
                    destination: join(mult >> 4, dest_low),
                }
            }
            CROSSPOINT_CONNECT => {
                let (_, xp) =
                    all_consuming(crosspoint_fields)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::Connect {
                    matrix: xp.matrix,
                    level: xp.level,
                    destination: xp.destination,
                    source: xp.source,
                }
            }
            CROSSPOINT_TALLY => {
                let (_, xp) =
                    all_consuming(crosspoint_fields)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::Tally(xp)
            }
            CROSSPOINT_CONNECTED => {
                let (_, xp) =
                    all_consuming(crosspoint_fields)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::Connected(xp)
            }
            TALLY_DUMP_REQUEST => {
                let (_, ml) = all_consuming(be_u8)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::TallyDumpRequest {
                    matrix: ml >> 4,
                    level: ml & 0x0f,
                }
            }
            TALLY_DUMP_BYTE => {
                let (_, (ml, sources)) = all_consuming(pair(be_u8, many0(be_u8)))(data)
                    .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::TallyDumpByte {
                    matrix: ml >> 4,
                    level: ml & 0x0f,
                    sources,
                }
            }
            TALLY_DUMP_WORD => {
                let (_, (ml, pairs)) = all_consuming(pair(be_u8, many0(dump_pair)))(data)
                    .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::TallyDumpWord {
                    matrix: ml >> 4,
                    level: ml & 0x0f,
                    entries: pairs
                        .into_iter()
                        .enumerate()
                        .map(|(i, (dest_high, source, source_status))| DumpEntry {
                            destination: join(dest_high, i as u8),
                            source,
                            source_status,
                        })
                        .collect(),
                }
            }
            CONNECT_ON_GO_GROUP_SALVO => {
                let (_, (xp, group)) = all_consuming(pair(crosspoint_fields, be_u8))(data)
                    .map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::ConnectOnGoGroupSalvo {
                    matrix: xp.matrix,
                    level: xp.level,
                    destination: xp.destination,
                    source: xp.source,
                    group,
                }
            }
            GO_GROUP_SALVO => {
                let (_, group) = all_consuming(be_u8)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::GoGroupSalvo { group }
            }
            CONNECT_ON_GO_ACK => {
                let (_, group) = all_consuming(be_u8)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::ConnectOnGoAck { group }
            }
            GO_DONE_ACK => {
                let (_, (group, status)) =
                    all_consuming(pair(be_u8, be_u8))(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::GoDoneAck { group, status }
            }
            GROUP_SALVO_INTERROGATE => {
                let (_, group) = all_consuming(be_u8)(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::GroupSalvoInterrogate { group }
            }
            GROUP_SALVO_TALLY => {
                let (_, (group, status)) =
                    all_consuming(pair(be_u8, be_u8))(data).map_err(|_: nom::Err<nom::error::Error<&[u8]>>| Error::Parse)?;
                Message::GroupSalvoTally { group, status }
            }
            _ => Message::Unknown(frame.clone()),
        };

        Ok(message)
    }

    /// Serializes the message into a raw frame ready for the encoder.
    pub fn to_frame(&self) -> Frame {
        match *self {
            Message::Interrogate {
                matrix,
                level,
                destination,
            } => Frame::new(
                CROSSPOINT_INTERROGATE,
                vec![
                    matrix_level(matrix, level),
                    multiplier(destination, 0, false),
                    low(destination),
                ],
            ),
            Message::Connect {
                matrix,
                level,
                destination,
                source,
            } => Frame::new(
                CROSSPOINT_CONNECT,
                vec![
                    matrix_level(matrix, level),
                    multiplier(destination, source, false),
                    low(destination),
                    low(source),
                ],
            ),
            Message::Tally(xp) => Frame::new(CROSSPOINT_TALLY, crosspoint_data(&xp)),
            Message::Connected(xp) => Frame::new(CROSSPOINT_CONNECTED, crosspoint_data(&xp)),
            Message::TallyDumpRequest { matrix, level } => Frame::new(
                TALLY_DUMP_REQUEST,
                vec![matrix_level(matrix, level)],
            ),
            Message::TallyDumpByte {
                matrix,
                level,
                ref sources,
            } => {
                let mut data = Vec::with_capacity(sources.len() + 1);
                data.push(matrix_level(matrix, level));
                data.extend(sources.iter().map(|s| s & 0x7f));
                Frame::new(TALLY_DUMP_BYTE, data)
            }
            Message::TallyDumpWord {
                matrix,
                level,
                ref entries,
            } => {
                let mut data = Vec::with_capacity(entries.len() * 2 + 1);
                data.push(matrix_level(matrix, level));
                for e in entries {
                    data.push(multiplier(e.destination, e.source, e.source_status));
                    data.push(low(e.source));
                }
                Frame::new(TALLY_DUMP_WORD, data)
            }
            Message::ConnectOnGoGroupSalvo {
                matrix,
                level,
                destination,
                source,
                group,
            } => Frame::new(
                CONNECT_ON_GO_GROUP_SALVO,
                vec![
                    matrix_level(matrix, level),
                    multiplier(destination, source, false),
                    low(destination),
                    low(source),
                    group,
                ],
            ),
            Message::GoGroupSalvo { group } => Frame::new(GO_GROUP_SALVO, vec![group]),
            Message::ConnectOnGoAck { group } => Frame::new(CONNECT_ON_GO_ACK, vec![group]),
            Message::GoDoneAck { group, status } => {
                Frame::new(GO_DONE_ACK, vec![group, status])
            }
            Message::GroupSalvoInterrogate { group } => {
                Frame::new(GROUP_SALVO_INTERROGATE, vec![group])
            }
            Message::GroupSalvoTally { group, status } => {
                Frame::new(GROUP_SALVO_TALLY, vec![group, status])
            }
            Message::Unknown(ref frame) => frame.clone(),
        }
    }

}

fn crosspoint_data(xp: &Crosspoint) -> Vec<u8> {
    vec![
        matrix_level(xp.matrix, xp.level),
        multiplier(xp.destination, xp.source, xp.source_status),
        low(xp.destination),
        low(xp.source),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_layout() {
        let msg = Message::Connect {
            matrix: 0,
            level: 0,
            destination: 5,
            source: 10,
        };
        assert_eq!(msg.to_frame(), Frame::new(0x02, vec![0x00, 0x00, 0x05, 0x0a]));
        assert_eq!(Message::from_frame(&msg.to_frame()).unwrap(), msg);
    }

    #[test]
    fn multiplier_packing() {
        // dest 517 = 4*128 + 5, source 900 = 7*128 + 4
        let msg = Message::Connect {
            matrix: 2,
            level: 3,
            destination: 517,
            source: 900,
        };
        assert_eq!(msg.to_frame(), Frame::new(0x02, vec![0x23, 0x47, 0x05, 0x04]));
        assert_eq!(Message::from_frame(&msg.to_frame()).unwrap(), msg);
    }

    #[test]
    fn interrogate_omits_source() {
        let msg = Message::Interrogate {
            matrix: 1,
            level: 2,
            destination: 130,
        };
        assert_eq!(msg.to_frame(), Frame::new(0x01, vec![0x12, 0x10, 0x02]));
        assert_eq!(Message::from_frame(&msg.to_frame()).unwrap(), msg);
    }

    #[test]
    fn tally_with_source_status() {
        let frame = Frame::new(0x03, vec![0x11, 0x08, 0x05, 0x00]);
        assert_eq!(
            Message::from_frame(&frame).unwrap(),
            Message::Tally(Crosspoint {
                matrix: 1,
                level: 1,
                destination: 5,
                source: 0,
                source_status: true,
            })
        );
    }

    #[test]
    fn tally_truncated_is_parse_error() {
        let frame = Frame::new(0x03, vec![0x11, 0x08, 0x05]);
        assert_eq!(Message::from_frame(&frame), Err(Error::Parse));
    }

    #[test]
    fn dump_byte_block() {
        let frame = Frame::new(0x16, vec![0x21, 0x04, 0x7f, 0x00]);
        assert_eq!(
            Message::from_frame(&frame).unwrap(),
            Message::TallyDumpByte {
                matrix: 2,
                level: 1,
                sources: vec![4, 127, 0],
            }
        );
    }

    #[test]
    fn dump_word_block() {
        // dest 0 <- src 4 (status set), dest 1 <- src 130
        let frame = Frame::new(0x17, vec![0x00, 0x08, 0x04, 0x01, 0x02]);
        assert_eq!(
            Message::from_frame(&frame).unwrap(),
            Message::TallyDumpWord {
                matrix: 0,
                level: 0,
                entries: vec![
                    DumpEntry {
                        destination: 0,
                        source: 4,
                        source_status: true,
                    },
                    DumpEntry {
                        destination: 1,
                        source: 130,
                        source_status: false,
                    },
                ],
            }
        );
    }

    #[test]
    fn dump_word_block_offset_by_multiplier() {
        // A block whose multipliers carry destination-high 1 covers 128..
        let frame = Frame::new(0x17, vec![0x00, 0x10, 0x05, 0x10, 0x06]);
        match Message::from_frame(&frame).unwrap() {
            Message::TallyDumpWord { entries, .. } => {
                assert_eq!(entries[0].destination, 128);
                assert_eq!(entries[1].destination, 129);
                assert_eq!(entries[1].source, 6);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn dump_word_odd_payload_is_parse_error() {
        let frame = Frame::new(0x17, vec![0x00, 0x08]);
        assert_eq!(Message::from_frame(&frame), Err(Error::Parse));
    }

    #[test]
    fn salvo_roundtrip() {
        let msg = Message::ConnectOnGoGroupSalvo {
            matrix: 0,
            level: 1,
            destination: 12,
            source: 300,
            group: 7,
        };
        assert_eq!(Message::from_frame(&msg.to_frame()).unwrap(), msg);

        let go = Message::GoGroupSalvo { group: 7 };
        assert_eq!(go.to_frame(), Frame::new(0x79, vec![7]));
    }

    #[test]
    fn unknown_command_is_preserved() {
        let frame = Frame::new(0x42, vec![1, 2, 3]);
        assert_eq!(
            Message::from_frame(&frame).unwrap(),
            Message::Unknown(frame)
        );
    }
}
