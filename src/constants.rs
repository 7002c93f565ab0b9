use std::time::Duration;

pub const DLE: u8 = 0x10u8;
pub const STX: u8 = 0x02u8;
pub const ETX: u8 = 0x03u8;
pub const ACK: u8 = 0x06u8;
pub const NAK: u8 = 0x15u8;

// Controller -> router commands
pub const CROSSPOINT_INTERROGATE: u8 = 0x01u8;
pub const CROSSPOINT_CONNECT: u8 = 0x02u8;
pub const TALLY_DUMP_REQUEST: u8 = 0x15u8;
pub const CONNECT_ON_GO_GROUP_SALVO: u8 = 0x78u8;
pub const GO_GROUP_SALVO: u8 = 0x79u8;
pub const GROUP_SALVO_INTERROGATE: u8 = 0x7cu8;

// Router -> controller commands
pub const CROSSPOINT_TALLY: u8 = 0x03u8;
pub const CROSSPOINT_CONNECTED: u8 = 0x04u8;
pub const TALLY_DUMP_BYTE: u8 = 0x16u8;
pub const TALLY_DUMP_WORD: u8 = 0x17u8;
pub const CONNECT_ON_GO_ACK: u8 = 0x7au8;
pub const GO_DONE_ACK: u8 = 0x7bu8;
pub const GROUP_SALVO_TALLY: u8 = 0x7du8;

/// Longest data payload the encoder will frame. SW-P-08 messages are short;
/// even a full word-format tally dump block stays under this.
pub const MAX_FRAME_DATA: usize = 120;

/// How long the link waits for a wire ACK before retransmitting.
pub const RETRY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Total transmissions of a command before it fails with [Timeout](crate::Error::Timeout).
pub const MAX_ATTEMPTS: u8 = 5;

/// Gap between successive tally dump requests during post-connect
/// reconciliation, so slow serial links are not flooded.
pub const DUMP_PACING: Duration = Duration::from_millis(100);

/// Delay between reconnection attempts after the transport drops.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Interval between `status-update` broadcasts to subscribed clients.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(5);
