//! LIFX LAN protocol core.
//! Host-driven: no sockets or timers; the host passes datagrams and clock readings in.

pub mod identity;
pub mod protocol;
pub mod session;
pub mod wire;

pub use identity::{random_source_id, MacAddr, MacParseError};
pub use protocol::{
    ApplicationRequest, Firmware, HardwareVersion, Hsbk, Label, Membership, MessageType, Payload,
    RadioInfo, Service, TimeInfo, Waveform, LIFX_PORT, POWER_OFF, POWER_ON,
};
pub use session::{
    Armed, Attributes, Inbound, PendingTable, Received, RosterChange, SessionCore,
    DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT,
};
pub use wire::{decode_packet, encode_packet, DecodeError, EncodeError, Header, Packet};
