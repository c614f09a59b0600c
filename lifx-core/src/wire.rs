//! Framing: fixed 36-byte little-endian header (frame, frame address, protocol header) + payload.

use crate::identity::MacAddr;
use crate::protocol::{decode_payload, encode_payload, MessageType, Payload};

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 36;
/// Protocol number carried in every frame.
pub const PROTOCOL_NUMBER: u16 = 1024;

const ADDRESSABLE_BIT: u16 = 1 << 12;
const TAGGED_BIT: u16 = 1 << 13;
const PROTOCOL_MASK: u16 = 0x0fff;
const RES_REQUIRED_BIT: u8 = 0x01;
const ACK_REQUIRED_BIT: u8 = 0x02;

/// Header fields that vary between messages. Size, origin, addressable, protocol and the
/// reserved areas are fixed and computed on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tagged: bool,
    pub source: u32,
    pub target: MacAddr,
    pub ack_required: bool,
    pub res_required: bool,
    pub sequence: u8,
}

impl Header {
    /// Header addressed to `target`; tagged when `target` is the broadcast sentinel.
    pub fn new(target: MacAddr, source: u32, sequence: u8) -> Self {
        Self {
            tagged: target.is_broadcast(),
            source,
            target,
            ack_required: false,
            res_required: false,
            sequence,
        }
    }

    pub fn with_ack(mut self, ack_required: bool) -> Self {
        self.ack_required = ack_required;
        self
    }

    pub fn with_response(mut self, res_required: bool) -> Self {
        self.res_required = res_required;
        self
    }
}

/// One protocol datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub header: Header,
    pub payload: Payload,
}

impl Packet {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }
}

/// Encode a packet: payload first, then the header carrying the total size.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, EncodeError> {
    let mut payload = Vec::new();
    encode_payload(&packet.payload, &mut payload);
    let size = HEADER_SIZE + payload.len();
    let size = u16::try_from(size).map_err(|_| EncodeError::TooLarge(size))?;

    let h = &packet.header;
    let mut flags = PROTOCOL_NUMBER & PROTOCOL_MASK | ADDRESSABLE_BIT;
    if h.tagged || h.target.is_broadcast() {
        flags |= TAGGED_BIT;
    }
    let mut response = 0u8;
    if h.ack_required {
        response |= ACK_REQUIRED_BIT;
    }
    if h.res_required {
        response |= RES_REQUIRED_BIT;
    }

    let mut out = Vec::with_capacity(size as usize);
    // Frame
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&h.source.to_le_bytes());
    // Frame address
    out.extend_from_slice(&h.target.to_wire().to_le_bytes());
    out.extend_from_slice(&[0u8; 6]);
    out.push(response);
    out.push(h.sequence);
    // Protocol header
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&packet.kind().code().to_le_bytes());
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("packet of {0} bytes exceeds the 16-bit size field")]
    TooLarge(usize),
}

/// Decode one datagram. Nothing is returned unless the whole packet parses.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated {
            needed: Some(HEADER_SIZE),
            got: bytes.len(),
        });
    }
    let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    if size < HEADER_SIZE || size > bytes.len() {
        return Err(DecodeError::SizeMismatch {
            declared: size,
            actual: bytes.len(),
        });
    }
    let flags = u16::from_le_bytes([bytes[2], bytes[3]]);
    let protocol = flags & PROTOCOL_MASK;
    if protocol != PROTOCOL_NUMBER {
        return Err(DecodeError::UnsupportedProtocol(protocol));
    }
    let source = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let mut target = [0u8; 8];
    target.copy_from_slice(&bytes[8..16]);
    let response = bytes[22];
    let sequence = bytes[23];
    let code = u16::from_le_bytes([bytes[32], bytes[33]]);
    let kind = MessageType::from_code(code).ok_or(DecodeError::UnknownMessageType(code))?;
    let payload = decode_payload(kind, &bytes[HEADER_SIZE..size])?;

    Ok(Packet {
        header: Header {
            tagged: flags & TAGGED_BIT != 0,
            source,
            target: MacAddr::from_wire(u64::from_le_bytes(target)),
            ack_required: response & ACK_REQUIRED_BIT != 0,
            res_required: response & RES_REQUIRED_BIT != 0,
            sequence,
        },
        payload,
    })
}

/// Error decoding a datagram (truncated, inconsistent size, unknown type, bad field).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated: got {got} bytes")]
    Truncated { needed: Option<usize>, got: usize },
    #[error("size field {declared} does not fit datagram of {actual} bytes")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("unsupported protocol number {0}")]
    UnsupportedProtocol(u16),
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("invalid value {1} for field {0}")]
    InvalidField(&'static str, u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        decode_payload, encode_payload, ApplicationRequest, Firmware, HardwareVersion, Hsbk,
        Label, Membership, RadioInfo, Service, TimeInfo, Waveform, POWER_OFF, POWER_ON,
    };

    fn mac() -> MacAddr {
        "d0:73:d5:01:02:03".parse().unwrap()
    }

    #[test]
    fn roundtrip_set_power() {
        let header = Header::new(mac(), 0xdead_beef, 5).with_ack(true);
        let packet = Packet::new(
            header,
            Payload::LightSetPower {
                level: POWER_ON,
                duration: 0,
            },
        );
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 6);
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn size_field_matches_length() {
        for payload in [
            Payload::GetService,
            Payload::SetLabel {
                label: Label::new("Lamp"),
            },
            Payload::LightSetColor {
                color: Hsbk::new(1, 2, 3, 4),
                duration: 1000,
            },
        ] {
            let bytes = encode_packet(&Packet::new(Header::new(mac(), 1, 1), payload)).unwrap();
            let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
            assert_eq!(size, bytes.len());
        }
    }

    #[test]
    fn get_service_broadcast_layout() {
        let header = Header::new(MacAddr::BROADCAST, 0x0403_0201, 0).with_response(true);
        let bytes = encode_packet(&Packet::new(header, Payload::GetService)).unwrap();
        let expected: [u8; 36] = [
            0x24, 0x00, // size
            0x00, 0x34, // protocol 1024, addressable, tagged
            0x01, 0x02, 0x03, 0x04, // source
            0, 0, 0, 0, 0, 0, 0, 0, // target
            0, 0, 0, 0, 0, 0, // reserved
            0x01, // res_required
            0x00, // sequence
            0, 0, 0, 0, 0, 0, 0, 0, // reserved
            0x02, 0x00, // type
            0, 0, // reserved
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn broadcast_target_forces_tagged() {
        let mut header = Header::new(MacAddr::BROADCAST, 7, 0);
        header.tagged = false;
        let bytes = encode_packet(&Packet::new(header, Payload::GetService)).unwrap();
        assert!(decode_packet(&bytes).unwrap().header.tagged);

        let bytes = encode_packet(&Packet::new(Header::new(mac(), 7, 0), Payload::GetLabel)).unwrap();
        assert!(!decode_packet(&bytes).unwrap().header.tagged);
    }

    #[test]
    fn ack_and_response_bits() {
        let header = Header::new(mac(), 7, 9).with_ack(true).with_response(true);
        let bytes = encode_packet(&Packet::new(header, Payload::GetPower)).unwrap();
        assert_eq!(bytes[22], 0x03);
        assert_eq!(bytes[23], 9);
        let decoded = decode_packet(&bytes).unwrap();
        assert!(decoded.header.ack_required && decoded.header.res_required);
    }

    #[test]
    fn truncated_header() {
        let bytes = encode_packet(&Packet::new(Header::new(mac(), 1, 1), Payload::GetService)).unwrap();
        assert!(matches!(
            decode_packet(&bytes[..20]),
            Err(DecodeError::Truncated { got: 20, .. })
        ));
    }

    #[test]
    fn truncated_payload() {
        let packet = Packet::new(
            Header::new(mac(), 1, 1),
            Payload::StateService {
                service: Service::Udp,
                port: 56700,
            },
        );
        let mut bytes = encode_packet(&packet).unwrap();
        bytes.truncate(HEADER_SIZE + 2);
        bytes[0] = (HEADER_SIZE + 2) as u8;
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn size_larger_than_datagram() {
        let mut bytes =
            encode_packet(&Packet::new(Header::new(mac(), 1, 1), Payload::GetService)).unwrap();
        bytes[0] = 40;
        assert_eq!(
            decode_packet(&bytes),
            Err(DecodeError::SizeMismatch {
                declared: 40,
                actual: 36
            })
        );
    }

    #[test]
    fn unknown_type_and_protocol() {
        let mut bytes =
            encode_packet(&Packet::new(Header::new(mac(), 1, 1), Payload::GetService)).unwrap();
        bytes[32] = 0xff;
        bytes[33] = 0x7f;
        assert_eq!(
            decode_packet(&bytes),
            Err(DecodeError::UnknownMessageType(0x7fff))
        );

        let mut bytes =
            encode_packet(&Packet::new(Header::new(mac(), 1, 1), Payload::GetService)).unwrap();
        bytes[3] = (bytes[3] & 0xf0) | 0x05;
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn trailing_bytes_beyond_size_ignored() {
        let packet = Packet::new(Header::new(mac(), 3, 4), Payload::Acknowledgement);
        let mut bytes = encode_packet(&packet).unwrap();
        bytes.extend_from_slice(&[0xaa; 4]);
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    fn sample(kind: MessageType) -> Payload {
        use MessageType as T;
        let color = Hsbk::new(21845, 65535, 32768, 3500);
        let radio = RadioInfo {
            signal: 3.2e-5,
            tx: 1200,
            rx: 3400,
        };
        let firmware = Firmware {
            build: 1_536_000_000_000_000_000,
            version: (2 << 16) | 80,
        };
        let membership = Membership {
            id: [0xa5; 16],
            label: Label::new("Upstairs"),
            updated_at: 1_600_000_000_000_000_000,
        };
        match kind {
            T::GetService => Payload::GetService,
            T::StateService => Payload::StateService {
                service: Service::Udp,
                port: 56700,
            },
            T::GetHostInfo => Payload::GetHostInfo,
            T::StateHostInfo => Payload::StateHostInfo(radio),
            T::GetHostFirmware => Payload::GetHostFirmware,
            T::StateHostFirmware => Payload::StateHostFirmware(firmware),
            T::GetWifiInfo => Payload::GetWifiInfo,
            T::StateWifiInfo => Payload::StateWifiInfo(radio),
            T::GetWifiFirmware => Payload::GetWifiFirmware,
            T::StateWifiFirmware => Payload::StateWifiFirmware(firmware),
            T::GetPower => Payload::GetPower,
            T::SetPower => Payload::SetPower { level: POWER_ON },
            T::StatePower => Payload::StatePower { level: POWER_OFF },
            T::GetLabel => Payload::GetLabel,
            T::SetLabel => Payload::SetLabel {
                label: Label::new("Kitchen"),
            },
            T::StateLabel => Payload::StateLabel {
                label: Label::new("Hall"),
            },
            T::GetVersion => Payload::GetVersion,
            T::StateVersion => Payload::StateVersion(HardwareVersion {
                vendor: 1,
                product: 31,
                version: 0,
            }),
            T::GetInfo => Payload::GetInfo,
            T::StateInfo => Payload::StateInfo(TimeInfo {
                time: 1_700_000_000_000_000_000,
                uptime: 86_400_000_000_000,
                downtime: 5_000_000_000,
            }),
            T::Acknowledgement => Payload::Acknowledgement,
            T::GetLocation => Payload::GetLocation,
            T::StateLocation => Payload::StateLocation(membership.clone()),
            T::GetGroup => Payload::GetGroup,
            T::StateGroup => Payload::StateGroup(membership),
            T::EchoRequest => Payload::EchoRequest { payload: [0x3c; 64] },
            T::EchoResponse => Payload::EchoResponse { payload: [0xc3; 64] },
            T::LightGet => Payload::LightGet,
            T::LightSetColor => Payload::LightSetColor {
                color,
                duration: 1500,
            },
            T::LightSetWaveform => Payload::LightSetWaveform {
                transient: true,
                color,
                period: 1000,
                cycles: 2.5,
                skew_ratio: -8192,
                waveform: Waveform::Triangle,
            },
            T::LightState => Payload::LightState {
                color,
                power: POWER_ON,
                label: Label::new("Desk"),
            },
            T::LightGetPower => Payload::LightGetPower,
            T::LightSetPower => Payload::LightSetPower {
                level: POWER_OFF,
                duration: 250,
            },
            T::LightStatePower => Payload::LightStatePower { level: POWER_ON },
            T::LightGetInfrared => Payload::LightGetInfrared,
            T::LightStateInfrared => Payload::LightStateInfrared { brightness: 1234 },
            T::LightSetInfrared => Payload::LightSetInfrared { brightness: 65535 },
            T::MultiZoneSetColorZones => Payload::MultiZoneSetColorZones {
                start_index: 2,
                end_index: 9,
                color,
                duration: 100,
                apply: ApplicationRequest::ApplyOnly,
            },
            T::MultiZoneGetColorZones => Payload::MultiZoneGetColorZones {
                start_index: 0,
                end_index: 255,
            },
            T::MultiZoneStateZone => Payload::MultiZoneStateZone {
                count: 16,
                index: 3,
                color,
            },
            T::MultiZoneStateMultiZone => Payload::MultiZoneStateMultiZone {
                count: 16,
                index: 8,
                colors: [
                    color,
                    Hsbk::new(0, 0, 65535, 2700),
                    color,
                    Hsbk::new(1, 2, 3, 9000),
                    color,
                    color,
                    Hsbk::default(),
                    color,
                ],
            },
        }
    }

    #[test]
    fn every_message_type_roundtrips() {
        let mut seen = 0;
        for code in 0..=1024u16 {
            let Some(kind) = MessageType::from_code(code) else {
                continue;
            };
            seen += 1;
            let payload = sample(kind);
            assert_eq!(payload.kind(), kind);

            let mut body = Vec::new();
            encode_payload(&payload, &mut body);
            assert_eq!(decode_payload(kind, &body).unwrap(), payload, "{kind:?}");

            let header = Header::new(mac(), 0x1234_5678, (code % 128) as u8)
                .with_ack(code % 2 == 0)
                .with_response(code % 3 == 0);
            let packet = Packet::new(header, payload);
            let bytes = encode_packet(&packet).unwrap();
            assert_eq!(bytes.len(), HEADER_SIZE + body.len(), "{kind:?}");
            assert_eq!(decode_packet(&bytes).unwrap(), packet, "{kind:?}");
        }
        assert_eq!(seen, 41);
    }
}
