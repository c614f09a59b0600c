//! Message catalog: type codes, payload schemas and their little-endian byte layout.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::wire::DecodeError;

/// Well-known UDP port for discovery and device traffic.
pub const LIFX_PORT: u16 = 56700;

/// Width of fixed-size label fields.
pub const LABEL_SIZE: usize = 32;

/// Number of zones carried by one multizone state message.
pub const ZONES_PER_MESSAGE: usize = 8;

macro_rules! message_types {
    ( $( $name:ident = $code:literal ),* $(,)? ) => {
        /// Message type code: identifies the payload schema of a packet.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $( $name ),*
        }

        impl MessageType {
            pub fn code(self) -> u16 {
                match self {
                    $( MessageType::$name => $code ),*
                }
            }

            pub fn from_code(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(MessageType::$name), )*
                    _ => None,
                }
            }
        }
    };
}

message_types! {
    GetService = 2,
    StateService = 3,
    GetHostInfo = 12,
    StateHostInfo = 13,
    GetHostFirmware = 14,
    StateHostFirmware = 15,
    GetWifiInfo = 16,
    StateWifiInfo = 17,
    GetWifiFirmware = 18,
    StateWifiFirmware = 19,
    GetPower = 20,
    SetPower = 21,
    StatePower = 22,
    GetLabel = 23,
    SetLabel = 24,
    StateLabel = 25,
    GetVersion = 32,
    StateVersion = 33,
    GetInfo = 34,
    StateInfo = 35,
    Acknowledgement = 45,
    GetLocation = 48,
    StateLocation = 50,
    GetGroup = 51,
    StateGroup = 53,
    EchoRequest = 58,
    EchoResponse = 59,
    LightGet = 101,
    LightSetColor = 102,
    LightSetWaveform = 103,
    LightState = 107,
    LightGetPower = 116,
    LightSetPower = 117,
    LightStatePower = 118,
    LightGetInfrared = 120,
    LightStateInfrared = 121,
    LightSetInfrared = 122,
    MultiZoneSetColorZones = 501,
    MultiZoneGetColorZones = 502,
    MultiZoneStateZone = 503,
    MultiZoneStateMultiZone = 506,
}

/// Power level reported for "on".
pub const POWER_ON: u16 = 65535;
/// Power level reported for "off".
pub const POWER_OFF: u16 = 0;

/// Hue, saturation, brightness, kelvin. Each component spans the full u16 range except kelvin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hsbk {
    pub hue: u16,
    pub saturation: u16,
    pub brightness: u16,
    pub kelvin: u16,
}

impl Hsbk {
    pub fn new(hue: u16, saturation: u16, brightness: u16, kelvin: u16) -> Self {
        Self {
            hue,
            saturation,
            brightness,
            kelvin,
        }
    }
}

/// Waveform used by `LightSetWaveform`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Saw = 0,
    Sine = 1,
    HalfSine = 2,
    Triangle = 3,
    Pulse = 4,
}

impl TryFrom<u8> for Waveform {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Waveform::Saw,
            1 => Waveform::Sine,
            2 => Waveform::HalfSine,
            3 => Waveform::Triangle,
            4 => Waveform::Pulse,
            x => return Err(DecodeError::InvalidField("waveform", u64::from(x))),
        })
    }
}

/// Service advertised in `StateService`. Only UDP is usable by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Udp,
    Other(u8),
}

impl From<u8> for Service {
    fn from(v: u8) -> Self {
        match v {
            1 => Service::Udp,
            x => Service::Other(x),
        }
    }
}

impl From<Service> for u8 {
    fn from(s: Service) -> u8 {
        match s {
            Service::Udp => 1,
            Service::Other(x) => x,
        }
    }
}

/// Whether a multizone change is applied now or buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationRequest {
    NoApply = 0,
    Apply = 1,
    ApplyOnly = 2,
}

impl TryFrom<u8> for ApplicationRequest {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => ApplicationRequest::NoApply,
            1 => ApplicationRequest::Apply,
            2 => ApplicationRequest::ApplyOnly,
            x => return Err(DecodeError::InvalidField("apply", u64::from(x))),
        })
    }
}

/// Fixed-width, NUL padded label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Label(String);

impl Label {
    /// Truncates to 32 bytes, backing off to a char boundary.
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(LABEL_SIZE);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        Label(s[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn to_field(&self) -> [u8; LABEL_SIZE] {
        let mut out = [0u8; LABEL_SIZE];
        let n = self.0.len().min(LABEL_SIZE);
        out[..n].copy_from_slice(&self.0.as_bytes()[..n]);
        out
    }

    fn from_field(field: &[u8; LABEL_SIZE]) -> Self {
        let end = field.iter().position(|&b| b == 0).unwrap_or(LABEL_SIZE);
        Label(String::from_utf8_lossy(&field[..end]).into_owned())
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Signal and traffic counters (`StateHostInfo`, `StateWifiInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RadioInfo {
    /// Signal strength in milliwatts.
    pub signal: f32,
    pub tx: u32,
    pub rx: u32,
}

/// Firmware build and version (`StateHostFirmware`, `StateWifiFirmware`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Firmware {
    /// Build timestamp, nanoseconds since the epoch.
    pub build: u64,
    pub version: u32,
}

impl Firmware {
    pub fn major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn minor(&self) -> u16 {
        (self.version & 0xffff) as u16
    }
}

/// Hardware identification (`StateVersion`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareVersion {
    pub vendor: u32,
    pub product: u32,
    pub version: u32,
}

/// Clock and uptime (`StateInfo`), all in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeInfo {
    pub time: u64,
    pub uptime: u64,
    pub downtime: u64,
}

/// Location or group membership (`StateLocation`, `StateGroup`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Membership {
    pub id: [u8; 16],
    pub label: Label,
    pub updated_at: u64,
}

/// Typed payload of every supported message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    GetService,
    StateService { service: Service, port: u32 },
    GetHostInfo,
    StateHostInfo(RadioInfo),
    GetHostFirmware,
    StateHostFirmware(Firmware),
    GetWifiInfo,
    StateWifiInfo(RadioInfo),
    GetWifiFirmware,
    StateWifiFirmware(Firmware),
    GetPower,
    SetPower { level: u16 },
    StatePower { level: u16 },
    GetLabel,
    SetLabel { label: Label },
    StateLabel { label: Label },
    GetVersion,
    StateVersion(HardwareVersion),
    GetInfo,
    StateInfo(TimeInfo),
    Acknowledgement,
    GetLocation,
    StateLocation(Membership),
    GetGroup,
    StateGroup(Membership),
    EchoRequest { payload: [u8; 64] },
    EchoResponse { payload: [u8; 64] },
    LightGet,
    LightSetColor { color: Hsbk, duration: u32 },
    LightSetWaveform {
        transient: bool,
        color: Hsbk,
        period: u32,
        cycles: f32,
        skew_ratio: i16,
        waveform: Waveform,
    },
    LightState { color: Hsbk, power: u16, label: Label },
    LightGetPower,
    LightSetPower { level: u16, duration: u32 },
    LightStatePower { level: u16 },
    LightGetInfrared,
    LightStateInfrared { brightness: u16 },
    LightSetInfrared { brightness: u16 },
    MultiZoneSetColorZones {
        start_index: u8,
        end_index: u8,
        color: Hsbk,
        duration: u32,
        apply: ApplicationRequest,
    },
    MultiZoneGetColorZones { start_index: u8, end_index: u8 },
    MultiZoneStateZone { count: u8, index: u8, color: Hsbk },
    MultiZoneStateMultiZone {
        count: u8,
        index: u8,
        colors: [Hsbk; ZONES_PER_MESSAGE],
    },
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        use MessageType as T;
        match self {
            Payload::GetService => T::GetService,
            Payload::StateService { .. } => T::StateService,
            Payload::GetHostInfo => T::GetHostInfo,
            Payload::StateHostInfo(_) => T::StateHostInfo,
            Payload::GetHostFirmware => T::GetHostFirmware,
            Payload::StateHostFirmware(_) => T::StateHostFirmware,
            Payload::GetWifiInfo => T::GetWifiInfo,
            Payload::StateWifiInfo(_) => T::StateWifiInfo,
            Payload::GetWifiFirmware => T::GetWifiFirmware,
            Payload::StateWifiFirmware(_) => T::StateWifiFirmware,
            Payload::GetPower => T::GetPower,
            Payload::SetPower { .. } => T::SetPower,
            Payload::StatePower { .. } => T::StatePower,
            Payload::GetLabel => T::GetLabel,
            Payload::SetLabel { .. } => T::SetLabel,
            Payload::StateLabel { .. } => T::StateLabel,
            Payload::GetVersion => T::GetVersion,
            Payload::StateVersion(_) => T::StateVersion,
            Payload::GetInfo => T::GetInfo,
            Payload::StateInfo(_) => T::StateInfo,
            Payload::Acknowledgement => T::Acknowledgement,
            Payload::GetLocation => T::GetLocation,
            Payload::StateLocation(_) => T::StateLocation,
            Payload::GetGroup => T::GetGroup,
            Payload::StateGroup(_) => T::StateGroup,
            Payload::EchoRequest { .. } => T::EchoRequest,
            Payload::EchoResponse { .. } => T::EchoResponse,
            Payload::LightGet => T::LightGet,
            Payload::LightSetColor { .. } => T::LightSetColor,
            Payload::LightSetWaveform { .. } => T::LightSetWaveform,
            Payload::LightState { .. } => T::LightState,
            Payload::LightGetPower => T::LightGetPower,
            Payload::LightSetPower { .. } => T::LightSetPower,
            Payload::LightStatePower { .. } => T::LightStatePower,
            Payload::LightGetInfrared => T::LightGetInfrared,
            Payload::LightStateInfrared { .. } => T::LightStateInfrared,
            Payload::LightSetInfrared { .. } => T::LightSetInfrared,
            Payload::MultiZoneSetColorZones { .. } => T::MultiZoneSetColorZones,
            Payload::MultiZoneGetColorZones { .. } => T::MultiZoneGetColorZones,
            Payload::MultiZoneStateZone { .. } => T::MultiZoneStateZone,
            Payload::MultiZoneStateMultiZone { .. } => T::MultiZoneStateMultiZone,
        }
    }
}

/// Append the little-endian payload bytes of `payload` to `out`.
pub fn encode_payload(payload: &Payload, out: &mut Vec<u8>) {
    // Writes into a Vec are infallible.
    let _ = write_payload(payload, out);
}

fn write_payload(payload: &Payload, w: &mut Vec<u8>) -> std::io::Result<()> {
    match payload {
        Payload::GetService
        | Payload::GetHostInfo
        | Payload::GetHostFirmware
        | Payload::GetWifiInfo
        | Payload::GetWifiFirmware
        | Payload::GetPower
        | Payload::GetLabel
        | Payload::GetVersion
        | Payload::GetInfo
        | Payload::Acknowledgement
        | Payload::GetLocation
        | Payload::GetGroup
        | Payload::LightGet
        | Payload::LightGetPower
        | Payload::LightGetInfrared => {}
        Payload::StateService { service, port } => {
            w.write_u8((*service).into())?;
            w.write_u32::<LittleEndian>(*port)?;
        }
        Payload::StateHostInfo(info) | Payload::StateWifiInfo(info) => {
            w.write_f32::<LittleEndian>(info.signal)?;
            w.write_u32::<LittleEndian>(info.tx)?;
            w.write_u32::<LittleEndian>(info.rx)?;
            w.write_i16::<LittleEndian>(0)?;
        }
        Payload::StateHostFirmware(fw) | Payload::StateWifiFirmware(fw) => {
            w.write_u64::<LittleEndian>(fw.build)?;
            w.write_u64::<LittleEndian>(0)?;
            w.write_u32::<LittleEndian>(fw.version)?;
        }
        Payload::SetPower { level }
        | Payload::StatePower { level }
        | Payload::LightStatePower { level } => w.write_u16::<LittleEndian>(*level)?,
        Payload::SetLabel { label } | Payload::StateLabel { label } => {
            w.extend_from_slice(&label.to_field())
        }
        Payload::StateVersion(v) => {
            w.write_u32::<LittleEndian>(v.vendor)?;
            w.write_u32::<LittleEndian>(v.product)?;
            w.write_u32::<LittleEndian>(v.version)?;
        }
        Payload::StateInfo(t) => {
            w.write_u64::<LittleEndian>(t.time)?;
            w.write_u64::<LittleEndian>(t.uptime)?;
            w.write_u64::<LittleEndian>(t.downtime)?;
        }
        Payload::StateLocation(m) | Payload::StateGroup(m) => {
            w.extend_from_slice(&m.id);
            w.extend_from_slice(&m.label.to_field());
            w.write_u64::<LittleEndian>(m.updated_at)?;
        }
        Payload::EchoRequest { payload } | Payload::EchoResponse { payload } => {
            w.extend_from_slice(payload)
        }
        Payload::LightSetColor { color, duration } => {
            w.write_u8(0)?;
            write_hsbk(w, color)?;
            w.write_u32::<LittleEndian>(*duration)?;
        }
        Payload::LightSetWaveform {
            transient,
            color,
            period,
            cycles,
            skew_ratio,
            waveform,
        } => {
            w.write_u8(0)?;
            w.write_u8(u8::from(*transient))?;
            write_hsbk(w, color)?;
            w.write_u32::<LittleEndian>(*period)?;
            w.write_f32::<LittleEndian>(*cycles)?;
            w.write_i16::<LittleEndian>(*skew_ratio)?;
            w.write_u8(*waveform as u8)?;
        }
        Payload::LightState {
            color,
            power,
            label,
        } => {
            write_hsbk(w, color)?;
            w.write_i16::<LittleEndian>(0)?;
            w.write_u16::<LittleEndian>(*power)?;
            w.extend_from_slice(&label.to_field());
            w.write_u64::<LittleEndian>(0)?;
        }
        Payload::LightSetPower { level, duration } => {
            w.write_u16::<LittleEndian>(*level)?;
            w.write_u32::<LittleEndian>(*duration)?;
        }
        Payload::LightStateInfrared { brightness } | Payload::LightSetInfrared { brightness } => {
            w.write_u16::<LittleEndian>(*brightness)?
        }
        Payload::MultiZoneSetColorZones {
            start_index,
            end_index,
            color,
            duration,
            apply,
        } => {
            w.write_u8(*start_index)?;
            w.write_u8(*end_index)?;
            write_hsbk(w, color)?;
            w.write_u32::<LittleEndian>(*duration)?;
            w.write_u8(*apply as u8)?;
        }
        Payload::MultiZoneGetColorZones {
            start_index,
            end_index,
        } => {
            w.write_u8(*start_index)?;
            w.write_u8(*end_index)?;
        }
        Payload::MultiZoneStateZone {
            count,
            index,
            color,
        } => {
            w.write_u8(*count)?;
            w.write_u8(*index)?;
            write_hsbk(w, color)?;
        }
        Payload::MultiZoneStateMultiZone {
            count,
            index,
            colors,
        } => {
            w.write_u8(*count)?;
            w.write_u8(*index)?;
            for c in colors {
                write_hsbk(w, c)?;
            }
        }
    }
    Ok(())
}

fn write_hsbk(w: &mut Vec<u8>, c: &Hsbk) -> std::io::Result<()> {
    w.write_u16::<LittleEndian>(c.hue)?;
    w.write_u16::<LittleEndian>(c.saturation)?;
    w.write_u16::<LittleEndian>(c.brightness)?;
    w.write_u16::<LittleEndian>(c.kelvin)
}

/// Decode the payload bytes of a message of type `kind`.
/// Short input is `Truncated`; trailing bytes are ignored.
pub fn decode_payload(kind: MessageType, bytes: &[u8]) -> Result<Payload, DecodeError> {
    let mut r = Cursor::new(bytes);
    read_payload(kind, &mut r).map_err(|e| match e {
        PayloadError::Short => DecodeError::Truncated {
            needed: None,
            got: bytes.len(),
        },
        PayloadError::Decode(d) => d,
    })
}

/// Reads over an in-memory cursor only fail by running out of bytes.
enum PayloadError {
    Short,
    Decode(DecodeError),
}

impl From<std::io::Error> for PayloadError {
    fn from(_: std::io::Error) -> Self {
        PayloadError::Short
    }
}

impl From<DecodeError> for PayloadError {
    fn from(e: DecodeError) -> Self {
        PayloadError::Decode(e)
    }
}

fn read_payload(kind: MessageType, r: &mut Cursor<&[u8]>) -> Result<Payload, PayloadError> {
    use MessageType as T;
    let payload = match kind {
        T::GetService => Payload::GetService,
        T::StateService => Payload::StateService {
            service: r.read_u8()?.into(),
            port: r.read_u32::<LittleEndian>()?,
        },
        T::GetHostInfo => Payload::GetHostInfo,
        T::StateHostInfo => Payload::StateHostInfo(read_radio(r)?),
        T::GetHostFirmware => Payload::GetHostFirmware,
        T::StateHostFirmware => Payload::StateHostFirmware(read_firmware(r)?),
        T::GetWifiInfo => Payload::GetWifiInfo,
        T::StateWifiInfo => Payload::StateWifiInfo(read_radio(r)?),
        T::GetWifiFirmware => Payload::GetWifiFirmware,
        T::StateWifiFirmware => Payload::StateWifiFirmware(read_firmware(r)?),
        T::GetPower => Payload::GetPower,
        T::SetPower => Payload::SetPower {
            level: r.read_u16::<LittleEndian>()?,
        },
        T::StatePower => Payload::StatePower {
            level: r.read_u16::<LittleEndian>()?,
        },
        T::GetLabel => Payload::GetLabel,
        T::SetLabel => Payload::SetLabel {
            label: read_label(r)?,
        },
        T::StateLabel => Payload::StateLabel {
            label: read_label(r)?,
        },
        T::GetVersion => Payload::GetVersion,
        T::StateVersion => Payload::StateVersion(HardwareVersion {
            vendor: r.read_u32::<LittleEndian>()?,
            product: r.read_u32::<LittleEndian>()?,
            version: r.read_u32::<LittleEndian>()?,
        }),
        T::GetInfo => Payload::GetInfo,
        T::StateInfo => Payload::StateInfo(TimeInfo {
            time: r.read_u64::<LittleEndian>()?,
            uptime: r.read_u64::<LittleEndian>()?,
            downtime: r.read_u64::<LittleEndian>()?,
        }),
        T::Acknowledgement => Payload::Acknowledgement,
        T::GetLocation => Payload::GetLocation,
        T::StateLocation => Payload::StateLocation(read_membership(r)?),
        T::GetGroup => Payload::GetGroup,
        T::StateGroup => Payload::StateGroup(read_membership(r)?),
        T::EchoRequest => Payload::EchoRequest {
            payload: read_array(r)?,
        },
        T::EchoResponse => Payload::EchoResponse {
            payload: read_array(r)?,
        },
        T::LightGet => Payload::LightGet,
        T::LightSetColor => {
            r.read_u8()?;
            Payload::LightSetColor {
                color: read_hsbk(r)?,
                duration: r.read_u32::<LittleEndian>()?,
            }
        }
        T::LightSetWaveform => {
            r.read_u8()?;
            Payload::LightSetWaveform {
                transient: r.read_u8()? != 0,
                color: read_hsbk(r)?,
                period: r.read_u32::<LittleEndian>()?,
                cycles: r.read_f32::<LittleEndian>()?,
                skew_ratio: r.read_i16::<LittleEndian>()?,
                waveform: Waveform::try_from(r.read_u8()?)?,
            }
        }
        T::LightState => {
            let color = read_hsbk(r)?;
            r.read_i16::<LittleEndian>()?;
            let power = r.read_u16::<LittleEndian>()?;
            let label = read_label(r)?;
            r.read_u64::<LittleEndian>()?;
            Payload::LightState {
                color,
                power,
                label,
            }
        }
        T::LightGetPower => Payload::LightGetPower,
        T::LightSetPower => Payload::LightSetPower {
            level: r.read_u16::<LittleEndian>()?,
            duration: r.read_u32::<LittleEndian>()?,
        },
        T::LightStatePower => Payload::LightStatePower {
            level: r.read_u16::<LittleEndian>()?,
        },
        T::LightGetInfrared => Payload::LightGetInfrared,
        T::LightStateInfrared => Payload::LightStateInfrared {
            brightness: r.read_u16::<LittleEndian>()?,
        },
        T::LightSetInfrared => Payload::LightSetInfrared {
            brightness: r.read_u16::<LittleEndian>()?,
        },
        T::MultiZoneSetColorZones => Payload::MultiZoneSetColorZones {
            start_index: r.read_u8()?,
            end_index: r.read_u8()?,
            color: read_hsbk(r)?,
            duration: r.read_u32::<LittleEndian>()?,
            apply: ApplicationRequest::try_from(r.read_u8()?)?,
        },
        T::MultiZoneGetColorZones => Payload::MultiZoneGetColorZones {
            start_index: r.read_u8()?,
            end_index: r.read_u8()?,
        },
        T::MultiZoneStateZone => Payload::MultiZoneStateZone {
            count: r.read_u8()?,
            index: r.read_u8()?,
            color: read_hsbk(r)?,
        },
        T::MultiZoneStateMultiZone => {
            let count = r.read_u8()?;
            let index = r.read_u8()?;
            let mut colors = [Hsbk::default(); ZONES_PER_MESSAGE];
            for c in colors.iter_mut() {
                *c = read_hsbk(r)?;
            }
            Payload::MultiZoneStateMultiZone {
                count,
                index,
                colors,
            }
        }
    };
    Ok(payload)
}

fn read_hsbk(r: &mut Cursor<&[u8]>) -> std::io::Result<Hsbk> {
    Ok(Hsbk {
        hue: r.read_u16::<LittleEndian>()?,
        saturation: r.read_u16::<LittleEndian>()?,
        brightness: r.read_u16::<LittleEndian>()?,
        kelvin: r.read_u16::<LittleEndian>()?,
    })
}

fn read_array<const N: usize>(r: &mut Cursor<&[u8]>) -> std::io::Result<[u8; N]> {
    let mut out = [0u8; N];
    r.read_exact(&mut out)?;
    Ok(out)
}

fn read_label(r: &mut Cursor<&[u8]>) -> std::io::Result<Label> {
    Ok(Label::from_field(&read_array(r)?))
}

fn read_radio(r: &mut Cursor<&[u8]>) -> std::io::Result<RadioInfo> {
    let info = RadioInfo {
        signal: r.read_f32::<LittleEndian>()?,
        tx: r.read_u32::<LittleEndian>()?,
        rx: r.read_u32::<LittleEndian>()?,
    };
    r.read_i16::<LittleEndian>()?;
    Ok(info)
}

fn read_firmware(r: &mut Cursor<&[u8]>) -> std::io::Result<Firmware> {
    let build = r.read_u64::<LittleEndian>()?;
    r.read_u64::<LittleEndian>()?;
    Ok(Firmware {
        build,
        version: r.read_u32::<LittleEndian>()?,
    })
}

fn read_membership(r: &mut Cursor<&[u8]>) -> std::io::Result<Membership> {
    Ok(Membership {
        id: read_array(r)?,
        label: read_label(r)?,
        updated_at: r.read_u64::<LittleEndian>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(p: &Payload) -> Vec<u8> {
        let mut out = Vec::new();
        encode_payload(p, &mut out);
        out
    }

    #[test]
    fn codes_map_both_ways() {
        for code in 0..=600u16 {
            if let Some(t) = MessageType::from_code(code) {
                assert_eq!(t.code(), code);
            }
        }
        assert_eq!(MessageType::from_code(45), Some(MessageType::Acknowledgement));
        assert_eq!(MessageType::from_code(9999), None);
    }

    #[test]
    fn representative_payloads_roundtrip() {
        let color = Hsbk::new(21845, 65535, 32768, 3500);
        let samples = vec![
            Payload::GetService,
            Payload::StateService {
                service: Service::Udp,
                port: 56700,
            },
            Payload::StateHostInfo(RadioInfo {
                signal: 1.5e-6,
                tx: 10,
                rx: 20,
            }),
            Payload::StateWifiFirmware(Firmware {
                build: 1_500_000_000_000_000_000,
                version: (2 << 16) | 75,
            }),
            Payload::LightSetPower {
                level: POWER_ON,
                duration: 250,
            },
            Payload::SetLabel {
                label: Label::new("Kitchen"),
            },
            Payload::StateGroup(Membership {
                id: [7; 16],
                label: Label::new("Downstairs"),
                updated_at: 42,
            }),
            Payload::EchoRequest { payload: [9; 64] },
            Payload::LightSetWaveform {
                transient: true,
                color,
                period: 100,
                cycles: 30.0,
                skew_ratio: -16384,
                waveform: Waveform::Pulse,
            },
            Payload::LightState {
                color,
                power: POWER_OFF,
                label: Label::new("Desk"),
            },
            Payload::MultiZoneSetColorZones {
                start_index: 0,
                end_index: 7,
                color,
                duration: 0,
                apply: ApplicationRequest::Apply,
            },
            Payload::MultiZoneStateMultiZone {
                count: 16,
                index: 8,
                colors: [color; ZONES_PER_MESSAGE],
            },
        ];
        for p in samples {
            let bytes = encoded(&p);
            let back = decode_payload(p.kind(), &bytes).unwrap();
            assert_eq!(back, p);
        }
    }

    #[test]
    fn payload_sizes_match_protocol() {
        assert_eq!(encoded(&Payload::Acknowledgement).len(), 0);
        assert_eq!(
            encoded(&Payload::StateService {
                service: Service::Udp,
                port: 1
            })
            .len(),
            5
        );
        assert_eq!(
            encoded(&Payload::LightSetColor {
                color: Hsbk::default(),
                duration: 0
            })
            .len(),
            13
        );
        assert_eq!(
            encoded(&Payload::LightState {
                color: Hsbk::default(),
                power: 0,
                label: Label::default()
            })
            .len(),
            52
        );
        assert_eq!(
            encoded(&Payload::MultiZoneStateMultiZone {
                count: 0,
                index: 0,
                colors: [Hsbk::default(); ZONES_PER_MESSAGE]
            })
            .len(),
            66
        );
    }

    #[test]
    fn label_truncates_on_char_boundary() {
        let long = "é".repeat(20);
        let label = Label::new(&long);
        assert!(label.as_str().len() <= LABEL_SIZE);
        assert_eq!(label.as_str().len(), 32);
        let label = Label::new(&format!("a{}", long));
        assert_eq!(label.as_str().len(), 31);
    }

    #[test]
    fn label_strips_padding() {
        let bytes = encoded(&Payload::StateLabel {
            label: Label::new("Porch"),
        });
        assert_eq!(bytes.len(), LABEL_SIZE);
        match decode_payload(MessageType::StateLabel, &bytes).unwrap() {
            Payload::StateLabel { label } => assert_eq!(label.as_str(), "Porch"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hsbk_serde_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Scene {
            color: Hsbk,
        }
        let scene = Scene {
            color: Hsbk::new(43690, 65535, 49151, 4000),
        };
        let text = toml::to_string(&scene).unwrap();
        assert!(text.contains("kelvin = 4000"));
        assert_eq!(toml::from_str::<Scene>(&text).unwrap(), scene);
    }

    #[test]
    fn short_payload_is_truncated() {
        let err = decode_payload(MessageType::StatePower, &[1]).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { needed: None, got: 1 });
        let err = decode_payload(MessageType::StateHostFirmware, &[0; 12]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: None,
                got: 12
            }
        );
    }

    #[test]
    fn bad_enum_value_is_invalid_field() {
        let mut bytes = encoded(&Payload::LightSetWaveform {
            transient: false,
            color: Hsbk::default(),
            period: 0,
            cycles: 0.0,
            skew_ratio: 0,
            waveform: Waveform::Saw,
        });
        *bytes.last_mut().unwrap() = 9;
        let err = decode_payload(MessageType::LightSetWaveform, &bytes).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField("waveform", 9)));
    }
}
