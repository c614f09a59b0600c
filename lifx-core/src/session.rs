//! Host-driven device session: sequence numbers, pending requests, liveness and cached attributes.
//! No I/O; the host feeds datagrams and clock readings in and acts on what comes back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::identity::{random_source_id, MacAddr};
use crate::protocol::{Firmware, HardwareVersion, Hsbk, MessageType, Payload};
use crate::wire::{decode_packet, DecodeError, Header, Packet};

/// How long to wait for an ack or response before re-sending.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
/// How many times a tracked request is sent before the device is declared offline.
pub const DEFAULT_ATTEMPTS: u32 = 3;
/// Sequence numbers rotate through 0..128.
pub const SEQUENCE_MODULUS: u8 = 128;

struct PendingEntry {
    expected: MessageType,
    signal: Option<oneshot::Sender<()>>,
    result: Option<Packet>,
}

/// Outcome of arming a pending request before an attempt.
#[derive(Debug)]
pub enum Armed {
    /// A matching reply already arrived; no need to send again.
    Ready,
    /// Signal fires when a matching reply arrives.
    Waiting(oneshot::Receiver<()>),
    /// The entry is gone (session torn down).
    Gone,
}

/// In-flight requests keyed by sequence number.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<u8, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `sequence`, expecting a reply of type `expected`.
    pub fn begin(&mut self, sequence: u8, expected: MessageType) {
        self.entries.insert(
            sequence,
            PendingEntry {
                expected,
                signal: None,
                result: None,
            },
        );
    }

    pub fn contains(&self, sequence: u8) -> bool {
        self.entries.contains_key(&sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install a fresh completion signal for the next attempt.
    pub fn arm(&mut self, sequence: u8) -> Armed {
        match self.entries.get_mut(&sequence) {
            None => Armed::Gone,
            Some(entry) if entry.result.is_some() => Armed::Ready,
            Some(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.signal = Some(tx);
                Armed::Waiting(rx)
            }
        }
    }

    /// Store `packet` as the result of its pending entry if sequence, type and source all match.
    /// Hands the packet back when it is not consumed.
    pub fn complete(&mut self, packet: Packet, source: u32) -> Result<u8, Packet> {
        let sequence = packet.header.sequence;
        let Some(entry) = self.entries.get_mut(&sequence) else {
            return Err(packet);
        };
        if entry.expected != packet.kind() || packet.header.source != source {
            return Err(packet);
        }
        entry.result = Some(packet);
        if let Some(signal) = entry.signal.take() {
            let _ = signal.send(());
        }
        Ok(sequence)
    }

    /// Remove the entry and return its captured result, if any.
    pub fn take(&mut self, sequence: u8) -> Option<Packet> {
        self.entries.remove(&sequence).and_then(|e| e.result)
    }

    /// Drop every entry; waiting attempts observe a closed signal.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Registration transition for the host to relay to the roster owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Registered,
    Unregistered,
}

/// What a received datagram turned out to be.
#[derive(Debug)]
pub enum Inbound {
    /// Completed the pending request with this sequence number.
    Matched(u8),
    /// Decoded but not a reply to anything we are waiting for.
    Unsolicited(Packet),
    /// Could not be decoded.
    Malformed(DecodeError),
}

/// Result of [`SessionCore::on_datagram`].
#[derive(Debug)]
pub struct Received {
    pub inbound: Inbound,
    pub roster: Option<RosterChange>,
}

/// Cached device attributes. `None` means "not fetched yet", never "empty".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub label: Option<String>,
    pub location: Option<String>,
    pub group: Option<String>,
    pub power_level: Option<u16>,
    pub color: Option<Hsbk>,
    pub version: Option<HardwareVersion>,
    pub host_firmware: Option<Firmware>,
    pub wifi_firmware: Option<Firmware>,
    pub infrared_brightness: Option<u16>,
    pub color_zones: Option<Vec<Option<Hsbk>>>,
}

impl Attributes {
    /// Fold a state message into the cache. Other payloads are ignored.
    pub fn apply(&mut self, payload: &Payload) {
        match payload {
            Payload::StateLabel { label } => self.label = Some(label.to_string()),
            Payload::StateLocation(m) => self.location = Some(m.label.to_string()),
            Payload::StateGroup(m) => self.group = Some(m.label.to_string()),
            Payload::StatePower { level } | Payload::LightStatePower { level } => {
                self.power_level = Some(*level)
            }
            Payload::LightState {
                color,
                power,
                label,
            } => {
                self.color = Some(*color);
                self.power_level = Some(*power);
                self.label = Some(label.to_string());
            }
            Payload::StateVersion(v) => self.version = Some(*v),
            Payload::StateHostFirmware(fw) => self.host_firmware = Some(*fw),
            Payload::StateWifiFirmware(fw) => self.wifi_firmware = Some(*fw),
            Payload::LightStateInfrared { brightness } => {
                self.infrared_brightness = Some(*brightness)
            }
            Payload::MultiZoneStateZone {
                count,
                index,
                color,
            } => self.merge_zones(*count, *index, std::slice::from_ref(color)),
            Payload::MultiZoneStateMultiZone {
                count,
                index,
                colors,
            } => self.merge_zones(*count, *index, colors),
            _ => {}
        }
    }

    /// Partial updates are merged: zones outside `index..index + colors.len()` keep their value.
    fn merge_zones(&mut self, count: u8, index: u8, colors: &[Hsbk]) {
        let count = usize::from(count);
        let zones = self.color_zones.get_or_insert_with(Vec::new);
        if zones.len() < count {
            zones.resize(count, None);
        }
        for (i, c) in colors.iter().enumerate() {
            let idx = usize::from(index) + i;
            if idx < count {
                zones[idx] = Some(*c);
            }
        }
    }
}

/// Per-device bookkeeping. Host owns the transport and timers.
pub struct SessionCore {
    target: MacAddr,
    source: u32,
    sequence: u8,
    pending: PendingTable,
    registered: bool,
    last_seen: Option<Instant>,
    liveness_window: Duration,
    /// Best-effort cache; see [`Attributes`].
    pub attributes: Attributes,
}

impl SessionCore {
    pub fn new(target: MacAddr) -> Self {
        Self::with_source(target, random_source_id())
    }

    pub fn with_source(target: MacAddr, source: u32) -> Self {
        Self {
            target,
            source,
            sequence: 0,
            pending: PendingTable::new(),
            registered: false,
            last_seen: None,
            liveness_window: DEFAULT_TIMEOUT,
            attributes: Attributes::default(),
        }
    }

    pub fn target(&self) -> MacAddr {
        self.target
    }

    pub fn source(&self) -> u32 {
        self.source
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    /// Window during which a received datagram blocks unregistration.
    pub fn set_liveness_window(&mut self, window: Duration) {
        self.liveness_window = window;
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Next sequence number, skipping any still in flight. `None` when all 128 are pending.
    pub fn next_sequence(&mut self) -> Option<u8> {
        for _ in 0..SEQUENCE_MODULUS {
            self.sequence = (self.sequence + 1) % SEQUENCE_MODULUS;
            if !self.pending.contains(self.sequence) {
                return Some(self.sequence);
            }
        }
        None
    }

    /// Untracked packet: sequence 0, neither ack nor response requested.
    pub fn build_untracked(&self, payload: Payload) -> Packet {
        Packet::new(Header::new(self.target, self.source, 0), payload)
    }

    /// Allocate a sequence number and register a pending entry expecting `expected`.
    /// Acknowledgement is the expected type when only an ack is requested.
    /// `None` when every sequence number is already in flight.
    pub fn begin_request(
        &mut self,
        payload: Payload,
        ack_required: bool,
        res_required: bool,
        expected: MessageType,
    ) -> Option<Packet> {
        let sequence = self.next_sequence()?;
        self.pending.begin(sequence, expected);
        let header = Header::new(self.target, self.source, sequence)
            .with_ack(ack_required)
            .with_response(res_required);
        Some(Packet::new(header, payload))
    }

    pub fn arm(&mut self, sequence: u8) -> Armed {
        self.pending.arm(sequence)
    }

    /// Remove a finished request and return its reply.
    pub fn finish(&mut self, sequence: u8) -> Option<Packet> {
        self.pending.take(sequence)
    }

    /// Give up on `sequence` after the last attempt timed out.
    pub fn abandon(&mut self, sequence: u8) {
        self.pending.take(sequence);
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Handle one datagram from the device's transport. Any datagram counts as liveness.
    pub fn on_datagram(&mut self, bytes: &[u8], now: Instant) -> Received {
        let roster = self.register();
        self.last_seen = Some(now);
        let inbound = match decode_packet(bytes) {
            Ok(packet) => self.on_packet(packet),
            Err(e) => Inbound::Malformed(e),
        };
        Received { inbound, roster }
    }

    /// Correlate a decoded packet with the pending table.
    pub fn on_packet(&mut self, packet: Packet) -> Inbound {
        match self.pending.complete(packet, self.source) {
            Ok(sequence) => Inbound::Matched(sequence),
            Err(packet) => {
                if matches!(
                    packet.kind(),
                    MessageType::MultiZoneStateZone | MessageType::MultiZoneStateMultiZone
                ) && packet.header.source == self.source
                {
                    self.attributes.apply(&packet.payload);
                }
                Inbound::Unsolicited(packet)
            }
        }
    }

    /// Idempotent: reports a change only when flipping from unregistered.
    pub fn register(&mut self) -> Option<RosterChange> {
        if self.registered {
            return None;
        }
        self.registered = true;
        Some(RosterChange::Registered)
    }

    /// Takes effect only if nothing was received within the liveness window.
    pub fn unregister(&mut self, now: Instant) -> Option<RosterChange> {
        if !self.registered {
            return None;
        }
        if let Some(seen) = self.last_seen {
            if now.saturating_duration_since(seen) < self.liveness_window {
                return None;
            }
        }
        self.registered = false;
        Some(RosterChange::Unregistered)
    }
}
