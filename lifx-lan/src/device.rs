//! Device session: one bulb's unicast transport, request workflows and cached attributes.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lifx_core::{
    encode_packet, ApplicationRequest, Armed, Attributes, EncodeError, Firmware,
    HardwareVersion, Hsbk, Inbound, Label, MacAddr, MessageType, Packet, Payload, RadioInfo,
    RosterChange, SessionCore, TimeInfo, Waveform, DEFAULT_ATTEMPTS, DEFAULT_TIMEOUT, POWER_OFF,
    POWER_ON,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Pause between repeated fire-and-forget sends; devices ingest about 20 messages per second.
pub const FIRE_INTERVAL: Duration = Duration::from_millis(50);

const RECV_BUFFER: usize = 4096;

/// Per-call overrides. `None` falls back to the session defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Wait per attempt.
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// How a state change is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transition {
    /// Fade duration in milliseconds.
    pub duration_ms: u32,
    /// Fire-and-forget a single untracked send instead of waiting for an ack.
    pub rapid: bool,
}

impl Transition {
    pub fn over(duration_ms: u32) -> Self {
        Self {
            duration_ms,
            rapid: false,
        }
    }

    pub fn rapid(mut self) -> Self {
        self.rapid = true;
        self
    }
}

/// Parameters of `LightSetWaveform`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformEffect {
    pub transient: bool,
    pub color: Hsbk,
    /// Cycle length in milliseconds.
    pub period: u32,
    pub cycles: f32,
    pub skew_ratio: i16,
    pub waveform: Waveform,
}

/// Error surfaced by a tracked request.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device {0} did not answer")]
    Offline(MacAddr),
    #[error("device session closed")]
    Cancelled,
    #[error("all sequence numbers are in flight")]
    Saturated,
    #[error("encode: {0}")]
    Encode(#[from] EncodeError),
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(MessageType),
}

/// Roster change relayed from a device to its owner.
#[derive(Debug, Clone)]
pub enum RosterEvent {
    Registered(Device),
    Unregistered(Device),
}

impl RosterEvent {
    pub fn device(&self) -> &Device {
        match self {
            RosterEvent::Registered(d) | RosterEvent::Unregistered(d) => d,
        }
    }
}

struct Transport {
    socket: Arc<UdpSocket>,
    recv_task: JoinHandle<()>,
}

struct Inner {
    mac: MacAddr,
    session: Mutex<SessionCore>,
    endpoint: Mutex<SocketAddr>,
    transport: Mutex<Option<Transport>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    unsolicited: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    roster: Option<mpsc::UnboundedSender<RosterEvent>>,
    defaults: RequestOptions,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(t) = self.transport.get_mut().take() {
            t.recv_task.abort();
        }
        for h in self.background.get_mut().drain(..) {
            h.abort();
        }
    }
}

/// Handle to one device session. Clones share the session.
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("mac", &self.inner.mac).finish()
    }
}

impl Device {
    /// Unbound session for `mac` at `endpoint`. Call [`Device::connect`] to open its transport.
    pub fn new(
        mac: MacAddr,
        endpoint: SocketAddr,
        defaults: RequestOptions,
        roster: Option<mpsc::UnboundedSender<RosterEvent>>,
    ) -> Self {
        let mut session = SessionCore::new(mac);
        session.set_liveness_window(defaults.timeout.unwrap_or(DEFAULT_TIMEOUT));
        Self {
            inner: Arc::new(Inner {
                mac,
                session: Mutex::new(session),
                endpoint: Mutex::new(endpoint),
                transport: Mutex::new(None),
                background: Mutex::new(Vec::new()),
                unsolicited: Mutex::new(None),
                roster,
                defaults,
            }),
        }
    }

    pub fn mac(&self) -> MacAddr {
        self.inner.mac
    }

    pub async fn endpoint(&self) -> SocketAddr {
        *self.inner.endpoint.lock().await
    }

    pub async fn source(&self) -> u32 {
        self.inner.session.lock().await.source()
    }

    pub async fn is_registered(&self) -> bool {
        self.inner.session.lock().await.is_registered()
    }

    /// True when both handles refer to the same session.
    pub fn same_session(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Snapshot of the cached attributes.
    pub async fn attributes(&self) -> Attributes {
        self.inner.session.lock().await.attributes.clone()
    }

    /// Receive packets that are not replies to a pending request. Replaces any earlier subscriber.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.unsolicited.lock().await = Some(tx);
        rx
    }

    //
    // Transport
    //

    /// Open a unicast transport to the current endpoint and start receiving. Registers the device.
    pub async fn connect(&self) -> io::Result<()> {
        let endpoint = self.endpoint().await;
        let local: SocketAddr = if endpoint.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(endpoint).await?;
        let socket = Arc::new(socket);
        let recv_task = tokio::spawn(recv_loop(Arc::downgrade(&self.inner), socket.clone()));
        let old = self.inner.transport.lock().await.replace(Transport { socket, recv_task });
        if let Some(old) = old {
            old.recv_task.abort();
        }
        debug!(mac = %self.mac(), %endpoint, "device transport open");
        self.register().await;
        Ok(())
    }

    /// Move the session to a new endpoint. Identity, cache and in-flight requests survive.
    pub async fn rebind(&self, endpoint: SocketAddr) -> io::Result<()> {
        self.close_transport().await;
        *self.inner.endpoint.lock().await = endpoint;
        self.connect().await
    }

    /// Tear down transport and background sends; suspended requests fail with `Cancelled`.
    pub async fn close(&self) {
        self.close_transport().await;
        for h in self.inner.background.lock().await.drain(..) {
            h.abort();
        }
        self.inner.session.lock().await.clear_pending();
    }

    async fn close_transport(&self) {
        if let Some(t) = self.inner.transport.lock().await.take() {
            t.recv_task.abort();
        }
    }

    async fn send_bytes(&self, bytes: &[u8]) -> bool {
        let socket = match self.inner.transport.lock().await.as_ref() {
            Some(t) => t.socket.clone(),
            None => return false,
        };
        match socket.send(bytes).await {
            Ok(_) => true,
            Err(e) => {
                debug!(mac = %self.mac(), error = %e, "send failed");
                false
            }
        }
    }

    async fn handle_datagram(&self, bytes: &[u8]) {
        let received = self
            .inner
            .session
            .lock()
            .await
            .on_datagram(bytes, Instant::now());
        self.notify(received.roster);
        match received.inbound {
            Inbound::Matched(seq) => trace!(mac = %self.mac(), seq, "reply matched"),
            Inbound::Unsolicited(packet) => {
                let sub = self.inner.unsolicited.lock().await;
                match sub.as_ref() {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => trace!(mac = %self.mac(), kind = ?packet.kind(), "unsolicited dropped"),
                }
            }
            Inbound::Malformed(e) => debug!(mac = %self.mac(), error = %e, "malformed datagram"),
        }
    }

    //
    // Registration
    //

    pub async fn register(&self) {
        let change = self.inner.session.lock().await.register();
        self.notify(change);
    }

    /// No-op while a datagram arrived within the liveness window.
    pub async fn unregister(&self) {
        let change = self.inner.session.lock().await.unregister(Instant::now());
        self.notify(change);
    }

    fn notify(&self, change: Option<RosterChange>) {
        let (Some(change), Some(tx)) = (change, self.inner.roster.as_ref()) else {
            return;
        };
        let event = match change {
            RosterChange::Registered => RosterEvent::Registered(self.clone()),
            RosterChange::Unregistered => RosterEvent::Unregistered(self.clone()),
        };
        let _ = tx.send(event);
    }

    //
    // Workflows
    //

    /// Send an untracked copy of `payload` `num_repeats` times (default: the attempt count),
    /// `FIRE_INTERVAL` apart, without waiting for anything.
    pub async fn fire_and_forget(&self, payload: Payload, num_repeats: Option<u32>) {
        let packet = self.inner.session.lock().await.build_untracked(payload);
        let bytes = match encode_packet(&packet) {
            Ok(b) => b,
            Err(e) => {
                warn!(mac = %self.mac(), error = %e, "fire-and-forget not sent");
                return;
            }
        };
        let repeats = num_repeats
            .or(self.inner.defaults.max_attempts)
            .unwrap_or(DEFAULT_ATTEMPTS);
        let device = self.clone();
        let handle = tokio::spawn(async move {
            for i in 0..repeats {
                device.send_bytes(&bytes).await;
                if i + 1 < repeats {
                    tokio::time::sleep(FIRE_INTERVAL).await;
                }
            }
        });
        let mut background = self.inner.background.lock().await;
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Tracked send expecting an Acknowledgement.
    pub async fn request_with_ack(
        &self,
        payload: Payload,
        opts: RequestOptions,
    ) -> Result<Packet, DeviceError> {
        let packet = self.inner.session.lock().await.begin_request(
            payload,
            true,
            false,
            MessageType::Acknowledgement,
        );
        self.try_sending(packet.ok_or(DeviceError::Saturated)?, opts)
            .await
    }

    /// Tracked send expecting a reply of type `expected`.
    pub async fn request_with_response(
        &self,
        payload: Payload,
        expected: MessageType,
        opts: RequestOptions,
    ) -> Result<Packet, DeviceError> {
        let packet = self
            .inner
            .session
            .lock()
            .await
            .begin_request(payload, false, true, expected);
        self.try_sending(packet.ok_or(DeviceError::Saturated)?, opts)
            .await
    }

    /// Tracked send requesting both; completes on the typed reply.
    pub async fn request_with_ack_response(
        &self,
        payload: Payload,
        expected: MessageType,
        opts: RequestOptions,
    ) -> Result<Packet, DeviceError> {
        let packet = self
            .inner
            .session
            .lock()
            .await
            .begin_request(payload, true, true, expected);
        self.try_sending(packet.ok_or(DeviceError::Saturated)?, opts)
            .await
    }

    /// Send on the same sequence number until a matching reply arrives or attempts run out.
    async fn try_sending(&self, packet: Packet, opts: RequestOptions) -> Result<Packet, DeviceError> {
        let seq = packet.header.sequence;
        let timeout = opts
            .timeout
            .or(self.inner.defaults.timeout)
            .unwrap_or(DEFAULT_TIMEOUT);
        let max_attempts = opts
            .max_attempts
            .or(self.inner.defaults.max_attempts)
            .unwrap_or(DEFAULT_ATTEMPTS)
            .max(1);
        let bytes = match encode_packet(&packet) {
            Ok(b) => b,
            Err(e) => {
                self.inner.session.lock().await.abandon(seq);
                return Err(e.into());
            }
        };

        for attempt in 1..=max_attempts {
            let armed = self.inner.session.lock().await.arm(seq);
            let signal = match armed {
                Armed::Ready => return self.finish(seq).await,
                Armed::Gone => return Err(DeviceError::Cancelled),
                Armed::Waiting(rx) => rx,
            };
            self.send_bytes(&bytes).await;
            match tokio::time::timeout(timeout, signal).await {
                Ok(Ok(())) => return self.finish(seq).await,
                Ok(Err(_)) => return Err(DeviceError::Cancelled),
                Err(_) => trace!(mac = %self.mac(), seq, attempt, "attempt timed out"),
            }
        }

        self.inner.session.lock().await.abandon(seq);
        debug!(mac = %self.mac(), seq, max_attempts, "no reply, device offline");
        self.unregister().await;
        Err(DeviceError::Offline(self.mac()))
    }

    async fn finish(&self, seq: u8) -> Result<Packet, DeviceError> {
        self.inner
            .session
            .lock()
            .await
            .finish(seq)
            .ok_or(DeviceError::Cancelled)
    }

    /// Query and fold the reply into the cache.
    async fn refresh(
        &self,
        get: Payload,
        state: MessageType,
        opts: RequestOptions,
    ) -> Result<Payload, DeviceError> {
        let reply = self.request_with_response(get, state, opts).await?;
        self.inner
            .session
            .lock()
            .await
            .attributes
            .apply(&reply.payload);
        Ok(reply.payload)
    }

    async fn cached<T>(&self, f: impl FnOnce(&Attributes) -> Option<T>) -> Option<T> {
        f(&self.inner.session.lock().await.attributes)
    }

    async fn update_cache(&self, f: impl FnOnce(&mut Attributes)) {
        f(&mut self.inner.session.lock().await.attributes)
    }

    /// Cache-aside: query only while `field` is unset.
    async fn cached_or_fetch<T>(
        &self,
        field: impl Fn(&Attributes) -> Option<T>,
        get: Payload,
        state: MessageType,
        opts: RequestOptions,
    ) -> Result<T, DeviceError> {
        if let Some(v) = self.cached(&field).await {
            return Ok(v);
        }
        self.refresh(get, state, opts).await?;
        self.cached(&field)
            .await
            .ok_or(DeviceError::UnexpectedReply(state))
    }

    //
    // Attributes
    //

    pub async fn get_label(&self, opts: RequestOptions) -> Result<String, DeviceError> {
        self.cached_or_fetch(
            |a| a.label.clone(),
            Payload::GetLabel,
            MessageType::StateLabel,
            opts,
        )
        .await
    }

    /// Labels longer than 32 bytes are truncated.
    pub async fn set_label(&self, label: &str, opts: RequestOptions) -> Result<(), DeviceError> {
        let label = Label::new(label);
        self.request_with_ack(
            Payload::SetLabel {
                label: label.clone(),
            },
            opts,
        )
        .await?;
        self.update_cache(|a| a.label = Some(label.to_string()))
            .await;
        Ok(())
    }

    pub async fn get_location(&self, opts: RequestOptions) -> Result<String, DeviceError> {
        self.cached_or_fetch(
            |a| a.location.clone(),
            Payload::GetLocation,
            MessageType::StateLocation,
            opts,
        )
        .await
    }

    pub async fn get_group(&self, opts: RequestOptions) -> Result<String, DeviceError> {
        self.cached_or_fetch(
            |a| a.group.clone(),
            Payload::GetGroup,
            MessageType::StateGroup,
            opts,
        )
        .await
    }

    pub async fn get_version(&self, opts: RequestOptions) -> Result<HardwareVersion, DeviceError> {
        self.cached_or_fetch(
            |a| a.version,
            Payload::GetVersion,
            MessageType::StateVersion,
            opts,
        )
        .await
    }

    pub async fn get_host_firmware(&self, opts: RequestOptions) -> Result<Firmware, DeviceError> {
        self.cached_or_fetch(
            |a| a.host_firmware,
            Payload::GetHostFirmware,
            MessageType::StateHostFirmware,
            opts,
        )
        .await
    }

    pub async fn get_wifi_firmware(&self, opts: RequestOptions) -> Result<Firmware, DeviceError> {
        self.cached_or_fetch(
            |a| a.wifi_firmware,
            Payload::GetWifiFirmware,
            MessageType::StateWifiFirmware,
            opts,
        )
        .await
    }

    /// Signal and counters change constantly; never cached.
    pub async fn get_host_info(&self, opts: RequestOptions) -> Result<RadioInfo, DeviceError> {
        match self
            .request_with_response(Payload::GetHostInfo, MessageType::StateHostInfo, opts)
            .await?
            .payload
        {
            Payload::StateHostInfo(info) => Ok(info),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    pub async fn get_wifi_info(&self, opts: RequestOptions) -> Result<RadioInfo, DeviceError> {
        match self
            .request_with_response(Payload::GetWifiInfo, MessageType::StateWifiInfo, opts)
            .await?
            .payload
        {
            Payload::StateWifiInfo(info) => Ok(info),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    pub async fn get_info(&self, opts: RequestOptions) -> Result<TimeInfo, DeviceError> {
        match self
            .request_with_response(Payload::GetInfo, MessageType::StateInfo, opts)
            .await?
            .payload
        {
            Payload::StateInfo(info) => Ok(info),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    pub async fn echo(&self, data: [u8; 64], opts: RequestOptions) -> Result<[u8; 64], DeviceError> {
        match self
            .request_with_response(
                Payload::EchoRequest { payload: data },
                MessageType::EchoResponse,
                opts,
            )
            .await?
            .payload
        {
            Payload::EchoResponse { payload } => Ok(payload),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    /// Label, location, version, group and both firmwares, fetched concurrently.
    pub async fn get_metadata(&self, opts: RequestOptions) -> Result<Attributes, DeviceError> {
        tokio::try_join!(
            self.get_label(opts),
            self.get_location(opts),
            self.get_version(opts),
            self.get_group(opts),
            self.get_wifi_firmware(opts),
            self.get_host_firmware(opts),
        )?;
        Ok(self.attributes().await)
    }

    //
    // Light state
    //

    /// Always queried; power changes outside this client.
    pub async fn get_power(&self, opts: RequestOptions) -> Result<u16, DeviceError> {
        match self
            .refresh(Payload::LightGetPower, MessageType::LightStatePower, opts)
            .await?
        {
            Payload::LightStatePower { level } => Ok(level),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    /// Returns the power level now cached (65535 for on, 0 for off).
    pub async fn set_power(
        &self,
        on: bool,
        transition: Transition,
        opts: RequestOptions,
    ) -> Result<u16, DeviceError> {
        let level = if on { POWER_ON } else { POWER_OFF };
        let payload = Payload::LightSetPower {
            level,
            duration: transition.duration_ms,
        };
        if transition.rapid {
            self.fire_and_forget(payload, Some(1)).await;
        } else {
            self.request_with_ack(payload, opts).await?;
        }
        self.update_cache(|a| a.power_level = Some(level)).await;
        Ok(level)
    }

    /// Queries `LightState`, which also refreshes cached power and label.
    pub async fn get_color(&self, opts: RequestOptions) -> Result<Hsbk, DeviceError> {
        match self
            .refresh(Payload::LightGet, MessageType::LightState, opts)
            .await?
        {
            Payload::LightState { color, .. } => Ok(color),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    /// The cache only takes `color` once the device acknowledged it (or, when rapid, once sent).
    pub async fn set_color(
        &self,
        color: Hsbk,
        transition: Transition,
        opts: RequestOptions,
    ) -> Result<Hsbk, DeviceError> {
        let payload = Payload::LightSetColor {
            color,
            duration: transition.duration_ms,
        };
        if transition.rapid {
            self.fire_and_forget(payload, Some(1)).await;
        } else {
            self.request_with_ack(payload, opts).await?;
        }
        self.update_cache(|a| a.color = Some(color)).await;
        Ok(color)
    }

    pub async fn set_waveform(
        &self,
        effect: WaveformEffect,
        rapid: bool,
        opts: RequestOptions,
    ) -> Result<(), DeviceError> {
        let payload = Payload::LightSetWaveform {
            transient: effect.transient,
            color: effect.color,
            period: effect.period,
            cycles: effect.cycles,
            skew_ratio: effect.skew_ratio,
            waveform: effect.waveform,
        };
        if rapid {
            self.fire_and_forget(payload, Some(1)).await;
        } else {
            self.request_with_ack(payload, opts).await?;
        }
        Ok(())
    }

    pub async fn get_infrared(&self, opts: RequestOptions) -> Result<u16, DeviceError> {
        match self
            .refresh(
                Payload::LightGetInfrared,
                MessageType::LightStateInfrared,
                opts,
            )
            .await?
        {
            Payload::LightStateInfrared { brightness } => Ok(brightness),
            other => Err(DeviceError::UnexpectedReply(other.kind())),
        }
    }

    pub async fn set_infrared(
        &self,
        brightness: u16,
        rapid: bool,
        opts: RequestOptions,
    ) -> Result<u16, DeviceError> {
        let payload = Payload::LightSetInfrared { brightness };
        if rapid {
            self.fire_and_forget(payload, Some(1)).await;
        } else {
            self.request_with_ack(payload, opts).await?;
        }
        self.update_cache(|a| a.infrared_brightness = Some(brightness))
            .await;
        Ok(brightness)
    }

    //
    // Multizone
    //

    /// Query zones `start..=end` (default `start + 8`). The first reply completes the call;
    /// replies for further zones merge into the cache as they arrive.
    pub async fn get_color_zones(
        &self,
        start: u8,
        end: Option<u8>,
        opts: RequestOptions,
    ) -> Result<Vec<Option<Hsbk>>, DeviceError> {
        let end = end.unwrap_or(start.saturating_add(8));
        let expected = if end == start {
            MessageType::MultiZoneStateZone
        } else {
            MessageType::MultiZoneStateMultiZone
        };
        self.refresh(
            Payload::MultiZoneGetColorZones {
                start_index: start,
                end_index: end,
            },
            expected,
            opts,
        )
        .await?;
        Ok(self
            .cached(|a| a.color_zones.clone())
            .await
            .unwrap_or_default())
    }

    pub async fn set_color_zones(
        &self,
        start: u8,
        end: u8,
        color: Hsbk,
        apply: ApplicationRequest,
        transition: Transition,
        opts: RequestOptions,
    ) -> Result<(), DeviceError> {
        let payload = Payload::MultiZoneSetColorZones {
            start_index: start,
            end_index: end,
            color,
            duration: transition.duration_ms,
            apply,
        };
        if transition.rapid {
            self.fire_and_forget(payload, Some(1)).await;
        } else {
            self.request_with_ack(payload, opts).await?;
        }
        Ok(())
    }
}

/// Drives one device's inbound datagrams. Holds only a weak reference so dropping every
/// handle ends the session.
async fn recv_loop(device: Weak<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let result = socket.recv(&mut buf).await;
        let Some(inner) = device.upgrade() else {
            return;
        };
        let device_handle = Device { inner };
        match result {
            Ok(n) => device_handle.handle_datagram(&buf[..n]).await,
            // ICMP port unreachable surfaces on the next recv of a connected socket.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(mac = %device_handle.mac(), "endpoint refused datagram");
                device_handle.unregister().await;
            }
            Err(e) => {
                warn!(mac = %device_handle.mac(), error = %e, "device transport failed");
                device_handle.unregister().await;
                return;
            }
        }
    }
}
