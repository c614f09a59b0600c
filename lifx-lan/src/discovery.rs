//! LAN discovery: broadcast GetService probes, parse service announcements, maintain the device roster.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use lifx_core::{
    decode_packet, encode_packet, random_source_id, Header, MacAddr, Packet, Payload, Service,
    LIFX_PORT,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{Device, RequestOptions, RosterEvent};

const RECV_BUFFER: usize = 4096;

struct Shared {
    config: Config,
    registry: Mutex<HashMap<MacAddr, Device>>,
    /// Handed to every device; drained by the relay task.
    events: mpsc::UnboundedSender<RosterEvent>,
}

/// Running discovery engine. Owns the broadcast socket and the registry.
pub struct Discovery {
    shared: Arc<Shared>,
    /// `None` once closed.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    source: u32,
    recv_task: Mutex<Option<JoinHandle<io::Result<()>>>>,
    /// Probe and relay loops.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    aborts: Vec<AbortHandle>,
}

impl Discovery {
    /// Bind the broadcast socket and start probing. Roster events go to `owner` when given.
    pub async fn start(
        config: Config,
        owner: Option<mpsc::UnboundedSender<RosterEvent>>,
    ) -> io::Result<Self> {
        let socket = Arc::new(bind_broadcast(config.bind_port)?);
        let source = random_source_id();
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            registry: Mutex::new(HashMap::new()),
            events,
        });

        let dest = SocketAddr::new(IpAddr::V4(shared.config.broadcast_addr), shared.config.port);
        let probe = tokio::spawn(probe_loop(
            socket.clone(),
            source,
            dest,
            shared.config.discovery_interval_secs,
            shared.config.discovery_step(),
        ));
        let relay = tokio::spawn(relay_loop(events_rx, owner));
        let recv = tokio::spawn(recv_loop(socket.clone(), shared.clone()));
        debug!(local = ?socket.local_addr().ok(), %dest, "discovery started");

        Ok(Self {
            aborts: vec![probe.abort_handle(), relay.abort_handle(), recv.abort_handle()],
            tasks: Mutex::new(vec![probe, relay]),
            recv_task: Mutex::new(Some(recv)),
            socket: Mutex::new(Some(socket)),
            shared,
            source,
        })
    }

    /// Address of the broadcast socket. `NotConnected` after [`Discovery::close`].
    pub async fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.lock().await.as_ref() {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "discovery closed",
            )),
        }
    }

    /// Source identifier stamped on probes.
    pub fn source(&self) -> u32 {
        self.source
    }

    /// Every known device, registered or not.
    pub async fn devices(&self) -> Vec<Device> {
        let mut out: Vec<Device> = self.shared.registry.lock().await.values().cloned().collect();
        out.sort_by_key(|d| d.mac());
        out
    }

    pub async fn device(&self, mac: &MacAddr) -> Option<Device> {
        self.shared.registry.lock().await.get(mac).cloned()
    }

    /// Devices whose label equals `label`. Labels are fetched when not cached; devices that do
    /// not answer are left out.
    pub async fn devices_by_label(&self, label: &str, opts: RequestOptions) -> Vec<Device> {
        let mut out = Vec::new();
        for d in self.devices().await {
            if d.get_label(opts).await.ok().as_deref() == Some(label) {
                out.push(d);
            }
        }
        out
    }

    pub async fn devices_by_group(&self, group: &str, opts: RequestOptions) -> Vec<Device> {
        let mut out = Vec::new();
        for d in self.devices().await {
            if d.get_group(opts).await.ok().as_deref() == Some(group) {
                out.push(d);
            }
        }
        out
    }

    /// Wait for the receive loop. Returns its error if the broadcast socket failed.
    pub async fn join(&self) -> io::Result<()> {
        let handle = self.recv_task.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }

    /// Stop probing and receiving, release the broadcast socket, close every device transport
    /// and clear the registry.
    pub async fn close(&self) {
        for a in &self.aborts {
            a.abort();
        }
        // The loops hold socket clones; wait for them to unwind so the port is free on return.
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for t in tasks {
            let _ = t.await;
        }
        let recv = self.recv_task.lock().await.take();
        if let Some(recv) = recv {
            let _ = recv.await;
        }
        self.socket.lock().await.take();
        let devices: Vec<Device> = self
            .shared
            .registry
            .lock()
            .await
            .drain()
            .map(|(_, d)| d)
            .collect();
        for d in devices {
            d.close().await;
        }
        debug!("discovery closed");
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        for a in &self.aborts {
            a.abort();
        }
    }
}

fn bind_broadcast(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Tick every `step`; broadcast once the countdown (starting at zero) runs out, then reset it
/// to `interval_secs`.
async fn probe_loop(
    socket: Arc<UdpSocket>,
    source: u32,
    dest: SocketAddr,
    interval_secs: u64,
    step: Duration,
) {
    let header = Header::new(MacAddr::BROADCAST, source, 0).with_response(true);
    let frame = match encode_packet(&Packet::new(header, Payload::GetService)) {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, "probe not encodable");
            return;
        }
    };
    let mut countdown: i64 = 0;
    let mut ticker = tokio::time::interval(step);
    loop {
        ticker.tick().await;
        if countdown <= 0 {
            countdown = i64::try_from(interval_secs).unwrap_or(i64::MAX);
            match socket.send_to(&frame, dest).await {
                Ok(_) => debug!(%dest, "probe sent"),
                Err(e) => warn!(%dest, error = %e, "probe send failed"),
            }
        }
        countdown = countdown.saturating_sub(step.as_secs() as i64);
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) -> io::Result<()> {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => shared.on_datagram(&buf[..n], from).await,
            Err(e) => {
                warn!(error = %e, "discovery socket failed");
                return Err(e);
            }
        }
    }
}

async fn relay_loop(
    mut events: mpsc::UnboundedReceiver<RosterEvent>,
    owner: Option<mpsc::UnboundedSender<RosterEvent>>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            RosterEvent::Registered(d) => debug!(mac = %d.mac(), "registered"),
            RosterEvent::Unregistered(d) => debug!(mac = %d.mac(), "unregistered"),
        }
        if let Some(owner) = &owner {
            let _ = owner.send(event);
        }
    }
}

impl Shared {
    async fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let packet = match decode_packet(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(%from, error = %e, "malformed datagram");
                return;
            }
        };
        let mac = packet.header.target;
        if mac.is_broadcast() {
            return;
        }
        let port = match packet.payload {
            Payload::StateService {
                service: Service::Udp,
                port,
            } => port,
            // Bulbs volunteer LightState after boot without answering GetService.
            Payload::LightState { .. } => u32::from(LIFX_PORT),
            _ => return,
        };
        let Ok(port) = u16::try_from(port) else {
            debug!(%mac, port, "announced port out of range");
            return;
        };
        let ip = match &self.config.ipv6_prefix {
            Some(prefix) => match mac.ipv6_link_local(prefix) {
                Ok(addr) => IpAddr::V6(addr),
                Err(e) => {
                    warn!(%mac, error = %e, "cannot derive ipv6 address");
                    return;
                }
            },
            None => from.ip(),
        };
        self.observe(mac, SocketAddr::new(ip, port)).await;
    }

    /// Roster policy: new device, same endpoint (liveness refresh), or moved (rebind).
    async fn observe(&self, mac: MacAddr, endpoint: SocketAddr) {
        let known = self.registry.lock().await.get(&mac).cloned();
        match known {
            None => {
                let device = Device::new(
                    mac,
                    endpoint,
                    self.config.request_defaults(),
                    Some(self.events.clone()),
                );
                self.registry.lock().await.insert(mac, device.clone());
                info!(%mac, %endpoint, "device discovered");
                if let Err(e) = device.connect().await {
                    warn!(%mac, %endpoint, error = %e, "device transport failed");
                }
            }
            Some(device) => {
                let old = device.endpoint().await;
                if old == endpoint {
                    device.register().await;
                    return;
                }
                info!(%mac, from = %old, to = %endpoint, "device moved");
                if let Err(e) = device.rebind(endpoint).await {
                    warn!(%mac, %endpoint, error = %e, "device transport failed");
                    device.unregister().await;
                }
            }
        }
    }
}
