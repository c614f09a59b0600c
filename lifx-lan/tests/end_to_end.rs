use std::net::Ipv4Addr;
use std::time::Duration;

use lifx_core::{
    decode_packet, encode_packet, Header, MacAddr, MessageType, Packet, Payload, Service, POWER_ON,
};
use lifx_lan::{Config, Discovery, RequestOptions, RosterEvent, Transition};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

const MAC: &str = "d0:73:d5:01:02:03";

async fn recv(socket: &UdpSocket) -> (Packet, std::net::SocketAddr) {
    let mut buf = [0u8; 1024];
    let (n, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
        .await
        .expect("no datagram")
        .unwrap();
    (decode_packet(&buf[..n]).unwrap(), from)
}

async fn reply(socket: &UdpSocket, to: std::net::SocketAddr, req: &Packet, payload: Payload) {
    let header = Header::new(MAC.parse().unwrap(), req.header.source, req.header.sequence);
    let bytes = encode_packet(&Packet::new(header, payload)).unwrap();
    socket.send_to(&bytes, to).await.unwrap();
}

#[tokio::test]
async fn discover_then_set_power() {
    let bulb = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bulb_addr = bulb.local_addr().unwrap();
    let config = Config {
        broadcast_addr: Ipv4Addr::LOCALHOST,
        port: bulb_addr.port(),
        bind_port: 0,
        ..Config::default()
    };
    let (owner, mut roster) = mpsc::unbounded_channel();
    let discovery = Discovery::start(config, Some(owner)).await.unwrap();

    let (probe, from) = recv(&bulb).await;
    assert_eq!(probe.kind(), MessageType::GetService);
    assert!(probe.header.target.is_broadcast());
    reply(
        &bulb,
        from,
        &probe,
        Payload::StateService {
            service: Service::Udp,
            port: u32::from(bulb_addr.port()),
        },
    )
    .await;

    let event = timeout(Duration::from_secs(2), roster.recv())
        .await
        .unwrap()
        .unwrap();
    let mac: MacAddr = MAC.parse().unwrap();
    let device = match event {
        RosterEvent::Registered(d) => d,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(device.mac(), mac);
    assert_eq!(discovery.devices().await.len(), 1);
    assert_eq!(device.endpoint().await, bulb_addr);

    let task = {
        let device = device.clone();
        tokio::spawn(async move {
            device
                .set_power(true, Transition::default(), RequestOptions::default())
                .await
        })
    };
    let (req, from) = recv(&bulb).await;
    assert_eq!(req.kind(), MessageType::LightSetPower);
    assert_eq!(req.header.target, mac);
    assert!(req.header.ack_required);
    assert!(!req.header.res_required);
    reply(&bulb, from, &req, Payload::Acknowledgement).await;

    assert_eq!(task.await.unwrap().unwrap(), POWER_ON);
    assert!(device.is_registered().await);
    discovery.close().await;
}
