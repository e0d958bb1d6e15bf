//! A self-contained walkthrough against the in-memory control store.
//!
//! The server comes up with one profile and no owners. A relay-forwarded
//! DISCOVER stages the unknown client without a reply; the "operator" then
//! assigns an address and publishes a reload notification, after which the
//! client's REQUEST is acknowledged.

use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use core::time::Duration;

use std::time::{SystemTime, UNIX_EPOCH};

use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;

use edge_nal::{UdpBind, UdpReceive, UdpSend};

use log::info;

use relay_dhcp::io;
use relay_dhcp::store::mem::{MemStore, Profile};
use relay_dhcp::store::Timestamp;
use relay_dhcp::{Mac, MessageType, Packet};

const SERVER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6767);
const RELAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    futures_lite::future::block_on(run()).unwrap();
}

fn now() -> Timestamp {
    Timestamp(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as _,
    )
}

async fn run() -> Result<(), anyhow::Error> {
    let store = MemStore::<NoopRawMutex>::new();

    store.add_profile(Profile {
        name: "office".into(),
        description: "Office floor subnet".into(),
        relay_ip: RELAY,
        network_addr: "192.168.7.0/24".parse()?,
        router_ip: Some(Ipv4Addr::new(192, 168, 7, 1)),
        dns_ips: vec![Ipv4Addr::new(192, 168, 7, 53)],
        ntp_ips: Vec::new(),
        lease_time: Duration::from_secs(3600),
    })?;

    let stack = edge_nal_std::Stack::new();
    let quit = Signal::<NoopRawMutex, ()>::new();
    let binds = [SocketAddr::V4(SERVER)];

    let server = io::run(
        &stack,
        &binds,
        Some(*SERVER.ip()),
        &store,
        store.subscriber(),
        now,
        &quit,
    );

    let driver = async {
        let result = drive(&store).await;

        // Stop the server whether the walkthrough succeeded or not
        quit.signal(());

        result
    };

    let (server, driver) = join(server, driver).await;

    server.map_err(|err| anyhow::anyhow!("server quit: {err}"))?;
    driver
}

async fn drive(store: &MemStore<NoopRawMutex>) -> Result<(), anyhow::Error> {
    let stack = edge_nal_std::Stack::new();
    let mut socket = stack
        .bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(127, 0, 0, 1),
            0,
        )))
        .await?;

    let mac: Mac = "de:12:44:4c:bb:48".parse()?;
    let mut buf = [0; 1500];

    // A relay-forwarded DISCOVER from an unknown MAC gets no reply; the
    // client lands in staging instead
    let mut discover = Packet::new_request(mac, 0x1d0b7e55, MessageType::Discover);
    discover.hops = 1;
    discover.giaddr = RELAY;

    socket
        .send(SocketAddr::V4(SERVER), discover.encode(&mut buf)?)
        .await?;

    let owner = loop {
        if let Some(owner) = store.find_owner(mac) {
            break owner;
        }

        Timer::after_millis(20).await;
    };

    info!("Operator assigns 192.168.7.2 to owner {}", owner.id);
    store.assign_ip(owner.id, Some(Ipv4Addr::new(192, 168, 7, 2)))?;
    store.notify(&format!("RELOAD_ITEM {}", owner.id)).await;

    // Retry the REQUEST until the reload has landed
    let (message_type, yiaddr) = loop {
        let mut request = Packet::new_request(mac, 0xcafebabe, MessageType::Request);
        request.hops = 1;
        request.giaddr = RELAY;

        socket
            .send(SocketAddr::V4(SERVER), request.encode(&mut buf)?)
            .await?;

        let mut reply_buf = [0; 1500];
        let outcome = select(socket.receive(&mut reply_buf), Timer::after_millis(200)).await;

        match outcome {
            Either::First(received) => {
                let (len, _) = received?;
                let reply = Packet::decode(&reply_buf[..len])?;

                break (reply.message_type, reply.yiaddr);
            }
            Either::Second(()) => continue,
        }
    };

    info!("Got {message_type:?} with address {yiaddr}");

    Ok(())
}
