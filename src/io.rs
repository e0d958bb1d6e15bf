//! The transport layer: UDP listeners, the notification subscriber, and the
//! [`run`] entry point tying them to the reconciler.
//!
//! Everything multiplexes on one executor. Each listener splits its socket
//! into a receive loop and a send loop joined by a small bounded queue, so a
//! slow downstream link backs the sender up without ever blocking the read
//! path on the store.

use core::fmt;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use core::pin::{pin, Pin};
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{select, select_slice, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;

use embassy_time::{Duration, Timer};

use edge_nal::{UdpBind, UdpReceive, UdpSend, UdpSplit};

use log::{debug, info, warn};

use crate::cache::Cache;
use crate::reconciler::{Reconciler, Task, TaskQueue};
use crate::server::{self, Verdict};
use crate::store::{ControlStore, Notification, Notifications, Timestamp};
use crate::{MessageType, Packet};

/// The DHCP server port.
pub const DEFAULT_PORT: u16 = 67;

/// Receive buffer size per listener.
pub const RECV_BUF_SIZE: usize = 4096;

/// Maximum size of an outgoing reply.
pub const SEND_BUF_SIZE: usize = 1500;

/// Capacity of the per-listener send queue.
const SEND_QUEUE_DEPTH: usize = 10;

/// How long listeners keep flushing their send queues after the reconciler
/// has exited.
const STOP_GRACE: Duration = Duration::from_millis(500);

type Outgoing = (SocketAddr, heapless::Vec<u8, SEND_BUF_SIZE>);

#[derive(Debug)]
pub enum ServerError<T, S, N> {
    /// A listener failed to bind at startup.
    Bind(T),
    /// A socket failed while serving.
    Io(T),
    /// The initial owner load failed.
    Store(S),
    /// The notification connection failed.
    Notifications(N),
}

impl<T, S, N> fmt::Display for ServerError<T, S, N>
where
    T: fmt::Display,
    S: fmt::Display,
    N: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(err) => write!(f, "Bind error: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Store(err) => write!(f, "Store error: {}", err),
            Self::Notifications(err) => write!(f, "Notification error: {}", err),
        }
    }
}

impl<T, S, N> std::error::Error for ServerError<T, S, N>
where
    T: fmt::Display + fmt::Debug,
    S: fmt::Display + fmt::Debug,
    N: fmt::Display + fmt::Debug,
{
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct InvalidBind;

impl fmt::Display for InvalidBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid bind address")
    }
}

impl std::error::Error for InvalidBind {}

/// Parses a whitespace-separated `host[:port]` list into socket addresses,
/// with [`DEFAULT_PORT`] as the default port.
pub fn parse_binds(spec: &str) -> Result<Vec<SocketAddr>, InvalidBind> {
    spec.split_whitespace()
        .map(|token| {
            let (host, port) = match token.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| InvalidBind)?),
                None => (token, DEFAULT_PORT),
            };

            let host: Ipv4Addr = host.parse().map_err(|_| InvalidBind)?;

            Ok(SocketAddr::V4(SocketAddrV4::new(host, port)))
        })
        .collect()
}

/// Runs the server until `quit` is signaled.
///
/// The owner snapshot is loaded to completion first, then one listener per
/// bind is brought up; only after that is client traffic processed. On `quit`
/// the decision engine short-circuits to drop, the reconciler finishes its
/// queue up to the shutdown marker, and listeners get a short grace period to
/// flush outstanding replies.
///
/// Initialization failures (bind, initial load) abort before any traffic is
/// served.
pub async fn run<U, S, E, M>(
    stack: &U,
    binds: &[SocketAddr],
    default_server_addr: Option<Ipv4Addr>,
    store: S,
    mut events: E,
    now: fn() -> Timestamp,
    quit: &Signal<M, ()>,
) -> Result<(), ServerError<U::Error, S::Error, E::Error>>
where
    U: UdpBind,
    S: ControlStore,
    E: Notifications,
    M: RawMutex,
{
    let cache = Cache::<M>::new();
    let queue = TaskQueue::<M>::new();
    let stopping = AtomicBool::new(false);

    let mut reconciler = Reconciler::new(&queue, &cache, store);
    reconciler.load().await.map_err(ServerError::Store)?;

    let mut sockets = Vec::new();
    for bind in binds {
        let socket = stack.bind(*bind).await.map_err(ServerError::Bind)?;
        info!("Listener bound to {bind}");

        sockets.push((socket, server_addr_for(bind, default_server_addr)));
    }

    let mut listeners = sockets
        .iter_mut()
        .map(|(socket, server_addr)| {
            Box::pin(listen(socket, *server_addr, &cache, &queue, &stopping, now))
        })
        .collect::<Vec<_>>();

    let mut data_plane = pin!(async {
        let serve = async {
            let (result, index) = select_slice(Pin::new(&mut listeners[..])).await;

            warn!("Listener {index} quit abruptly");

            result.map_err(ServerError::Io)
        };

        let subscriber = async {
            match subscribe(&mut events, &queue).await {
                Ok(()) => {
                    info!("Notification channel closed");
                    core::future::pending().await
                }
                Err(err) => Err(ServerError::Notifications(err)),
            }
        };

        match select(serve, subscriber).await {
            Either::First(result) => result,
            Either::Second(result) => result,
        }
    });

    let control_plane = async {
        let shutdown = async {
            quit.wait().await;

            info!("Graceful shutdown requested");
            stopping.store(true, Ordering::Relaxed);
            queue.push(Task::Shutdown).await;

            core::future::pending::<()>().await
        };

        match select(reconciler.run(), shutdown).await {
            Either::First(()) => (),
            Either::Second(()) => (),
        }
    };

    match select(control_plane, &mut data_plane).await {
        Either::First(()) => {
            // Let the listeners flush queued replies before tearing down
            match select(Timer::after(STOP_GRACE), &mut data_plane).await {
                Either::First(()) => Ok(()),
                Either::Second(result) => result,
            }
        }
        Either::Second(result) => result,
    }
}

/// One listener: a receive loop and a send loop sharing a bounded queue.
async fn listen<T, M>(
    socket: &mut T,
    server_addr: Option<Ipv4Addr>,
    cache: &Cache<M>,
    tasks: &TaskQueue<M>,
    stopping: &AtomicBool,
    now: fn() -> Timestamp,
) -> Result<(), T::Error>
where
    T: UdpSplit,
    M: RawMutex,
{
    let queue = Channel::<M, Outgoing, SEND_QUEUE_DEPTH>::new();
    let (mut rx, mut tx) = socket.split();

    let recv = async {
        let mut buf = [0; RECV_BUF_SIZE];

        loop {
            let (len, remote) = rx.receive(&mut buf).await?;
            debug!("Received {len} octets from {remote}");

            handle_datagram(
                &buf[..len.min(RECV_BUF_SIZE)],
                remote,
                server_addr,
                cache,
                tasks,
                stopping,
                now,
                &queue,
            )
            .await;
        }
    };

    let send = async {
        loop {
            let (remote, data) = queue.receive().await;

            tx.send(remote, &data).await?;
            debug!("Sent {} octets to {remote}", data.len());
        }
    };

    match select(recv, send).await {
        Either::First(result) => result,
        Either::Second(result) => result,
    }
}

/// Classifies one datagram and applies the verdict: enqueues reconciler
/// tasks, places the optimistic staging mark, queues the reply.
#[allow(clippy::too_many_arguments)]
async fn handle_datagram<M>(
    data: &[u8],
    remote: SocketAddr,
    server_addr: Option<Ipv4Addr>,
    cache: &Cache<M>,
    tasks: &TaskQueue<M>,
    stopping: &AtomicBool,
    now: fn() -> Timestamp,
    queue: &Channel<M, Outgoing, SEND_QUEUE_DEPTH>,
) where
    M: RawMutex,
{
    let request = match Packet::decode(data) {
        Ok(request) => request,
        Err(err) => {
            debug!("Dropping malformed packet from {remote}: {err}");
            return;
        }
    };

    let verdict = cache.with(|inner| {
        server::classify(
            stopping.load(Ordering::Relaxed),
            &request,
            remote.ip(),
            inner,
        )
    });

    match verdict {
        Verdict::Drop(reason) => {
            debug!("Dropping packet from {remote}: {reason}");
        }
        Verdict::Stage { mac, relay_ip } => {
            info!("Staging {mac} behind relay {relay_ip}");

            // Mark only when the task went in, so an unserved MAC retries
            if tasks.offer(Task::AddStaging {
                at: now(),
                mac,
                relay_ip,
            }) {
                cache.mark_staging(mac, relay_ip);
            }
        }
        Verdict::Lease {
            mac,
            relay_ip,
            kind,
            entry,
        } => {
            info!(
                "{kind} {} for {mac} via relay {relay_ip}",
                entry.ip_addr
            );

            if matches!(kind, MessageType::Ack) {
                tasks.offer(Task::UpdateLease { at: now(), mac });
            }

            let reply = server::make_reply(&request, kind, &entry, server_addr);

            let mut buf = [0; SEND_BUF_SIZE];
            match reply.encode(&mut buf) {
                Ok(data) => {
                    let payload = heapless::Vec::from_slice(data).unwrap();
                    queue.send((broadcast_fallback(remote), payload)).await;
                }
                Err(err) => warn!("Failed to encode reply for {mac}: {err}"),
            }
        }
    }
}

/// Translates store notifications into reconciler tasks until the channel
/// closes.
async fn subscribe<E, M, const N: usize>(
    events: &mut E,
    tasks: &TaskQueue<M, N>,
) -> Result<(), E::Error>
where
    E: Notifications,
    M: RawMutex,
{
    while let Some(payload) = events.recv().await? {
        debug!("Control notification: {payload}");

        match Notification::parse(&payload) {
            Ok(notification) => tasks.push(notification.into()).await,
            Err(err) => warn!("Discarding malformed notification {payload:?}: {err}"),
        }
    }

    Ok(())
}

fn server_addr_for(bind: &SocketAddr, default: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
    match bind {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => default,
    }
}

fn broadcast_fallback(remote: SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(addr) if addr.ip().is_unspecified() => {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, addr.port()))
        }
        other => other,
    }
}
