//! LAN discovery over UDP broadcast.
//!
//! The client broadcasts a `DiscoveryRequest` to the global broadcast
//! address and to every interface's subnet broadcast, then collects
//! `DiscoveryResponse`s until a deadline. The host runs a responder bound
//! on the discovery port that replies to the packet source.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use spanview_protocol::discovery::{DiscoveryMessage, DISCOVERY_PROTOCOL_VERSION};

use crate::error::DiscoveryError;

/// Default time to wait for responses.
pub const DEFAULT_DISCOVERY_DEADLINE: Duration = Duration::from_millis(1_200);

const MAX_DATAGRAM: usize = 2048;

/// A host that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub server_id: String,
    pub server_name: String,
    pub host: IpAddr,
    pub tcp_port: u16,
    pub server_version: String,
}

/// Broadcast a discovery request and collect responses until `deadline`.
/// The result is de-duplicated by `(server_id, host, tcp_port)` and
/// sorted by server name.
pub async fn discover_hosts(
    udp_port: u16,
    deadline: Duration,
    client_device_id: Option<String>,
    client_device_name: Option<String>,
) -> Result<Vec<DiscoveredHost>, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let request = DiscoveryMessage::DiscoveryRequest {
        request_id: request_id.clone(),
        discovery_protocol_version: DISCOVERY_PROTOCOL_VERSION,
        client_device_id,
        client_device_name,
    };
    let packet = request.encode()?;

    for target in broadcast_targets(udp_port) {
        if let Err(e) = socket.send_to(&packet, target).await {
            debug!(%target, "discovery send failed: {e}");
        }
    }

    let deadline_at = Instant::now() + deadline;
    let mut collator = ResponseCollator::new(request_id);
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                warn!("discovery recv error: {e}");
            }
            Ok(Ok((len, src))) => {
                if let Some(msg) = DiscoveryMessage::decode(&buf[..len]) {
                    collator.accept(msg, src.ip());
                }
            }
        }
    }

    Ok(collator.finish())
}

/// De-duplication and ordering of discovery responses, kept separate from
/// the socket loop.
struct ResponseCollator {
    request_id: String,
    seen: HashSet<(String, IpAddr, u16)>,
    found: Vec<DiscoveredHost>,
}

impl ResponseCollator {
    fn new(request_id: String) -> Self {
        Self { request_id, seen: HashSet::new(), found: Vec::new() }
    }

    fn accept(&mut self, msg: DiscoveryMessage, src: IpAddr) {
        let DiscoveryMessage::DiscoveryResponse {
            request_id,
            server_id,
            server_name,
            tcp_port,
            server_version,
            ..
        } = msg
        else {
            return;
        };
        if request_id != self.request_id {
            trace!("ignoring discovery response for a different request");
            return;
        }
        if self.seen.insert((server_id.clone(), src, tcp_port)) {
            self.found.push(DiscoveredHost {
                server_id,
                server_name,
                host: src,
                tcp_port,
                server_version,
            });
        }
    }

    fn finish(mut self) -> Vec<DiscoveredHost> {
        self.found.sort_by(|a, b| {
            (&a.server_name, &a.server_id, a.host, a.tcp_port)
                .cmp(&(&b.server_name, &b.server_id, b.host, b.tcp_port))
        });
        self.found
    }
}

/// The global broadcast address plus each IPv4 interface's subnet
/// broadcast (derived from its netmask when the OS doesn't report one).
fn broadcast_targets(udp_port: u16) -> Vec<SocketAddr> {
    let mut targets: Vec<SocketAddr> =
        vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, udp_port).into()];

    match NetworkInterface::show() {
        Ok(interfaces) => {
            for iface in interfaces {
                for addr in iface.addr {
                    let Addr::V4(v4) = addr else { continue };
                    if v4.ip.is_loopback() {
                        continue;
                    }
                    let broadcast = v4
                        .broadcast
                        .or_else(|| v4.netmask.map(|mask| subnet_broadcast(v4.ip, mask)));
                    if let Some(b) = broadcast {
                        let target: SocketAddr = SocketAddrV4::new(b, udp_port).into();
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
            }
        }
        Err(e) => debug!("interface enumeration failed, using global broadcast only: {e}"),
    }

    targets
}

fn subnet_broadcast(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// Identity the responder advertises.
#[derive(Debug, Clone)]
pub struct ResponderInfo {
    pub server_id: String,
    pub server_name: String,
    pub tcp_port: u16,
    pub server_version: String,
}

/// Bind the discovery responder socket with `SO_REUSEADDR` so a restart
/// doesn't trip over TIME_WAIT state.
pub fn bind_responder(bind_addr: Ipv4Addr, port: u16) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(bind_addr, port).into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// Answer discovery requests until cancelled. Malformed datagrams and
/// non-request messages are dropped silently.
pub async fn run_responder(socket: UdpSocket, info: ResponderInfo, cancel: CancellationToken) {
    let local = socket.local_addr().ok();
    info!(addr = ?local, server_id = %info.server_id, "discovery responder started");

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("discovery responder recv error: {e}");
                        continue;
                    }
                };

                let Some(DiscoveryMessage::DiscoveryRequest { request_id, .. }) =
                    DiscoveryMessage::decode(&buf[..len])
                else {
                    trace!(%src, "dropping non-request discovery datagram");
                    continue;
                };

                let response = DiscoveryMessage::DiscoveryResponse {
                    request_id,
                    discovery_protocol_version: DISCOVERY_PROTOCOL_VERSION,
                    server_id: info.server_id.clone(),
                    server_name: info.server_name.clone(),
                    tcp_port: info.tcp_port,
                    web_socket_supported: false,
                    server_version: info.server_version.clone(),
                };
                match response.encode() {
                    Ok(packet) => {
                        if let Err(e) = socket.send_to(&packet, src).await {
                            warn!(%src, "discovery response send failed: {e}");
                        } else {
                            debug!(%src, "answered discovery request");
                        }
                    }
                    Err(e) => warn!("discovery response encode failed: {e}"),
                }
            }
        }
    }

    info!("discovery responder stopped");
}
