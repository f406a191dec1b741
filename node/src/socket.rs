//! UDP endpoints: the node's single game socket and the multicast listener.
//!
//! Every node owns exactly one game socket, bound to an ephemeral port on the
//! best local IPv4 address, and shares it across all of the active role's
//! tasks. Writes are atomic per datagram, so no locking is needed around
//! sends. The multicast listener is a second, independent socket dedicated to
//! the discovery channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use shared::{GameError, GameMessage};

/// Discovery multicast group shared by every node.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 4);
pub const MULTICAST_PORT: u16 = 9192;

/// Environment override for the local bind address. Interface-selection
/// heuristics are guesswork on exotic setups; this is the escape hatch.
pub const BIND_ADDR_ENV: &str = "SNAKE_BIND_ADDR";

/// Picks the IPv4 address to bind the game socket to.
///
/// Order: explicit `SNAKE_BIND_ADDR` override, then the source address of the
/// default route (a connected UDP socket never sends a packet, it only asks
/// the kernel for routing), then the unspecified address.
pub fn preferred_bind_ip() -> Ipv4Addr {
    if let Ok(value) = std::env::var(BIND_ADDR_ENV) {
        match value.parse::<Ipv4Addr>() {
            Ok(ip) => return ip,
            Err(_) => warn!("Ignoring unparsable {}={}", BIND_ADDR_ENV, value),
        }
    }

    if let Ok(probe) = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
        if probe.connect(("8.8.8.8", 80)).is_ok() {
            if let Ok(SocketAddr::V4(local)) = probe.local_addr() {
                if !local.ip().is_loopback() {
                    return *local.ip();
                }
            }
        }
    }

    Ipv4Addr::UNSPECIFIED
}

/// The node's shared unicast endpoint.
///
/// Also the source of the node-wide monotone `msg_seq` counter: sequence
/// numbers must never repeat across roles, and roles come and go while the
/// socket lives for the whole session.
pub struct GameSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    msg_seq: AtomicI64,
}

impl GameSocket {
    pub async fn bind() -> Result<Self, GameError> {
        Self::bind_to(preferred_bind_ip()).await
    }

    pub async fn bind_to(ip: Ipv4Addr) -> Result<Self, GameError> {
        let socket = UdpSocket::bind((ip, 0)).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;
        info!("Game socket listening on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            msg_seq: AtomicI64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn next_seq(&self) -> i64 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn send(&self, msg: &GameMessage, addr: SocketAddr) -> Result<(), GameError> {
        let data = msg.encode()?;
        self.socket.send_to(&data, addr).await?;
        Ok(())
    }

    /// Sends to the multicast group and mirrors the datagram to the limited
    /// broadcast address and the /24 subnet broadcast of the bound address,
    /// for networks where multicast routing is broken. Mirror failures are
    /// not errors.
    pub async fn send_multicast(&self, msg: &GameMessage) -> Result<(), GameError> {
        let data = msg.encode()?;
        let group = SocketAddr::from((MULTICAST_GROUP, MULTICAST_PORT));
        self.socket.send_to(&data, group).await?;

        let _ = self
            .socket
            .send_to(&data, (Ipv4Addr::BROADCAST, MULTICAST_PORT))
            .await;

        if let IpAddr::V4(ip) = self.local_addr.ip() {
            if !ip.is_unspecified() && !ip.is_loopback() {
                let o = ip.octets();
                let subnet = Ipv4Addr::new(o[0], o[1], o[2], 255);
                let _ = self.socket.send_to(&data, (subnet, MULTICAST_PORT)).await;
            }
        }

        Ok(())
    }

    /// Waits up to `deadline` for one well-formed message. Datagrams that do
    /// not decode are dropped where they land.
    pub async fn recv(&self, deadline: Duration) -> Option<(GameMessage, SocketAddr)> {
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(deadline, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => match GameMessage::decode(&buf[..len]) {
                Ok(msg) => Some((msg, addr)),
                Err(err) => {
                    debug!("Dropping undecodable datagram from {}: {}", addr, err);
                    None
                }
            },
            Ok(Err(err)) => {
                warn!("Receive error on game socket: {}", err);
                None
            }
            Err(_) => None,
        }
    }
}

/// Receiving side of the discovery channel.
///
/// Joins the multicast group on the preferred interface, falling back to an
/// unspecified-interface join, falling back to a plain UDP bind on the
/// multicast port (which still catches the broadcast mirrors).
pub struct MulticastListener {
    socket: UdpSocket,
}

impl MulticastListener {
    pub fn bind() -> Result<Self, GameError> {
        let std_socket = match Self::join_group(preferred_bind_ip()) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("Multicast join on preferred interface failed: {}", err);
                match Self::join_group(Ipv4Addr::UNSPECIFIED) {
                    Ok(socket) => socket,
                    Err(err) => {
                        warn!("Multicast join failed ({}), using plain UDP bind", err);
                        Self::bind_plain()?
                    }
                }
            }
        };

        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        info!("Discovery listener ready on {}", socket.local_addr()?);
        Ok(Self { socket })
    }

    fn join_group(interface: Ipv4Addr) -> std::io::Result<std::net::UdpSocket> {
        // Reuse-addr so several nodes on one host can all watch the group.
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)).into())?;
        let socket: std::net::UdpSocket = socket.into();
        socket.join_multicast_v4(&MULTICAST_GROUP, &interface)?;
        Ok(socket)
    }

    fn bind_plain() -> std::io::Result<std::net::UdpSocket> {
        std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT))
    }

    pub async fn recv(&self, deadline: Duration) -> Option<(GameMessage, SocketAddr)> {
        let mut buf = vec![0u8; 64 * 1024];
        match tokio::time::timeout(deadline, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => match GameMessage::decode(&buf[..len]) {
                Ok(msg) => Some((msg, addr)),
                Err(err) => {
                    debug!("Dropping undecodable announcement from {}: {}", addr, err);
                    None
                }
            },
            Ok(Err(err)) => {
                warn!("Receive error on multicast socket: {}", err);
                None
            }
            Err(_) => None,
        }
    }
}
