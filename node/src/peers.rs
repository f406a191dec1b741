//! Liveness bookkeeping for every peer the local node talks to.
//!
//! Indexed both by player id and by socket address: incoming datagrams carry
//! an address, game state carries ids, and NAT rebinding means the mapping
//! between the two can change mid-game.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use shared::NodeRole;

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: i32,
    pub name: String,
    pub addr: SocketAddr,
    pub role: NodeRole,
    pub last_received: Instant,
    pub last_sent: Instant,
}

impl Peer {
    pub fn new(id: i32, name: impl Into<String>, addr: SocketAddr, role: NodeRole) -> Self {
        let now = Instant::now();
        Self {
            id,
            name: name.into(),
            addr,
            role,
            last_received: now,
            last_sent: now,
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_received.elapsed() > timeout
    }

    pub fn needs_ping(&self, interval: Duration) -> bool {
        self.last_sent.elapsed() > interval
    }
}

#[derive(Default)]
struct Registry {
    peers: HashMap<i32, Peer>,
    by_addr: HashMap<SocketAddr, i32>,
}

/// Shared peer table. Callers get clones; mutation goes through the
/// dedicated update methods so the two indices never drift apart.
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<Registry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, peer: Peer) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_addr.insert(peer.addr, peer.id);
        inner.peers.insert(peer.id, peer);
    }

    pub fn remove(&self, id: i32) -> Option<Peer> {
        let mut inner = self.inner.lock().unwrap();
        let peer = inner.peers.remove(&id)?;
        inner.by_addr.remove(&peer.addr);
        Some(peer)
    }

    pub fn get(&self, id: i32) -> Option<Peer> {
        self.inner.lock().unwrap().peers.get(&id).cloned()
    }

    pub fn get_by_addr(&self, addr: SocketAddr) -> Option<Peer> {
        let inner = self.inner.lock().unwrap();
        let id = inner.by_addr.get(&addr)?;
        inner.peers.get(id).cloned()
    }

    pub fn all(&self) -> Vec<Peer> {
        self.inner.lock().unwrap().peers.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    pub fn update_addr(&self, id: i32, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(&id) {
            let old = peer.addr;
            peer.addr = addr;
            inner.by_addr.remove(&old);
            inner.by_addr.insert(addr, id);
        }
    }

    pub fn update_role(&self, id: i32, role: NodeRole) {
        if let Some(peer) = self.inner.lock().unwrap().peers.get_mut(&id) {
            peer.role = role;
        }
    }

    /// Refreshes `last_received` for whoever owns `addr`; returns their id.
    pub fn touch_received(&self, addr: SocketAddr) -> Option<i32> {
        let mut inner = self.inner.lock().unwrap();
        let id = *inner.by_addr.get(&addr)?;
        if let Some(peer) = inner.peers.get_mut(&id) {
            peer.last_received = Instant::now();
        }
        Some(id)
    }

    pub fn touch_received_by_id(&self, id: i32) {
        if let Some(peer) = self.inner.lock().unwrap().peers.get_mut(&id) {
            peer.last_received = Instant::now();
        }
    }

    pub fn touch_sent(&self, id: i32) {
        if let Some(peer) = self.inner.lock().unwrap().peers.get_mut(&id) {
            peer.last_sent = Instant::now();
        }
    }

    pub fn find_timed_out(&self, timeout: Duration) -> Vec<Peer> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .values()
            .filter(|p| p.is_timed_out(timeout))
            .cloned()
            .collect()
    }

    pub fn find_need_ping(&self, interval: Duration) -> Vec<Peer> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .values()
            .filter(|p| p.needs_ping(interval))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_lookup_by_both_indices() {
        let registry = PeerRegistry::new();
        registry.add(Peer::new(2, "bob", addr(9000), NodeRole::Normal));

        assert_eq!(registry.get(2).unwrap().name, "bob");
        assert_eq!(registry.get_by_addr(addr(9000)).unwrap().id, 2);
        assert!(registry.get(3).is_none());
        assert!(registry.get_by_addr(addr(9001)).is_none());
    }

    #[test]
    fn test_remove_clears_both_indices() {
        let registry = PeerRegistry::new();
        registry.add(Peer::new(2, "bob", addr(9000), NodeRole::Normal));

        assert!(registry.remove(2).is_some());
        assert!(registry.get(2).is_none());
        assert!(registry.get_by_addr(addr(9000)).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_update_addr_rekeys_address_index() {
        let registry = PeerRegistry::new();
        registry.add(Peer::new(2, "bob", addr(9000), NodeRole::Normal));

        registry.update_addr(2, addr(9050));

        assert!(registry.get_by_addr(addr(9000)).is_none());
        assert_eq!(registry.get_by_addr(addr(9050)).unwrap().id, 2);
    }

    #[test]
    fn test_timeout_and_ping_queries() {
        let registry = PeerRegistry::new();
        registry.add(Peer::new(2, "bob", addr(9000), NodeRole::Normal));
        registry.add(Peer::new(3, "eve", addr(9001), NodeRole::Viewer));

        assert!(registry.find_timed_out(Duration::from_millis(50)).is_empty());
        assert!(registry
            .find_need_ping(Duration::from_millis(50))
            .is_empty());

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(registry.find_timed_out(Duration::from_millis(50)).len(), 2);
        assert_eq!(registry.find_need_ping(Duration::from_millis(50)).len(), 2);

        // A refreshed peer drops out of the timed-out set.
        registry.touch_received(addr(9000));
        let timed_out = registry.find_timed_out(Duration::from_millis(50));
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].id, 3);

        registry.touch_sent(3);
        let need_ping = registry.find_need_ping(Duration::from_millis(50));
        assert_eq!(need_ping.len(), 1);
        assert_eq!(need_ping[0].id, 2);
    }

    #[test]
    fn test_update_role() {
        let registry = PeerRegistry::new();
        registry.add(Peer::new(2, "bob", addr(9000), NodeRole::Normal));
        registry.update_role(2, NodeRole::Deputy);
        assert_eq!(registry.get(2).unwrap().role, NodeRole::Deputy);
    }
}
