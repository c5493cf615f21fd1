//! Duplicate-Connection / DoS Guard
//!
//! Best-effort abuse mitigation: two or more simultaneous connections from
//! one address get all of them closed and the address blacklisted for a
//! cooldown. Expiry is timer-driven from the protocol loop; the guard also
//! checks wall time on lookup so a lost timer cannot extend a ban. This
//! complements the cryptographic handshake, it does not replace it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use crate::network::transport::ConnId;

/// Live-connection tracking and address blacklist.
#[derive(Debug, Default)]
pub struct DosGuard {
    live: HashMap<ConnId, IpAddr>,
    blacklist: HashMap<IpAddr, Instant>,
}

impl DosGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection as live at an address.
    pub fn track(&mut self, conn: ConnId, addr: IpAddr) {
        self.live.insert(conn, addr);
    }

    /// Forget a connection. Called from the disconnect event.
    pub fn untrack(&mut self, conn: ConnId) -> Option<IpAddr> {
        self.live.remove(&conn)
    }

    /// All live connections sharing an address, including the newest one.
    pub fn peers_of(&self, addr: IpAddr) -> Vec<ConnId> {
        let mut peers: Vec<ConnId> = self
            .live
            .iter()
            .filter(|(_, a)| **a == addr)
            .map(|(c, _)| *c)
            .collect();
        peers.sort();
        peers
    }

    /// Whether an address is currently blacklisted.
    pub fn is_blacklisted(&self, addr: IpAddr) -> bool {
        match self.blacklist.get(&addr) {
            Some(until) => Instant::now() < *until,
            None => false,
        }
    }

    /// Blacklist an address until the given instant.
    pub fn blacklist(&mut self, addr: IpAddr, until: Instant) {
        self.blacklist.insert(addr, until);
    }

    /// Remove an address from the blacklist. Called when the expiry timer
    /// fires.
    pub fn unblacklist(&mut self, addr: IpAddr) {
        self.blacklist.remove(&addr);
    }

    /// Number of live tracked connections.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_single_connection_never_flagged() {
        let mut guard = DosGuard::new();
        guard.track(ConnId(1), addr(1));
        assert_eq!(guard.peers_of(addr(1)).len(), 1);
        assert!(!guard.is_blacklisted(addr(1)));
    }

    #[test]
    fn test_two_connections_share_address() {
        let mut guard = DosGuard::new();
        guard.track(ConnId(1), addr(1));
        guard.track(ConnId(2), addr(1));
        guard.track(ConnId(3), addr(2));

        assert_eq!(guard.peers_of(addr(1)), vec![ConnId(1), ConnId(2)]);
        assert_eq!(guard.peers_of(addr(2)), vec![ConnId(3)]);
    }

    #[test]
    fn test_blacklist_expires_by_wall_time() {
        let mut guard = DosGuard::new();
        guard.blacklist(addr(1), Instant::now() + Duration::from_secs(60));
        assert!(guard.is_blacklisted(addr(1)));

        // An entry whose expiry already passed is not a ban, even before
        // the timer fires.
        guard.blacklist(addr(2), Instant::now() - Duration::from_secs(1));
        assert!(!guard.is_blacklisted(addr(2)));

        guard.unblacklist(addr(1));
        assert!(!guard.is_blacklisted(addr(1)));
    }

    #[test]
    fn test_untrack_clears_live_entry() {
        let mut guard = DosGuard::new();
        guard.track(ConnId(1), addr(1));
        assert_eq!(guard.untrack(ConnId(1)), Some(addr(1)));
        assert!(guard.peers_of(addr(1)).is_empty());
        assert_eq!(guard.live_count(), 0);
    }
}
