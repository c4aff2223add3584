//! Connection registry: per-peer outgoing queues, the ban list, our own
//! version nonces, and outbound connection policy.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use rand::RngCore;
use rookd_log::{log_debug, log_warn};
use rookd_net::collab::{BanReason, ConnMan};
use rookd_net::peer::PeerId;
use rookd_net::wire::{NetAddress, NetMessage};
use siphasher::sip::SipHasher24;
use tokio::sync::mpsc::UnboundedSender;

const BAN_SECS_MISBEHAVING: u64 = 24 * 60 * 60;
const ADDR_BOOK_MAX: usize = 5000;

/// Instruction for a peer's writer task.
pub enum Outgoing {
    Message(Box<NetMessage>),
    Close,
}

struct ConnEntry {
    addr: SocketAddr,
    outbound: bool,
    sender: UnboundedSender<Outgoing>,
    local_nonce: u64,
}

pub struct Connections {
    peers: Mutex<HashMap<PeerId, ConnEntry>>,
    banned: Mutex<HashMap<std::net::IpAddr, Instant>>,
    addr_book: Mutex<HashMap<[u8; 18], NetAddress>>,
    try_new_outbound: AtomicBool,
    best_height: AtomicI32,
    outbound_target: usize,
    randomizer_keys: (u64, u64),
}

impl Connections {
    pub fn new(outbound_target: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            peers: Mutex::new(HashMap::new()),
            banned: Mutex::new(HashMap::new()),
            addr_book: Mutex::new(HashMap::new()),
            try_new_outbound: AtomicBool::new(false),
            best_height: AtomicI32::new(0),
            outbound_target,
            randomizer_keys: (rng.next_u64(), rng.next_u64()),
        }
    }

    pub fn register(
        &self,
        id: PeerId,
        addr: SocketAddr,
        outbound: bool,
        sender: UnboundedSender<Outgoing>,
    ) -> u64 {
        let local_nonce = rand::thread_rng().next_u64().max(1);
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(
                id,
                ConnEntry {
                    addr,
                    outbound,
                    sender,
                    local_nonce,
                },
            );
        }
        local_nonce
    }

    pub fn unregister(&self, id: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&id);
        }
    }

    pub fn count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        let now = Instant::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(until) = banned.get(&addr.ip()).copied() {
            if until > now {
                return true;
            }
            banned.remove(&addr.ip());
        }
        false
    }

}

impl ConnMan for Connections {
    fn push_message(&self, peer: PeerId, message: NetMessage) {
        let Ok(peers) = self.peers.lock() else {
            return;
        };
        if let Some(entry) = peers.get(&peer) {
            if entry.sender.send(Outgoing::Message(Box::new(message))).is_err() {
                log_debug!("peer={peer} send queue closed");
            }
        }
    }

    fn disconnect(&self, peer: PeerId) {
        let Ok(peers) = self.peers.lock() else {
            return;
        };
        if let Some(entry) = peers.get(&peer) {
            let _ = entry.sender.send(Outgoing::Close);
        }
    }

    fn ban(&self, addr: SocketAddr, _reason: BanReason) {
        log_warn!("banning {addr} for misbehavior");
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(
                addr.ip(),
                Instant::now() + Duration::from_secs(BAN_SECS_MISBEHAVING),
            );
        }
    }

    fn mark_address_good(&self, addr: SocketAddr) {
        let address = NetAddress::from_socket(addr, 0, now_seconds() as u32);
        if let Ok(mut book) = self.addr_book.lock() {
            book.insert(address.key(), address);
        }
    }

    fn addresses(&self) -> Vec<NetAddress> {
        self.addr_book
            .lock()
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default()
    }

    fn address_count(&self) -> usize {
        self.addr_book.lock().map(|book| book.len()).unwrap_or(0)
    }

    fn add_new_addresses(&self, addresses: &[NetAddress], _source: SocketAddr) {
        let Ok(mut book) = self.addr_book.lock() else {
            return;
        };
        for address in addresses {
            if book.len() >= ADDR_BOOK_MAX {
                break;
            }
            book.entry(address.key()).or_insert_with(|| address.clone());
        }
    }

    fn check_incoming_nonce(&self, nonce: u64) -> bool {
        let Ok(peers) = self.peers.lock() else {
            return true;
        };
        !peers.values().any(|entry| entry.local_nonce == nonce)
    }

    fn outbound_target_reached(&self, _historical_block_serving: bool) -> bool {
        false
    }

    fn set_try_new_outbound_peer(&self, value: bool) {
        self.try_new_outbound.store(value, Ordering::Relaxed);
    }

    fn get_try_new_outbound_peer(&self) -> bool {
        self.try_new_outbound.load(Ordering::Relaxed)
    }

    fn extra_outbound_count(&self) -> i32 {
        let outbound = self
            .peers
            .lock()
            .map(|peers| peers.values().filter(|entry| entry.outbound).count())
            .unwrap_or(0);
        outbound as i32 - self.outbound_target as i32
    }

    fn set_best_height(&self, height: i32) {
        self.best_height.store(height, Ordering::Relaxed);
    }

    fn wake_message_handler(&self) {}

    fn local_nonce(&self, peer: PeerId) -> u64 {
        self.peers
            .lock()
            .ok()
            .and_then(|peers| peers.get(&peer).map(|entry| entry.local_nonce))
            .unwrap_or(1)
    }

    fn send_buffer_full(&self, _peer: PeerId) -> bool {
        false
    }

    fn local_address(&self, _peer: PeerId) -> Option<NetAddress> {
        None
    }

    fn deterministic_randomizer(&self, id: u64) -> SipHasher24 {
        SipHasher24::new_with_keys(self.randomizer_keys.0 ^ id, self.randomizer_keys.1)
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn nonce_detects_self_connection() {
        let conns = Connections::new(8);
        let (tx, _rx) = mpsc::unbounded_channel();
        let nonce = conns.register(PeerId(1), "127.0.0.1:1000".parse().unwrap(), true, tx);
        assert!(!conns.check_incoming_nonce(nonce));
        assert!(conns.check_incoming_nonce(nonce.wrapping_add(1)));
    }

    #[test]
    fn ban_expires() {
        let conns = Connections::new(8);
        let addr: SocketAddr = "10.0.0.1:8333".parse().unwrap();
        assert!(!conns.is_banned(addr));
        conns.ban(addr, BanReason::NodeMisbehaving);
        assert!(conns.is_banned(addr));
    }

    #[test]
    fn extra_outbound_counts_against_target() {
        let conns = Connections::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        conns.register(PeerId(1), "10.0.0.1:8333".parse().unwrap(), true, tx);
        conns.register(PeerId(2), "10.0.0.2:8333".parse().unwrap(), true, tx2);
        assert_eq!(conns.extra_outbound_count(), 1);
    }
}
