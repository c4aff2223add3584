//! Version handshake behavior, matching the live network's observable
//! exchange.

mod common;

use common::Harness;
use rookd_consensus::constants::{
    NODE_NETWORK, NODE_WITNESS, PROTOCOL_VERSION, REJECT_DUPLICATE, REJECT_OBSOLETE,
};
use rookd_net::peer::PeerFlags;
use rookd_net::Clock;
use rookd_net::wire::{NetAddress, NetMessage, SendCmpct, VersionMessage};

fn version_message(harness: &Harness, nonce: u64, version: i32, services: u64) -> VersionMessage {
    VersionMessage {
        version,
        services,
        timestamp: harness.clock.unix_seconds(),
        addr_recv: NetAddress {
            time: 0,
            services: 0,
            ip: [0u8; 16],
            port: 0,
        },
        addr_from: NetAddress {
            time: 0,
            services,
            ip: [0u8; 16],
            port: 0,
        },
        nonce,
        user_agent: "/peer:1.0/".to_string(),
        start_height: 100,
        relay: true,
    }
}

#[test]
fn outbound_handshake_exchange() {
    let harness = Harness::new();
    let peer = harness.add_peer(1, PeerFlags::default());

    // An outbound connection greets first.
    let commands = harness.connman.commands_for(peer);
    assert_eq!(commands, vec!["version"]);
    let messages = harness.connman.messages_for(peer);
    match &messages[0] {
        NetMessage::Version(version) => {
            assert_eq!(version.version, PROTOCOL_VERSION);
            assert_ne!(version.services & NODE_NETWORK, 0);
            assert_ne!(version.services & NODE_WITNESS, 0);
        }
        other => panic!("expected version, got {}", other.command()),
    }
    harness.connman.clear();

    // Their version triggers our verack and address solicitation.
    let version = version_message(&harness, 0x77, PROTOCOL_VERSION, NODE_NETWORK | NODE_WITNESS);
    harness.deliver(peer, &NetMessage::Version(version));
    let commands = harness.connman.commands_for(peer);
    assert_eq!(commands, vec!["verack", "getaddr"]);
    harness.connman.clear();

    // Their verack completes the handshake and announces our preferences.
    harness.deliver(peer, &NetMessage::Verack);
    let messages = harness.connman.messages_for(peer);
    let commands: Vec<&str> = messages.iter().map(NetMessage::command).collect();
    assert_eq!(commands, vec!["sendheaders", "sendcmpct", "sendcmpct"]);
    match (&messages[1], &messages[2]) {
        (
            NetMessage::SendCmpct(SendCmpct {
                announce: false,
                version: 2,
            }),
            NetMessage::SendCmpct(SendCmpct {
                announce: false,
                version: 1,
            }),
        ) => {}
        _ => panic!("expected sendcmpct 2 then 1"),
    }
}

#[test]
fn duplicate_version_is_rejected() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), NODE_NETWORK, 100);
    let version = version_message(&harness, 0x78, PROTOCOL_VERSION, NODE_NETWORK);
    harness.deliver(peer, &NetMessage::Version(version));
    let messages = harness.connman.messages_for(peer);
    match &messages[0] {
        NetMessage::Reject(reject) => {
            assert_eq!(reject.message, "version");
            assert_eq!(reject.code, REJECT_DUPLICATE);
        }
        other => panic!("expected reject, got {}", other.command()),
    }
    assert_eq!(harness.misbehavior_of(peer), 1);
}

#[test]
fn obsolete_version_gets_reject_and_disconnect() {
    let harness = Harness::new();
    let peer = harness.add_peer(1, PeerFlags::default());
    harness.connman.clear();
    let version = version_message(&harness, 0x79, 30_000, NODE_NETWORK);
    harness.deliver(peer, &NetMessage::Version(version));
    let messages = harness.connman.messages_for(peer);
    match &messages[0] {
        NetMessage::Reject(reject) => {
            assert_eq!(reject.code, REJECT_OBSOLETE);
            assert!(reject.reason.starts_with("Version must be"));
        }
        other => panic!("expected reject, got {}", other.command()),
    }
    assert!(harness.processor.peer_marked_for_disconnect(peer));
}

#[test]
fn messages_before_version_are_penalized() {
    let harness = Harness::new();
    let peer = harness.add_peer(1, PeerFlags::default());
    harness.deliver(peer, &NetMessage::SendHeaders);
    assert_eq!(harness.misbehavior_of(peer), 1);
}

#[test]
fn messages_between_version_and_verack_are_penalized() {
    let harness = Harness::new();
    let peer = harness.add_peer(1, PeerFlags::default());
    let version = version_message(&harness, 0x80, PROTOCOL_VERSION, NODE_NETWORK);
    harness.deliver(peer, &NetMessage::Version(version));
    harness.deliver(peer, &NetMessage::SendHeaders);
    assert_eq!(harness.misbehavior_of(peer), 1);
    // After verack the same message is welcome.
    harness.deliver(peer, &NetMessage::Verack);
    harness.deliver(peer, &NetMessage::SendHeaders);
    assert_eq!(harness.misbehavior_of(peer), 1);
}

#[test]
fn sendcmpct_first_announcement_locks_witness_choice() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), NODE_NETWORK | NODE_WITNESS, 100);
    harness.deliver(
        peer,
        &NetMessage::SendCmpct(SendCmpct {
            announce: true,
            version: 1,
        }),
    );
    // A later v2 announcement no longer flips the locked-in choice.
    harness.deliver(
        peer,
        &NetMessage::SendCmpct(SendCmpct {
            announce: false,
            version: 2,
        }),
    );
    // The v1 lock means witness compact blocks are not the negotiated
    // encoding, yet the desired (v2) support was still recorded on the
    // second message.
    harness.processor.with_state(|state| {
        let peer_state = state.peer(peer).expect("peer state");
        assert!(peer_state.provides_header_and_ids);
        assert!(!peer_state.wants_cmpct_witness);
        assert!(peer_state.prefer_header_and_ids);
        assert!(peer_state.supports_desired_cmpct_version);
    });
}

#[test]
fn feeler_disconnects_after_version() {
    let harness = Harness::new();
    let peer = harness.add_peer(
        7,
        PeerFlags {
            feeler: true,
            ..PeerFlags::default()
        },
    );
    let version = version_message(&harness, 0x81, PROTOCOL_VERSION, NODE_NETWORK);
    harness.deliver(peer, &NetMessage::Version(version));
    assert!(harness.processor.peer_marked_for_disconnect(peer));
}
