//! Headers-first synchronization behavior.

mod common;

use common::Harness;
use rookd_consensus::constants::{NODE_NETWORK, NODE_WITNESS};
use rookd_net::header_sync::{MAX_HEADERS_RESULTS, MAX_UNCONNECTING_HEADERS};
use rookd_net::peer::PeerFlags;
use rookd_net::wire::NetMessage;
use rookd_primitives::BlockHeader;

fn full_node() -> u64 {
    NODE_NETWORK | NODE_WITNESS
}

#[test]
fn sync_starts_with_getheaders_from_parent_of_best() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    harness.tick_send(peer);
    let messages = harness.connman.messages_for(peer);
    let getheaders = messages
        .iter()
        .find_map(|message| match message {
            NetMessage::GetHeaders(locator) => Some(locator.clone()),
            _ => None,
        })
        .expect("initial getheaders");
    assert_eq!(getheaders.stop, [0u8; 32]);
    assert!(!getheaders.have.is_empty());
    harness.processor.with_state(|state| {
        assert!(state.peer(peer).expect("peer").sync_started);
        assert_eq!(state.sync_started_count, 1);
    });
}

#[test]
fn full_batch_triggers_followup_getheaders() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let headers = harness
        .chain
        .make_headers(harness.chain.genesis(), MAX_HEADERS_RESULTS, 1);
    harness.deliver(peer, &NetMessage::Headers(headers.clone()));
    let commands = harness.connman.commands_for(peer);
    assert!(
        commands.iter().any(|command| command == "getheaders"),
        "expected a follow-up getheaders, got {commands:?}"
    );
    // Availability tracked to the last delivered header.
    harness.processor.with_state(|state| {
        let best = state.peer(peer).expect("peer").best_known_block;
        assert!(best.is_some());
    });
}

#[test]
fn short_batch_does_not_trigger_followup() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let headers = harness
        .chain
        .make_headers(harness.chain.genesis(), MAX_HEADERS_RESULTS - 1, 1);
    // Witness rules never activate in this harness, so a direct fetch may
    // fire; only the absence of a headers continuation matters here.
    harness.deliver(peer, &NetMessage::Headers(headers));
    let messages = harness.connman.messages_for(peer);
    assert!(!messages
        .iter()
        .any(|message| matches!(message, NetMessage::GetHeaders(_))));
}

#[test]
fn empty_headers_is_a_clean_noop() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    harness.deliver(peer, &NetMessage::Headers(Vec::new()));
    assert_eq!(harness.misbehavior_of(peer), 0);
    assert!(harness.connman.messages_for(peer).is_empty());
}

#[test]
fn unconnecting_announcement_requests_bridge_headers() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let orphan = BlockHeader {
        version: 4,
        prev_hash: [0xaa; 32],
        merkle_root: [0u8; 32],
        time: 1000,
        bits: 0x207f_ffff,
        nonce: 1,
    };
    harness.deliver(peer, &NetMessage::Headers(vec![orphan]));
    let commands = harness.connman.commands_for(peer);
    assert_eq!(commands, vec!["getheaders"]);
    assert_eq!(harness.misbehavior_of(peer), 0);
    harness.processor.with_state(|state| {
        let peer_state = state.peer(peer).expect("peer");
        assert_eq!(peer_state.unconnecting_headers, 1);
        assert_eq!(peer_state.last_unknown_block, Some(orphan.hash()));
    });
}

#[test]
fn tenth_unconnecting_header_costs_twenty_points() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    for round in 0..MAX_UNCONNECTING_HEADERS {
        let orphan = BlockHeader {
            version: 4,
            prev_hash: [0xbb; 32],
            merkle_root: [0u8; 32],
            time: 1000 + round as u32,
            bits: 0x207f_ffff,
            nonce: round as u32,
        };
        harness.deliver(peer, &NetMessage::Headers(vec![orphan]));
        if round < MAX_UNCONNECTING_HEADERS - 1 {
            assert_eq!(harness.misbehavior_of(peer), 0, "round {round}");
        }
    }
    assert_eq!(harness.misbehavior_of(peer), 20);
}

#[test]
fn connecting_headers_reset_the_streak() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let orphan = BlockHeader {
        version: 4,
        prev_hash: [0xcc; 32],
        merkle_root: [0u8; 32],
        time: 1000,
        bits: 0x207f_ffff,
        nonce: 5,
    };
    harness.deliver(peer, &NetMessage::Headers(vec![orphan]));
    let headers = harness.chain.make_headers(harness.chain.genesis(), 3, 2);
    harness.deliver(peer, &NetMessage::Headers(headers));
    harness.processor.with_state(|state| {
        assert_eq!(state.peer(peer).expect("peer").unconnecting_headers, 0);
    });
}

#[test]
fn non_contiguous_headers_cost_twenty_points() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let mut headers = harness.chain.make_headers(harness.chain.genesis(), 3, 3);
    headers[2].prev_hash = [0xdd; 32];
    harness.deliver(peer, &NetMessage::Headers(headers));
    assert_eq!(harness.misbehavior_of(peer), 20);
}

#[test]
fn oversized_headers_message_costs_twenty_points() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let headers = harness
        .chain
        .make_headers(harness.chain.genesis(), MAX_HEADERS_RESULTS + 1, 4);
    harness.deliver(peer, &NetMessage::Headers(headers));
    assert_eq!(harness.misbehavior_of(peer), 20);
}

#[test]
fn direct_fetch_requests_announced_blocks() {
    let harness = Harness::new();
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    let headers = harness.chain.make_headers(harness.chain.genesis(), 3, 5);
    harness.deliver(peer, &NetMessage::Headers(headers.clone()));
    let messages = harness.connman.messages_for(peer);
    let get_data = messages
        .iter()
        .find_map(|message| match message {
            NetMessage::GetData(items) => Some(items.clone()),
            _ => None,
        })
        .expect("direct fetch getdata");
    assert_eq!(get_data.len(), 3);
    // Earliest block first.
    assert_eq!(get_data[0].hash, headers[0].hash());
    harness.processor.with_state(|state| {
        assert_eq!(state.total_in_flight(), 3);
        assert_eq!(
            state.peer(peer).expect("peer").blocks_in_flight.len(),
            3
        );
    });
}

#[test]
fn headers_sync_timeout_drops_sole_sync_peer() {
    // Old chain: nothing is near today, so only one sync peer is allowed.
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);
    let sync_peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 5000);
    harness.tick_send(sync_peer);
    harness.processor.with_state(|state| {
        assert!(state.peer(sync_peer).expect("peer").sync_started);
    });
    // A second preferred peer exists, so the stalled sync peer can go.
    let _other = harness.connect_peer(2, PeerFlags::default(), full_node(), 5000);
    harness.processor.with_state(|state| {
        assert_eq!(state.sync_started_count, 1);
    });

    // Jump far past the deadline.
    harness.clock.advance_seconds(16 * 60);
    harness.tick_send(sync_peer);
    assert!(harness.processor.peer_marked_for_disconnect(sync_peer));
}

#[test]
fn whitelisted_sync_peer_is_reset_not_dropped() {
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);
    let sync_peer = harness.connect_peer(
        1,
        PeerFlags {
            whitelisted: true,
            ..PeerFlags::default()
        },
        full_node(),
        5000,
    );
    harness.tick_send(sync_peer);
    let _other = harness.connect_peer(2, PeerFlags::default(), full_node(), 5000);
    harness.clock.advance_seconds(16 * 60);
    harness.tick_send(sync_peer);
    assert!(!harness.processor.peer_marked_for_disconnect(sync_peer));
    harness.processor.with_state(|state| {
        assert!(!state.peer(sync_peer).expect("peer").sync_started);
    });
}
