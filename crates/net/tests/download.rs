//! Block-download scheduling: window behavior, staller attribution, and
//! the stall/slow-block disconnects.

mod common;

use common::Harness;
use rookd_consensus::constants::{NODE_NETWORK, NODE_WITNESS};
use rookd_net::download::{BLOCK_DOWNLOAD_WINDOW, MAX_BLOCKS_IN_TRANSIT_PER_PEER};
use rookd_net::peer::PeerFlags;
use rookd_net::wire::NetMessage;

fn full_node() -> u64 {
    NODE_NETWORK | NODE_WITNESS
}

#[test]
fn scheduler_requests_up_to_the_transit_cap() {
    // Old tip: direct fetch is off, the scheduler does the requesting.
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 100);
    let headers = harness.chain.make_headers(harness.chain.genesis(), 40, 1);
    harness.deliver(peer, &NetMessage::Headers(headers.clone()));
    harness.connman.clear();

    harness.tick_send(peer);
    let messages = harness.connman.messages_for(peer);
    let get_data = messages
        .iter()
        .find_map(|message| match message {
            NetMessage::GetData(items) => Some(items.clone()),
            _ => None,
        })
        .expect("scheduled getdata");
    assert_eq!(get_data.len(), MAX_BLOCKS_IN_TRANSIT_PER_PEER);
    assert_eq!(get_data[0].hash, headers[0].hash());
    harness.processor.with_state(|state| {
        assert_eq!(state.total_in_flight(), MAX_BLOCKS_IN_TRANSIT_PER_PEER);
        assert_eq!(
            state.total_in_flight(),
            state
                .peers
                .values()
                .map(|peer| peer.blocks_in_flight.len())
                .sum::<usize>()
        );
    });

    // Delivering the first block frees one slot for the next request.
    let block = common::build_block(&headers[0]);
    harness.deliver(peer, &NetMessage::Block(block));
    harness.connman.clear();
    harness.tick_send(peer);
    let messages = harness.connman.messages_for(peer);
    let get_data = messages
        .iter()
        .find_map(|message| match message {
            NetMessage::GetData(items) => Some(items.clone()),
            _ => None,
        })
        .expect("follow-up getdata");
    assert_eq!(get_data.len(), 1);
    assert_eq!(get_data[0].hash, headers[MAX_BLOCKS_IN_TRANSIT_PER_PEER].hash());
}

#[test]
fn window_blockage_names_the_staller_and_evicts_it() {
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);

    // A long headers chain with two holes: block 1 is missing everywhere,
    // bodies for heights 2..=1024 are on disk, and the next gap sits just
    // past the download window.
    let headers = harness
        .chain
        .make_headers(harness.chain.genesis(), 1100, 2);
    let ids = harness.chain.insert_headers(&headers);
    for index in 1..1024 {
        harness.chain.give_data(ids[index]);
    }

    let slow_peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 1100);
    let keen_peer = harness.connect_peer(2, PeerFlags::default(), full_node(), 1100);
    harness.processor.with_state_mut(|state| {
        for id in [slow_peer, keen_peer] {
            let peer = state.peer_mut(id).expect("peer");
            peer.best_known_block = Some(ids[1099]);
        }
    });

    // The slow peer picks up the only fetchable block in the window.
    harness.tick_send(slow_peer);
    harness.processor.with_state(|state| {
        let peer = state.peer(slow_peer).expect("peer");
        assert_eq!(peer.blocks_in_flight.len(), 1);
        assert_eq!(peer.blocks_in_flight[0].hash, headers[0].hash());
    });

    // The keen peer finds the window exhausted: every candidate is behind
    // the slow peer's outstanding request, which gets the blame.
    harness.connman.clear();
    harness.tick_send(keen_peer);
    let messages = harness.connman.messages_for(keen_peer);
    assert!(!messages
        .iter()
        .any(|message| matches!(message, NetMessage::GetData(_))));
    let stall_started = harness.processor.with_state(|state| {
        assert_eq!(state.peer(keen_peer).expect("peer").stalling_since, 0);
        state.peer(slow_peer).expect("peer").stalling_since
    });
    assert_ne!(stall_started, 0);

    // At exactly the stalling timeout nothing happens yet...
    harness.clock.advance_seconds(2);
    harness.tick_send(slow_peer);
    assert!(!harness.processor.peer_marked_for_disconnect(slow_peer));
    // ...one second later the staller is gone.
    harness.clock.advance_seconds(1);
    harness.tick_send(slow_peer);
    assert!(harness.processor.peer_marked_for_disconnect(slow_peer));
    assert!(harness.connman.was_disconnected(slow_peer));
}

#[test]
fn download_window_is_1024() {
    assert_eq!(BLOCK_DOWNLOAD_WINDOW, 1024);
}

#[test]
fn peer_without_interesting_chain_is_not_asked() {
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);
    // Raise the bar so a stub chain qualifies for neither condition.
    harness
        .chain
        .set_min_work(primitive_types::U256::MAX);
    let headers = harness.chain.make_headers(harness.chain.genesis(), 4, 3);
    let ids = harness.chain.insert_headers(&headers);
    harness.chain.advance_tip(ids[3]);

    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 100);
    harness.processor.with_state_mut(|state| {
        state.peer_mut(peer).expect("peer").best_known_block = Some(ids[0]);
    });
    harness.connman.clear();
    harness.tick_send(peer);
    let messages = harness.connman.messages_for(peer);
    assert!(!messages
        .iter()
        .any(|message| matches!(message, NetMessage::GetData(_))));
}

#[test]
fn slow_block_timeout_disconnects() {
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);
    let peer = harness.connect_peer(1, PeerFlags::default(), full_node(), 100);
    let headers = harness.chain.make_headers(harness.chain.genesis(), 4, 4);
    harness.deliver(peer, &NetMessage::Headers(headers));
    harness.tick_send(peer);
    harness.processor.with_state(|state| {
        assert!(!state.peer(peer).expect("peer").blocks_in_flight.is_empty());
    });
    // No other peers download validated blocks, so the budget is one block
    // interval; an hour of silence is far past it.
    harness.clock.advance_seconds(60 * 60);
    harness.tick_send(peer);
    assert!(harness.processor.peer_marked_for_disconnect(peer));
}

#[test]
fn requests_stop_for_light_clients() {
    let harness = Harness::with_genesis_age(40 * 24 * 60 * 60);
    // No NODE_NETWORK: a client that cannot serve blocks.
    let peer = harness.connect_peer(1, PeerFlags::default(), 0, 100);
    let headers = harness.chain.make_headers(harness.chain.genesis(), 4, 5);
    harness.chain.insert_headers(&headers);
    harness.connman.clear();
    harness.tick_send(peer);
    let messages = harness.connman.messages_for(peer);
    assert!(!messages
        .iter()
        .any(|message| matches!(message, NetMessage::GetData(_))));
}
