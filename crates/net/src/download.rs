//! Block-download scheduling: deciding which blocks to request from which
//! peer, within the moving download window.

use rookd_chain::BlockId;

use crate::collab::ChainEngine;
use crate::peer::PeerId;
use crate::state::NetState;

/// How far ahead of the last linked common block we are willing to fetch.
pub const BLOCK_DOWNLOAD_WINDOW: i32 = 1024;
/// Per-peer ceiling on outstanding block requests.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;
/// A window-blocking peer is dropped this long after being named a staller.
pub const BLOCK_STALLING_TIMEOUT_MICROS: i64 = 2 * 1_000_000;
/// Slow-block timeout: spacing × (BASE + PER_PEER × other validated
/// downloaders), with the constants pre-scaled to microseconds.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: i64 = 1_000_000;
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: i64 = 500_000;

/// Ancestor batch size for the window walk; fetching ancestors is as
/// expensive as scanning about this many entries anyway.
const WALK_BATCH: i32 = 128;

/// Update the peer's last common block and collect up to `count` fetchable
/// successors toward its best known block. When the window is blocked and
/// nothing was collected, also names the peer responsible.
pub fn find_next_blocks_to_download<C: ChainEngine>(
    state: &mut NetState,
    chain: &C,
    id: PeerId,
    count: usize,
) -> (Vec<BlockId>, Option<PeerId>) {
    let mut blocks: Vec<BlockId> = Vec::new();
    let mut staller: Option<PeerId> = None;
    if count == 0 {
        return (blocks, staller);
    }

    state.process_block_availability(id, chain);
    let (best_known, have_witness, prior_common) = match state.peer(id) {
        Some(peer) => (
            peer.best_known_block,
            peer.have_witness,
            peer.last_common_block,
        ),
        None => return (blocks, staller),
    };
    let Some(best_known) = best_known else {
        // This peer has nothing interesting.
        return (blocks, staller);
    };
    let tip = chain.tip();
    let best_work = chain.chain_work(best_known);
    if best_work < chain.chain_work(tip) && best_work < chain.min_chain_work() {
        return (blocks, staller);
    }

    // Bootstrap by guessing the fork point is at our height on the peer's
    // chain; wrong guesses fix themselves below.
    let seeded = match prior_common {
        Some(common) => common,
        None => {
            let guess_height = chain.height(best_known).min(chain.height(tip));
            match chain.active_at(guess_height) {
                Some(at) => at,
                None => return (blocks, staller),
            }
        }
    };
    // A reorg on the peer's side may have left the previous common block
    // off its chain; walk back to the true fork point.
    let mut last_common = chain.last_common_ancestor(seeded, best_known);

    'walk: {
        if last_common == best_known {
            break 'walk;
        }

        let window_end = chain.height(last_common) + BLOCK_DOWNLOAD_WINDOW;
        let max_height = chain.height(best_known).min(window_end + 1);
        let mut waiting_for: Option<PeerId> = None;
        let mut walk = last_common;

        while chain.height(walk) < max_height {
            let walk_height = chain.height(walk);
            let to_fetch = (max_height - walk_height)
                .min(((count - blocks.len()) as i32).max(WALK_BATCH));
            let Some(batch_top) = chain.ancestor(best_known, walk_height + to_fetch) else {
                break 'walk;
            };
            let mut batch = Vec::with_capacity(to_fetch as usize);
            let mut cursor = Some(batch_top);
            for _ in 0..to_fetch {
                match cursor {
                    Some(at) => {
                        batch.push(at);
                        cursor = chain.prev(at);
                    }
                    None => break 'walk,
                }
            }
            batch.reverse();
            walk = batch_top;

            for index in batch {
                if !chain.is_valid_tree(index) {
                    // The whole chain this peer is on is invalid.
                    break 'walk;
                }
                if !have_witness && chain.witness_enabled(chain.prev(index)) {
                    // We would not download this block or its descendants
                    // from this peer.
                    break 'walk;
                }
                let hash = chain.block_hash(index);
                if chain.has_data(index) || chain.contains(index) {
                    if chain.chain_tx(index) {
                        last_common = index;
                    }
                } else if !state.is_block_in_flight(&hash) {
                    if chain.height(index) > window_end {
                        if blocks.is_empty() && waiting_for != Some(id) {
                            // We would fetch the next block if the window
                            // were one larger; name the blocker.
                            staller = waiting_for;
                        }
                        break 'walk;
                    }
                    blocks.push(index);
                    if blocks.len() == count {
                        break 'walk;
                    }
                } else if waiting_for.is_none() {
                    waiting_for = state.in_flight_owner(&hash);
                }
            }
        }
    }

    if let Some(peer) = state.peer_mut(id) {
        peer.last_common_block = Some(last_common);
    }
    (blocks, staller)
}
