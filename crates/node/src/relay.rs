//! Transaction-pool seam for a block-relay-only node: the daemon keeps no
//! mempool, so every call is a polite refusal.

use rookd_consensus::Hash256;
use rookd_net::bloom::BloomFilter;
use rookd_net::collab::{TxAcceptOutcome, TxInventoryResult, TxPool};
use rookd_net::config::DEFAULT_MIN_RELAY_TX_FEE;
use rookd_net::peer::PeerId;
use rookd_primitives::{Block, Transaction};

#[derive(Default)]
pub struct PassiveTxPool;

impl TxPool for PassiveTxPool {
    fn does_tx_exist(&self, _hash: &Hash256) -> bool {
        false
    }

    fn accept_tx(&self, _from: PeerId, _tx: &Transaction) -> TxAcceptOutcome {
        // We advertised relay=false; unsolicited transactions are dropped
        // without grading the peer.
        TxAcceptOutcome::default()
    }

    fn request_tx(
        &self,
        _hash: &Hash256,
        _with_witness: bool,
        _last_mempool_request: i64,
    ) -> Option<Transaction> {
        None
    }

    fn tx_inventory(
        &self,
        _send_mempool: bool,
        _fee_filter: i64,
        _filter: Option<&BloomFilter>,
        _candidates: Vec<Hash256>,
    ) -> TxInventoryResult {
        TxInventoryResult::default()
    }

    fn remove_orphans_for_block(&self, _block: &Block) {}

    fn remove_orphans_for_peer(&self, _peer: PeerId) {}

    fn min_fee_rate(&self, _max_mempool_bytes: u64) -> i64 {
        DEFAULT_MIN_RELAY_TX_FEE
    }

    fn snapshot(&self) -> Vec<Transaction> {
        Vec::new()
    }
}
