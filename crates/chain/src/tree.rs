//! Header tree: an append-only arena of block index entries.
//!
//! Entries are addressed by copyable [`BlockId`]s that stay valid for the
//! tree's lifetime, so other subsystems can hold them as back-references
//! without lifetime entanglement.

use std::collections::HashMap;
use std::fmt;

use primitive_types::U256;
use rookd_consensus::{hash256_to_hex, Hash256};
use rookd_primitives::BlockHeader;

use crate::work::block_proof;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How far validation has progressed for an entry. Mirrors the usual
/// tree → transactions → chain ladder; `Failed` entries keep their level
/// but are never treated as valid.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Validity {
    Tree,
    Transactions,
    Chain,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AcceptError {
    /// The header's parent is not in the tree.
    PrevMissing(Hash256),
    /// The header builds on a known-invalid block.
    BadPrev,
    /// The header was already rejected before.
    DuplicateInvalid,
    /// The compact target is unusable.
    BadBits,
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptError::PrevMissing(hash) => {
                write!(f, "previous block {} not found", hash256_to_hex(hash))
            }
            AcceptError::BadPrev => write!(f, "builds on an invalid block"),
            AcceptError::DuplicateInvalid => write!(f, "header was previously rejected"),
            AcceptError::BadBits => write!(f, "invalid compact target"),
        }
    }
}

impl std::error::Error for AcceptError {}

struct IndexEntry {
    hash: Hash256,
    header: BlockHeader,
    prev: Option<BlockId>,
    children: Vec<BlockId>,
    height: i32,
    chain_work: U256,
    validity: Validity,
    failed: bool,
    have_data: bool,
    /// Every block from genesis through this one has data.
    chain_tx: bool,
    n_tx: u32,
}

pub struct BlockTree {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
    /// Active chain, indexed by height.
    active: Vec<BlockId>,
    best_header: BlockId,
}

impl BlockTree {
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.hash();
        let work = block_proof(genesis.bits).unwrap_or_default();
        let entry = IndexEntry {
            hash,
            header: genesis,
            prev: None,
            children: Vec::new(),
            height: 0,
            chain_work: work,
            validity: Validity::Chain,
            failed: false,
            have_data: true,
            chain_tx: true,
            n_tx: 1,
        };
        let id = BlockId(0);
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, id);
        Self {
            entries: vec![entry],
            by_hash,
            active: vec![id],
            best_header: id,
        }
    }

    fn entry(&self, id: BlockId) -> &IndexEntry {
        &self.entries[id.index()]
    }

    fn entry_mut(&mut self, id: BlockId) -> &mut IndexEntry {
        &mut self.entries[id.index()]
    }

    pub fn genesis(&self) -> BlockId {
        BlockId(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// All entry ids, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.entries.len() as u32).map(BlockId)
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn hash(&self, id: BlockId) -> Hash256 {
        self.entry(id).hash
    }

    pub fn header(&self, id: BlockId) -> BlockHeader {
        self.entry(id).header
    }

    pub fn height(&self, id: BlockId) -> i32 {
        self.entry(id).height
    }

    pub fn prev(&self, id: BlockId) -> Option<BlockId> {
        self.entry(id).prev
    }

    pub fn chain_work(&self, id: BlockId) -> U256 {
        self.entry(id).chain_work
    }

    pub fn header_time(&self, id: BlockId) -> i64 {
        i64::from(self.entry(id).header.time)
    }

    pub fn have_data(&self, id: BlockId) -> bool {
        self.entry(id).have_data
    }

    pub fn n_tx(&self, id: BlockId) -> u32 {
        self.entry(id).n_tx
    }

    pub fn chain_tx(&self, id: BlockId) -> bool {
        self.entry(id).chain_tx
    }

    pub fn is_valid(&self, id: BlockId, level: Validity) -> bool {
        let entry = self.entry(id);
        !entry.failed && entry.validity >= level
    }

    pub fn is_failed(&self, id: BlockId) -> bool {
        self.entry(id).failed
    }

    pub fn raise_validity(&mut self, id: BlockId, level: Validity) {
        let entry = self.entry_mut(id);
        if !entry.failed && entry.validity < level {
            entry.validity = level;
        }
    }

    /// Mark an entry invalid along with every descendant.
    pub fn mark_failed(&mut self, id: BlockId) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let entry = self.entry_mut(current);
            entry.failed = true;
            stack.extend(entry.children.iter().copied());
        }
        self.recompute_best_header();
    }

    fn recompute_best_header(&mut self) {
        let mut best = self.genesis();
        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.failed && entry.chain_work > self.entries[best.index()].chain_work {
                best = BlockId(index as u32);
            }
        }
        self.best_header = best;
    }

    /// Structurally accept one header. Re-announcing a known valid header
    /// returns its existing id.
    pub fn accept_header(&mut self, header: &BlockHeader) -> Result<BlockId, AcceptError> {
        let hash = header.hash();
        if let Some(existing) = self.lookup(&hash) {
            if self.entry(existing).failed {
                return Err(AcceptError::DuplicateInvalid);
            }
            return Ok(existing);
        }
        let prev = self
            .lookup(&header.prev_hash)
            .ok_or(AcceptError::PrevMissing(header.prev_hash))?;
        if self.entry(prev).failed {
            return Err(AcceptError::BadPrev);
        }
        let proof = block_proof(header.bits).ok_or(AcceptError::BadBits)?;
        if proof.is_zero() {
            return Err(AcceptError::BadBits);
        }
        let id = BlockId(self.entries.len() as u32);
        let parent = self.entry(prev);
        let entry = IndexEntry {
            hash,
            header: *header,
            prev: Some(prev),
            children: Vec::new(),
            height: parent.height + 1,
            chain_work: parent.chain_work + proof,
            validity: Validity::Tree,
            failed: false,
            have_data: false,
            chain_tx: false,
            n_tx: 0,
        };
        let work = entry.chain_work;
        self.entries.push(entry);
        self.by_hash.insert(hash, id);
        self.entry_mut(prev).children.push(id);
        if work > self.entry(self.best_header).chain_work {
            self.best_header = id;
        }
        Ok(id)
    }

    /// Record that a block's data arrived; propagates `chain_tx` to any
    /// descendants whose ancestry is now complete.
    pub fn set_have_data(&mut self, id: BlockId, n_tx: u32) {
        {
            let entry = self.entry_mut(id);
            entry.have_data = true;
            entry.n_tx = n_tx;
        }
        let parent_complete = match self.entry(id).prev {
            Some(prev) => self.entry(prev).chain_tx,
            None => true,
        };
        if !parent_complete {
            return;
        }
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let ready = {
                let entry = self.entry(current);
                entry.have_data && !entry.chain_tx
            };
            if !ready {
                continue;
            }
            self.entry_mut(current).chain_tx = true;
            let children = self.entry(current).children.clone();
            stack.extend(children);
        }
    }

    pub fn ancestor(&self, id: BlockId, height: i32) -> Option<BlockId> {
        if height < 0 || height > self.entry(id).height {
            return None;
        }
        let mut walk = id;
        while self.entry(walk).height > height {
            walk = self.entry(walk).prev?;
        }
        Some(walk)
    }

    /// Deepest entry that is an ancestor of both arguments.
    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> BlockId {
        let mut left = a;
        let mut right = b;
        let common_height = self.entry(left).height.min(self.entry(right).height);
        left = self.ancestor(left, common_height).unwrap_or(self.genesis());
        right = self.ancestor(right, common_height).unwrap_or(self.genesis());
        while left != right {
            match (self.entry(left).prev, self.entry(right).prev) {
                (Some(l), Some(r)) => {
                    left = l;
                    right = r;
                }
                _ => return self.genesis(),
            }
        }
        left
    }

    pub fn descends_from(&self, id: BlockId, ancestor: BlockId) -> bool {
        self.ancestor(id, self.entry(ancestor).height) == Some(ancestor)
    }

    // Active chain.

    pub fn tip(&self) -> BlockId {
        *self.active.last().expect("active chain never empty")
    }

    pub fn tip_height(&self) -> i32 {
        self.active.len() as i32 - 1
    }

    pub fn at_height(&self, height: i32) -> Option<BlockId> {
        if height < 0 {
            return None;
        }
        self.active.get(height as usize).copied()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.at_height(self.entry(id).height) == Some(id)
    }

    /// Re-point the active chain at `tip`, which must have complete data.
    pub fn set_tip(&mut self, tip: BlockId) {
        let mut chain = Vec::with_capacity(self.entry(tip).height as usize + 1);
        let mut walk = Some(tip);
        while let Some(id) = walk {
            chain.push(id);
            walk = self.entry(id).prev;
        }
        chain.reverse();
        self.active = chain;
    }

    pub fn best_header(&self) -> BlockId {
        self.best_header
    }

    /// Sparse locator with exponentially growing strides, ending at genesis.
    pub fn locator(&self, from: Option<BlockId>) -> Vec<Hash256> {
        let start = from.unwrap_or_else(|| self.best_header());
        let mut locator = Vec::with_capacity(32);
        let mut walk = start;
        let mut step: i32 = 1;
        loop {
            locator.push(self.entry(walk).hash);
            let height = self.entry(walk).height;
            if height == 0 {
                break;
            }
            let next_height = (height - step).max(0);
            walk = self
                .ancestor(walk, next_height)
                .unwrap_or_else(|| self.genesis());
            if locator.len() > 10 {
                step = step.saturating_mul(2);
            }
        }
        if locator.last() != Some(&self.entry(self.genesis()).hash) {
            locator.push(self.entry(self.genesis()).hash);
        }
        locator
    }
}
