//! Key/value cache threaded through every decoder layer.
//!
//! Two layouts are supported:
//! - [`ContiguousKvCache`]: one growing K/V tensor per layer and sequence slot.
//! - [`PagedKvCache`]: fixed-size blocks drawn from a shared pool. Each slot
//!   owns a block table; blocks are reference counted so forked sequences
//!   (beam search) share their prefix and copy a block only when appending
//!   to a shared one.
//!
//! K/V tensors are stored per slot as `[kv_heads, tokens, head_size]`.

use std::collections::{HashMap, VecDeque};

use candle_core::Tensor;
use tracing::debug;

use crate::config::{BaichuanConfig, BuildConfig};
use crate::error::{Error, Result};
use crate::mapping::Mapping;

/// Block ID inside the paged pool.
pub type BlockId = usize;

/// Sequence slot inside a cache.
pub type SlotId = usize;

/// Cache handle plus the slot used by each batch row.
pub struct KeyValueCacheParams<'a> {
    pub cache: &'a mut KvCache,
    pub slots: Vec<SlotId>,
    /// Return `present_key_value_*` tensors from the step. Off by default;
    /// the contiguous layout copies every cached row to build them.
    pub export_presents: bool,
}

impl<'a> KeyValueCacheParams<'a> {
    pub fn new(cache: &'a mut KvCache, slots: Vec<SlotId>) -> Self {
        Self {
            cache,
            slots,
            export_presents: false,
        }
    }

    /// Slots `0..batch_size`.
    pub fn sequential(cache: &'a mut KvCache, batch_size: usize) -> Self {
        Self::new(cache, (0..batch_size).collect())
    }

    pub fn with_presents(mut self) -> Self {
        self.export_presents = true;
        self
    }

    /// Tokens already cached for every row.
    pub fn past_key_value_lengths(&self) -> Vec<usize> {
        self.slots.iter().map(|&s| self.cache.seq_len(s)).collect()
    }
}

pub enum KvCache {
    Contiguous(ContiguousKvCache),
    Paged(PagedKvCache),
}

impl KvCache {
    /// Cache sized for `max_slots` sequences of up to `max_seq_len` tokens,
    /// laid out as the build config requests.
    pub fn for_model(
        config: &BaichuanConfig,
        mapping: &Mapping,
        build: &BuildConfig,
        max_slots: usize,
        max_seq_len: usize,
    ) -> Self {
        if build.paged_kv_cache {
            let blocks_per_seq = max_seq_len.div_ceil(build.tokens_per_block);
            KvCache::Paged(PagedKvCache::new(PagedKvConfig {
                num_layers: config.num_layers,
                num_kv_heads: config.num_kv_heads() / mapping.tp_size,
                head_size: config.head_size(),
                tokens_per_block: build.tokens_per_block,
                max_blocks: max_slots * blocks_per_seq,
                max_slots,
                max_seq_len,
            }))
        } else {
            KvCache::Contiguous(ContiguousKvCache::new(
                config.num_layers,
                max_slots,
                max_seq_len,
            ))
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, KvCache::Paged(_))
    }

    pub fn num_layers(&self) -> usize {
        match self {
            KvCache::Contiguous(c) => c.num_layers(),
            KvCache::Paged(c) => c.config.num_layers,
        }
    }

    pub fn max_slots(&self) -> usize {
        match self {
            KvCache::Contiguous(c) => c.max_slots,
            KvCache::Paged(c) => c.config.max_slots,
        }
    }

    /// Check that every `(slot, new_tokens)` request of a step fits before any
    /// layer appends, then claim the blocks the step writes to. Nothing changes
    /// when a request is rejected.
    pub fn prepare(&mut self, requests: &[(SlotId, usize)]) -> Result<()> {
        let max_slots = self.max_slots();
        let mut seen = vec![false; max_slots];
        for &(slot, _) in requests {
            if slot >= max_slots {
                return Err(Error::CacheError(format!(
                    "slot {slot} is out of range for {max_slots} slots"
                )));
            }
            if std::mem::replace(&mut seen[slot], true) {
                return Err(Error::CacheError(format!("slot {slot} appears twice in one step")));
            }
            let len = self.seq_len(slot);
            if let Some(layer) = (1..self.num_layers()).find(|&l| self.layer_len(l, slot) != len) {
                return Err(Error::CacheError(format!(
                    "slot {slot} holds {len} tokens at layer 0 but {} at layer {layer}",
                    self.layer_len(layer, slot)
                )));
            }
        }
        match self {
            KvCache::Contiguous(c) => c.prepare(requests),
            KvCache::Paged(c) => c.prepare(requests),
        }
    }

    /// Append `k`/`v` (`[kv_heads, new_tokens, head_size]`) for `slot` at
    /// `layer` and return every cached key and value of that slot.
    pub fn append(
        &mut self,
        layer: usize,
        slot: SlotId,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        match self {
            KvCache::Contiguous(c) => c.append(layer, slot, k, v),
            KvCache::Paged(c) => c.append(layer, slot, k, v),
        }
    }

    /// Number of tokens cached for `slot`.
    pub fn seq_len(&self, slot: SlotId) -> usize {
        match self {
            KvCache::Contiguous(c) => c.seq_len(slot),
            KvCache::Paged(c) => c.seq_len(slot),
        }
    }

    /// Tokens cached for `slot` at `layer`. Layers catch up with each other
    /// during a forward step.
    pub fn layer_len(&self, layer: usize, slot: SlotId) -> usize {
        match self {
            KvCache::Contiguous(c) => c.layer_len(layer, slot),
            KvCache::Paged(c) => c.layer_len(layer, slot),
        }
    }

    pub fn release(&mut self, slot: SlotId) {
        match self {
            KvCache::Contiguous(c) => c.release(slot),
            KvCache::Paged(c) => c.release(slot),
        }
    }

    /// Make `dst` a copy of `src`.
    pub fn fork(&mut self, src: SlotId, dst: SlotId) -> Result<()> {
        self.reorder(&[dst], &[src])
    }

    /// For every `i`, replace `slots[i]` by the content `sources[i]` had before
    /// the call. This is the cache-indirection step of beam search.
    pub fn reorder(&mut self, slots: &[SlotId], sources: &[SlotId]) -> Result<()> {
        if slots.len() != sources.len() {
            return Err(Error::CacheError(format!(
                "reorder got {} slots but {} sources",
                slots.len(),
                sources.len()
            )));
        }
        let max_slots = self.max_slots();
        if let Some(bad) = slots.iter().chain(sources).find(|&&s| s >= max_slots) {
            return Err(Error::CacheError(format!(
                "slot {bad} is out of range for {max_slots} slots"
            )));
        }
        match self {
            KvCache::Contiguous(c) => c.reorder(slots, sources),
            KvCache::Paged(c) => c.reorder(slots, sources),
        }
    }

    /// Present keys/values of `layer` for `slots`, as
    /// `[batch, 2, kv_heads, max_len, head_size]` padded with zeros.
    /// Only the contiguous layout exports presents.
    pub fn present(&self, layer: usize, slots: &[SlotId]) -> Result<Option<Tensor>> {
        match self {
            KvCache::Contiguous(c) => c.present(layer, slots).map(Some),
            KvCache::Paged(_) => Ok(None),
        }
    }
}

type KvPair = (Tensor, Tensor);

pub struct ContiguousKvCache {
    layers: Vec<Vec<Option<KvPair>>>,
    max_slots: usize,
    max_seq_len: usize,
}

impl ContiguousKvCache {
    pub fn new(num_layers: usize, max_slots: usize, max_seq_len: usize) -> Self {
        Self {
            layers: vec![vec![None; max_slots]; num_layers],
            max_slots,
            max_seq_len,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn entry_mut(&mut self, layer: usize, slot: SlotId) -> Result<&mut Option<KvPair>> {
        let max_slots = self.max_slots;
        self.layers
            .get_mut(layer)
            .ok_or_else(|| Error::CacheError(format!("layer {layer} is out of range")))?
            .get_mut(slot)
            .ok_or_else(|| {
                Error::CacheError(format!("slot {slot} is out of range for {max_slots} slots"))
            })
    }

    pub fn append(
        &mut self,
        layer: usize,
        slot: SlotId,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let max_seq_len = self.max_seq_len;
        let entry = self.entry_mut(layer, slot)?;
        let (k, v) = match entry.as_ref() {
            Some((prev_k, prev_v)) => (Tensor::cat(&[prev_k, k], 1)?, Tensor::cat(&[prev_v, v], 1)?),
            None => (k.clone(), v.clone()),
        };
        let len = k.dim(1)?;
        if len > max_seq_len {
            return Err(Error::CacheError(format!(
                "slot {slot} would hold {len} tokens, max_seq_len is {max_seq_len}"
            )));
        }
        *entry = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    fn prepare(&self, requests: &[(SlotId, usize)]) -> Result<()> {
        for &(slot, new_tokens) in requests {
            let total = self.seq_len(slot) + new_tokens;
            if total > self.max_seq_len {
                return Err(Error::CacheError(format!(
                    "slot {slot} would hold {total} tokens, max_seq_len is {}",
                    self.max_seq_len
                )));
            }
        }
        Ok(())
    }

    pub fn seq_len(&self, slot: SlotId) -> usize {
        self.layer_len(0, slot)
    }

    pub fn layer_len(&self, layer: usize, slot: SlotId) -> usize {
        self.layers
            .get(layer)
            .and_then(|layer| layer.get(slot))
            .and_then(|entry| entry.as_ref())
            .and_then(|(k, _)| k.dim(1).ok())
            .unwrap_or(0)
    }

    pub fn release(&mut self, slot: SlotId) {
        for layer in self.layers.iter_mut() {
            if let Some(entry) = layer.get_mut(slot) {
                *entry = None;
            }
        }
    }

    fn reorder(&mut self, slots: &[SlotId], sources: &[SlotId]) -> Result<()> {
        for layer in self.layers.iter_mut() {
            let snapshot: Vec<Option<KvPair>> = sources.iter().map(|&s| layer[s].clone()).collect();
            for (&slot, entry) in slots.iter().zip(snapshot) {
                layer[slot] = entry;
            }
        }
        Ok(())
    }

    pub fn present(&self, layer: usize, slots: &[SlotId]) -> Result<Tensor> {
        let entries = self
            .layers
            .get(layer)
            .ok_or_else(|| Error::CacheError(format!("layer {layer} is out of range")))?;
        let mut pairs = Vec::with_capacity(slots.len());
        for &slot in slots {
            let pair = entries
                .get(slot)
                .and_then(|e| e.as_ref())
                .ok_or_else(|| Error::CacheError(format!("slot {slot} holds no keys/values")))?;
            pairs.push(pair);
        }
        let max_len = pairs
            .iter()
            .map(|(k, _)| k.dim(1))
            .collect::<candle_core::Result<Vec<_>>>()?
            .into_iter()
            .max()
            .unwrap_or(0);
        let mut rows = Vec::with_capacity(pairs.len());
        for (k, v) in pairs {
            let pad = max_len - k.dim(1)?;
            let k = k.pad_with_zeros(1, 0, pad)?;
            let v = v.pad_with_zeros(1, 0, pad)?;
            rows.push(Tensor::stack(&[k, v], 0)?);
        }
        Tensor::stack(&rows, 0).map_err(Error::from)
    }
}

/// Configuration for the paged cache.
#[derive(Debug, Clone)]
pub struct PagedKvConfig {
    pub num_layers: usize,
    /// KV heads held by this rank
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub tokens_per_block: usize,
    pub max_blocks: usize,
    pub max_slots: usize,
    pub max_seq_len: usize,
}

impl PagedKvConfig {
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.tokens_per_block)
    }
}

#[derive(Debug, Clone)]
struct Block {
    ref_count: usize,
}

/// Block allocator using a LIFO free list.
#[derive(Debug)]
pub struct BlockAllocator {
    blocks: Vec<Block>,
    free_list: VecDeque<BlockId>,
}

impl BlockAllocator {
    pub fn new(max_blocks: usize) -> Self {
        Self {
            blocks: vec![Block { ref_count: 0 }; max_blocks],
            free_list: (0..max_blocks).collect(),
        }
    }

    pub fn can_allocate(&self, n: usize) -> bool {
        self.free_list.len() >= n
    }

    /// Allocate one block. Recently freed blocks are reused first.
    pub fn allocate(&mut self) -> Option<BlockId> {
        let id = self.free_list.pop_back()?;
        self.blocks[id].ref_count = 1;
        Some(id)
    }

    pub fn retain(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(id) {
            block.ref_count += 1;
        }
    }

    /// Drop one reference. Returns true when the block went back to the pool.
    pub fn free(&mut self, id: BlockId) -> bool {
        let Some(block) = self.blocks.get_mut(id) else {
            return false;
        };
        if block.ref_count == 0 {
            return false;
        }
        block.ref_count -= 1;
        if block.ref_count == 0 {
            self.free_list.push_back(id);
            true
        } else {
            false
        }
    }

    pub fn ref_count(&self, id: BlockId) -> usize {
        self.blocks.get(id).map(|b| b.ref_count).unwrap_or(0)
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_allocated(&self) -> usize {
        self.blocks.len() - self.free_list.len()
    }
}

pub struct PagedKvCache {
    config: PagedKvConfig,
    allocator: BlockAllocator,
    /// `[layer][block]` -> K/V `[kv_heads, filled, head_size]`
    storage: Vec<Vec<Option<KvPair>>>,
    /// Block pointers of each slot.
    tables: Vec<Vec<BlockId>>,
    /// `[layer][slot]` tokens written
    lengths: Vec<Vec<usize>>,
}

impl PagedKvCache {
    pub fn new(config: PagedKvConfig) -> Self {
        debug!(
            "Paged KV cache: {} blocks of {} tokens for {} slots",
            config.max_blocks, config.tokens_per_block, config.max_slots
        );
        Self {
            allocator: BlockAllocator::new(config.max_blocks),
            storage: vec![vec![None; config.max_blocks]; config.num_layers],
            tables: vec![Vec::new(); config.max_slots],
            lengths: vec![vec![0; config.max_slots]; config.num_layers],
            config,
        }
    }

    pub fn config(&self) -> &PagedKvConfig {
        &self.config
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    /// Block pointers currently held by `slot`.
    pub fn block_table(&self, slot: SlotId) -> &[BlockId] {
        self.tables.get(slot).map(|t| t.as_slice()).unwrap_or(&[])
    }

    pub fn seq_len(&self, slot: SlotId) -> usize {
        self.layer_len(0, slot)
    }

    pub fn layer_len(&self, layer: usize, slot: SlotId) -> usize {
        self.lengths
            .get(layer)
            .and_then(|l| l.get(slot))
            .copied()
            .unwrap_or(0)
    }

    fn check_slot(&self, slot: SlotId) -> Result<()> {
        if slot >= self.config.max_slots {
            return Err(Error::CacheError(format!(
                "slot {slot} is out of range for {} slots",
                self.config.max_slots
            )));
        }
        Ok(())
    }

    /// Give `slot` enough blocks for `total` tokens.
    fn reserve(&mut self, slot: SlotId, total: usize) -> Result<()> {
        let needed = self.config.blocks_for_tokens(total);
        while self.tables[slot].len() < needed {
            let id = self.allocator.allocate().ok_or_else(|| {
                Error::CacheError(format!(
                    "out of KV cache blocks ({} in use)",
                    self.allocator.num_allocated()
                ))
            })?;
            self.tables[slot].push(id);
        }
        Ok(())
    }

    fn prepare(&mut self, requests: &[(SlotId, usize)]) -> Result<()> {
        let tpb = self.config.tokens_per_block;
        let mut needed = 0;
        // Shared blocks the step writes into, with the number of writers.
        let mut touched: HashMap<BlockId, usize> = HashMap::new();
        for &(slot, new_tokens) in requests {
            let start = self.seq_len(slot);
            let total = start + new_tokens;
            if total > self.config.max_seq_len {
                return Err(Error::CacheError(format!(
                    "slot {slot} would hold {total} tokens, max_seq_len is {}",
                    self.config.max_seq_len
                )));
            }
            needed += self
                .config
                .blocks_for_tokens(total)
                .saturating_sub(self.tables[slot].len());
            if new_tokens > 0 {
                if let Some(&block) = self.tables[slot].get(start / tpb) {
                    *touched.entry(block).or_default() += 1;
                }
            }
        }
        for (block, writers) in touched {
            needed += writers.min(self.allocator.ref_count(block).saturating_sub(1));
        }
        if !self.allocator.can_allocate(needed) {
            return Err(Error::CacheError(format!(
                "step needs {needed} KV cache blocks, {} are free",
                self.allocator.num_free()
            )));
        }

        for &(slot, new_tokens) in requests {
            let start = self.seq_len(slot);
            if new_tokens > 0 && start / tpb < self.tables[slot].len() {
                self.make_private(slot, start / tpb)?;
            }
            self.reserve(slot, start + new_tokens)?;
        }
        Ok(())
    }

    /// Replace a shared block of `slot` by a private copy before writing to it.
    fn make_private(&mut self, slot: SlotId, table_idx: usize) -> Result<BlockId> {
        let shared = self.tables[slot][table_idx];
        if self.allocator.ref_count(shared) <= 1 {
            return Ok(shared);
        }
        let copy = self.allocator.allocate().ok_or_else(|| {
            Error::CacheError("out of KV cache blocks for copy-on-write".to_string())
        })?;
        for layer in self.storage.iter_mut() {
            layer[copy] = layer[shared].clone();
        }
        self.allocator.free(shared);
        self.tables[slot][table_idx] = copy;
        debug!("Copy-on-write of block {shared} into {copy} for slot {slot}");
        Ok(copy)
    }

    pub fn append(
        &mut self,
        layer: usize,
        slot: SlotId,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        self.check_slot(slot)?;
        if layer >= self.config.num_layers {
            return Err(Error::CacheError(format!("layer {layer} is out of range")));
        }
        let new_tokens = k.dim(1)?;
        let start = self.lengths[layer][slot];
        let total = start + new_tokens;
        if total > self.config.max_seq_len {
            return Err(Error::CacheError(format!(
                "slot {slot} would hold {total} tokens, max_seq_len is {}",
                self.config.max_seq_len
            )));
        }
        self.reserve(slot, total)?;

        let tpb = self.config.tokens_per_block;
        let mut written = 0;
        while written < new_tokens {
            let pos = start + written;
            let table_idx = pos / tpb;
            let offset = pos % tpb;
            let take = (tpb - offset).min(new_tokens - written);
            let block = self.make_private(slot, table_idx)?;

            let k_chunk = k.narrow(1, written, take)?;
            let v_chunk = v.narrow(1, written, take)?;
            let entry = &mut self.storage[layer][block];
            // Shared prefixes may leave stale tokens past `offset` in a copied block.
            let merged = match entry.as_ref() {
                Some((bk, bv)) if offset > 0 => (
                    Tensor::cat(&[&bk.narrow(1, 0, offset)?, &k_chunk], 1)?,
                    Tensor::cat(&[&bv.narrow(1, 0, offset)?, &v_chunk], 1)?,
                ),
                _ => (k_chunk, v_chunk),
            };
            *entry = Some(merged);
            written += take;
        }
        self.lengths[layer][slot] = total;

        self.gather(layer, slot)
    }

    fn gather(&self, layer: usize, slot: SlotId) -> Result<(Tensor, Tensor)> {
        let len = self.lengths[layer][slot];
        let tpb = self.config.tokens_per_block;
        let mut ks = Vec::new();
        let mut vs = Vec::new();
        for (idx, &block) in self.tables[slot].iter().enumerate() {
            let begin = idx * tpb;
            if begin >= len {
                break;
            }
            let used = (len - begin).min(tpb);
            let (bk, bv) = self.storage[layer][block].as_ref().ok_or_else(|| {
                Error::CacheError(format!("block {block} of slot {slot} is empty"))
            })?;
            ks.push(bk.narrow(1, 0, used)?);
            vs.push(bv.narrow(1, 0, used)?);
        }
        if ks.is_empty() {
            return Err(Error::CacheError(format!("slot {slot} holds no keys/values")));
        }
        Ok((Tensor::cat(&ks, 1)?, Tensor::cat(&vs, 1)?))
    }

    pub fn release(&mut self, slot: SlotId) {
        if slot >= self.config.max_slots {
            return;
        }
        let table = std::mem::take(&mut self.tables[slot]);
        for block in table {
            if self.allocator.free(block) {
                for layer in self.storage.iter_mut() {
                    layer[block] = None;
                }
            }
        }
        for lengths in self.lengths.iter_mut() {
            lengths[slot] = 0;
        }
    }

    fn reorder(&mut self, slots: &[SlotId], sources: &[SlotId]) -> Result<()> {
        let tables: Vec<Vec<BlockId>> = sources.iter().map(|&s| self.tables[s].clone()).collect();
        let lengths: Vec<Vec<usize>> = sources
            .iter()
            .map(|&s| self.lengths.iter().map(|l| l[s]).collect())
            .collect();
        // Take the new references before dropping the old ones so shared
        // blocks never reach a zero count in between.
        for table in &tables {
            for &block in table {
                self.allocator.retain(block);
            }
        }
        for &slot in slots {
            self.release(slot);
        }
        for ((&slot, table), lens) in slots.iter().zip(tables).zip(lengths) {
            self.tables[slot] = table;
            for (layer, len) in lens.into_iter().enumerate() {
                self.lengths[layer][slot] = len;
            }
        }
        Ok(())
    }
}
