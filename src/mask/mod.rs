//! Adaptive token masks
//!
//! A mask classifies the whole vocabulary at one grammar position into
//! accepted / rejected / uncertain and stores itself in whichever of three
//! representations is smallest: a sorted accepted list, a sorted rejected
//! list, or a vocabulary-wide bitset. Index lists hold positions in the
//! tokenizer's sorted decoded vocabulary; bitsets are over token ids.

use crate::support::bitset::DynamicBitset;
use crate::tokenizer_info::TokenizerInfo;

pub mod compute;

/// Which representation a mask uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStoreType {
    /// Sorted accepted indices (accepted side is small)
    Accepted,
    /// Sorted rejected indices (rejected side is small)
    Rejected,
    /// Bitset over token ids, set = accepted
    AcceptedBitset,
}

/// Below this set size a sorted index list beats a bitset.
pub const USE_BITSET_THRESHOLD: usize = 256;

/// Per-position vocabulary classification.
#[derive(Debug, Clone)]
pub struct AdaptiveTokenMask {
    /// The representation in use
    pub store_type: MaskStoreType,
    /// Sorted vocab indices accepted (for [`MaskStoreType::Accepted`])
    pub accepted_indices: Vec<u32>,
    /// Sorted vocab indices rejected (for [`MaskStoreType::Rejected`])
    pub rejected_indices: Vec<u32>,
    /// Token-id bitset (for [`MaskStoreType::AcceptedBitset`])
    pub accepted_bitset: DynamicBitset,
    /// Sorted vocab indices whose acceptance depends on the continuation
    pub uncertain_indices: Vec<u32>,
}

impl AdaptiveTokenMask {
    /// Build from accepted/rejected/uncertain sorted-vocab index lists.
    #[must_use]
    pub fn new(
        vocab_size: usize,
        sorted_decoded_vocab: &[(u32, Vec<u8>)],
        accepted_indices: Vec<u32>,
        rejected_indices: Vec<u32>,
        uncertain_indices: Vec<u32>,
    ) -> Self {
        if accepted_indices.len() < USE_BITSET_THRESHOLD
            && accepted_indices.len() <= rejected_indices.len()
        {
            Self {
                store_type: MaskStoreType::Accepted,
                accepted_indices,
                rejected_indices: Vec::new(),
                accepted_bitset: DynamicBitset::new(0),
                uncertain_indices,
            }
        } else if rejected_indices.len() < USE_BITSET_THRESHOLD {
            Self {
                store_type: MaskStoreType::Rejected,
                accepted_indices: Vec::new(),
                rejected_indices,
                accepted_bitset: DynamicBitset::new(0),
                uncertain_indices,
            }
        } else {
            Self::bitset_from_accepted(
                vocab_size,
                sorted_decoded_vocab,
                &accepted_indices,
                uncertain_indices,
            )
        }
    }

    /// Build when the rejected list was skipped (it was too large to be
    /// worth collecting): only accepted and uncertain are known.
    #[must_use]
    pub fn new_without_rejected(
        vocab_size: usize,
        sorted_decoded_vocab: &[(u32, Vec<u8>)],
        accepted_indices: Vec<u32>,
        uncertain_indices: Vec<u32>,
    ) -> Self {
        if accepted_indices.len() < USE_BITSET_THRESHOLD {
            Self {
                store_type: MaskStoreType::Accepted,
                accepted_indices,
                rejected_indices: Vec::new(),
                accepted_bitset: DynamicBitset::new(0),
                uncertain_indices,
            }
        } else {
            Self::bitset_from_accepted(
                vocab_size,
                sorted_decoded_vocab,
                &accepted_indices,
                uncertain_indices,
            )
        }
    }

    fn bitset_from_accepted(
        vocab_size: usize,
        sorted_decoded_vocab: &[(u32, Vec<u8>)],
        accepted_indices: &[u32],
        uncertain_indices: Vec<u32>,
    ) -> Self {
        let mut bitset = DynamicBitset::new(vocab_size);
        for &index in accepted_indices {
            let (token_id, _) = sorted_decoded_vocab[index as usize];
            bitset.set(token_id as usize);
        }
        Self {
            store_type: MaskStoreType::AcceptedBitset,
            accepted_indices: Vec::new(),
            rejected_indices: Vec::new(),
            accepted_bitset: bitset,
            uncertain_indices,
        }
    }

    /// Whether the token at sorted-vocab `index` is accepted outright.
    #[must_use]
    pub fn is_accepted(&self, tokenizer_info: &TokenizerInfo, index: u32) -> bool {
        match self.store_type {
            MaskStoreType::Accepted => self.accepted_indices.binary_search(&index).is_ok(),
            MaskStoreType::Rejected => {
                self.rejected_indices.binary_search(&index).is_err()
                    && self.uncertain_indices.binary_search(&index).is_err()
            }
            MaskStoreType::AcceptedBitset => {
                let (token_id, _) = tokenizer_info.sorted_decoded_vocab()[index as usize];
                self.accepted_bitset.get(token_id as usize)
            }
        }
    }

    /// Whether the token at sorted-vocab `index` is uncertain.
    #[must_use]
    pub fn is_uncertain(&self, index: u32) -> bool {
        self.uncertain_indices.binary_search(&index).is_ok()
    }

    /// Reported byte size, used by the LRU caches for accounting.
    #[must_use]
    pub fn memory_size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.accepted_indices.capacity() * std::mem::size_of::<u32>()
            + self.rejected_indices.capacity() * std::mem::size_of::<u32>()
            + self.uncertain_indices.capacity() * std::mem::size_of::<u32>()
            + self.accepted_bitset.memory_size_bytes()
    }
}

/// Merge sorted index lists, deduplicating.
pub(crate) fn sorted_union(target: &mut Vec<u32>, other: &[u32]) {
    if other.is_empty() {
        return;
    }
    let mut merged = Vec::with_capacity(target.len() + other.len());
    let (mut i, mut j) = (0, 0);
    while i < target.len() || j < other.len() {
        let next = match (target.get(i), other.get(j)) {
            (Some(&a), Some(&b)) if a == b => {
                i += 1;
                j += 1;
                a
            }
            (Some(&a), Some(&b)) if a < b => {
                i += 1;
                a
            }
            (Some(_), Some(&b)) => {
                j += 1;
                b
            }
            (Some(&a), None) => {
                i += 1;
                a
            }
            (None, Some(&b)) => {
                j += 1;
                b
            }
            (None, None) => break,
        };
        merged.push(next);
    }
    *target = merged;
}

/// Sorted set difference `a \ b`.
pub(crate) fn sorted_difference(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().saturating_sub(b.len()));
    let mut j = 0;
    for &value in a {
        while j < b.len() && b[j] < value {
            j += 1;
        }
        if j < b.len() && b[j] == value {
            continue;
        }
        out.push(value);
    }
    out
}
