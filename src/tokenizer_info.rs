//! Tokenizer oracle consumed by the compiler
//!
//! The engine never tokenizes text itself; it consumes an immutable view
//! of the vocabulary: the lexicographically sorted decoded byte strings,
//! a radix-trie subtree-range table over that ordering, the special-token
//! id set, and a stable content hash that keys the crossing cache.

use std::collections::HashSet;
use std::sync::Arc;

use crate::support::hashing::{fnv1a_hash, hash_combine};

/// Immutable vocabulary view. Cheap to clone (shared internals).
#[derive(Debug, Clone)]
pub struct TokenizerInfo {
    inner: Arc<TokenizerInfoInner>,
}

#[derive(Debug)]
struct TokenizerInfoInner {
    vocab_size: usize,
    /// `(token_id, decoded_bytes)` sorted lexicographically by bytes
    sorted_decoded_vocab: Vec<(u32, Vec<u8>)>,
    /// Entry `i` is one past the last index in the sorted vocab whose
    /// decoded bytes start with token `i`'s decoded bytes
    trie_subtree_nodes_range: Vec<usize>,
    special_token_ids: HashSet<u32>,
    tokenizer_hash: u64,
}

impl TokenizerInfo {
    /// Build the view from decoded token byte strings (index = token id)
    /// and the special-token id set.
    #[must_use]
    pub fn new(decoded_vocab: Vec<Vec<u8>>, special_token_ids: HashSet<u32>) -> Self {
        let vocab_size = decoded_vocab.len();

        let mut sorted_decoded_vocab: Vec<(u32, Vec<u8>)> = decoded_vocab
            .into_iter()
            .enumerate()
            .map(|(id, bytes)| (u32::try_from(id).unwrap_or(u32::MAX), bytes))
            .filter(|(id, _)| !special_token_ids.contains(id))
            .collect();
        sorted_decoded_vocab.sort_by(|a, b| a.1.cmp(&b.1));

        // Subtree ranges: for each token, the end of the run of tokens
        // sharing it as a prefix.
        let n = sorted_decoded_vocab.len();
        let mut trie_subtree_nodes_range = vec![0usize; n];
        for i in 0..n {
            let prefix = &sorted_decoded_vocab[i].1;
            let mut end = i + 1;
            while end < n && sorted_decoded_vocab[end].1.starts_with(prefix) {
                end += 1;
            }
            trie_subtree_nodes_range[i] = end;
        }

        let mut hash = fnv1a_hash(&(vocab_size as u64).to_le_bytes());
        for (id, bytes) in &sorted_decoded_vocab {
            hash = hash_combine(hash, u64::from(*id));
            hash = hash_combine(hash, fnv1a_hash(bytes));
        }
        let mut special_sorted: Vec<u32> = special_token_ids.iter().copied().collect();
        special_sorted.sort_unstable();
        for id in special_sorted {
            hash = hash_combine(hash, u64::from(id));
        }

        Self {
            inner: Arc::new(TokenizerInfoInner {
                vocab_size,
                sorted_decoded_vocab,
                trie_subtree_nodes_range,
                special_token_ids,
                tokenizer_hash: hash,
            }),
        }
    }

    /// Build from UTF-8 token strings. Convenience for tests and simple
    /// vocabularies.
    #[must_use]
    pub fn from_strings(tokens: &[&str], special_token_ids: HashSet<u32>) -> Self {
        Self::new(
            tokens.iter().map(|t| t.as_bytes().to_vec()).collect(),
            special_token_ids,
        )
    }

    /// Total vocabulary size (including special tokens).
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.vocab_size
    }

    /// The sorted decoded vocabulary (special tokens excluded).
    #[must_use]
    pub fn sorted_decoded_vocab(&self) -> &[(u32, Vec<u8>)] {
        &self.inner.sorted_decoded_vocab
    }

    /// The trie subtree-range table over the sorted vocabulary.
    #[must_use]
    pub fn trie_subtree_nodes_range(&self) -> &[usize] {
        &self.inner.trie_subtree_nodes_range
    }

    /// The special-token id set.
    #[must_use]
    pub fn special_token_ids(&self) -> &HashSet<u32> {
        &self.inner.special_token_ids
    }

    /// Stable content hash of the vocabulary.
    #[must_use]
    pub fn tokenizer_hash(&self) -> u64 {
        self.inner.tokenizer_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_and_ranges() {
        let info = TokenizerInfo::from_strings(&["b", "a", "ab", "abc", "ad"], HashSet::new());
        let sorted: Vec<&[u8]> = info
            .sorted_decoded_vocab()
            .iter()
            .map(|(_, b)| b.as_slice())
            .collect();
        assert_eq!(sorted, vec![&b"a"[..], b"ab", b"abc", b"ad", b"b"]);
        // "a" prefixes a, ab, abc, ad
        assert_eq!(info.trie_subtree_nodes_range()[0], 4);
        // "ab" prefixes ab, abc
        assert_eq!(info.trie_subtree_nodes_range()[1], 3);
        assert_eq!(info.trie_subtree_nodes_range()[4], 5);
    }

    #[test]
    fn test_special_tokens_excluded_from_sorted() {
        let specials: HashSet<u32> = [0].into_iter().collect();
        let info = TokenizerInfo::from_strings(&["<eos>", "x"], specials);
        assert_eq!(info.vocab_size(), 2);
        assert_eq!(info.sorted_decoded_vocab().len(), 1);
        assert!(info.special_token_ids().contains(&0));
    }

    #[test]
    fn test_hash_stability_and_sensitivity() {
        let a = TokenizerInfo::from_strings(&["a", "b"], HashSet::new());
        let b = TokenizerInfo::from_strings(&["a", "b"], HashSet::new());
        let c = TokenizerInfo::from_strings(&["a", "c"], HashSet::new());
        assert_eq!(a.tokenizer_hash(), b.tokenizer_hash());
        assert_ne!(a.tokenizer_hash(), c.tokenizer_hash());
    }
}
