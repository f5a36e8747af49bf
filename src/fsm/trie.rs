//! Byte trie construction with optional Aho-Corasick back edges and
//! excluded-string dead sinks.
//!
//! Used for tag-dispatch trigger machines and for the exclusion filter in
//! the regex-with-excludes path. With back edges enabled, every state has a
//! defined transition on every byte: forward along a pattern, back along the
//! longest proper suffix that is also a trie prefix, or into an edgeless
//! dead sink once an excluded string has been matched.

use std::collections::VecDeque;

use crate::error::{MoldearError, Result};
use crate::fsm::{FsmWithStartEnd, StateId};

/// Result of [`TrieFsmBuilder::build`].
#[derive(Debug, Clone)]
pub struct TrieFsm {
    /// The machine. Accepting states are the pattern end states.
    pub fsm: FsmWithStartEnd,
    /// End state of each pattern, in input order.
    pub pattern_end_states: Vec<StateId>,
}

/// Builder for pattern/exclusion tries.
pub struct TrieFsmBuilder;

struct TrieNode {
    children: [Option<StateId>; 256],
    fail: StateId,
    pattern_end: bool,
    excluded_end: bool,
}

impl TrieNode {
    fn new() -> Self {
        Self {
            children: [None; 256],
            fail: 0,
            pattern_end: false,
            excluded_end: false,
        }
    }
}

impl TrieFsmBuilder {
    /// Build a trie over `patterns` and `excluded` strings.
    ///
    /// Pattern end states are returned in input order and marked accepting.
    /// When `add_back_edges` is set, failure transitions are materialized so
    /// the machine behaves as an Aho-Corasick automaton; states that have
    /// matched an excluded string (directly or via a suffix) lose all
    /// outgoing edges and every transition into them is redirected to a
    /// single dead sink. With `allow_overlap` off, pattern end states keep
    /// no outgoing edges either: reaching one commits the caller to its
    /// dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`MoldearError::InvalidConfiguration`] if any pattern or
    /// excluded string is empty.
    pub fn build(
        patterns: &[String],
        excluded: &[String],
        add_back_edges: bool,
        allow_overlap: bool,
    ) -> Result<TrieFsm> {
        for s in patterns.iter().chain(excluded.iter()) {
            if s.is_empty() {
                return Err(MoldearError::InvalidConfiguration(
                    "trie patterns must be non-empty".to_string(),
                ));
            }
        }

        let mut nodes = vec![TrieNode::new()];
        let mut insert = |nodes: &mut Vec<TrieNode>, s: &str| -> StateId {
            let mut current = 0usize;
            for &b in s.as_bytes() {
                current = match nodes[current].children[b as usize] {
                    Some(next) => next,
                    None => {
                        nodes.push(TrieNode::new());
                        let next = nodes.len() - 1;
                        nodes[current].children[b as usize] = Some(next);
                        next
                    }
                };
            }
            current
        };

        let mut pattern_end_states = Vec::with_capacity(patterns.len());
        for p in patterns {
            let end = insert(&mut nodes, p);
            nodes[end].pattern_end = true;
            pattern_end_states.push(end);
        }
        for e in excluded {
            let end = insert(&mut nodes, e);
            nodes[end].excluded_end = true;
        }

        if add_back_edges {
            Self::add_failure_links(&mut nodes);
        }

        // A node is dead once an excluded string is a suffix of its path.
        let mut dead = vec![false; nodes.len()];
        if add_back_edges && !excluded.is_empty() {
            for (id, _) in nodes.iter().enumerate() {
                let mut cursor = id;
                loop {
                    if nodes[cursor].excluded_end {
                        dead[id] = true;
                        break;
                    }
                    if cursor == 0 {
                        break;
                    }
                    cursor = nodes[cursor].fail;
                }
            }
        } else {
            for (id, node) in nodes.iter().enumerate() {
                dead[id] = node.excluded_end;
            }
        }

        let mut fsm = FsmWithStartEnd::new();
        for _ in 0..nodes.len() {
            fsm.add_state();
        }
        let sink = if add_back_edges && dead.iter().any(|&d| d) {
            Some(fsm.add_state())
        } else {
            None
        };
        fsm.set_start(0);

        for (id, node) in nodes.iter().enumerate() {
            if dead[id] {
                continue;
            }
            if node.pattern_end {
                fsm.add_end_state(id);
                if !allow_overlap {
                    continue;
                }
            }
            if add_back_edges {
                // Full goto function: defined on every byte.
                let mut byte = 0usize;
                while byte < 256 {
                    let target = Self::goto(&nodes, id, byte as u8);
                    let resolved = if dead[target] {
                        sink.expect("sink exists when dead states exist")
                    } else {
                        target
                    };
                    // Compress contiguous bytes with the same destination.
                    let mut hi = byte;
                    while hi + 1 < 256 {
                        let t = Self::goto(&nodes, id, (hi + 1) as u8);
                        let r = if dead[t] {
                            sink.expect("sink exists when dead states exist")
                        } else {
                            t
                        };
                        if r != resolved {
                            break;
                        }
                        hi += 1;
                    }
                    #[allow(clippy::cast_possible_truncation)]
                    fsm.fsm_mut().add_edge(id, resolved, byte as u8, hi as u8);
                    byte = hi + 1;
                }
            } else {
                for (b, child) in node.children.iter().enumerate() {
                    if let Some(child) = *child {
                        if !dead[child] {
                            #[allow(clippy::cast_possible_truncation)]
                            fsm.fsm_mut().add_edge(id, child, b as u8, b as u8);
                        }
                    }
                }
            }
        }

        Ok(TrieFsm {
            fsm,
            pattern_end_states,
        })
    }

    /// Compute Aho-Corasick failure links by BFS.
    fn add_failure_links(nodes: &mut [TrieNode]) {
        let mut queue = VecDeque::new();
        for b in 0..256 {
            if let Some(child) = nodes[0].children[b] {
                nodes[child].fail = 0;
                queue.push_back(child);
            }
        }
        while let Some(current) = queue.pop_front() {
            for b in 0..256 {
                let Some(child) = nodes[current].children[b] else {
                    continue;
                };
                let mut cursor = nodes[current].fail;
                loop {
                    if let Some(next) = nodes[cursor].children[b] {
                        if next != child {
                            nodes[child].fail = next;
                            break;
                        }
                    }
                    if cursor == 0 {
                        nodes[child].fail = 0;
                        break;
                    }
                    cursor = nodes[cursor].fail;
                }
                queue.push_back(child);
            }
        }
    }

    /// The goto function: forward edge if present, otherwise follow
    /// failure links; the root loops to itself.
    fn goto(nodes: &[TrieNode], state: StateId, b: u8) -> StateId {
        let mut cursor = state;
        loop {
            if let Some(next) = nodes[cursor].children[b as usize] {
                return next;
            }
            if cursor == 0 {
                return 0;
            }
            cursor = nodes[cursor].fail;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::StateId;

    fn run(fsm: &FsmWithStartEnd, input: &[u8]) -> Option<StateId> {
        let mut state = fsm.start();
        for &b in input {
            let next = fsm
                .fsm()
                .edges(state)
                .iter()
                .find(|e| e.accepts_byte(b))
                .map(|e| e.target)?;
            state = next;
        }
        Some(state)
    }

    #[test]
    fn test_plain_trie() {
        let trie = TrieFsmBuilder::build(
            &["ab".to_string(), "ac".to_string()],
            &[],
            false,
            true,
        )
        .expect("valid patterns");
        assert_eq!(trie.pattern_end_states.len(), 2);
        let end = run(&trie.fsm, b"ab").expect("path exists");
        assert_eq!(end, trie.pattern_end_states[0]);
        assert!(trie.fsm.is_end_state(end));
        // No back edges: unknown byte has no transition
        assert!(run(&trie.fsm, b"x").is_none());
    }

    #[test]
    fn test_aho_corasick_suffix_match() {
        let trie = TrieFsmBuilder::build(&["bc".to_string()], &[], true, true).expect("valid");
        // "abc" contains "bc" as a suffix of the scanned prefix
        let end = run(&trie.fsm, b"abc").expect("total transition function");
        assert_eq!(end, trie.pattern_end_states[0]);
        // Every state is total on every byte
        for state in 0..trie.fsm.num_states() {
            if trie.fsm.fsm().edges(state).is_empty() {
                continue; // dead sink
            }
            let mut covered = [false; 256];
            for e in trie.fsm.fsm().edges(state) {
                #[allow(clippy::cast_sign_loss)]
                for b in e.min..=i16::try_from(e.max).expect("byte range") {
                    covered[b as usize] = true;
                }
            }
            assert!(covered.iter().all(|&c| c), "state {state} is not total");
        }
    }

    #[test]
    fn test_excluded_strings_go_to_sink() {
        let trie =
            TrieFsmBuilder::build(&[], &["bbb".to_string()], true, true).expect("valid");
        // After "bbb" every continuation is stuck in the edgeless sink
        let sink = run(&trie.fsm, b"abbb").expect("transition into sink");
        assert!(trie.fsm.fsm().edges(sink).is_empty());
        // But "bb" alone is still alive
        let alive = run(&trie.fsm, b"abb").expect("alive");
        assert!(!trie.fsm.fsm().edges(alive).is_empty());
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(TrieFsmBuilder::build(&[String::new()], &[], true, true).is_err());
    }
}
