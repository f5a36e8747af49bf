//! Property-based coverage of the universal invariants: mask partition
//! over generated grammars, normalizer idempotence, and the Unicode range
//! round-trip.

use std::collections::HashSet;

use proptest::prelude::*;

use moldear::compiler::{CompilerOptions, GrammarCompiler};
use moldear::fsm::unicode::add_character_range;
use moldear::fsm::FsmWithStartEnd;
use moldear::grammar::functor::normalize;
use moldear::grammar::Grammar;
use moldear::tokenizer_info::TokenizerInfo;

fn tokenizer() -> TokenizerInfo {
    TokenizerInfo::from_strings(
        &["a", "b", "c", "d", "ab", "ba", "abc", "bcd", "x", "xyz", "0", "9"],
        HashSet::new(),
    )
}

fn literal_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(proptest::char::range('a', 'd'), 1..4)
        .prop_map(|chars| chars.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Invariant: for any finite alternation grammar, every mask
    /// partitions the vocabulary, and acceptance agrees with prefix
    /// membership in the alternation language.
    #[test]
    fn mask_partition_for_literal_alternations(
        literals in proptest::collection::btree_set(literal_strategy(), 1..5)
    ) {
        let body = literals
            .iter()
            .map(|l| format!("\"{l}\""))
            .collect::<Vec<_>>()
            .join(" | ");
        let ebnf = format!("root ::= {body}\n");
        let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions {
            max_threads: 1,
            cache_enabled: false,
            max_memory_bytes: None,
        });
        let compiled = compiler.compile_grammar_ebnf(&ebnf, "root").expect("compiles");
        let info = compiled.tokenizer_info();

        for state in compiled.mask_states() {
            let mask = compiled.token_mask(state).expect("present");
            for list in [&mask.accepted_indices, &mask.rejected_indices, &mask.uncertain_indices] {
                prop_assert!(list.windows(2).all(|w| w[0] < w[1]));
            }
        }

        // Root initial state: accepted tokens are exactly those that are a
        // prefix-extension chain inside some literal
        let root_state = moldear::earley::root_initial_state(compiled.grammar());
        if let Some(mask) = compiled.token_mask(&root_state) {
            for (index, (_, token)) in info.sorted_decoded_vocab().iter().enumerate() {
                let index = u32::try_from(index).expect("small vocab");
                let expected = literals
                    .iter()
                    .any(|l| l.as_bytes().starts_with(token));
                prop_assert_eq!(
                    mask.is_accepted(info, index) || mask.is_uncertain(index),
                    expected,
                    "token {:?} against {:?}", token, literals
                );
            }
        }
    }

    /// Invariant: running the normalizer twice yields an identical
    /// grammar.
    #[test]
    fn normalizer_idempotent(
        literals in proptest::collection::vec(literal_strategy(), 1..4),
        optional in proptest::bool::ANY,
        starred in proptest::bool::ANY,
    ) {
        let mut parts: Vec<String> = literals.iter().map(|l| format!("(\"{l}\")")).collect();
        if optional {
            parts.push("(\"z\")?".to_string());
        }
        if starred {
            parts.push("[a-d]*".to_string());
        }
        let ebnf = format!("root ::= {}\n", parts.join(" "));
        let grammar = Grammar::from_ebnf(&ebnf, "root").expect("compiles");
        let once = normalize(&grammar);
        let twice = normalize(&once);
        prop_assert_eq!(once.to_string(), twice.to_string());
    }

    /// Invariant: the lowered byte DFA of `[lo, hi]` accepts exactly the
    /// UTF-8 encodings of code points inside the range.
    #[test]
    fn unicode_range_roundtrip(
        bounds in (0u32..0x3000, 0u32..0x3000),
        probes in proptest::collection::vec(0u32..0x3100, 8),
    ) {
        let (a, b) = bounds;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut fsm = FsmWithStartEnd::new();
        let start = fsm.add_state();
        let end = fsm.add_state();
        fsm.set_start(start);
        fsm.add_end_state(end);
        add_character_range(&mut fsm, start, end, lo, hi);
        for cp in probes {
            let Some(c) = char::from_u32(cp) else { continue };
            let mut buf = [0u8; 4];
            let encoded = c.encode_utf8(&mut buf).as_bytes();
            prop_assert_eq!(
                fsm.accepts(encoded),
                (lo..=hi).contains(&cp),
                "code point U+{:04X} against [U+{:04X}, U+{:04X}]", cp, lo, hi
            );
        }
    }
}
