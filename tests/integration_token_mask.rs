//! Token-mask invariants over compiled grammars: the accepted / rejected /
//! uncertain partition, root-state certainty, acceptance soundness, and
//! crossing-cache equivalence.

use std::collections::HashSet;

use moldear::compiler::{CompiledGrammar, CompilerOptions, GrammarCompiler};
use moldear::earley::EarleyParser;
use moldear::mask::{AdaptiveTokenMask, MaskStoreType};
use moldear::tokenizer_info::TokenizerInfo;

fn tokenizer() -> TokenizerInfo {
    TokenizerInfo::from_strings(
        &[
            "a", "b", "c", "ab", "abc", "bb", "bbb", "<", ">", "<f", "<f>", "x", "xy", "tr", "ue",
            "true", "false", "0", "1", "12", "</", "think", "</think>", " ", "<eos>",
        ],
        [24].into_iter().collect::<HashSet<u32>>(),
    )
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Class {
    Accepted,
    Rejected,
    Uncertain,
}

/// Classify sorted-vocab index `i` under `mask`.
fn classify(mask: &AdaptiveTokenMask, info: &TokenizerInfo, index: u32) -> Class {
    if mask.is_uncertain(index) {
        return Class::Uncertain;
    }
    if mask.is_accepted(info, index) {
        Class::Accepted
    } else {
        Class::Rejected
    }
}

fn check_partition(compiled: &CompiledGrammar) {
    let info = compiled.tokenizer_info();
    let n = u32::try_from(info.sorted_decoded_vocab().len()).expect("small vocab");
    for state in compiled.mask_states() {
        let mask = compiled.token_mask(state).expect("mask present");
        // Index lists are sorted and in range
        for list in [
            &mask.accepted_indices,
            &mask.rejected_indices,
            &mask.uncertain_indices,
        ] {
            assert!(list.windows(2).all(|w| w[0] < w[1]), "list not sorted");
            assert!(list.iter().all(|&i| i < n), "index out of range");
        }
        // The three classes are a partition: classify() is total and
        // consistent with the storage
        let mut counts = [0usize; 3];
        for i in 0..n {
            match classify(mask, info, i) {
                Class::Accepted => counts[0] += 1,
                Class::Rejected => counts[1] += 1,
                Class::Uncertain => counts[2] += 1,
            }
        }
        assert_eq!(counts.iter().sum::<usize>(), n as usize);
        match mask.store_type {
            MaskStoreType::Accepted => {
                assert_eq!(counts[0], mask.accepted_indices.len());
            }
            MaskStoreType::Rejected => {
                assert_eq!(counts[1], mask.rejected_indices.len());
            }
            MaskStoreType::AcceptedBitset => {}
        }
    }
}

/// Invariant: accepted tokens advance the parser from their state without
/// failing (checked for rules without a look-ahead assertion, where
/// acceptance cannot come from look-ahead promotion).
fn check_accepted_soundness(compiled: &CompiledGrammar) {
    let grammar = compiled.grammar();
    let info = compiled.tokenizer_info();
    for state in compiled.mask_states() {
        let rule_id = usize::try_from(state.rule_id).expect("non-negative");
        if grammar.rule(rule_id).lookahead.is_some() {
            continue;
        }
        let mask = compiled.token_mask(state).expect("mask present");
        for (index, (_, token)) in info.sorted_decoded_vocab().iter().enumerate() {
            let index = u32::try_from(index).expect("small vocab");
            if classify(mask, info, index) != Class::Accepted {
                continue;
            }
            let mut parser = EarleyParser::new(grammar, *state);
            for &byte in token {
                assert!(
                    parser.advance(byte),
                    "accepted token {token:?} rejected at state {state:?}"
                );
            }
        }
    }
}

fn check_root_has_no_uncertain(compiled: &CompiledGrammar) {
    let root = compiled.grammar().root_rule_id();
    for state in compiled.mask_states() {
        if usize::try_from(state.rule_id) == Ok(root) {
            let mask = compiled.token_mask(state).expect("mask present");
            assert!(
                mask.uncertain_indices.is_empty(),
                "root state {state:?} has uncertain tokens"
            );
        }
    }
}

fn check_all(compiled: &CompiledGrammar) {
    check_partition(compiled);
    check_accepted_soundness(compiled);
    check_root_has_no_uncertain(compiled);
}

#[test]
fn invariants_hold_for_literal_alternation() {
    let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
    let compiled = compiler
        .compile_grammar_ebnf("root ::= \"true\" | \"false\"\n", "root")
        .expect("compiles");
    check_all(&compiled);
}

#[test]
fn invariants_hold_for_multi_rule_grammar() {
    let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
    let compiled = compiler
        .compile_grammar_ebnf(
            "root ::= item \" \" item\nitem ::= [a-c]+ | \"true\"\n",
            "root",
        )
        .expect("compiles");
    check_all(&compiled);
}

#[test]
fn invariants_hold_for_structural_tag() {
    let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
    let compiled = compiler
        .compile_structural_tag(
            r#"{"type": "structural_tag", "format": {
                "type": "triggered_tags",
                "triggers": ["<f"],
                "tags": [{"begin": "<f>", "content": {"type": "const_string", "value": "x"},
                          "end": "</think>"}]
            }}"#,
        )
        .expect("compiles");
    check_all(&compiled);
}

#[test]
fn invariants_hold_for_json_schema() {
    let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
    let compiled = compiler
        .compile_json_schema(
            r#"{"type": "integer", "minimum": 0, "maximum": 12}"#,
            &moldear::schema::JsonSchemaOptions::default(),
        )
        .expect("compiles");
    check_all(&compiled);
}

#[test]
fn special_tokens_never_accepted() {
    let info = tokenizer();
    let compiler = GrammarCompiler::new(info.clone(), &CompilerOptions::default());
    let compiled = compiler
        .compile_grammar_ebnf("root ::= [a-z]*\n", "root")
        .expect("compiles");
    // Special tokens are excluded from the sorted vocabulary entirely, so
    // no mask can enumerate them as accepted indices
    assert!(info
        .sorted_decoded_vocab()
        .iter()
        .all(|(id, _)| !info.special_token_ids().contains(id)));
    check_all(&compiled);
}

#[test]
fn crossing_cache_hit_equals_miss() {
    // Two textually different requests with structurally identical rules:
    // the second compilation hits the crossing cache. A cache-disabled
    // compiler provides the from-scratch reference.
    let ebnf_a = "root ::= \"ab\" [0-9]\n";
    let ebnf_b = "root ::= \"ab\" [0-9] \n"; // same grammar, different key

    let cached = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
    let first = cached.compile_grammar_ebnf(ebnf_a, "root").expect("compiles");
    let second = cached.compile_grammar_ebnf(ebnf_b, "root").expect("compiles");

    let uncached = GrammarCompiler::new(
        tokenizer(),
        &CompilerOptions {
            cache_enabled: false,
            ..CompilerOptions::default()
        },
    );
    let reference = uncached
        .compile_grammar_ebnf(ebnf_a, "root")
        .expect("compiles");

    let info = first.tokenizer_info();
    let n = u32::try_from(info.sorted_decoded_vocab().len()).expect("small vocab");
    for state in reference.mask_states() {
        let ref_mask = reference.token_mask(state).expect("mask present");
        for compiled in [&first, &second] {
            let mask = compiled.token_mask(state).expect("same states");
            for i in 0..n {
                assert_eq!(
                    classify(ref_mask, info, i),
                    classify(mask, info, i),
                    "state {state:?}, sorted index {i}"
                );
            }
        }
    }
    check_all(&first);
    check_all(&second);
}
