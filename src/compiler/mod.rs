//! Compiler driver
//!
//! Runs the functor pipeline over a grammar from any front end, enumerates
//! every reachable grammar position, dispatches mask computation across a
//! worker pool, and manages the compile cache and the crossing cache under
//! a shared byte budget (split 2:1).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::earley::ParserState;
use crate::error::Result;
use crate::grammar::functor::{hash_fsms, normalize, optimize};
use crate::grammar::{Grammar, GrammarExpr};
use crate::mask::compute::{tag_dispatch_slicing_bitsets, TokenMaskComputer};
use crate::mask::AdaptiveTokenMask;
use crate::schema::JsonSchemaOptions;
use crate::tokenizer_info::TokenizerInfo;

pub mod cache;

use cache::{CrossingCache, ThreadSafeLruCache};

/// Options for a [`GrammarCompiler`].
#[derive(Debug, Clone)]
pub struct CompilerOptions {
    /// Worker threads for mask computation; 1 runs inline without any
    /// synchronization primitives
    pub max_threads: usize,
    /// Whether the compile cache and crossing cache are active
    pub cache_enabled: bool,
    /// Total byte budget shared by the two caches (`None` = unlimited)
    pub max_memory_bytes: Option<usize>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            max_threads: 8,
            cache_enabled: true,
            max_memory_bytes: None,
        }
    }
}

/// A compiled grammar: the optimized grammar, the tokenizer view it was
/// compiled against, and the frozen per-position mask table. Immutable
/// and cheap to clone; decoding sessions share it freely.
#[derive(Clone)]
pub struct CompiledGrammar {
    inner: Arc<CompiledGrammarInner>,
}

struct CompiledGrammarInner {
    grammar: Grammar,
    tokenizer_info: TokenizerInfo,
    token_mask_cache: HashMap<ParserState, AdaptiveTokenMask>,
}

impl CompiledGrammar {
    /// The optimized grammar, for parser instantiation by the decoder.
    #[must_use]
    pub fn grammar(&self) -> &Grammar {
        &self.inner.grammar
    }

    /// The tokenizer view this grammar was compiled against.
    #[must_use]
    pub fn tokenizer_info(&self) -> &TokenizerInfo {
        &self.inner.tokenizer_info
    }

    /// The adaptive token mask at `state`, if `state` is a reachable
    /// scan-able position.
    #[must_use]
    pub fn token_mask(&self, state: &ParserState) -> Option<&AdaptiveTokenMask> {
        self.inner.token_mask_cache.get(state)
    }

    /// Every position the compiler computed a mask for.
    #[must_use]
    pub fn mask_states(&self) -> impl Iterator<Item = &ParserState> {
        self.inner.token_mask_cache.keys()
    }

    /// In-memory footprint, reported to the compile cache.
    #[must_use]
    pub fn memory_size_bytes(&self) -> usize {
        let masks: usize = self
            .inner
            .token_mask_cache
            .values()
            .map(AdaptiveTokenMask::memory_size_bytes)
            .sum();
        self.inner.grammar.memory_size_bytes()
            + masks
            + self.inner.token_mask_cache.len() * std::mem::size_of::<ParserState>()
    }
}

/// Compile-cache key: one variant per request kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CompileKey {
    BuiltinJson,
    Schema {
        schema: String,
        any_whitespace: bool,
        indent: Option<usize>,
        separators: Option<(String, String)>,
        strict_mode: bool,
        max_whitespace_cnt: Option<usize>,
    },
    StructuralTag(String),
    Regex(String),
    Grammar { ebnf: String, root_rule_name: String },
}

/// The compiler. One instance per tokenizer; caches are owned here and
/// shared by every compilation through it.
pub struct GrammarCompiler {
    tokenizer_info: TokenizerInfo,
    max_threads: usize,
    cache_enabled: bool,
    compile_cache: ThreadSafeLruCache<CompileKey, CompiledGrammar>,
    crossing_cache: CrossingCache,
}

impl GrammarCompiler {
    /// Create a compiler over `tokenizer_info` with `options`.
    #[must_use]
    pub fn new(tokenizer_info: TokenizerInfo, options: &CompilerOptions) -> Self {
        let total = options.max_memory_bytes.unwrap_or(usize::MAX);
        // Split roughly 2:1 between the compile cache and crossing cache
        let (compile_budget, crossing_budget) = if total == usize::MAX {
            (usize::MAX, usize::MAX)
        } else {
            (total / 3 * 2, total / 3)
        };
        let crossing_budget = if options.cache_enabled { crossing_budget } else { 0 };
        Self {
            tokenizer_info,
            max_threads: options.max_threads.max(1),
            cache_enabled: options.cache_enabled,
            compile_cache: ThreadSafeLruCache::new(
                compile_budget,
                CompiledGrammar::memory_size_bytes,
            ),
            crossing_cache: CrossingCache::new(crossing_budget),
        }
    }

    /// Compile the builtin JSON grammar.
    #[must_use]
    pub fn compile_builtin_json_grammar(&self) -> CompiledGrammar {
        let key = CompileKey::BuiltinJson;
        if self.cache_enabled {
            if let Some(hit) = self.compile_cache.get(&key) {
                return hit;
            }
        }
        let compiled = self.compile_pipeline(Grammar::builtin_json_grammar());
        if self.cache_enabled {
            self.compile_cache.insert(key, compiled.clone());
        }
        compiled
    }

    /// Compile a JSON schema.
    ///
    /// # Errors
    ///
    /// Propagates JSON and schema errors.
    pub fn compile_json_schema(
        &self,
        schema: &str,
        options: &JsonSchemaOptions,
    ) -> Result<CompiledGrammar> {
        let key = CompileKey::Schema {
            schema: schema.to_string(),
            any_whitespace: options.any_whitespace,
            indent: options.indent,
            separators: options.separators.clone(),
            strict_mode: options.strict_mode,
            max_whitespace_cnt: options.max_whitespace_cnt,
        };
        self.compile_cached(key, || Grammar::from_json_schema(schema, options))
    }

    /// Compile a structural tag.
    ///
    /// # Errors
    ///
    /// Propagates JSON and structural-tag errors.
    pub fn compile_structural_tag(&self, structural_tag_json: &str) -> Result<CompiledGrammar> {
        let key = CompileKey::StructuralTag(structural_tag_json.to_string());
        self.compile_cached(key, || Grammar::from_structural_tag(structural_tag_json))
    }

    /// Compile a regex pattern.
    ///
    /// # Errors
    ///
    /// Propagates regex parse errors.
    pub fn compile_regex(&self, pattern: &str) -> Result<CompiledGrammar> {
        let key = CompileKey::Regex(pattern.to_string());
        self.compile_cached(key, || Grammar::from_regex(pattern))
    }

    /// Compile EBNF text rooted at `root_rule_name`.
    ///
    /// # Errors
    ///
    /// Propagates EBNF parse errors.
    pub fn compile_grammar_ebnf(
        &self,
        ebnf: &str,
        root_rule_name: &str,
    ) -> Result<CompiledGrammar> {
        let key = CompileKey::Grammar {
            ebnf: ebnf.to_string(),
            root_rule_name: root_rule_name.to_string(),
        };
        self.compile_cached(key, || Grammar::from_ebnf(ebnf, root_rule_name))
    }

    /// Compile an already built grammar object. The cache key is its
    /// printed form.
    ///
    /// # Errors
    ///
    /// Propagates validation errors.
    pub fn compile_grammar(&self, grammar: &Grammar) -> Result<CompiledGrammar> {
        grammar.validate()?;
        let key = CompileKey::Grammar {
            ebnf: grammar.to_string(),
            root_rule_name: grammar.root_rule().name.clone(),
        };
        let normalized = normalize(grammar);
        self.compile_cached(key, move || Ok(normalized))
    }

    fn compile_cached(
        &self,
        key: CompileKey,
        build: impl FnOnce() -> Result<Grammar>,
    ) -> Result<CompiledGrammar> {
        if self.cache_enabled {
            if let Some(hit) = self.compile_cache.get(&key) {
                return Ok(hit);
            }
        }
        let compiled = self.compile_pipeline(build()?);
        if self.cache_enabled {
            self.compile_cache.insert(key, compiled.clone());
        }
        Ok(compiled)
    }

    /// The main pipeline: optimize, hash (when caching), enumerate
    /// positions, and compute masks across the worker pool.
    fn compile_pipeline(&self, grammar: Grammar) -> CompiledGrammar {
        let mut optimized = optimize(&grammar);
        if self.tokenizer_info.vocab_size() == 0 {
            return CompiledGrammar {
                inner: Arc::new(CompiledGrammarInner {
                    grammar: optimized,
                    tokenizer_info: self.tokenizer_info.clone(),
                    token_mask_cache: HashMap::new(),
                }),
            };
        }
        if self.crossing_cache.is_enabled() {
            hash_fsms(&mut optimized);
        }
        let slicing = tag_dispatch_slicing_bitsets(&optimized, &self.tokenizer_info);
        let positions = enumerate_positions(&optimized);

        let root = optimized.root_rule_id();
        let is_root = |state: &ParserState| state.rule_id >= 0 && state.rule_id as usize == root;

        let token_mask_cache: HashMap<ParserState, AdaptiveTokenMask> = if self.max_threads <= 1
            || positions.len() <= 1
        {
            let mut table = HashMap::with_capacity(positions.len());
            for state in positions {
                let mut computer = TokenMaskComputer::new(
                    &optimized,
                    &self.tokenizer_info,
                    state,
                    &slicing,
                    &self.crossing_cache,
                );
                let root_here = is_root(&state);
                table.insert(state, computer.compute(root_here));
            }
            table
        } else {
            let table = Mutex::new(HashMap::with_capacity(positions.len()));
            let chunk_size = positions.len().div_ceil(self.max_threads);
            let grammar_ref = &optimized;
            let tokenizer_ref = &self.tokenizer_info;
            let slicing_ref = &slicing;
            let crossing_ref = &self.crossing_cache;
            let table_ref = &table;
            let is_root_ref = &is_root;
            std::thread::scope(|scope| {
                for chunk in positions.chunks(chunk_size) {
                    scope.spawn(move || {
                        let mut local = Vec::with_capacity(chunk.len());
                        for &state in chunk {
                            let mut computer = TokenMaskComputer::new(
                                grammar_ref,
                                tokenizer_ref,
                                state,
                                slicing_ref,
                                crossing_ref,
                            );
                            let root_here = is_root_ref(&state);
                            local.push((state, computer.compute(root_here)));
                        }
                        let mut table = table_ref.lock().expect("mask table lock");
                        table.extend(local);
                    });
                }
            });
            table.into_inner().expect("mask table lock")
        };

        CompiledGrammar {
            inner: Arc::new(CompiledGrammarInner {
                grammar: optimized,
                tokenizer_info: self.tokenizer_info.clone(),
                token_mask_cache,
            }),
        }
    }

    /// Drop both caches.
    pub fn clear_cache(&self) {
        self.compile_cache.clear();
        self.crossing_cache.clear();
    }

    /// Currently accounted bytes across both caches.
    #[must_use]
    pub fn cache_size_bytes(&self) -> usize {
        self.compile_cache.current_bytes() + self.crossing_cache.current_bytes()
    }

    /// The combined byte budget, `None` when unlimited.
    #[must_use]
    pub fn cache_limit_bytes(&self) -> Option<usize> {
        if self.compile_cache.max_bytes() == usize::MAX {
            return None;
        }
        Some(self.compile_cache.max_bytes() + self.crossing_cache.max_bytes())
    }
}

/// Every reachable scan-able position of the grammar: FSM states with
/// outgoing byte edges for FSM-backed rules; byte-string byte offsets and
/// character-class positions (0..=3 continuation bytes remaining) for the
/// rest. Rule-reference and repeat elements expand to other positions and
/// get no entry of their own.
fn enumerate_positions(grammar: &Grammar) -> Vec<ParserState> {
    let mut positions = Vec::new();
    for rule_id in 0..grammar.num_rules() {
        let rule = grammar.rule(rule_id);
        let rule_id_i32 = i32::try_from(rule_id).unwrap_or(i32::MAX);
        if let Some(fsm) = grammar.per_rule_fsm(rule_id) {
            for state in fsm.reachable_states() {
                if fsm.is_scanable_state(state) {
                    positions.push(ParserState::new(
                        rule_id_i32,
                        u32::try_from(rule.body).unwrap_or(u32::MAX),
                        u32::try_from(state).unwrap_or(u32::MAX),
                        0,
                    ));
                }
            }
            continue;
        }
        let GrammarExpr::Choices(choices) = grammar.expr(rule.body) else {
            continue;
        };
        for &sequence_id in choices {
            let GrammarExpr::Sequence(elements) = grammar.expr(sequence_id) else {
                continue;
            };
            for (element_index, &element) in elements.iter().enumerate() {
                let make = |sub: u32| {
                    ParserState::new(
                        rule_id_i32,
                        u32::try_from(sequence_id).unwrap_or(u32::MAX),
                        u32::try_from(element_index).unwrap_or(u32::MAX),
                        sub,
                    )
                };
                match grammar.expr(element) {
                    GrammarExpr::ByteString(bytes) => {
                        for sub in 0..bytes.len() {
                            positions.push(make(u32::try_from(sub).unwrap_or(u32::MAX)));
                        }
                    }
                    GrammarExpr::CharacterClass { .. } | GrammarExpr::CharacterClassStar { .. } => {
                        for sub in 0..=3u32 {
                            positions.push(make(sub));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tokenizer() -> TokenizerInfo {
        TokenizerInfo::from_strings(
            &["a", "b", "ab", "abc", "true", "false", "t", "r", "u", "e", "<eos>"],
            [10].into_iter().collect::<HashSet<u32>>(),
        )
    }

    #[test]
    fn test_compile_regex_and_masks() {
        let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
        let compiled = compiler.compile_regex("ab*").expect("compiles");
        assert!(compiled.mask_states().count() > 0);
        // Every mask state resolves
        for state in compiled.mask_states() {
            assert!(compiled.token_mask(state).is_some());
        }
    }

    #[test]
    fn test_compile_cache_hits() {
        let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
        let first = compiler.compile_regex("a|b").expect("compiles");
        let second = compiler.compile_regex("a|b").expect("compiles");
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
        compiler.clear_cache();
        let third = compiler.compile_regex("a|b").expect("compiles");
        assert!(!Arc::ptr_eq(&first.inner, &third.inner));
    }

    #[test]
    fn test_cache_disabled_recompiles() {
        let options = CompilerOptions {
            cache_enabled: false,
            ..CompilerOptions::default()
        };
        let compiler = GrammarCompiler::new(tokenizer(), &options);
        let first = compiler.compile_regex("a").expect("compiles");
        let second = compiler.compile_regex("a").expect("compiles");
        assert!(!Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[test]
    fn test_single_and_multi_thread_agree() {
        let single = GrammarCompiler::new(
            tokenizer(),
            &CompilerOptions {
                max_threads: 1,
                cache_enabled: false,
                max_memory_bytes: None,
            },
        );
        let multi = GrammarCompiler::new(
            tokenizer(),
            &CompilerOptions {
                max_threads: 4,
                cache_enabled: false,
                max_memory_bytes: None,
            },
        );
        let ebnf = "root ::= \"true\" | \"false\" | [a-b]*\n";
        let a = single.compile_grammar_ebnf(ebnf, "root").expect("compiles");
        let b = multi.compile_grammar_ebnf(ebnf, "root").expect("compiles");
        assert_eq!(a.mask_states().count(), b.mask_states().count());
        for state in a.mask_states() {
            let mask_a = a.token_mask(state).expect("present");
            let mask_b = b.token_mask(state).expect("present");
            assert_eq!(mask_a.store_type, mask_b.store_type);
            assert_eq!(mask_a.accepted_indices, mask_b.accepted_indices);
            assert_eq!(mask_a.rejected_indices, mask_b.rejected_indices);
            assert_eq!(mask_a.uncertain_indices, mask_b.uncertain_indices);
        }
    }

    #[test]
    fn test_memory_budget_splits() {
        let options = CompilerOptions {
            max_memory_bytes: Some(3_000_000),
            ..CompilerOptions::default()
        };
        let compiler = GrammarCompiler::new(tokenizer(), &options);
        assert_eq!(compiler.cache_limit_bytes(), Some(3_000_000));
    }

    #[test]
    fn test_builtin_json_compiles() {
        let compiler = GrammarCompiler::new(tokenizer(), &CompilerOptions::default());
        let compiled = compiler.compile_builtin_json_grammar();
        assert!(compiled.grammar().num_rules() >= 9);
        assert!(compiled.memory_size_bytes() > 0);
    }
}
