//! Fragment Chunker
//!
//! Regroups upstream text fragments into output units according to the
//! request's chunk policy.

use std::collections::VecDeque;

use crate::messages::ChunkMode;

/// Chunking policy with its batch size resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// One unit per non-empty fragment
    Token,
    /// Units of exactly `batch` characters (the last one may be shorter)
    FixedChars {
        /// Characters per unit
        batch: usize,
    },
    /// Units of exactly `batch` words joined by single spaces
    ///
    /// Whitespace is normalized: runs of whitespace inside or between
    /// fragments collapse to one space, and a word split across two fragments
    /// counts as two words.
    FixedWords {
        /// Words per unit
        batch: usize,
    },
}

impl ChunkPolicy {
    /// Resolve a chunk mode against the configured batch sizes
    ///
    /// A batch size of zero is clamped to one.
    #[must_use]
    pub fn for_mode(mode: ChunkMode, char_batch: usize, word_batch: usize) -> Self {
        match mode {
            ChunkMode::Token => Self::Token,
            ChunkMode::FixedChars => Self::FixedChars {
                batch: char_batch.max(1),
            },
            ChunkMode::FixedWords => Self::FixedWords {
                batch: word_batch.max(1),
            },
        }
    }
}

/// Per-request accumulator
///
/// Create one per request and drop it when the request ends so buffered text
/// never leaks into the next request.
#[derive(Debug)]
pub struct Chunker {
    policy: ChunkPolicy,
    /// Pending characters (fixed_chars mode)
    chars: String,
    /// Number of chars in `chars`, tracked to avoid recounting
    char_count: usize,
    /// Pending words (fixed_words mode)
    words: VecDeque<String>,
}

impl Chunker {
    /// Create an empty chunker
    #[must_use]
    pub fn new(policy: ChunkPolicy) -> Self {
        Self {
            policy,
            chars: String::new(),
            char_count: 0,
            words: VecDeque::new(),
        }
    }

    /// The policy this chunker applies
    #[must_use]
    pub fn policy(&self) -> ChunkPolicy {
        self.policy
    }

    /// Feed one upstream fragment, returning the units it completes
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        match self.policy {
            ChunkPolicy::Token => {
                if fragment.is_empty() {
                    Vec::new()
                } else {
                    vec![fragment.to_string()]
                }
            }
            ChunkPolicy::FixedChars { batch } => {
                self.chars.push_str(fragment);
                self.char_count += fragment.chars().count();

                let mut units = Vec::new();
                while self.char_count >= batch {
                    let split_at = self
                        .chars
                        .char_indices()
                        .nth(batch)
                        .map_or(self.chars.len(), |(idx, _)| idx);
                    let rest = self.chars.split_off(split_at);
                    units.push(std::mem::replace(&mut self.chars, rest));
                    self.char_count -= batch;
                }
                units
            }
            ChunkPolicy::FixedWords { batch } => {
                self.words
                    .extend(fragment.split_whitespace().map(str::to_string));

                let mut units = Vec::new();
                while self.words.len() >= batch {
                    let unit: Vec<String> = self.words.drain(..batch).collect();
                    units.push(unit.join(" "));
                }
                units
            }
        }
    }

    /// Flush whatever is still buffered once upstream is exhausted
    ///
    /// Returns `None` when nothing is pending. Token mode never buffers.
    pub fn finish(&mut self) -> Option<String> {
        match self.policy {
            ChunkPolicy::Token => None,
            ChunkPolicy::FixedChars { .. } => {
                self.char_count = 0;
                if self.chars.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut self.chars))
                }
            }
            ChunkPolicy::FixedWords { .. } => {
                if self.words.is_empty() {
                    None
                } else {
                    let rest: Vec<String> = self.words.drain(..).collect();
                    Some(rest.join(" "))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(policy: ChunkPolicy, fragments: &[&str]) -> Vec<String> {
        let mut chunker = Chunker::new(policy);
        let mut units: Vec<String> = fragments.iter().flat_map(|f| chunker.push(f)).collect();
        units.extend(chunker.finish());
        units
    }

    #[test]
    fn test_token_mode_passes_fragments_through() {
        let units = run(ChunkPolicy::Token, &["He", "", "llo ", "world"]);
        assert_eq!(units, vec!["He", "llo ", "world"]);
    }

    #[test]
    fn test_fixed_chars_scenario() {
        let units = run(
            ChunkPolicy::FixedChars { batch: 5 },
            &["He", "llo ", "wor", "ld"],
        );
        assert_eq!(units, vec!["Hello", " worl", "d"]);
    }

    #[test]
    fn test_fixed_chars_large_fragment_emits_several_units() {
        let mut chunker = Chunker::new(ChunkPolicy::FixedChars { batch: 3 });
        assert_eq!(chunker.push("abcdefgh"), vec!["abc", "def"]);
        assert_eq!(chunker.finish(), Some("gh".to_string()));
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_fixed_chars_counts_characters_not_bytes() {
        let units = run(ChunkPolicy::FixedChars { batch: 2 }, &["héé", "ü"]);
        assert_eq!(units, vec!["hé", "éü"]);
    }

    #[test]
    fn test_fixed_chars_exact_multiple_has_no_trailing_unit() {
        let units = run(ChunkPolicy::FixedChars { batch: 2 }, &["ab", "cd"]);
        assert_eq!(units, vec!["ab", "cd"]);
    }

    #[test]
    fn test_fixed_words_scenario() {
        let units = run(
            ChunkPolicy::FixedWords { batch: 5 },
            &["one two ", "three four five six"],
        );
        assert_eq!(units, vec!["one two three four five", "six"]);
    }

    #[test]
    fn test_fixed_words_normalizes_whitespace() {
        let units = run(
            ChunkPolicy::FixedWords { batch: 2 },
            &["  a\t\tb \n", "c   d"],
        );
        assert_eq!(units, vec!["a b", "c d"]);
    }

    #[test]
    fn test_fixed_words_splits_words_across_fragments() {
        let units = run(ChunkPolicy::FixedWords { batch: 5 }, &["wor", "ld"]);
        assert_eq!(units, vec!["wor ld"]);
    }

    #[test]
    fn test_concatenation_preserved_for_lossless_modes() {
        let fragments = ["The ", "qu", "ick", " brown ", "", "fox ✓", " jumps"];
        let expected: String = fragments.concat();

        for policy in [
            ChunkPolicy::Token,
            ChunkPolicy::FixedChars { batch: 1 },
            ChunkPolicy::FixedChars { batch: 4 },
            ChunkPolicy::FixedChars { batch: 64 },
        ] {
            assert_eq!(run(policy, &fragments).concat(), expected, "{policy:?}");
        }
    }

    #[test]
    fn test_policy_for_mode_clamps_zero_batch() {
        assert_eq!(
            ChunkPolicy::for_mode(ChunkMode::FixedChars, 0, 5),
            ChunkPolicy::FixedChars { batch: 1 }
        );
        assert_eq!(
            ChunkPolicy::for_mode(ChunkMode::FixedWords, 5, 3),
            ChunkPolicy::FixedWords { batch: 3 }
        );
        assert_eq!(ChunkPolicy::for_mode(ChunkMode::Token, 5, 5), ChunkPolicy::Token);
    }
}
