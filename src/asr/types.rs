//! Core ASR domain types.
//!
//! This module defines the vocabulary used for detokenisation and context-word
//! tokenisation, the hypotheses exchanged between search and rescoring, and
//! the n-best results handed to clients.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::asr::options::SessionConfig;
use crate::error::{AppError, Result};
use crate::model::TokenId;

/// Word-boundary marker used by sentencepiece-style units.
const WORD_BOUNDARY: char = '▁';

/// Bidirectional token/id mapping loaded from a units file.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    id_to_token: HashMap<TokenId, String>,
    token_to_id: HashMap<String, TokenId>,
    /// Longest token, in chars; bounds the greedy match in [`Vocabulary::encode`].
    max_token_chars: usize,
}

impl Vocabulary {
    /// Load vocabulary from a file.
    ///
    /// The file format is one `<token> <id>` pair per line, for example
    /// `▁the 5` or `<blank> 0`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::ModelLoad(format!("cannot read units file {}: {}", path.display(), e))
        })?;
        let vocabulary = Self::parse(&content)?;
        debug!("Loaded vocabulary with {} tokens", vocabulary.len());
        Ok(vocabulary)
    }

    /// Parse the contents of a units file.
    pub fn parse(content: &str) -> Result<Self> {
        let mut vocabulary = Self::default();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (token, id) = line
                .rsplit_once(char::is_whitespace)
                .and_then(|(token, id)| Some((token.trim(), id.parse::<TokenId>().ok()?)))
                .ok_or_else(|| {
                    AppError::ModelLoad(format!("malformed units line {}: '{}'", number + 1, line))
                })?;
            vocabulary.insert(token, id);
        }
        Ok(vocabulary)
    }

    fn insert(&mut self, token: &str, id: TokenId) {
        self.max_token_chars = self.max_token_chars.max(token.chars().count());
        self.id_to_token.insert(id, token.to_string());
        self.token_to_id.insert(token.to_string(), id);
    }

    /// Get the token for a given ID, or None if not found.
    pub fn get_token(&self, id: TokenId) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    pub fn token_id(&self, token: &str) -> Option<TokenId> {
        self.token_to_id.get(token).copied()
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    fn is_special(token: &str) -> bool {
        token.starts_with('<') && token.ends_with('>')
    }

    /// Join tokens into text.
    ///
    /// Special `<...>` tokens are dropped. For space-delimited languages the
    /// word-boundary marker becomes a space; otherwise tokens are concatenated
    /// and a space is only kept between two latin words.
    pub fn detokenize(&self, tokens: &[TokenId], language: &str) -> String {
        let spaced = uses_word_spaces(language);
        let mut text = String::new();
        for token in tokens.iter().filter_map(|&id| self.get_token(id)) {
            if Self::is_special(token) {
                continue;
            }
            match token.strip_prefix(WORD_BOUNDARY) {
                Some(rest) => {
                    let latin_join = text.chars().last().is_some_and(|c| c.is_ascii_alphanumeric())
                        && rest.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
                    if spaced || latin_join {
                        text.push(' ');
                    }
                    text.push_str(rest);
                }
                None => text.push_str(token),
            }
        }
        text.trim().to_string()
    }

    /// Display text of a single token, without the word-boundary marker.
    pub fn piece_text(&self, id: TokenId) -> Option<&str> {
        let token = self.get_token(id)?;
        if Self::is_special(token) {
            return None;
        }
        Some(token.trim_start_matches(WORD_BOUNDARY))
    }

    /// Tokenise a word or phrase by greedy longest match.
    ///
    /// Each whitespace-separated word first tries a boundary-marked piece at
    /// its start. Returns `None` if some part cannot be matched.
    pub fn encode(&self, phrase: &str) -> Option<Vec<TokenId>> {
        let mut tokens = Vec::new();
        for word in phrase.split_whitespace() {
            let chars: Vec<char> = word.chars().collect();
            let mut start = 0;
            while start < chars.len() {
                let longest = (start + self.max_token_chars).min(chars.len());
                let (end, id) = (start + 1..=longest).rev().find_map(|end| {
                    let piece: String = chars[start..end].iter().collect();
                    if start == 0 {
                        let marked = format!("{}{}", WORD_BOUNDARY, piece);
                        if let Some(id) = self.token_id(&marked) {
                            return Some((end, id));
                        }
                    }
                    self.token_id(&piece).map(|id| (end, id))
                })?;
                tokens.push(id);
                start = end;
            }
        }
        Some(tokens)
    }
}

/// Whether words of `language` are separated by spaces.
pub fn uses_word_spaces(language: &str) -> bool {
    let language = language.to_ascii_lowercase();
    !(language.starts_with("zh")
        || matches!(language.as_str(), "chs" | "cmn" | "ja" | "jp" | "yue"))
}

/// A candidate token sequence from the CTC search.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Token ids without start/end markers.
    pub tokens: Vec<TokenId>,
    pub score: f32,
    /// Encoder frame at which each token was emitted.
    pub times: Vec<usize>,
}

/// A hypothesis with its final ranking score.
#[derive(Debug, Clone, PartialEq)]
pub struct RescoredHypothesis {
    pub hypothesis: Hypothesis,
    /// Position in the CTC ranking; ties in `final_score` keep this order.
    pub ctc_rank: usize,
    pub attention_score: Option<f32>,
    pub final_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordPiece {
    pub word: String,
    /// Milliseconds from the start of the stream.
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NbestEntry {
    pub sentence: String,
    pub tokens: Vec<TokenId>,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_pieces: Option<Vec<WordPiece>>,
}

/// Ranked n-best list for one utterance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodeResult {
    pub nbest: Vec<NbestEntry>,
}

impl DecodeResult {
    /// Render the top `config.nbest` ranked hypotheses.
    ///
    /// # Arguments
    /// * `ranked` - Hypotheses in final ranking order
    /// * `config` - Session options (n-best size, language, timestamps)
    /// * `vocabulary` - Units used for detokenisation
    /// * `frame_ms` - Duration of one encoder frame
    /// * `offset_ms` - Start of this utterance within the stream
    pub fn from_ranked(
        ranked: &[RescoredHypothesis],
        config: &SessionConfig,
        vocabulary: &Vocabulary,
        frame_ms: u64,
        offset_ms: u64,
    ) -> Self {
        let nbest = ranked
            .iter()
            .take(config.nbest)
            .map(|ranked| {
                let hyp = &ranked.hypothesis;
                let word_pieces = config.enable_timestamp.then(|| {
                    hyp.tokens
                        .iter()
                        .zip(&hyp.times)
                        .filter_map(|(&id, &frame)| {
                            let start = offset_ms + frame as u64 * frame_ms;
                            vocabulary.piece_text(id).map(|word| WordPiece {
                                word: word.to_string(),
                                start,
                                end: start + frame_ms,
                            })
                        })
                        .collect()
                });
                NbestEntry {
                    sentence: vocabulary.detokenize(&hyp.tokens, &config.language),
                    tokens: hyp.tokens.clone(),
                    score: ranked.final_score,
                    word_pieces,
                }
            })
            .collect();
        Self { nbest }
    }

    pub fn is_empty(&self) -> bool {
        self.nbest.is_empty()
    }

    /// Sentence of the top hypothesis, or an empty string.
    pub fn best_sentence(&self) -> &str {
        self.nbest.first().map(|e| e.sentence.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const UNITS: &str = "<blank> 0\n<unk> 1\n▁hel 2\nlo 3\n▁wor 4\nld 5\n你 6\n好 7\n<sos/eos> 8\n";

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(UNITS.as_bytes()).unwrap();
        let vocab = Vocabulary::load_from_file(file.path()).unwrap();
        assert_eq!(vocab.len(), 9);
        assert_eq!(vocab.get_token(2), Some("▁hel"));
        assert_eq!(vocab.token_id("<sos/eos>"), Some(8));

        assert!(matches!(
            Vocabulary::load_from_file("/nonexistent/units.txt"),
            Err(AppError::ModelLoad(_))
        ));
        assert!(Vocabulary::parse("token_without_id\n").is_err());
    }

    #[test]
    fn test_detokenize_by_language() {
        let vocab = Vocabulary::parse(UNITS).unwrap();
        assert_eq!(vocab.detokenize(&[2, 3, 4, 5], "en"), "hello world");
        assert_eq!(vocab.detokenize(&[6, 7], "chs"), "你好");
        assert_eq!(vocab.detokenize(&[6, 2, 3, 4, 5], "zh"), "你hello world");
        assert_eq!(vocab.detokenize(&[0, 2, 3, 8], "en"), "hello");
    }

    #[test]
    fn test_encode_greedy_longest_match() {
        let vocab = Vocabulary::parse(UNITS).unwrap();
        assert_eq!(vocab.encode("hello world"), Some(vec![2, 3, 4, 5]));
        assert_eq!(vocab.encode("你好"), Some(vec![6, 7]));
        assert_eq!(vocab.encode("xyz"), None);
    }

    #[test]
    fn test_result_from_ranked_with_timestamps() {
        let vocab = Vocabulary::parse(UNITS).unwrap();
        let ranked = vec![
            RescoredHypothesis {
                hypothesis: Hypothesis {
                    tokens: vec![6, 7],
                    score: -1.0,
                    times: vec![3, 9],
                },
                ctc_rank: 0,
                attention_score: None,
                final_score: -1.0,
            },
            RescoredHypothesis {
                hypothesis: Hypothesis {
                    tokens: vec![6],
                    score: -2.0,
                    times: vec![3],
                },
                ctc_rank: 1,
                attention_score: None,
                final_score: -2.0,
            },
        ];
        let config = SessionConfig {
            enable_timestamp: true,
            ..Default::default()
        };
        let result = DecodeResult::from_ranked(&ranked, &config, &vocab, 40, 1000);
        assert_eq!(result.nbest.len(), 1);
        assert_eq!(result.best_sentence(), "你好");
        let pieces = result.nbest[0].word_pieces.as_ref().unwrap();
        assert_eq!(pieces[1].word, "好");
        assert_eq!(pieces[1].start, 1360);
        assert_eq!(pieces[1].end, 1400);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json["nbest"][0]["word_pieces"].is_array());

        let plain = DecodeResult::from_ranked(&ranked, &SessionConfig::default(), &vocab, 40, 0);
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json["nbest"][0].get("word_pieces").is_none());
    }
}
