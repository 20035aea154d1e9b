//! Text tokenization for Baichuan checkpoints.

use std::fs;
use std::path::Path;

use serde_json::Value;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{Error, Result};

/// Control token ids. Baichuan checkpoints use `<s>` = 1, `</s>` = 2 and
/// `<unk>` = 0 for padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos_id: u32,
    pub eos_id: u32,
    pub pad_id: u32,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos_id: 1,
            eos_id: 2,
            pad_id: 0,
        }
    }
}

impl SpecialTokens {
    /// Read ids from a `generation_config.json`, keeping defaults for missing
    /// keys. A list-valued `eos_token_id` uses its first entry.
    pub fn from_generation_config(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let id = |key: &str| -> Option<u32> {
            match value.get(key)? {
                Value::Number(n) => n.as_u64().map(|n| n as u32),
                Value::Array(items) => items.first()?.as_u64().map(|n| n as u32),
                _ => None,
            }
        };
        let defaults = Self::default();
        Ok(Self {
            bos_id: id("bos_token_id").unwrap_or(defaults.bos_id),
            eos_id: id("eos_token_id").unwrap_or(defaults.eos_id),
            pad_id: id("pad_token_id").unwrap_or(defaults.pad_id),
        })
    }
}

pub struct Tokenizer {
    inner: HfTokenizer,
    special_tokens: SpecialTokens,
}

impl Tokenizer {
    pub fn new(inner: HfTokenizer, special_tokens: SpecialTokens) -> Self {
        Self {
            inner,
            special_tokens,
        }
    }

    /// Load `tokenizer.json` and, when present, `generation_config.json`
    /// from a model directory.
    pub fn from_path(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(Error::TokenizationError(format!(
                "No tokenizer.json found in {}",
                model_dir.display()
            )));
        }
        let inner = HfTokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;

        let generation_config = model_dir.join("generation_config.json");
        let special_tokens = if generation_config.exists() {
            SpecialTokens::from_generation_config(&fs::read_to_string(generation_config)?)?
        } else {
            SpecialTokens::default()
        };
        debug!(
            "Loaded tokenizer from {:?} with {:?}",
            tokenizer_path, special_tokens
        );
        Ok(Self::new(inner, special_tokens))
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::TokenizationError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a prompt, prefixed with the BOS token.
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = vec![self.special_tokens.bos_id];
        ids.extend(self.encode(text)?);
        Ok(ids)
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::TokenizationError(e.to_string()))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4},
            "unk_token": "<unk>"
        }
    }"#;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new(
            HfTokenizer::from_str(WORD_LEVEL).unwrap(),
            SpecialTokens::default(),
        )
    }

    #[test]
    fn test_encode_decode() {
        let tok = tokenizer();
        assert_eq!(tok.encode("hello world").unwrap(), vec![3, 4]);
        assert_eq!(tok.encode_prompt("world").unwrap(), vec![1, 4]);
        assert_eq!(tok.encode("goodbye").unwrap(), vec![0]);
        assert_eq!(tok.decode(&[3, 4]).unwrap(), "hello world");
        assert_eq!(tok.vocab_size(), 5);
    }

    #[test]
    fn test_special_tokens_from_generation_config() {
        let ids = SpecialTokens::from_generation_config(
            r#"{"bos_token_id": 1, "eos_token_id": [7, 2], "user_token_id": 195}"#,
        )
        .unwrap();
        assert_eq!(ids.eos_id, 7);
        assert_eq!(ids.pad_id, 0);
        assert!(SpecialTokens::from_generation_config("not json").is_err());
    }

    #[test]
    fn test_missing_tokenizer_file() {
        let dir = std::env::temp_dir().join(format!("baichuan-no-tokenizer-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            Tokenizer::from_path(&dir),
            Err(Error::TokenizationError(_))
        ));
        fs::remove_dir_all(&dir).ok();
    }
}
