//! Vocabulary-level language filter.
//!
//! The report generator must stay in English medical register; the decoder's
//! vocabulary however covers every script Gemma was trained on. Once per
//! tokenizer we decode the full vocabulary and flag every id whose text falls
//! outside ASCII + Latin-1 Supplement + Latin Extended-A/B, so the sampler
//! can suppress those ids wholesale.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use once_cell::sync::Lazy;
use tokenizers::Tokenizer;
use tracing::info;

/// Highest scalar value accepted by the filter. Covers accented medical
/// terms (é, ü, ñ); Cyrillic and everything beyond is rejected.
const MAX_ALLOWED_SCALAR: u32 = 0x024F;

/// Process-wide mask cache, keyed by tokenizer identity. Entries are never
/// mutated after construction, so readers clone the `Arc` and drop the lock.
static FOREIGN_MASKS: Lazy<Mutex<HashMap<usize, Arc<Vec<bool>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Whether `text` contains only characters acceptable in English medical
/// output. CJK, Arabic, Cyrillic, Hebrew, Thai, emoji and the like fail.
pub fn is_english_text(text: &str) -> bool {
    text.chars().all(|c| (c as u32) <= MAX_ALLOWED_SCALAR)
}

/// The foreign-token mask for `tokenizer`: `true` marks ids the sampler must
/// suppress. Built on first request and cached for the tokenizer's lifetime;
/// concurrent requesters block until the first builder finishes.
pub fn foreign_token_mask(tokenizer: &Arc<Tokenizer>) -> Result<Arc<Vec<bool>>> {
    let key = Arc::as_ptr(tokenizer) as usize;
    let mut cache = FOREIGN_MASKS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(mask) = cache.get(&key) {
        return Ok(Arc::clone(mask));
    }
    let mask = Arc::new(build_mask(tokenizer)?);
    cache.insert(key, Arc::clone(&mask));
    Ok(mask)
}

fn build_mask(tokenizer: &Tokenizer) -> Result<Vec<bool>> {
    let vocab_size = tokenizer.get_vocab_size(true);
    let mut mask = vec![false; vocab_size];
    let mut blocked = 0usize;
    for (id, entry) in mask.iter_mut().enumerate() {
        // ids that fail to decode stay allowed, matching the conservative
        // behavior of only blocking what we can positively classify
        if let Ok(text) = tokenizer.decode(&[id as u32], false) {
            if !is_english_text(&text) {
                *entry = true;
                blocked += 1;
            }
        }
    }
    info!("language filter: blocked {blocked} / {vocab_size} tokens as non-English");
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_and_latin_extended_pass() {
        assert!(is_english_text("pneumothorax"));
        assert!(is_english_text("Sjögren syndrome"));
        assert!(is_english_text("café-au-lait, naïve, señal"));
        assert!(is_english_text("ŧ ƃ ɏ")); // Latin Extended-B upper edge
        assert!(is_english_text(""));
    }

    #[test]
    fn non_latin_scripts_fail() {
        assert!(!is_english_text("肺炎"));
        assert!(!is_english_text("пневмония"));
        assert!(!is_english_text("ɐ")); // U+0250, first scalar past the cutoff
        assert!(!is_english_text("report 終"));
        assert!(!is_english_text("🙂"));
    }

    #[test]
    fn boundary_scalar_is_inclusive() {
        assert!(is_english_text("\u{024F}"));
        assert!(!is_english_text("\u{0250}"));
    }
}
