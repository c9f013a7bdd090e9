//! Decoder KV-cache bookkeeping.
//!
//! The runtime owns the actual key/value tensors; this module tracks the 34
//! per-layer pairs as they shuttle between `present.*` outputs and
//! `past_key_values.*` inputs, along with the single source of truth for how
//! many positions the decoder has attended to.

use anyhow::{Result, ensure};
use once_cell::sync::Lazy;
use ort::value::DynValue;

use crate::{
    constants::{DECODER_LAYERS, HEAD_DIM, KV_HEADS},
    session,
};

/// Decoder graph input names: embeddings, mask, then the 34 KV pairs.
pub static DECODER_INPUT_NAMES: Lazy<Vec<String>> = Lazy::new(|| {
    let mut names = vec!["inputs_embeds".to_owned(), "attention_mask".to_owned()];
    for layer in 0..DECODER_LAYERS {
        names.push(format!("past_key_values.{layer}.key"));
        names.push(format!("past_key_values.{layer}.value"));
    }
    names
});

/// Decoder graph output names: logits, then the 34 present KV pairs.
pub static DECODER_OUTPUT_NAMES: Lazy<Vec<String>> = Lazy::new(|| {
    let mut names = vec!["logits".to_owned()];
    for layer in 0..DECODER_LAYERS {
        names.push(format!("present.{layer}.key"));
        names.push(format!("present.{layer}.value"));
    }
    names
});

/// Number of KV tensors a decoder run consumes and produces.
pub const KV_TENSOR_COUNT: usize = DECODER_LAYERS * 2;

/// Owned KV tensors plus the attended-position count.
///
/// `positions` grows monotonically: once per prefill chunk by the chunk
/// length and once per decode step by one. The tensors move out for each
/// decoder run ([`take_tensors`]) and the run's `present.*` outputs move
/// back in ([`replace`]); they are never copied.
pub struct DecoderKvCache {
    tensors: Vec<DynValue>,
    positions: usize,
}

impl DecoderKvCache {
    /// Cache for a fresh inference: 68 zero-length `1 x 4 x 0 x 256` tensors.
    pub fn empty() -> Result<Self> {
        let mut tensors = Vec::with_capacity(KV_TENSOR_COUNT);
        for _ in 0..KV_TENSOR_COUNT {
            tensors.push(session::f32_value(
                vec![1, KV_HEADS, 0, HEAD_DIM],
                Vec::new(),
            )?);
        }
        Ok(Self {
            tensors,
            positions: 0,
        })
    }

    /// Total positions the decoder has attended to so far.
    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Move the tensors out for the next decoder run.
    pub fn take_tensors(&mut self) -> Vec<DynValue> {
        std::mem::take(&mut self.tensors)
    }

    /// Install the `present.*` tensors of a completed run and advance the
    /// position count by the positions that run processed.
    pub fn replace(&mut self, tensors: Vec<DynValue>, advanced: usize) -> Result<()> {
        ensure!(
            tensors.len() == KV_TENSOR_COUNT,
            "expected {KV_TENSOR_COUNT} KV tensors, got {}",
            tensors.len()
        );
        ensure!(advanced > 0, "decoder run advanced zero positions");
        self.tensors = tensors;
        self.positions += advanced;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_names_cover_embeddings_mask_and_all_layers() {
        assert_eq!(DECODER_INPUT_NAMES.len(), 2 + KV_TENSOR_COUNT);
        assert_eq!(DECODER_INPUT_NAMES[0], "inputs_embeds");
        assert_eq!(DECODER_INPUT_NAMES[1], "attention_mask");
        assert_eq!(DECODER_INPUT_NAMES[2], "past_key_values.0.key");
        assert_eq!(DECODER_INPUT_NAMES[3], "past_key_values.0.value");
        assert_eq!(
            DECODER_INPUT_NAMES.last().unwrap(),
            &format!("past_key_values.{}.value", DECODER_LAYERS - 1)
        );
    }

    #[test]
    fn output_names_lead_with_logits() {
        assert_eq!(DECODER_OUTPUT_NAMES.len(), 1 + KV_TENSOR_COUNT);
        assert_eq!(DECODER_OUTPUT_NAMES[0], "logits");
        assert_eq!(DECODER_OUTPUT_NAMES[1], "present.0.key");
        assert_eq!(
            DECODER_OUTPUT_NAMES.last().unwrap(),
            &format!("present.{}.value", DECODER_LAYERS - 1)
        );
    }

    #[test]
    fn input_and_output_kv_names_pair_up() {
        for layer in 0..DECODER_LAYERS {
            let past_key = &DECODER_INPUT_NAMES[2 + layer * 2];
            let present_key = &DECODER_OUTPUT_NAMES[1 + layer * 2];
            assert_eq!(
                past_key.trim_start_matches("past_key_values."),
                present_key.trim_start_matches("present.")
            );
        }
    }
}
