//! The staged inference pipeline: vision encode, embedding fusion, chunked
//! prefill, and the autoregressive decode loop.
//!
//! One call is one complete generation. Every failure path is converted into
//! a tagged callback string; nothing propagates to the host.

use anyhow::{Context, Result, ensure};
use tracing::{debug, error, info};

use crate::{
    cache::DecoderKvCache,
    config::RuntimeBudget,
    constants::{BOS_TOKEN_ID, EMBED_DIM, EOS_TOKEN_IDS},
    engine::MedGemmaEngine,
    language, memory,
    sampling::{self, SamplingOptions},
    session,
    stopping::StopMatcher,
    vision,
};

/// Drive one full generation, streaming decoded fragments (and bracketed
/// diagnostics) through `emit` in order.
pub fn run_inference(
    engine: &mut MedGemmaEngine,
    image_bytes: Option<&[u8]>,
    prompt: &str,
    max_tokens: i32,
    emit: &mut dyn FnMut(&str),
) {
    if let Err(err) = execute(engine, image_bytes, prompt, max_tokens, emit) {
        error!("inference failed: {err:#}");
        emit(&format!("[EXCEPTION] {err:#}"));
    }
}

fn execute(
    engine: &mut MedGemmaEngine,
    image_bytes: Option<&[u8]>,
    prompt: &str,
    max_tokens: i32,
    emit: &mut dyn FnMut(&str),
) -> Result<()> {
    let budget = engine.budget().clone();
    let max_tokens = budget.normalize_max_tokens(max_tokens);
    let image_bytes = image_bytes.filter(|bytes| !bytes.is_empty());
    info!(
        "inference start: image_len={} max_tokens={max_tokens}",
        image_bytes.map_or(0, <[u8]>::len)
    );

    // Stage 1: vision path. Failures degrade to text-only generation.
    let patch_embeddings = match image_bytes {
        Some(bytes) => vision_stage(engine, bytes, &budget, emit)?,
        None => {
            info!("no image, text-only mode");
            None
        }
    };

    // Stage 2: tokenize and fuse.
    let mut tokens = Vec::with_capacity(64);
    tokens.push(BOS_TOKEN_ID);
    tokens.extend(engine.encode_prompt(prompt)?);
    info!("tokenized: {} tokens", tokens.len());

    let image_token_id = engine.image_token_id();
    let placeholder_occurrences = tokens.iter().filter(|&&id| id == image_token_id).count();
    let fused = fuse_embeddings(
        &tokens,
        image_token_id,
        patch_embeddings.as_deref(),
        EMBED_DIM,
        |id| engine.embed_token(id),
    )?;
    drop(patch_embeddings);
    info!(
        "fused sequence: {} positions, {} image splice(s), {:.1} MiB",
        fused.positions,
        fused.spliced_images,
        (fused.embeds.len() * 4) as f32 / (1024.0 * 1024.0)
    );
    if image_bytes.is_some() && placeholder_occurrences == 0 {
        error!("image bytes provided but the <image> token never appears in the prompt");
        emit("[WARN] Image not grounded — <image> token missing from prompt. Output may be hallucinated.");
    }

    // Stage 3: chunked prefill.
    let (mut kv, first_logits) = chunked_prefill(engine, &fused.embeds, fused.positions, &budget)?;
    drop(fused);

    let Some(first_logits) = first_logits else {
        error!("prefill produced no token");
        emit("[ERR] Prefill failed");
        return Ok(());
    };

    // Stage 4: first-token emit and the decode loop.
    let options = SamplingOptions::default();
    let foreign_mask = language::foreign_token_mask(engine.tokenizer())?;
    let mut recent_ids: Vec<i64> = Vec::with_capacity(budget.repetition_window);
    let mut stop = StopMatcher::new();

    let first_id = sampling::select_token(&first_logits, &options, &recent_ids, Some(foreign_mask.as_slice()))?;
    drop(first_logits);
    info!("prefill complete, first token id={first_id}");
    if EOS_TOKEN_IDS.contains(&first_id) {
        info!("EOS on first sampled token");
        return Ok(());
    }
    if emit_token(engine, first_id, &mut recent_ids, &budget, &mut stop, emit)? {
        info!("stop string triggered on first token");
        return Ok(());
    }

    let mut next_id = first_id;
    for step in 0..max_tokens.saturating_sub(1) {
        let row = engine.embed_token(next_id)?;
        let embeds = session::f32_value(vec![1, 1, EMBED_DIM], row)?;
        let mask = session::ones_mask(kv.positions() + 1)?;
        debug!("decode step {step}: kv_len={}", kv.positions());

        let (logits, kv_out) = engine.run_decoder_step(embeds, mask, kv.take_tensors(), true)?;
        let logits = logits.context("decoder step produced no logits")?;
        let id = sampling::select_token(&logits, &options, &recent_ids, Some(foreign_mask.as_slice()))?;
        drop(logits);

        if EOS_TOKEN_IDS.contains(&id) {
            info!("EOS at decode step {}", step + 1);
            break;
        }
        next_id = id;
        if emit_token(engine, id, &mut recent_ids, &budget, &mut stop, emit)? {
            info!("stop string triggered at decode step {}", step + 1);
            break;
        }

        // the run above attended to one new position
        kv.replace(kv_out, 1)?;

        if budget.ram_check_interval > 0 && step % budget.ram_check_interval == 0 {
            if let Some(available) = memory::available_mib() {
                debug!("decode step {} RAM: {available} MiB", step + 1);
                if available < budget.decode_min_free_mib {
                    error!("available RAM {available} MiB below decode floor, stopping");
                    emit("[WARN] Low RAM, stopping");
                    break;
                }
            }
        }
    }

    info!("inference complete");
    Ok(())
}

/// Preprocess the image, run the vision encoder + projection, and destroy
/// both vision sessions. Returns `None` (after emitting an `[IMG_ERR]`
/// diagnostic) when the image cannot be used; generation then continues
/// text-only.
fn vision_stage(
    engine: &mut MedGemmaEngine,
    bytes: &[u8],
    budget: &RuntimeBudget,
    emit: &mut dyn FnMut(&str),
) -> Result<Option<Vec<f32>>> {
    info!("vision stage: {} input bytes", bytes.len());
    let pixel_values = match vision::planar_pixel_values(bytes) {
        Ok(values) => values,
        Err(err) => {
            let message = format!("[IMG_ERR] {err}");
            error!("{message}");
            emit(&message);
            return Ok(None);
        }
    };

    if let Some(available) = memory::available_mib() {
        info!("available RAM before vision encoder: {available} MiB");
        if available < budget.vision_min_free_mib {
            let message = format!(
                "[IMG_ERR] Insufficient RAM for vision encoder ({available} MiB free, need ~{} MiB). Try closing other apps.",
                budget.vision_min_free_mib
            );
            error!("{message}");
            emit(&message);
            return Ok(None);
        }
    }

    let patches = engine.encode_image_embeddings(pixel_values)?;
    // the encoder and projection weights are never needed again this run
    engine.release_vision_sessions();
    Ok(Some(patches))
}

/// The fused embedding sequence handed to prefill.
pub struct FusedSequence {
    /// Row-major `positions x embed_dim` buffer.
    pub embeds: Vec<f32>,
    /// Total sequence length; the attention mask is this many ones.
    pub positions: usize,
    /// How many placeholder positions received patch embeddings.
    pub spliced_images: usize,
}

/// Build the fused embedding sequence for a token-id stream.
///
/// Each placeholder id is replaced by the full patch-embedding block when
/// one is live; placeholders without a patch buffer (and every ordinary id)
/// take their row from the embedding table via `lookup`.
pub fn fuse_embeddings(
    tokens: &[i64],
    image_token_id: i64,
    patch_embeddings: Option<&[f32]>,
    embed_dim: usize,
    mut lookup: impl FnMut(i64) -> Result<Vec<f32>>,
) -> Result<FusedSequence> {
    ensure!(embed_dim > 0, "embed_dim must be positive");
    if let Some(patches) = patch_embeddings {
        ensure!(
            !patches.is_empty() && patches.len() % embed_dim == 0,
            "patch embedding buffer of {} values is not a multiple of embed_dim {embed_dim}",
            patches.len()
        );
    }
    let patch_rows = patch_embeddings.map_or(0, |patches| patches.len() / embed_dim);

    let mut embeds = Vec::with_capacity((tokens.len() + patch_rows) * embed_dim);
    let mut positions = 0usize;
    let mut spliced_images = 0usize;
    for &id in tokens {
        if id == image_token_id {
            if let Some(patches) = patch_embeddings {
                embeds.extend_from_slice(patches);
                positions += patch_rows;
                spliced_images += 1;
                continue;
            }
            // no live patch buffer: the placeholder embeds like any other id
        }
        let row = lookup(id)?;
        ensure!(
            row.len() == embed_dim,
            "embedding row for id {id} has {} values, expected {embed_dim}",
            row.len()
        );
        embeds.extend_from_slice(&row);
        positions += 1;
    }
    Ok(FusedSequence {
        embeds,
        positions,
        spliced_images,
    })
}

/// Split `total` positions into `(start, len)` spans of at most `chunk`.
pub fn chunk_spans(total: usize, chunk: usize) -> Vec<(usize, usize)> {
    let chunk = chunk.max(1);
    let mut spans = Vec::with_capacity(total.div_ceil(chunk));
    let mut start = 0;
    while start < total {
        let len = chunk.min(total - start);
        spans.push((start, len));
        start += len;
    }
    spans
}

/// Run prefill over the fused sequence in bounded chunks so no intermediate
/// logits tensor ever exceeds `chunk x vocab`. Only the final chunk's
/// last-position logits are copied out; every other logits tensor is
/// dropped unread.
fn chunked_prefill(
    engine: &mut MedGemmaEngine,
    embeds: &[f32],
    total: usize,
    budget: &RuntimeBudget,
) -> Result<(DecoderKvCache, Option<Vec<f32>>)> {
    let mut cache = DecoderKvCache::empty()?;
    let spans = chunk_spans(total, budget.prefill_chunk);
    let last_index = spans.len().saturating_sub(1);
    let mut final_logits = None;

    for (index, &(start, len)) in spans.iter().enumerate() {
        let chunk = embeds[start * EMBED_DIM..(start + len) * EMBED_DIM].to_vec();
        let chunk_value = session::f32_value(vec![1, len, EMBED_DIM], chunk)?;
        let mask = session::ones_mask(cache.positions() + len)?;
        debug!(
            "prefill chunk [{start}..{}] kv_len={}",
            start + len - 1,
            cache.positions()
        );

        let is_last = index == last_index;
        let (logits, kv_out) =
            engine.run_decoder_step(chunk_value, mask, cache.take_tensors(), is_last)?;
        if is_last {
            final_logits = logits;
        }
        cache.replace(kv_out, len)?;
    }
    Ok((cache, final_logits))
}

/// Record an emitted token: recent-id window, text decode, callback, stop
/// matching. Returns `true` when a stop string completed.
fn emit_token(
    engine: &MedGemmaEngine,
    id: i64,
    recent_ids: &mut Vec<i64>,
    budget: &RuntimeBudget,
    stop: &mut StopMatcher,
    emit: &mut dyn FnMut(&str),
) -> Result<bool> {
    recent_ids.push(id);
    if recent_ids.len() > budget.repetition_window {
        recent_ids.remove(0);
    }
    let text = engine.decode_token_text(id)?;
    emit(&text);
    Ok(stop.observe(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_spans_cover_the_sequence_exactly() {
        assert_eq!(chunk_spans(0, 16), vec![]);
        assert_eq!(chunk_spans(5, 16), vec![(0, 5)]);
        assert_eq!(chunk_spans(16, 16), vec![(0, 16)]);
        assert_eq!(chunk_spans(40, 16), vec![(0, 16), (16, 16), (32, 8)]);

        let spans = chunk_spans(173, 16);
        let total: usize = spans.iter().map(|&(_, len)| len).sum();
        assert_eq!(total, 173);
        for window in spans.windows(2) {
            assert_eq!(window[0].0 + window[0].1, window[1].0);
        }
    }

    #[test]
    fn chunk_spans_tolerate_zero_chunk_size() {
        assert_eq!(chunk_spans(3, 0), vec![(0, 1), (1, 1), (2, 1)]);
    }
}
