//! Engine loading and lifetime: the four runtime sessions, the tokenizer,
//! and the model constants resolved at load time.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Once},
};

use anyhow::{Context, Result, anyhow, ensure};
use once_cell::sync::Lazy;
use ort::{session::Session, value::DynValue};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::{
    cache::{DECODER_INPUT_NAMES, DECODER_OUTPUT_NAMES, KV_TENSOR_COUNT},
    config::RuntimeBudget,
    constants::{BOS_TOKEN_ID, EMBED_DIM, FALLBACK_IMAGE_TOKEN_ID, IMAGE_SIZE, NUM_PATCHES},
    memory,
    session::{self, SessionProfile},
};

const VISION_ENCODER_FILE: &str = "vision_encoder.ort";
const VISION_PROJECTION_FILE: &str = "vision_projection.ort";
const EMBEDDINGS_FILE: &str = "embeddings.ort";
const DECODER_FILE: &str = "model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";

static ORT_INIT: Once = Once::new();

static VISION_ENCODER_OUTPUTS: Lazy<Vec<String>> =
    Lazy::new(|| vec!["image_features".to_owned()]);
static VISION_PROJECTION_OUTPUTS: Lazy<Vec<String>> =
    Lazy::new(|| vec!["visual_tokens".to_owned()]);
static EMBEDDING_OUTPUTS: Lazy<Vec<String>> = Lazy::new(|| vec!["embeddings".to_owned()]);

/// A loaded MedGemma model: four sessions, tokenizer, resolved constants.
///
/// One inference at a time; callers serialize. The vision sessions are
/// destroyed mid-inference to reclaim RAM and come back via
/// [`reset_inference_state`](Self::reset_inference_state).
pub struct MedGemmaEngine {
    model_dir: PathBuf,
    budget: RuntimeBudget,
    vision_profile: SessionProfile,
    vision_encoder: Option<Session>,
    vision_projection: Option<Session>,
    embeddings: Session,
    decoder: Session,
    tokenizer: Arc<Tokenizer>,
    image_token_id: i64,
}

impl MedGemmaEngine {
    /// Load every model artifact from `model_dir`.
    pub fn load(model_dir: impl AsRef<Path>) -> Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();
        info!("loading MedGemma from {}", model_dir.display());

        ORT_INIT.call_once(|| {
            let _ = ort::init().with_name("medgemma").commit();
        });

        let tokenizer = Tokenizer::from_file(model_dir.join(TOKENIZER_FILE))
            .map_err(|err| anyhow!("failed to load tokenizer: {err}"))?;
        let image_token_id = discover_image_token(&tokenizer);
        info!("image token id: {image_token_id}");

        let vision_profile = SessionProfile::vision();
        let llm_profile = SessionProfile::llm();
        let vision_encoder = vision_profile.load(&model_dir.join(VISION_ENCODER_FILE))?;
        let vision_projection = vision_profile.load(&model_dir.join(VISION_PROJECTION_FILE))?;
        let embeddings = llm_profile.load(&model_dir.join(EMBEDDINGS_FILE))?;
        let decoder = llm_profile.load(&model_dir.join(DECODER_FILE))?;
        info!("all sessions loaded");

        let budget = RuntimeBudget::load(&model_dir);
        Ok(Self {
            model_dir,
            budget,
            vision_profile,
            vision_encoder: Some(vision_encoder),
            vision_projection: Some(vision_projection),
            embeddings,
            decoder,
            tokenizer: Arc::new(tokenizer),
            image_token_id,
        })
    }

    pub fn budget(&self) -> &RuntimeBudget {
        &self.budget
    }

    pub fn image_token_id(&self) -> i64 {
        self.image_token_id
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    /// Encode prompt text to token ids (no BOS; the orchestrator prepends it).
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        Ok(encoding.get_ids().iter().map(|&id| id as i64).collect())
    }

    /// Decode a single token id to its text form, control tokens included
    /// (the stop matcher needs `<end_of_turn>` in the clear).
    pub fn decode_token_text(&self, id: i64) -> Result<String> {
        self.tokenizer
            .decode(&[id as u32], false)
            .map_err(|err| anyhow!("token decode failed: {err}"))
    }

    /// Look up the embedding row for one token id.
    pub fn embed_token(&mut self, id: i64) -> Result<Vec<f32>> {
        let ids = session::i64_value(vec![1, 1], vec![id])?;
        let outputs = session::run(
            &mut self.embeddings,
            vec![session::named("input_ids", ids)],
            &EMBEDDING_OUTPUTS,
        )?;
        let row = session::copy_f32(&outputs[0])?;
        ensure!(
            row.len() == EMBED_DIM,
            "embedding row for id {id} has {} values, expected {EMBED_DIM}",
            row.len()
        );
        Ok(row)
    }

    /// Run the vision encoder and projection over a planar pixel tensor and
    /// copy the resulting patch embeddings out of runtime ownership. The
    /// pixel tensor is consumed by the encoder run and freed immediately
    /// after it; only the copied buffer outlives this call.
    pub fn encode_image_embeddings(&mut self, pixel_values: Vec<f32>) -> Result<Vec<f32>> {
        let features = {
            let encoder = self
                .vision_encoder
                .as_mut()
                .context("vision encoder session not loaded; call reset_inference_state")?;
            let input = session::f32_value(vec![1, 3, IMAGE_SIZE, IMAGE_SIZE], pixel_values)?;
            let mut outputs = session::run(
                encoder,
                vec![session::named("pixel_values", input)],
                &VISION_ENCODER_OUTPUTS,
            )?;
            info!("vision encoder done");
            outputs.swap_remove(0)
        };

        let projection = self
            .vision_projection
            .as_mut()
            .context("vision projection session not loaded; call reset_inference_state")?;
        let outputs = session::run(
            projection,
            vec![session::named("image_features", features)],
            &VISION_PROJECTION_OUTPUTS,
        )?;
        let patches = session::copy_f32(&outputs[0])?;
        ensure!(
            patches.len() == NUM_PATCHES * EMBED_DIM,
            "projection produced {} values, expected {}",
            patches.len(),
            NUM_PATCHES * EMBED_DIM
        );
        info!(
            "vision projection done ({:.1} MiB of patch embeddings)",
            (patches.len() * 4) as f32 / (1024.0 * 1024.0)
        );
        Ok(patches)
    }

    /// One decoder run: a span of embeddings plus the current KV tensors in,
    /// the new KV tensors (and optionally the last position's logits) out.
    /// The logits tensor itself is released before returning.
    pub fn run_decoder_step(
        &mut self,
        embeds: DynValue,
        attention_mask: DynValue,
        kv_tensors: Vec<DynValue>,
        want_logits: bool,
    ) -> Result<(Option<Vec<f32>>, Vec<DynValue>)> {
        ensure!(
            kv_tensors.len() == KV_TENSOR_COUNT,
            "decoder step given {} KV tensors, expected {KV_TENSOR_COUNT}",
            kv_tensors.len()
        );
        let mut inputs = Vec::with_capacity(DECODER_INPUT_NAMES.len());
        inputs.push(session::named("inputs_embeds", embeds));
        inputs.push(session::named("attention_mask", attention_mask));
        for (name, value) in DECODER_INPUT_NAMES[2..].iter().zip(kv_tensors) {
            inputs.push(session::named(name.clone(), value));
        }

        let mut outputs = session::run(&mut self.decoder, inputs, &DECODER_OUTPUT_NAMES)?;
        let logits_value = outputs.remove(0);
        let logits = if want_logits {
            Some(session::copy_last_row(&logits_value)?)
        } else {
            None
        };
        drop(logits_value);
        Ok((logits, outputs))
    }

    /// Drop the vision encoder and projection sessions, reclaiming their
    /// weights' RAM for the generation loop.
    pub fn release_vision_sessions(&mut self) {
        let before = memory::available_mib();
        self.vision_encoder = None;
        self.vision_projection = None;
        match (before, memory::available_mib()) {
            (Some(before), Some(after)) => info!(
                "vision sessions freed: RAM {before} MiB -> {after} MiB (reclaimed {} MiB)",
                after.saturating_sub(before)
            ),
            _ => info!("vision encoder + projection sessions freed"),
        }
    }

    /// Reload any vision session released during a previous inference. The
    /// LLM sessions and tokenizer persist unchanged.
    pub fn reset_inference_state(&mut self) -> Result<()> {
        if self.vision_encoder.is_none() {
            self.vision_encoder = Some(
                self.vision_profile
                    .load(&self.model_dir.join(VISION_ENCODER_FILE))?,
            );
            info!("vision encoder reloaded");
        }
        if self.vision_projection.is_none() {
            self.vision_projection = Some(
                self.vision_profile
                    .load(&self.model_dir.join(VISION_PROJECTION_FILE))?,
            );
            info!("vision projection reloaded");
        }
        Ok(())
    }
}

/// Resolve the image-placeholder id by tokenizing the literal `"<image>"`
/// and taking the first id that is not BOS. The id is vocabulary-dependent,
/// so it is never hardcoded; the known MedGemma value only serves as the
/// fallback when discovery fails.
fn discover_image_token(tokenizer: &Tokenizer) -> i64 {
    let discovered = tokenizer
        .encode("<image>", false)
        .ok()
        .and_then(|encoding| {
            let ids: Vec<i64> = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
            info!("<image> tokenizes to {} token(s): {ids:?}", ids.len());
            ids.into_iter().find(|&id| id != BOS_TOKEN_ID)
        });
    match discovered {
        Some(id) => id,
        None => {
            warn!("<image> token discovery failed, using fallback id {FALLBACK_IMAGE_TOKEN_ID}");
            FALLBACK_IMAGE_TOKEN_ID
        }
    }
}
