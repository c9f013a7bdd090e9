//! Constants fixed by the MedGemma-4B int4 export this runtime drives.

/// Square side length the vision encoder expects, in pixels.
pub const IMAGE_SIZE: usize = 896;

/// Number of visual patch rows the projection head emits per image.
pub const NUM_PATCHES: usize = 256;

/// Width of every embedding row (text and visual) fed to the decoder.
pub const EMBED_DIM: usize = 2560;

/// KV heads per decoder layer.
pub const KV_HEADS: usize = 4;

/// Per-head dimension of the KV cache tensors.
pub const HEAD_DIM: usize = 256;

/// Number of decoder layers, each contributing one key/value tensor pair.
pub const DECODER_LAYERS: usize = 34;

/// Beginning-of-sequence token id in the Gemma vocabulary.
pub const BOS_TOKEN_ID: i64 = 2;

/// Token ids that terminate generation.
pub const EOS_TOKEN_IDS: [i64; 2] = [1, 106];

/// Image-placeholder id used when tokenizer discovery fails.
pub const FALLBACK_IMAGE_TOKEN_ID: i64 = 255999;

/// Default nucleus mass for top-p sampling.
pub const DEFAULT_TOP_P: f32 = 0.75;

/// Default softmax temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.29;

/// Default repetition penalty applied over the recent-token window.
pub const DEFAULT_REPETITION_PENALTY: f32 = 1.30;
