//! Session construction profiles and the thin seam over the ONNX runtime.
//!
//! Everything that touches runtime tensors funnels through here so the rest
//! of the crate deals in plain `Vec<f32>` / `Vec<i64>` buffers and owned
//! [`DynValue`]s.

use std::{borrow::Cow, path::Path};

use anyhow::{Context, Result, ensure};
use ort::{
    memory::AllocatorType,
    session::{Session, SessionInputValue, builder::GraphOptimizationLevel},
    value::{DynValue, Tensor},
};
use tracing::info;

/// A named, owned input for a session run.
pub type NamedInput = (Cow<'static, str>, SessionInputValue<'static>);

/// Option set applied when building a session.
///
/// Both profiles disable the memory pattern and the per-op CPU arena and run
/// sequentially with basic graph optimization and mmap'd weights. The int4
/// LLM graphs additionally pin intra- and inter-op parallelism to one
/// thread: their weights dequantize to fp32 during compute, and parallel
/// threads dequantizing several layers at once spike peak RAM.
#[derive(Debug, Clone, Copy)]
pub struct SessionProfile {
    pub intra_threads: usize,
    pub inter_threads: usize,
}

impl SessionProfile {
    /// Profile for the token-embedding and decoder sessions.
    pub fn llm() -> Self {
        Self {
            intra_threads: 1,
            inter_threads: 1,
        }
    }

    /// Profile for the vision encoder and projection sessions.
    pub fn vision() -> Self {
        Self {
            intra_threads: 2,
            inter_threads: 1,
        }
    }

    /// Build a session for the graph at `path` with this profile.
    pub fn load(&self, path: &Path) -> Result<Session> {
        info!("loading session: {}", path.display());
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_intra_threads(self.intra_threads)?
            .with_inter_threads(self.inter_threads)?
            .with_parallel_execution(false)?
            .with_memory_pattern(false)?
            .with_allocator(AllocatorType::Device)?
            .with_config_entry("session.use_mmap", "1")?
            .commit_from_file(path)
            .with_context(|| format!("failed to load session {}", path.display()))
    }
}

/// Wrap an owned f32 buffer as a runtime tensor value.
pub fn f32_value(shape: Vec<usize>, data: Vec<f32>) -> Result<DynValue> {
    Ok(Tensor::from_array((shape, data))?.into_dyn())
}

/// Wrap an owned i64 buffer as a runtime tensor value.
pub fn i64_value(shape: Vec<usize>, data: Vec<i64>) -> Result<DynValue> {
    Ok(Tensor::from_array((shape, data))?.into_dyn())
}

/// All-ones attention mask of shape `1 x len`.
pub fn ones_mask(len: usize) -> Result<DynValue> {
    i64_value(vec![1, len], vec![1i64; len])
}

/// Pair a name with an owned value for [`run`].
pub fn named(name: impl Into<Cow<'static, str>>, value: DynValue) -> NamedInput {
    (name.into(), SessionInputValue::from(value))
}

/// Run `session` and hand back the requested outputs, owned, in the order of
/// `output_names`. Outputs not listed are dropped with the run result.
pub fn run(
    session: &mut Session,
    inputs: Vec<NamedInput>,
    output_names: &[String],
) -> Result<Vec<DynValue>> {
    let mut outputs = session.run(inputs)?;
    output_names
        .iter()
        .map(|name| {
            outputs
                .remove(name.as_str())
                .with_context(|| format!("session output `{name}` missing"))
        })
        .collect()
}

/// Copy the full contents of an f32 tensor value out of runtime ownership.
pub fn copy_f32(value: &DynValue) -> Result<Vec<f32>> {
    let (_, data) = value.try_extract_tensor::<f32>()?;
    Ok(data.to_vec())
}

/// Copy the final-position row of a `.. x vocab` f32 tensor (the logits of
/// the last processed position).
pub fn copy_last_row(value: &DynValue) -> Result<Vec<f32>> {
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    let width = shape
        .last()
        .copied()
        .context("logits tensor has no dimensions")? as usize;
    ensure!(
        width > 0 && data.len() >= width,
        "logits tensor too small: {} elements, row width {width}",
        data.len()
    );
    Ok(data[data.len() - width..].to_vec())
}
