use std::cmp::Ordering;

use anyhow::{Result, ensure};

use crate::constants::{DEFAULT_REPETITION_PENALTY, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};

/// Logit assigned to masked-out vocabulary ids.
const SUPPRESSED_LOGIT: f32 = -1e9;

/// Temperatures below this short-circuit to greedy argmax.
const GREEDY_TEMPERATURE: f32 = 0.01;

/// Knobs for next-token selection.
#[derive(Debug, Clone, Copy)]
pub struct SamplingOptions {
    pub top_p: f32,
    pub temperature: f32,
    pub repetition_penalty: f32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            top_p: DEFAULT_TOP_P,
            temperature: DEFAULT_TEMPERATURE,
            repetition_penalty: DEFAULT_REPETITION_PENALTY,
        }
    }
}

/// Select the next token id from a raw logit vector.
///
/// Applied in order: foreign-token suppression, repetition penalty over the
/// recent-id window, greedy short-circuit for near-zero temperatures, then
/// temperature softmax with nucleus selection. Selection is deterministic:
/// within the nucleus the highest-probability id (the first to push the
/// cumulative mass across `top_p`) wins.
pub fn select_token(
    logits: &[f32],
    options: &SamplingOptions,
    recent_ids: &[i64],
    foreign_mask: Option<&[bool]>,
) -> Result<i64> {
    ensure!(!logits.is_empty(), "logits vector is empty");

    let mut penalized = logits.to_vec();

    if let Some(mask) = foreign_mask {
        for (logit, &blocked) in penalized.iter_mut().zip(mask.iter()) {
            if blocked {
                *logit = SUPPRESSED_LOGIT;
            }
        }
    }

    if options.repetition_penalty > 1.0 {
        for &id in recent_ids {
            if id >= 0 && (id as usize) < penalized.len() {
                let entry = &mut penalized[id as usize];
                if *entry > 0.0 {
                    *entry /= options.repetition_penalty;
                } else {
                    *entry *= options.repetition_penalty;
                }
            }
        }
    }

    if options.temperature < GREEDY_TEMPERATURE {
        return Ok(argmax(&penalized) as i64);
    }

    let max_logit = penalized.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<(f32, usize)> = penalized
        .iter()
        .enumerate()
        .map(|(id, &logit)| (((logit - max_logit) / options.temperature).exp(), id))
        .collect();
    let total: f32 = probs.iter().map(|(weight, _)| weight).sum();
    ensure!(
        total > 0.0 && total.is_finite(),
        "softmax normalization degenerate (sum={total})"
    );
    for entry in &mut probs {
        entry.0 /= total;
    }
    probs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut cumulative = 0.0f32;
    for &(probability, id) in &probs {
        cumulative += probability;
        if cumulative >= options.top_p {
            return Ok(id as i64);
        }
    }
    Ok(probs[0].1 as i64)
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(id, _)| id)
        .expect("argmax over non-empty slice")
}
