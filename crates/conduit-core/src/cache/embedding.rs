//! Local embedding model for the semantic tier.
//!
//! The model is loaded at most once per process and kept for its lifetime.
//! Inference is CPU-bound, so callers go through `spawn_blocking` instead
//! of stalling the request executor.

use std::sync::{Mutex, OnceLock};

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

static MODEL: OnceLock<Mutex<TextEmbedding>> = OnceLock::new();

pub const EMBEDDING_DIMENSIONS: usize = 384;

fn resolve_model(name: &str) -> EmbeddingModel {
    match name {
        "BAAI/bge-small-en-v1.5" | "" => EmbeddingModel::BGESmallENV15,
        "sentence-transformers/all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
        other => {
            tracing::warn!(
                model = other,
                "unknown embedding model, using BAAI/bge-small-en-v1.5"
            );
            EmbeddingModel::BGESmallENV15
        }
    }
}

/// Embed one normalized prompt to a 384-dim vector.
pub async fn embed_text(model_name: &str, text: String) -> Result<Vec<f32>, String> {
    let model_name = model_name.to_string();
    tokio::task::spawn_blocking(move || {
        if MODEL.get().is_none() {
            tracing::info!(model = %model_name, "loading embedding model");
            let model = TextEmbedding::try_new(
                InitOptions::new(resolve_model(&model_name)).with_show_download_progress(false),
            )
            .map_err(|err| err.to_string())?;
            // A racing initializer may have won; its model is equivalent.
            let _ = MODEL.set(Mutex::new(model));
        }

        let model = MODEL.get().ok_or("embedding model unavailable")?;
        let mut guard = model
            .lock()
            .map_err(|_| "embedding model lock poisoned".to_string())?;
        let mut vectors = guard
            .embed(vec![text], None)
            .map_err(|err| err.to_string())?;
        vectors
            .pop()
            .ok_or_else(|| "embedding model returned no vector".to_string())
    })
    .await
    .map_err(|err| err.to_string())?
}

/// Cosine distance (`1 - similarity`); mismatched or zero vectors are
/// treated as maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_zero_distance() {
        let v = vec![0.5f32, -0.25, 0.1];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_are_distant() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn opposite_vectors_hit_max_distance() {
        let a = vec![1.0f32, 0.0];
        let b = vec![-1.0f32, 0.0];
        assert!((cosine_distance(&a, &b) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn degenerate_inputs_are_distant() {
        assert_eq!(cosine_distance(&[1.0], &[1.0, 2.0]), 1.0);
        assert_eq!(cosine_distance(&[], &[]), 1.0);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 1.0]), 1.0);
    }
}
