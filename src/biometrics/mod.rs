//! Host-side faceprint handling: vector math, storage and best-match selection

pub mod selector;
pub mod store;

pub use selector::{MatchDecision, MatchPolicy, MatchSelector};
pub use store::{LocalFileStore, StoreError, StoredTemplate, VectorStore};

use crate::device::NUM_RECOGNITION_FEATURES;

/// Compute cosine similarity between two vectors (0.0 on length mismatch or zero norm)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Normalize a vector to unit length
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Search vector of a descriptor: its leading recognition features
pub fn recognition_vector(descriptor: &[i16]) -> Vec<f32> {
    descriptor
        .iter()
        .take(NUM_RECOGNITION_FEATURES)
        .map(|&v| v as f32)
        .collect()
}
