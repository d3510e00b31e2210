//! semantic agreement scoring
//!
//! each accepted response is scored by how well its tokens are covered by the
//! tokens of every other response (late-interaction maxsim). the response the
//! rest of the quorum agrees with most wins; equal scores go to the lowest
//! address so the outcome never depends on arrival order.

use std::cmp::Ordering;

use quorum_primitives::Address;

use crate::embedding::TokenVectors;

/// cosine similarity; 0 for mismatched lengths or zero vectors
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// sum over query tokens of the best cosine against any document token
pub fn max_similarity(query: &[Vec<f32>], docs: &[&[Vec<f32>]]) -> f32 {
    query
        .iter()
        .map(|q| {
            docs.iter()
                .flat_map(|d| d.iter())
                .map(|t| cosine(q, t))
                .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))))
                .unwrap_or(0.0)
        })
        .sum()
}

/// one verified response ready for scoring
#[derive(Debug, Clone)]
pub struct Candidate {
    pub address: Address,
    pub text: String,
    pub embedding: TokenVectors,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// index into the candidate slice
    pub index: usize,
    pub address: Address,
    pub score: f32,
}

fn score_order(a: f32, b: f32) -> Ordering {
    let clean = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    clean(a).total_cmp(&clean(b))
}

/// score every candidate against the others and pick the winner
pub fn select(candidates: &[Candidate]) -> Option<Selection> {
    let scores: Vec<f32> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let others: Vec<&[Vec<f32>]> = candidates
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, o)| o.embedding.as_slice())
                .collect();
            max_similarity(&c.embedding, &others)
        })
        .collect();

    candidates
        .iter()
        .enumerate()
        .max_by(|(i, a), (j, b)| {
            score_order(scores[*i], scores[*j]).then_with(|| b.address.cmp(&a.address))
        })
        .map(|(index, c)| Selection {
            index,
            address: c.address,
            score: scores[index],
        })
}
