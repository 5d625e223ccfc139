use rayon::prelude::*;

/// Cosine distance in `[0, 2]`; a zero vector is treated as orthogonal to everything.
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

/// Exact k-nearest-neighbour ranking. Returns `(candidate index, distance)` ascending.
pub fn rank_nearest(query: &[f32], candidates: &[Vec<f32>], k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = candidates
        .par_iter()
        .enumerate()
        .filter(|(_, vector)| vector.len() == query.len())
        .map(|(i, vector)| (i, cosine_distance(query, vector)))
        .collect();

    scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_vectors_have_zero_distance() {
        let v = vec![0.3, 0.4, 0.5];
        assert!(cosine_distance(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn test_orthogonal_and_opposite() {
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cosine_distance(&[], &[]), 1.0);
    }

    #[test]
    fn test_rank_nearest_orders_and_truncates() {
        let candidates = vec![
            vec![0.0, 1.0],
            vec![1.0, 0.1],
            vec![1.0, 0.0],
            vec![1.0, 0.0, 0.0],
        ];
        let ranked = rank_nearest(&[1.0, 0.0], &candidates, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, 2);
        assert_eq!(ranked[1].0, 1);
    }
}
