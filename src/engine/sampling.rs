//! Token sampling over final-position logits.
//!
//! Softmax, nucleus (top-p) truncation, and categorical draws implemented
//! host-side; backends only have to produce logits.

use rand::Rng;

/// Temperatures outside (0, 100), including NaN and infinities, fall
/// back to 1.0 rather than corrupting the logit scale.
pub fn sanitize_temperature(temperature: f32) -> f32 {
    if temperature.is_finite() && temperature > 0.0 && temperature < 100.0 {
        temperature
    } else {
        1.0
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        // Degenerate logits: fall back to uniform.
        let uniform = 1.0 / logits.len() as f32;
        return vec![uniform; logits.len()];
    }
    exps.iter().map(|&e| e / sum).collect()
}

/// Indices sorted by descending value.
pub fn argsort_desc(values: &[f32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| {
        values[b]
            .partial_cmp(&values[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indices
}

/// Running cumulative sum.
pub fn cumsum(values: &[f32]) -> Vec<f32> {
    let mut total = 0.0f32;
    values
        .iter()
        .map(|&v| {
            total += v;
            total
        })
        .collect()
}

/// Draw one index from a probability distribution.
pub fn sample_categorical<R: Rng>(rng: &mut R, probs: &[f32]) -> usize {
    if probs.is_empty() {
        return 0;
    }
    let total: f32 = probs.iter().sum();
    if total <= 0.0 || !total.is_finite() {
        return 0;
    }
    let mut target = rng.gen::<f32>() * total;
    for (i, &p) in probs.iter().enumerate() {
        target -= p;
        if target <= 0.0 {
            return i;
        }
    }
    probs.len() - 1
}

/// Greedy argmax over raw logits.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = i;
        }
    }
    best
}

/// Nucleus sampling: restrict to the smallest descending-probability
/// prefix whose cumulative mass reaches `top_p`, renormalize, sample.
pub fn sample_top_p<R: Rng>(rng: &mut R, logits: &[f32], top_p: f32) -> usize {
    let probs = softmax(logits);
    let order = argsort_desc(&probs);
    let sorted: Vec<f32> = order.iter().map(|&i| probs[i]).collect();
    let cumulative = cumsum(&sorted);

    let cutoff = cumulative
        .iter()
        .position(|&c| c >= top_p)
        .unwrap_or(cumulative.len().saturating_sub(1));

    let kept = &sorted[..=cutoff];
    let picked = sample_categorical(rng, kept);
    order[picked]
}

/// Sample one token id: temperature scaling, then top-p when `top_p < 1`,
/// else plain categorical. `temperature == 0` is greedy argmax.
pub fn sample_token<R: Rng>(rng: &mut R, logits: &[f32], temperature: f32, top_p: f32) -> u32 {
    if temperature == 0.0 {
        return argmax(logits) as u32;
    }
    let temp = sanitize_temperature(temperature);
    let scaled: Vec<f32> = logits.iter().map(|&l| l / temp.max(1e-8)).collect();

    let index = if top_p < 1.0 {
        sample_top_p(rng, &scaled, top_p)
    } else {
        let probs = softmax(&scaled);
        sample_categorical(rng, &probs)
    };
    index as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_sanitize_temperature() {
        assert_eq!(sanitize_temperature(0.7), 0.7);
        assert_eq!(sanitize_temperature(-1.0), 1.0);
        assert_eq!(sanitize_temperature(0.0), 1.0);
        assert_eq!(sanitize_temperature(f32::NAN), 1.0);
        assert_eq!(sanitize_temperature(f32::INFINITY), 1.0);
        assert_eq!(sanitize_temperature(250.0), 1.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, 4.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[3] > probs[0]);
    }

    #[test]
    fn test_argsort_desc() {
        assert_eq!(argsort_desc(&[0.1, 0.7, 0.2]), vec![1, 2, 0]);
    }

    #[test]
    fn test_cumsum() {
        assert_eq!(cumsum(&[0.5, 0.3, 0.2]), vec![0.5, 0.8, 1.0]);
    }

    #[test]
    fn test_argmax_greedy() {
        let logits = [0.0, 9.5, 3.0, -2.0];
        assert_eq!(argmax(&logits), 1);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(sample_token(&mut rng, &logits, 0.0, 1.0), 1);
    }

    #[test]
    fn test_top_p_excludes_tail() {
        // One token carries 99% of the mass; with top_p = 0.5 only that
        // token can be drawn.
        let mut logits = vec![0.0f32; 16];
        logits[5] = 20.0;
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            assert_eq!(sample_top_p(&mut rng, &logits, 0.5), 5);
        }
    }

    #[test]
    fn test_categorical_respects_distribution() {
        let mut rng = StdRng::seed_from_u64(1);
        let probs = [0.0, 0.0, 1.0, 0.0];
        for _ in 0..20 {
            assert_eq!(sample_categorical(&mut rng, &probs), 2);
        }
    }

    #[test]
    fn test_sample_token_in_vocab_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let logits: Vec<f32> = (0..32).map(|i| (i % 7) as f32 * 0.3).collect();
        for _ in 0..100 {
            let token = sample_token(&mut rng, &logits, 0.8, 0.9);
            assert!((token as usize) < logits.len());
        }
    }
}
