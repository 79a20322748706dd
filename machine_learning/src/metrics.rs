//! Batch quality metrics reported by the chief on every step.

use std::cmp::Ordering;

use ndarray::{ArrayView1, ArrayView2};

/// The amount of top predictions per example that take part in the GAP.
pub const GAP_TOP_K: usize = 20;

/// Fraction of examples whose highest scored class is a true positive.
pub fn hit_at_one(predictions: ArrayView2<f32>, actuals: ArrayView2<f32>) -> f32 {
    let rows = predictions.nrows();
    if rows == 0 {
        return 0.;
    }

    let hits: f32 = predictions
        .rows()
        .into_iter()
        .zip(actuals.rows())
        .map(|(pred, actual)| argmax(pred).map(|i| actual[i]).unwrap_or_default())
        .sum();

    hits / rows as f32
}

/// Precision at the recall level equal to the true label count, averaged over the examples.
pub fn precision_at_equal_recall(predictions: ArrayView2<f32>, actuals: ArrayView2<f32>) -> f32 {
    let rows = predictions.nrows();
    if rows == 0 {
        return 0.;
    }

    let total: f32 = predictions
        .rows()
        .into_iter()
        .zip(actuals.rows())
        .map(|(pred, actual)| {
            let positives = actual.sum().round() as usize;
            if positives == 0 {
                return 0.;
            }

            let hits: f32 = top_k(pred, positives)
                .into_iter()
                .filter(|&i| pred[i] > 0.)
                .map(|i| actual[i])
                .sum();

            hits / positives as f32
        })
        .sum();

    total / rows as f32
}

/// Global average precision over the top `GAP_TOP_K` predictions of every example.
pub fn global_average_precision(predictions: ArrayView2<f32>, actuals: ArrayView2<f32>) -> f32 {
    let positives: f32 = actuals.sum();
    if positives <= 0. {
        return 0.;
    }

    let mut ranked: Vec<(f32, f32)> = predictions
        .rows()
        .into_iter()
        .zip(actuals.rows())
        .flat_map(|(pred, actual)| {
            top_k(pred, GAP_TOP_K)
                .into_iter()
                .map(move |i| (pred[i], actual[i]))
        })
        .collect();

    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

    let mut hits = 0.;
    let mut ap = 0.;
    for (i, &(_, actual)) in ranked.iter().enumerate() {
        if actual > 0. {
            hits += 1.;
            ap += hits / (i + 1) as f32;
        }
    }

    ap / positives
}

fn argmax(row: ArrayView1<f32>) -> Option<usize> {
    row.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

/// The indices of the `k` largest values of `row`, highest first.
fn top_k(row: ArrayView1<f32>, k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..row.len()).collect();
    indices.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
    indices.truncate(k);
    indices
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn hit_at_one_counts_top_predictions() {
        let pred = array![[0.9, 0.1, 0.0], [0.2, 0.7, 0.1], [0.3, 0.3, 0.4]];
        let actual = array![[1., 0., 0.], [1., 0., 0.], [0., 0., 1.]];

        let hit = hit_at_one(pred.view(), actual.view());
        assert!((hit - 2. / 3.).abs() < 1e-6);
    }

    #[test]
    fn perr_uses_the_label_count_as_cutoff() {
        let pred = array![[0.9, 0.8, 0.1, 0.0], [0.1, 0.2, 0.3, 0.4]];
        let actual = array![[1., 0., 1., 0.], [0., 0., 0., 0.]];

        // First row: top 2 are {0, 1}, one hit out of two. Second row has no labels.
        let perr = precision_at_equal_recall(pred.view(), actual.view());
        assert!((perr - 0.25).abs() < 1e-6);
    }

    #[test]
    fn gap_of_a_perfect_ranking_is_one() {
        let pred = array![[0.9, 0.1, 0.8], [0.2, 0.7, 0.1]];
        let actual = array![[1., 0., 1.], [0., 1., 0.]];

        let gap = global_average_precision(pred.view(), actual.view());
        assert!((gap - 1.).abs() < 1e-6);
    }

    #[test]
    fn gap_penalizes_late_positives() {
        let pred = array![[0.9, 0.5]];
        let actual = array![[0., 1.]];

        let gap = global_average_precision(pred.view(), actual.view());
        assert!((gap - 0.5).abs() < 1e-6);
    }

    #[test]
    fn empty_batches_score_zero() {
        let empty = ndarray::Array2::<f32>::zeros((0, 3));
        assert_eq!(hit_at_one(empty.view(), empty.view()), 0.);
        assert_eq!(global_average_precision(empty.view(), empty.view()), 0.);
    }
}
