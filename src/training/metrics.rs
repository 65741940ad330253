//! Classification metrics computed from a confusion matrix.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

/// Top-1 accuracy, macro-averaged precision/recall/F1, and a per-class
/// report, in the order the classes were trained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// `confusion[actual][predicted]` counts.
pub fn report_from_confusion(class_names: &[String], confusion: &[Vec<u64>]) -> EvaluationReport {
    let n = class_names.len();
    debug_assert_eq!(confusion.len(), n);

    let mut total = 0u64;
    let mut correct = 0u64;
    let mut per_class = Vec::with_capacity(n);

    for class_index in 0..n {
        let tp = confusion[class_index][class_index];
        let support: u64 = confusion[class_index].iter().sum();
        let predicted: u64 = confusion.iter().map(|row| row[class_index]).sum();

        let precision = ratio(tp, predicted);
        let recall = ratio(tp, support);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        total += support;
        correct += tp;
        per_class.push(ClassMetrics {
            class: class_names[class_index].clone(),
            precision,
            recall,
            f1,
            support,
        });
    }

    let macro_precision = per_class.iter().map(|m| m.precision).sum::<f64>() / n.max(1) as f64;
    let macro_recall = per_class.iter().map(|m| m.recall).sum::<f64>() / n.max(1) as f64;
    let macro_f1 = per_class.iter().map(|m| m.f1).sum::<f64>() / n.max(1) as f64;

    EvaluationReport {
        accuracy: ratio(correct, total),
        macro_precision,
        macro_recall,
        macro_f1,
        per_class,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn perfect_predictions_score_one() {
        let report = report_from_confusion(
            &names(&["cat", "dog"]),
            &[vec![10, 0], vec![0, 10]],
        );
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.macro_precision, 1.0);
        assert_eq!(report.macro_recall, 1.0);
        assert_eq!(report.macro_f1, 1.0);
    }

    #[test]
    fn mixed_predictions_average_per_class() {
        // cat: tp=8 fn=2; dog: tp=6 fn=4 (all misses go to the other class)
        let report = report_from_confusion(
            &names(&["cat", "dog"]),
            &[vec![8, 2], vec![4, 6]],
        );
        assert!((report.accuracy - 0.7).abs() < 1e-9);
        assert!((report.per_class[0].recall - 0.8).abs() < 1e-9);
        assert!((report.per_class[1].recall - 0.6).abs() < 1e-9);
        assert!((report.per_class[0].precision - 8.0 / 12.0).abs() < 1e-9);
        assert!((report.per_class[1].precision - 6.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn absent_class_gets_zero_scores_not_nan() {
        let report = report_from_confusion(
            &names(&["cat", "dog", "bird"]),
            &[vec![5, 0, 0], vec![0, 5, 0], vec![0, 0, 0]],
        );
        let bird = &report.per_class[2];
        assert_eq!(bird.support, 0);
        assert_eq!(bird.precision, 0.0);
        assert_eq!(bird.recall, 0.0);
        assert_eq!(bird.f1, 0.0);
        assert!(report.macro_f1.is_finite());
    }
}
