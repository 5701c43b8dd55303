use ndarray::ArrayView1;

/// Goodness of fit on the held-out partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {
    /// Coefficient of determination on the test partition.
    pub r2: f64,
    pub mae: f64,
    pub rmse: f64,
    pub train_count: usize,
    pub test_count: usize,
    /// In-sample R², `None` when the training targets are constant.
    pub train_r2: Option<f64>,
}

/// `1 - SS_res / SS_tot`, or `None` when the actual values have zero variance.
pub fn r_squared(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> Option<f64> {
    assert_eq!(actual.len(), predicted.len(), "length mismatch in r_squared");
    if actual.is_empty() {
        return None;
    }
    let mean = actual.sum() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean) * (a - mean)).sum();
    if ss_tot <= 0.0 {
        return None;
    }
    let ss_res: f64 = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    Some(1.0 - ss_res / ss_tot)
}

pub fn mean_absolute_error(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    assert_eq!(actual.len(), predicted.len(), "length mismatch in mean_absolute_error");
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

pub fn root_mean_squared_error(actual: ArrayView1<f64>, predicted: ArrayView1<f64>) -> f64 {
    assert_eq!(actual.len(), predicted.len(), "length mismatch in root_mean_squared_error");
    if actual.is_empty() {
        return 0.0;
    }
    let mse = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p) * (a - p))
        .sum::<f64>()
        / actual.len() as f64;
    mse.sqrt()
}
