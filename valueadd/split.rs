use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SplitError {
    #[error("test_fraction must lie strictly between 0 and 1, got {0}")]
    InvalidTestFraction(f64),
    #[error(
        "A test fraction of {test_fraction} over {rows} rows leaves an empty train or test partition."
    )]
    EmptyPartition { rows: usize, test_fraction: f64 },
}

/// A deterministic train/test partition of `0..rows`.
///
/// The partition depends only on `(rows, test_fraction, seed)`, so the encoder
/// and the fitter can each rebuild it and agree on which rows are held out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainTestSplit {
    /// Training row indices, ascending.
    pub train: Vec<usize>,
    /// Held-out row indices, ascending.
    pub test: Vec<usize>,
}

impl TrainTestSplit {
    pub fn new(rows: usize, test_fraction: f64, seed: u64) -> Result<Self, SplitError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(SplitError::InvalidTestFraction(test_fraction));
        }

        let test_count = test_count(rows, test_fraction);
        if test_count == 0 || test_count >= rows {
            return Err(SplitError::EmptyPartition {
                rows,
                test_fraction,
            });
        }

        let mut order: Vec<usize> = (0..rows).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);

        let mut test = order[..test_count].to_vec();
        let mut train = order[test_count..].to_vec();
        test.sort_unstable();
        train.sort_unstable();

        log::debug!(
            "Split {} rows into {} train / {} test (seed {})",
            rows,
            train.len(),
            test.len(),
            seed
        );

        Ok(Self { train, test })
    }

    pub fn rows(&self) -> usize {
        self.train.len() + self.test.len()
    }
}

/// Held-out row count: `ceil(rows * test_fraction)`.
fn test_count(rows: usize, test_fraction: f64) -> usize {
    // Guard against 0.2 * 100 landing a hair above 20.
    ((rows as f64) * test_fraction - 1e-9).ceil().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eighty_twenty_split_of_one_hundred() {
        let split = TrainTestSplit::new(100, 0.2, 42).unwrap();
        assert_eq!(split.train.len(), 80);
        assert_eq!(split.test.len(), 20);
        assert_eq!(split.rows(), 100);
    }

    #[test]
    fn test_partitions_are_disjoint_and_complete() {
        let split = TrainTestSplit::new(37, 0.3, 7).unwrap();
        let mut all: Vec<usize> = split.train.iter().chain(split.test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..37).collect::<Vec<_>>());
        assert_eq!(split.test.len(), 12);
    }

    #[test]
    fn test_same_seed_same_split() {
        let a = TrainTestSplit::new(500, 0.2, 1234).unwrap();
        let b = TrainTestSplit::new(500, 0.2, 1234).unwrap();
        assert_eq!(a, b);

        let c = TrainTestSplit::new(500, 0.2, 4321).unwrap();
        assert_ne!(a.test, c.test);
    }

    #[test]
    fn test_rejects_fraction_outside_unit_interval() {
        assert_eq!(
            TrainTestSplit::new(10, 0.0, 0).unwrap_err(),
            SplitError::InvalidTestFraction(0.0)
        );
        assert!(matches!(
            TrainTestSplit::new(10, 1.0, 0),
            Err(SplitError::InvalidTestFraction(_))
        ));
        assert!(matches!(
            TrainTestSplit::new(10, f64::NAN, 0),
            Err(SplitError::InvalidTestFraction(_))
        ));
    }

    #[test]
    fn test_rejects_split_leaving_no_training_rows() {
        assert!(matches!(
            TrainTestSplit::new(1, 0.5, 0),
            Err(SplitError::EmptyPartition { rows: 1, .. })
        ));
    }
}
