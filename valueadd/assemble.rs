//! # Dataset Assembly
//!
//! Entry point for tabular input. The requested target, covariate, entity and
//! label columns are validated against the table's column set before any row
//! is read, then every row is either accepted as an `Observation` or counted
//! in the `DropReport`. Nothing is dropped without being accounted for:
//! `observations.len() + dropped.total` always equals the table height.
//!
//! A table may already hold one row per school. Its optional sample-count
//! column then gives the number of students behind each row, and the
//! ranker weights school aggregates by it.
//!
//! There is no fallback column lookup. A requested name must match a column
//! exactly, otherwise assembly fails with `ColumnNotFound`.

use crate::types::{CovariateKind, CovariateSchema, CovariateValue, Observation, ObservationSet};
use itertools::Itertools;
use polars::prelude::*;
use std::collections::HashSet;
use thiserror::Error;

/// The columns a run reads from the input table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSelection {
    pub target: String,
    pub covariates: CovariateSchema,
    /// Ranking key. At school aggregation this is the school identifier.
    pub entity: String,
    pub label: Option<String>,
    /// Students represented by each row. Without it every row counts as one.
    pub sample_count: Option<String>,
}

/// Per-reason accounting of rows excluded from the fit-eligible set.
///
/// A row failing several checks is attributed to the first one in the order
/// target, covariates (schema order), entity, sample count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropReport {
    pub total: usize,
    pub missing_target: usize,
    /// One entry per covariate, in schema order.
    pub missing_covariate: Vec<(String, usize)>,
    pub missing_entity: usize,
    /// Rows whose sample count is missing, fractional or below one.
    pub invalid_sample_count: usize,
}

#[derive(Debug, Clone)]
pub struct Assembled {
    pub observations: ObservationSet,
    pub dropped: DropReport,
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error(
        "The requested column '{0}' was not found in the input table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("The column '{0}' is requested in more than one role.")]
    DuplicateColumn(String),
    #[error(
        "Only {found} usable rows remain after excluding {dropped} incomplete rows, but at least {required} are required for a meaningful regression."
    )]
    InsufficientData {
        found: usize,
        required: usize,
        dropped: usize,
    },
}

/// Selects, validates and filters the rows used by a value-added run.
pub fn assemble(
    table: &DataFrame,
    selection: &ColumnSelection,
    min_rows: usize,
) -> Result<Assembled, AssemblyError> {
    internal::check_columns(table, selection)?;

    let height = table.height();
    log::info!(
        "Assembling {} rows: target '{}', {} covariates, entity '{}'",
        height,
        selection.target,
        selection.covariates.len(),
        selection.entity
    );

    let target = internal::numeric_column(table, &selection.target)?;
    let covariates = selection
        .covariates
        .iter()
        .map(|c| match c.kind {
            CovariateKind::Continuous => {
                internal::numeric_column(table, &c.name).map(internal::ColumnValues::Numeric)
            }
            CovariateKind::Categorical => {
                internal::text_column(table, &c.name).map(internal::ColumnValues::Text)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    let entity = internal::text_column(table, &selection.entity)?;
    let label = match &selection.label {
        Some(name) => Some(internal::text_column(table, name)?),
        None => None,
    };
    let counts = match &selection.sample_count {
        Some(name) => Some(internal::numeric_column(table, name)?),
        None => None,
    };

    let mut dropped = DropReport {
        missing_covariate: selection
            .covariates
            .iter()
            .map(|c| (c.name.clone(), 0))
            .collect(),
        ..DropReport::default()
    };
    let mut observations = Vec::with_capacity(height);

    'rows: for row in 0..height {
        let Some(target_score) = target[row].filter(|v| v.is_finite()) else {
            dropped.missing_target += 1;
            dropped.total += 1;
            continue;
        };

        let mut values = Vec::with_capacity(covariates.len());
        for (position, column) in covariates.iter().enumerate() {
            match column.value(row) {
                Some(value) => values.push(value),
                None => {
                    dropped.missing_covariate[position].1 += 1;
                    dropped.total += 1;
                    continue 'rows;
                }
            }
        }

        let entity_id = match entity[row].as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                dropped.missing_entity += 1;
                dropped.total += 1;
                continue;
            }
        };

        let sample_count = match &counts {
            Some(counts) => match counts[row].and_then(internal::whole_count) {
                Some(n) => n,
                None => {
                    dropped.invalid_sample_count += 1;
                    dropped.total += 1;
                    continue;
                }
            },
            None => 1,
        };

        let entity_label = label
            .as_ref()
            .and_then(|labels| labels[row].clone())
            .filter(|l| !l.trim().is_empty());

        observations.push(Observation {
            target_score,
            covariates: values,
            entity_id,
            entity_label,
            sample_count,
            row_index: row,
        });
    }

    if dropped.total > 0 {
        log::warn!(
            "Excluded {} of {} rows (missing target: {}, missing entity: {}, invalid sample count: {}, missing covariates: {})",
            dropped.total,
            height,
            dropped.missing_target,
            dropped.missing_entity,
            dropped.invalid_sample_count,
            dropped
                .missing_covariate
                .iter()
                .filter(|(_, n)| *n > 0)
                .map(|(name, n)| format!("{name}={n}"))
                .join(", ")
        );
    }

    if observations.len() < min_rows {
        return Err(AssemblyError::InsufficientData {
            found: observations.len(),
            required: min_rows,
            dropped: dropped.total,
        });
    }

    log::info!("{} observations are eligible for fitting", observations.len());

    Ok(Assembled {
        observations: ObservationSet::new(selection.covariates.clone(), observations),
        dropped,
    })
}

mod internal {
    use super::*;

    pub(super) enum ColumnValues {
        Numeric(Vec<Option<f64>>),
        Text(Vec<Option<String>>),
    }

    impl ColumnValues {
        pub(super) fn value(&self, row: usize) -> Option<CovariateValue> {
            match self {
                Self::Numeric(values) => values[row]
                    .filter(|v| v.is_finite())
                    .map(CovariateValue::Continuous),
                Self::Text(values) => values[row]
                    .as_deref()
                    .map(str::trim)
                    .filter(|level| !level.is_empty())
                    .map(|level| CovariateValue::Categorical(level.to_string())),
            }
        }
    }

    /// A student count must be a whole number of at least one.
    pub(super) fn whole_count(value: f64) -> Option<usize> {
        (value.is_finite() && value >= 1.0 && value.fract() == 0.0).then_some(value as usize)
    }

    /// Verifies every requested column exists and that no column plays two roles.
    pub(super) fn check_columns(
        table: &DataFrame,
        selection: &ColumnSelection,
    ) -> Result<(), AssemblyError> {
        let present: HashSet<String> = table
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        // Every role must name a distinct column, except that the label may repeat the entity.
        let mut roles: Vec<&str> = Vec::with_capacity(selection.covariates.len() + 3);
        roles.push(&selection.target);
        roles.extend(selection.covariates.names());
        roles.push(&selection.entity);
        if let Some(count) = &selection.sample_count {
            roles.push(count);
        }

        let label = selection.label.as_deref();
        for name in roles.iter().copied().chain(label) {
            if !present.contains(name) {
                return Err(AssemblyError::ColumnNotFound(name.to_string()));
            }
        }

        let mut seen = HashSet::with_capacity(roles.len());
        for name in roles.iter().copied() {
            if !seen.insert(name) {
                return Err(AssemblyError::DuplicateColumn(name.to_string()));
            }
        }
        if let Some(label) = label {
            if label != selection.entity && seen.contains(label) {
                return Err(AssemblyError::DuplicateColumn(label.to_string()));
            }
        }
        Ok(())
    }

    /// Reads a column as nullable `f64`. Cells that are present but not numeric
    /// make the whole column a type error rather than silently becoming nulls.
    pub(super) fn numeric_column(
        table: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<f64>>, AssemblyError> {
        let column = table.column(column_name)?;
        let wrong_type = || AssemblyError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        };

        let casted = column
            .cast(&DataType::Float64)
            .map_err(|_| wrong_type())?;
        if casted.null_count() > column.null_count() {
            return Err(wrong_type());
        }

        let chunked = casted.f64()?;
        Ok(chunked.into_iter().collect())
    }

    /// Reads a column as nullable text. Numeric codes are rendered as strings.
    pub(super) fn text_column(
        table: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<String>>, AssemblyError> {
        let column = table.column(column_name)?;
        let casted = column
            .cast(&DataType::String)
            .map_err(|_| AssemblyError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "text",
                found_type: format!("{:?}", column.dtype()),
            })?;

        let chunked = casted.str()?;
        Ok(chunked
            .into_iter()
            .map(|v| v.map(|s| s.to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Covariate;

    fn selection(target: &str) -> ColumnSelection {
        ColumnSelection {
            target: target.to_string(),
            covariates: CovariateSchema::new(vec![
                Covariate::categorical("estrato"),
                Covariate::continuous("inse"),
            ]),
            entity: "cole_cod".to_string(),
            label: Some("cole_nombre".to_string()),
            sample_count: None,
        }
    }

    fn table() -> DataFrame {
        df!(
            "punt_matematicas" => [Some(50.0), None, Some(61.0), Some(47.0), Some(55.0)],
            "estrato" => [Some("1"), Some("2"), None, Some("3"), Some("2")],
            "inse" => [Some(40.1), Some(52.3), Some(60.0), Some(f64::NAN), Some(48.2)],
            "cole_cod" => [Some("A"), Some("A"), Some("B"), Some("B"), None],
            "cole_nombre" => [Some("Colegio A"), Some("Colegio A"), Some("Colegio B"), Some("Colegio B"), Some("")]
        )
        .unwrap()
    }

    #[test]
    fn test_drop_accounting_covers_every_row() {
        let df = table();
        let assembled = assemble(&df, &selection("punt_matematicas"), 1).unwrap();

        assert_eq!(assembled.observations.len(), 1);
        assert_eq!(
            assembled.observations.len() + assembled.dropped.total,
            df.height()
        );
        assert_eq!(assembled.dropped.missing_target, 1);
        assert_eq!(
            assembled.dropped.missing_covariate,
            vec![("estrato".to_string(), 1), ("inse".to_string(), 1)]
        );
        assert_eq!(assembled.dropped.missing_entity, 1);

        let only = &assembled.observations.observations()[0];
        assert_eq!(only.entity_id, "A");
        assert_eq!(only.entity_label.as_deref(), Some("Colegio A"));
        assert_eq!(only.row_index, 0);
        assert_eq!(
            only.covariates,
            vec![
                CovariateValue::Categorical("1".to_string()),
                CovariateValue::Continuous(40.1)
            ]
        );
    }

    #[test]
    fn test_missing_target_column_is_schema_error() {
        let err = assemble(&table(), &selection("punt_global"), 1).unwrap_err();
        match err {
            AssemblyError::ColumnNotFound(col) => assert_eq!(col, "punt_global"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_covariate_column_is_schema_error() {
        let mut sel = selection("punt_matematicas");
        sel.covariates = CovariateSchema::new(vec![Covariate::categorical("FAMI_ESTRATOVIVIENDA")]);
        let err = assemble(&table(), &sel, 1).unwrap_err();
        assert!(matches!(err, AssemblyError::ColumnNotFound(c) if c == "FAMI_ESTRATOVIVIENDA"));
    }

    #[test]
    fn test_non_numeric_target_is_wrong_type() {
        let df = df!(
            "score" => ["alto", "bajo"],
            "estrato" => ["1", "2"],
            "inse" => [1.0, 2.0],
            "cole_cod" => ["A", "B"],
            "cole_nombre" => ["a", "b"]
        )
        .unwrap();
        let err = assemble(&df, &selection("score"), 1).unwrap_err();
        match err {
            AssemblyError::ColumnWrongType {
                column_name,
                expected_type,
                ..
            } => {
                assert_eq!(column_name, "score");
                assert_eq!(expected_type, "f64 (numeric)");
            }
            other => panic!("Expected ColumnWrongType, got {other:?}"),
        }
    }

    #[test]
    fn test_numeric_codes_become_categorical_levels() {
        let df = df!(
            "score" => [10.0, 20.0],
            "estrato" => [1i64, 2],
            "inse" => [1.0, 2.0],
            "cole_cod" => [101i64, 102],
            "cole_nombre" => ["a", "b"]
        )
        .unwrap();
        let assembled = assemble(&df, &selection("score"), 2).unwrap();
        let first = &assembled.observations.observations()[0];
        assert_eq!(first.entity_id, "101");
        assert_eq!(first.covariates[0], CovariateValue::Categorical("1".to_string()));
    }

    #[test]
    fn test_insufficient_rows_reports_dropped_count() {
        let err = assemble(&table(), &selection("punt_matematicas"), 30).unwrap_err();
        match err {
            AssemblyError::InsufficientData {
                found,
                required,
                dropped,
            } => {
                assert_eq!(found, 1);
                assert_eq!(required, 30);
                assert_eq!(dropped, 4);
            }
            other => panic!("Expected InsufficientData, got {other:?}"),
        }
    }

    #[test]
    fn test_target_listed_as_covariate_is_rejected() {
        let mut sel = selection("inse");
        sel.label = None;
        let err = assemble(&table(), &sel, 1).unwrap_err();
        assert!(matches!(err, AssemblyError::DuplicateColumn(c) if c == "inse"));
    }

    #[test]
    fn test_categorical_levels_are_trimmed() {
        let df = df!(
            "score" => [10.0, 20.0, 30.0],
            "estrato" => ["URBANO ", " URBANO", "   "],
            "inse" => [1.0, 2.0, 3.0],
            "cole_cod" => ["A", "B", "C"],
            "cole_nombre" => ["a", "b", "c"]
        )
        .unwrap();
        let assembled = assemble(&df, &selection("score"), 1).unwrap();
        assert_eq!(assembled.observations.len(), 2);
        for observation in assembled.observations.iter() {
            assert_eq!(
                observation.covariates[0],
                CovariateValue::Categorical("URBANO".to_string())
            );
        }
        assert_eq!(
            assembled.dropped.missing_covariate,
            vec![("estrato".to_string(), 1), ("inse".to_string(), 0)]
        );
    }

    #[test]
    fn test_sample_count_column_is_read_and_validated() {
        let df = df!(
            "score" => [10.0, 20.0, 30.0, 40.0, 50.0],
            "estrato" => ["1", "2", "3", "1", "2"],
            "inse" => [1.0, 2.0, 3.0, 4.0, 5.0],
            "cole_cod" => ["A", "B", "C", "D", "E"],
            "cole_nombre" => ["a", "b", "c", "d", "e"],
            "n_estudiantes" => [Some(200i64), Some(0), None, Some(35), Some(1)]
        )
        .unwrap();
        let mut sel = selection("score");
        sel.sample_count = Some("n_estudiantes".to_string());
        let assembled = assemble(&df, &sel, 1).unwrap();

        let counts: Vec<usize> = assembled.observations.iter().map(|o| o.sample_count).collect();
        assert_eq!(counts, vec![200, 35, 1]);
        assert_eq!(assembled.dropped.invalid_sample_count, 2);
        assert_eq!(assembled.dropped.total, 2);

        let without = assemble(&df, &selection("score"), 1).unwrap();
        assert!(without.observations.iter().all(|o| o.sample_count == 1));
    }

    #[test]
    fn test_fractional_sample_count_is_invalid() {
        assert_eq!(internal::whole_count(12.0), Some(12));
        assert_eq!(internal::whole_count(12.5), None);
        assert_eq!(internal::whole_count(0.0), None);
        assert_eq!(internal::whole_count(f64::NAN), None);
    }

    #[test]
    fn test_sample_count_column_must_exist() {
        let mut sel = selection("punt_matematicas");
        sel.sample_count = Some("n_estudiantes".to_string());
        let err = assemble(&table(), &sel, 1).unwrap_err();
        assert!(matches!(err, AssemblyError::ColumnNotFound(c) if c == "n_estudiantes"));
    }
}
