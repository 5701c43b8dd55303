#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use itertools::Itertools;
use polars::prelude::*;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;

use saber_va::{
    AggregationLevel, Covariate, CovariateKind, CovariateSchema, CovariateValue,
    LowConfidencePolicy, ResidualRecord, RunConfig, UnseenCategoryPolicy, ValueAddedReport,
    run_value_added,
};

#[derive(Parser)]
#[command(
    name = "saber-va",
    about = "Value-added estimation for SABER test results",
    long_about = "Fits a tree ensemble predicting expected scores from socioeconomic and \
                 school context, then ranks students or schools by actual minus expected score."
)]
struct Cli {
    /// Log per-stage detail (overridden by RUST_LOG)
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the model and print the value-added ranking
    Rank(RankArgs),
    /// Fit the model and print the expected score for one covariate profile
    Predict(PredictArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Delimited text file with one row per student or school
    #[arg(value_name = "DATA")]
    data: PathBuf,

    /// TOML run configuration; the flags below override its values
    #[arg(long, value_name = "RUN_TOML")]
    config: Option<PathBuf>,

    /// Field delimiter: a single character, or "tab"
    #[arg(long, default_value = ",", value_parser = parse_delimiter)]
    delimiter: u8,

    /// Target score column
    #[arg(long)]
    target: Option<String>,

    /// Comma-separated categorical covariate columns
    #[arg(long, value_delimiter = ',')]
    categorical: Vec<String>,

    /// Comma-separated continuous covariate columns
    #[arg(long, value_delimiter = ',')]
    continuous: Vec<String>,

    /// Entity id column (school code)
    #[arg(long)]
    entity: Option<String>,

    /// Human-readable entity name column
    #[arg(long)]
    label: Option<String>,

    /// Students behind each row, for tables with one row per school
    #[arg(long)]
    sample_count: Option<String>,

    /// Report level: student or school
    #[arg(long, value_parser = parse_level)]
    level: Option<AggregationLevel>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    test_fraction: Option<f64>,

    #[arg(long)]
    min_rows: Option<usize>,

    /// Schools with fewer students are low-confidence
    #[arg(long)]
    min_sample_count: Option<usize>,

    /// Drop low-confidence schools instead of flagging them
    #[arg(long)]
    exclude_low_confidence: bool,

    /// Map categories unseen in training to an unknown code instead of failing
    #[arg(long)]
    unknown_bucket: bool,
}

#[derive(Args)]
struct RankArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Number of entities shown at each end of the ranking
    #[arg(long, default_value = "10")]
    top: usize,
}

#[derive(Args)]
struct PredictArgs {
    #[command(flatten)]
    run: RunArgs,

    /// Covariate value as NAME=VALUE; repeat for every covariate
    #[arg(long = "set", value_name = "NAME=VALUE")]
    values: Vec<String>,

    /// Print the known levels of each categorical covariate
    #[arg(long)]
    levels: bool,
}

fn parse_delimiter(raw: &str) -> Result<u8, String> {
    match raw {
        "tab" | "\\t" => Ok(b'\t'),
        _ if raw.len() == 1 && raw.is_ascii() => Ok(raw.as_bytes()[0]),
        _ => Err(format!("delimiter must be one ASCII character or \"tab\", got '{raw}'")),
    }
}

fn parse_level(raw: &str) -> Result<AggregationLevel, String> {
    match raw {
        "student" => Ok(AggregationLevel::Student),
        "school" => Ok(AggregationLevel::School),
        _ => Err(format!("level must be \"student\" or \"school\", got '{raw}'")),
    }
}

/// Builds the run configuration from the optional TOML file plus flag overrides.
fn build_config(args: &RunArgs) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let flag_covariates: Vec<Covariate> = args
        .categorical
        .iter()
        .map(Covariate::categorical)
        .chain(args.continuous.iter().map(Covariate::continuous))
        .collect();

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Reading run configuration from '{}'", path.display());
            RunConfig::load(path)?
        }
        None => {
            let target = args
                .target
                .clone()
                .ok_or("--target is required without --config")?;
            let entity = args
                .entity
                .clone()
                .ok_or("--entity is required without --config")?;
            RunConfig::new(target, CovariateSchema::default(), entity)
        }
    };

    if let Some(target) = &args.target {
        config.target = target.clone();
    }
    if let Some(entity) = &args.entity {
        config.entity = entity.clone();
    }
    if args.label.is_some() {
        config.label = args.label.clone();
    }
    if args.sample_count.is_some() {
        config.sample_count = args.sample_count.clone();
    }
    if !flag_covariates.is_empty() {
        config.covariates = CovariateSchema::new(flag_covariates);
    }
    if let Some(level) = args.level {
        config.aggregation_level = level;
    }
    if let Some(seed) = args.seed {
        config.random_seed = seed;
    }
    if let Some(test_fraction) = args.test_fraction {
        config.test_fraction = test_fraction;
    }
    if let Some(min_rows) = args.min_rows {
        config.min_rows = min_rows;
    }
    if let Some(min_sample_count) = args.min_sample_count {
        config.min_sample_count = min_sample_count;
    }
    if args.exclude_low_confidence {
        config.low_confidence = LowConfidencePolicy::Exclude;
    }
    if args.unknown_bucket {
        config.unseen_category = UnseenCategoryPolicy::UnknownBucket;
    }

    config.validate()?;
    log::debug!("Effective configuration:\n{}", config.to_toml_string()?);
    Ok(config)
}

fn load_table(path: &Path, delimiter: u8) -> Result<DataFrame, Box<dyn std::error::Error>> {
    log::info!("Loading data from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(delimiter)),
        )
        .finish()?;
    log::info!("Loaded {} rows x {} columns", df.height(), df.width());
    Ok(df)
}

fn run(args: &RunArgs) -> Result<ValueAddedReport, Box<dyn std::error::Error>> {
    let config = build_config(args)?;
    let table = load_table(&args.data, args.delimiter)?;
    match run_value_added(&table, &config) {
        Ok(report) => Ok(report),
        Err(e) => Err(format!("{} ({})", e, e.kind()).into()),
    }
}

fn print_report_header(report: &ValueAddedReport) {
    let metrics = &report.metrics;
    println!(
        "Held-out metrics ({} train / {} test rows)",
        metrics.train_count, metrics.test_count
    );
    println!("  R²   {:>10.4}", metrics.r2);
    println!("  MAE  {:>10.3}", metrics.mae);
    println!("  RMSE {:>10.3}", metrics.rmse);
    if let Some(train_r2) = metrics.train_r2 {
        println!("  Train R² {:>6.4}", train_r2);
    }
    if report.dropped.total > 0 {
        println!(
            "Excluded {} incomplete rows ({})",
            report.dropped.total,
            std::iter::once(("target", report.dropped.missing_target))
                .chain(std::iter::once(("entity", report.dropped.missing_entity)))
                .chain(std::iter::once((
                    "sample count",
                    report.dropped.invalid_sample_count
                )))
                .chain(
                    report
                        .dropped
                        .missing_covariate
                        .iter()
                        .map(|(name, n)| (name.as_str(), *n))
                )
                .filter(|(_, n)| *n > 0)
                .map(|(name, n)| format!("{name}: {n}"))
                .join(", ")
        );
    }

    if report.unseen_categories > 0 {
        println!(
            "{} categorical values were unseen in training and coded as unknown",
            report.unseen_categories
        );
    }

    println!();
    println!("Covariate importance");
    for feature in &report.importance {
        println!("  {:<40} {:>8.4}", feature.covariate, feature.importance);
    }
}

fn print_records(title: &str, records: &[&ResidualRecord]) {
    println!();
    println!("{title}");
    println!(
        "  {:<16} {:<40} {:>9} {:>9} {:>9} {:>6}",
        "entity", "label", "actual", "expected", "residual", "n"
    );
    for record in records {
        println!(
            "  {:<16} {:<40} {:>9.2} {:>9.2} {:>+9.2} {:>6}{}",
            record.entity_id,
            record.entity_label.as_deref().unwrap_or("-"),
            record.actual_score,
            record.predicted_score,
            record.residual,
            record.sample_count,
            if record.low_confidence { "  (low confidence)" } else { "" }
        );
    }
}

fn rank(args: RankArgs) -> Result<(), Box<dyn std::error::Error>> {
    let report = run(&args.run)?;
    print_report_header(&report);

    let ranking = &report.ranking;
    print_records(
        &format!("Top {} above expectation ({}-level)", args.top, ranking.level()),
        &ranking.top(args.top),
    );
    print_records(
        &format!("Bottom {} below expectation ({}-level)", args.top, ranking.level()),
        &ranking.bottom(args.top),
    );

    println!();
    if ranking.excluded_low_confidence() > 0 {
        println!(
            "{} low-confidence entities were excluded from the ranking.",
            ranking.excluded_low_confidence()
        );
    }
    println!("Note: {}", ranking.population_scoring_note());
    Ok(())
}

fn parse_profile(
    schema: &CovariateSchema,
    values: &[String],
) -> Result<HashMap<String, CovariateValue>, Box<dyn std::error::Error>> {
    let mut profile = HashMap::with_capacity(values.len());
    for raw in values {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("--set expects NAME=VALUE, got '{raw}'"))?;
        let covariate = schema
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| format!("'{name}' is not a covariate of this run"))?;
        let value = match covariate.kind {
            CovariateKind::Categorical => CovariateValue::Categorical(value.to_string()),
            CovariateKind::Continuous => CovariateValue::Continuous(
                value
                    .parse::<f64>()
                    .map_err(|e| format!("'{name}' expects a number, got '{value}': {e}"))?,
            ),
        };
        profile.insert(name.to_string(), value);
    }
    Ok(profile)
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let report = run(&args.run)?;
    let encoder = &report.model.encoder;

    if args.levels {
        for covariate in encoder.schema() {
            if let Some(levels) = encoder.levels(&covariate.name) {
                println!("{}: {}", covariate.name, levels.iter().join(" | "));
            }
        }
    }
    if args.values.is_empty() {
        return Ok(());
    }

    let profile = parse_profile(encoder.schema(), &args.values)?;
    let expected = report.model.predict_profile(&profile)?;
    println!(
        "Expected score: {expected:.2} (held-out R² {:.4})",
        report.metrics.r2
    );
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Some(Commands::Rank(args)) => rank(args),
        Some(Commands::Predict(args)) => predict(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse_run(args: &[&str]) -> RunArgs {
        let argv = ["saber-va", "rank"].iter().chain(args.iter()).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Some(Commands::Rank(rank)) => rank.run,
            _ => panic!("expected the rank subcommand"),
        }
    }

    #[test]
    fn test_flags_build_a_config_without_toml() {
        let args = parse_run(&[
            "saber.csv",
            "--target",
            "punt_global",
            "--entity",
            "cole_cod_dane",
            "--categorical",
            "fami_estratovivienda,cole_naturaleza",
            "--continuous",
            "inse",
            "--level",
            "student",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.target, "punt_global");
        assert_eq!(config.entity, "cole_cod_dane");
        assert_eq!(
            config.covariates.names(),
            vec!["fami_estratovivienda", "cole_naturaleza", "inse"]
        );
        assert_eq!(config.covariates.get(2).unwrap().kind, CovariateKind::Continuous);
        assert_eq!(config.aggregation_level, AggregationLevel::Student);
        assert_eq!(args.delimiter, b',');
    }

    #[test]
    fn test_target_is_required_without_config() {
        let args = parse_run(&["saber.csv", "--entity", "cole_cod_dane", "--categorical", "estrato"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("--target"));
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"target = "punt_global"
entity = "cole_cod_dane"
random_seed = 7

[[covariates]]
name = "fami_estratovivienda"
kind = "categorical"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = parse_run(&[
            "saber.csv",
            "--config",
            &path,
            "--target",
            "punt_matematicas",
            "--sample-count",
            "n_estudiantes",
            "--exclude-low-confidence",
            "--unknown-bucket",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.target, "punt_matematicas");
        assert_eq!(config.entity, "cole_cod_dane");
        assert_eq!(config.random_seed, 7);
        assert_eq!(config.covariates.names(), vec!["fami_estratovivienda"]);
        assert_eq!(config.sample_count.as_deref(), Some("n_estudiantes"));
        assert_eq!(config.low_confidence, LowConfidencePolicy::Exclude);
        assert_eq!(config.unseen_category, UnseenCategoryPolicy::UnknownBucket);

        let args = parse_run(&["saber.csv", "--config", &path, "--seed", "99"]);
        assert_eq!(build_config(&args).unwrap().random_seed, 99);
    }

    #[test]
    fn test_delimiter_parsing() {
        assert_eq!(parse_delimiter(";"), Ok(b';'));
        assert_eq!(parse_delimiter("tab"), Ok(b'\t'));
        assert!(parse_delimiter("::").is_err());
        assert!(parse_delimiter("ñ").is_err());
        assert!(Cli::try_parse_from(["saber-va", "rank", "x.csv", "--delimiter", "ab"]).is_err());
    }

    #[test]
    fn test_profile_values_follow_covariate_kind() {
        let schema = CovariateSchema::new(vec![
            Covariate::categorical("fami_estratovivienda"),
            Covariate::continuous("inse"),
        ]);
        let profile = parse_profile(
            &schema,
            &["fami_estratovivienda=Estrato 2".to_string(), "inse=55.5".to_string()],
        )
        .unwrap();
        assert_eq!(
            profile["fami_estratovivienda"],
            CovariateValue::Categorical("Estrato 2".to_string())
        );
        assert_eq!(profile["inse"], CovariateValue::Continuous(55.5));

        assert!(parse_profile(&schema, &["inse".to_string()]).is_err());
        assert!(parse_profile(&schema, &["inse=alto".to_string()]).is_err());
        assert!(parse_profile(&schema, &["estrato=1".to_string()]).is_err());
    }
}

