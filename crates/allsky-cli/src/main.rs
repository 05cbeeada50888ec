use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glob::glob;
use serde::Serialize;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use allsky_core::{
    read, BatchData, Dataset, DecodedBatch, ImageStack, IssueKind, ReadOptions,
};

const VERSION_LONG: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("ALLSKY_BUILD_COMMIT"),
    ", ",
    env!("ALLSKY_BUILD_DATE"),
    ")"
);

/// Bound arguments are naive UTC wall-clock times.
const CLI_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

const REPORT_TIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6] UTC");

#[derive(Parser, Debug)]
#[command(name = "allsky")]
#[command(version)]
#[command(long_version = VERSION_LONG)]
#[command(
    about = "Decoder for raw auroral instrument files (all-sky imagers, spectrograph, grids, riometers).",
    long_about = None,
    after_help = "Examples:\n  allsky read THEMIS_ASI_RAW '20210205_06*_gill*full.pgm.gz' -o report.json\n  allsky read NORSTAR_RIOMETER_K2_TXT 'data/*.txt' --stdout --pretty\n  allsky datasets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decode raw files for one dataset and generate a JSON report.
    #[command(
        after_help = "Examples:\n  allsky read THEMIS_ASI_RAW '20210205_06*_gill*full.pgm.gz' -o report.json\n  allsky read REGO_RAW a.pgm.gz b.pgm.gz --n-parallel 4 --stdout"
    )]
    Read {
        /// Dataset name, as listed by `allsky datasets`
        dataset: String,

        /// Input files or glob patterns
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Output report path (JSON)
        #[arg(short = 'o', long, required_unless_present = "stdout")]
        report: Option<PathBuf>,

        /// Write the JSON report to stdout
        #[arg(long, conflicts_with = "report")]
        stdout: bool,

        /// Pretty-print JSON output
        #[arg(long, conflicts_with = "compact")]
        pretty: bool,

        /// Compact JSON output (default)
        #[arg(long)]
        compact: bool,

        /// Number of decode workers (1 = sequential)
        #[arg(long, default_value_t = 1)]
        n_parallel: usize,

        /// Stop each file after its first kept frame
        #[arg(long)]
        first_record: bool,

        /// Skip metadata and timestamp collection
        #[arg(long)]
        no_metadata: bool,

        /// Keep frames at or after this UTC time (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        start_time: Option<String>,

        /// Keep frames at or before this UTC time (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        end_time: Option<String>,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,

        /// List problematic files after decoding
        #[arg(long)]
        list_problems: bool,

        /// Exit with a non-zero code if any file failed to decode
        #[arg(long)]
        strict: bool,
    },
    /// List the supported dataset names.
    Datasets {
        /// Emit the list as a JSON array
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Read {
            dataset,
            inputs,
            report,
            stdout,
            pretty,
            compact,
            n_parallel,
            first_record,
            no_metadata,
            start_time,
            end_time,
            quiet,
            list_problems,
            strict,
        } => cmd_read(ReadCommand {
            dataset,
            inputs,
            report,
            stdout,
            pretty,
            compact,
            n_parallel,
            first_record,
            no_metadata,
            start_time,
            end_time,
            quiet,
            list_problems,
            strict,
        }),
        Commands::Datasets { json } => cmd_datasets(json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            if let Some(hint) = err.hint {
                eprintln!("hint: {}", hint);
            }
            ExitCode::from(2)
        }
    }
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            message: message.into(),
            hint,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(err.to_string(), None)
    }
}

#[derive(Debug)]
struct ReadCommand {
    dataset: String,
    inputs: Vec<String>,
    report: Option<PathBuf>,
    stdout: bool,
    pretty: bool,
    compact: bool,
    n_parallel: usize,
    first_record: bool,
    no_metadata: bool,
    start_time: Option<String>,
    end_time: Option<String>,
    quiet: bool,
    list_problems: bool,
    strict: bool,
}

#[derive(Debug, Serialize)]
struct ReadReport {
    dataset: &'static str,
    files: usize,
    frames: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<usize>,
    timestamps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_timestamp: Option<String>,
    metadata_entries: usize,
    problematic_files: Vec<allsky_core::ProblematicFile>,
}

fn cmd_read(command: ReadCommand) -> Result<(), CliError> {
    let dataset = parse_dataset(&command.dataset)?;
    let files = resolve_inputs(&command.inputs)?;
    let report_path = if command.stdout {
        None
    } else {
        Some(command.report.ok_or_else(|| {
            CliError::new(
                "missing output path",
                Some("use -o/--report or --stdout".to_string()),
            )
        })?)
    };

    let options = ReadOptions {
        n_parallel: command.n_parallel.max(1),
        first_record_only: command.first_record,
        suppress_metadata: command.no_metadata,
        start_time: command
            .start_time
            .as_deref()
            .map(|value| parse_bound("start time", value))
            .transpose()?,
        end_time: command
            .end_time
            .as_deref()
            .map(|value| parse_bound("end time", value))
            .transpose()?,
        quiet: command.quiet,
        ..ReadOptions::default()
    };

    let file_count = files.len();
    let batch = read(dataset, files, &options).map_err(describe_read_error)?;
    let summary = summarize(dataset, file_count, &batch);
    let json = serialize_report(&summary, command.pretty)?;

    if let Some(report_path) = report_path {
        if let Some(parent) = report_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }
        fs::write(&report_path, json)
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;
        if !command.quiet {
            eprintln!("OK: report written -> {}", report_path.display());
        }
    } else {
        print!("{}", json);
    }

    if command.list_problems && !command.quiet {
        print_problems(&batch);
    }
    if command.strict && batch.problematic_files.iter().any(|p| p.error_kind == IssueKind::Error) {
        return Err(CliError::new(
            "decode problems detected",
            Some("use --list-problems to inspect".to_string()),
        ));
    }
    Ok(())
}

fn cmd_datasets(json: bool) -> Result<(), CliError> {
    let names = allsky_core::list_supported();
    if json {
        let text = serde_json::to_string_pretty(&names)
            .context("JSON serialization failed")
            .map_err(CliError::from)?;
        println!("{text}");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

fn parse_dataset(name: &str) -> Result<Dataset, CliError> {
    Dataset::from_name(&name.to_ascii_uppercase()).ok_or_else(|| {
        CliError::new(
            format!("unsupported dataset '{name}'"),
            Some("run `allsky datasets` for the supported names".to_string()),
        )
    })
}

fn parse_bound(which: &str, value: &str) -> Result<OffsetDateTime, CliError> {
    PrimitiveDateTime::parse(value, CLI_TIME)
        .map(|dt| dt.assume_utc())
        .map_err(|err| {
            CliError::new(
                format!("invalid {which} '{value}': {err}"),
                Some("use YYYY-MM-DDTHH:MM:SS (UTC)".to_string()),
            )
        })
}

fn describe_read_error(err: allsky_core::ReadError) -> CliError {
    let hint = match &err {
        allsky_core::ReadError::UnsupportedDataset(_) => Some(
            "tabular container datasets need an HDF5 table reader; only the stream formats decode from the CLI"
                .to_string(),
        ),
    };
    CliError::new(err.to_string(), hint)
}

fn summarize(dataset: Dataset, files: usize, batch: &DecodedBatch) -> ReadReport {
    let (shape, records) = match &batch.data {
        BatchData::Images(stack) => (Some(stack.shape().to_vec()), None),
        BatchData::GridRecords(entries) => (None, Some(entries.len())),
        BatchData::RiometerRecords(entries) => (None, Some(entries.len())),
    };
    ReadReport {
        dataset: dataset.name(),
        files,
        frames: batch.frame_count(),
        shape,
        records,
        timestamps: batch.timestamps.len(),
        first_timestamp: batch.timestamps.first().map(format_stamp),
        last_timestamp: batch.timestamps.last().map(format_stamp),
        metadata_entries: batch.metadata.len(),
        problematic_files: batch.problematic_files.clone(),
    }
}

fn format_stamp(stamp: &OffsetDateTime) -> String {
    stamp
        .format(REPORT_TIME)
        .unwrap_or_else(|_| stamp.to_string())
}

fn serialize_report(report: &ReadReport, pretty: bool) -> Result<String, CliError> {
    let json = if pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    json.context("JSON serialization failed").map_err(Into::into)
}

fn print_problems(batch: &DecodedBatch) {
    if batch.problematic_files.is_empty() {
        eprintln!("No problematic files.");
        return;
    }
    eprintln!("Problematic files:");
    for file in &batch.problematic_files {
        let kind = match file.error_kind {
            IssueKind::Error => "error",
            IssueKind::Warning => "warning",
        };
        eprintln!("  [{kind}] {}: {}", file.filename, file.error_message);
    }
}

fn resolve_inputs(patterns: &[String]) -> Result<Vec<String>, CliError> {
    let mut files = Vec::new();
    for pattern in patterns {
        if !is_glob_pattern(pattern) {
            files.push(pattern.clone());
            continue;
        }
        let paths = glob(pattern).map_err(|err| {
            CliError::new(
                format!("invalid input pattern '{}'", pattern),
                Some(format!("pattern error: {}", err.msg)),
            )
        })?;
        let mut matched = 0usize;
        for entry in paths {
            let path = entry.map_err(|err| {
                CliError::new(
                    format!("invalid input pattern '{}'", pattern),
                    Some(format!("pattern error: {}", err)),
                )
            })?;
            if path.is_file() {
                files.push(path.to_string_lossy().into_owned());
                matched += 1;
            }
        }
        if matched == 0 {
            return Err(CliError::new(
                format!("no files match pattern '{}'", pattern),
                Some("check the path or quote the pattern".to_string()),
            ));
        }
    }
    Ok(files)
}

fn is_glob_pattern(input: &str) -> bool {
    input.contains('*') || input.contains('?') || input.contains('[')
}
