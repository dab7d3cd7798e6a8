//! gradeloop: command-line front end for the grading round-trip.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use gradeloop_lib::config::{ClassPaths, GraderSettings, StaticConfig};
use gradeloop_lib::events::{codes, StageResult};
use gradeloop_lib::pipeline::naming::NameResolver;
use gradeloop_lib::pipeline::orchestrator::{CompletionRequest, ExtractRequest, Orchestrator};
use gradeloop_lib::pipeline::report::RunReport;
use gradeloop_lib::pipeline::roster::GradeMode;

/// Name the class is registered under for a single CLI run.
const CLI_CLASS: &str = "cli";

/// Exit status for a stage that failed on a locked file; rerun once it is closed.
const EXIT_LOCKED: u8 = 75;

#[derive(Parser, Debug)]
#[command(name = "gradeloop")]
#[command(about = "Combine D2L submissions, read handwritten grades, rebuild the upload ZIP")]
#[command(version)]
struct Cli {
    /// Folder holding the roster import CSV
    #[arg(long, env = "GRADELOOP_ROSTER")]
    roster: PathBuf,

    /// Folder holding the D2L download ZIP
    #[arg(long, env = "GRADELOOP_DOWNLOADS")]
    downloads: PathBuf,

    /// Settings file (defaults to ~/Gradeloop/gradeloop.toml)
    #[arg(long, env = "GRADELOOP_SETTINGS")]
    settings: Option<PathBuf>,

    /// Where replaced folders and packages are archived
    #[arg(long)]
    archive_root: Option<PathBuf>,

    /// Manual match, "Folder Name=username"; may be repeated
    #[arg(long = "match", value_parser = parse_override)]
    overrides: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate and unpack the download, then build the combined PDF
    Process {
        /// Download ZIP (newest in the downloads folder if omitted)
        #[arg(long)]
        zip: Option<PathBuf>,
    },
    /// Read grades off the graded PDF into the roster CSV
    Extract {
        #[command(flatten)]
        column: ColumnArgs,

        /// Graded PDF (the combined PDF if omitted)
        #[arg(long)]
        pdf: Option<PathBuf>,
    },
    /// Split the graded PDF back into submissions and write the upload ZIP
    Split {
        #[arg(long)]
        pdf: Option<PathBuf>,
    },
    /// Archive the processing folder and combined PDF
    Clear,
    /// Completion grading from submission times
    Complete {
        #[command(flatten)]
        column: ColumnArgs,

        /// Points per submitter (settings `completion_points` if omitted)
        #[arg(long)]
        points: Option<f64>,

        /// Due date, "YYYY-MM-DD HH:MM" or "YYYY-MM-DD" (end of day)
        #[arg(long, value_parser = parse_due)]
        due: Option<NaiveDateTime>,

        /// Read submissions from this ZIP instead of the processing folder
        #[arg(long)]
        zip: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ColumnArgs {
    /// Grade column header, e.g. "Lab 1 Points Grade"
    #[arg(long)]
    column: String,

    /// Only fill blank grades instead of replacing the grade column
    #[arg(long)]
    keep_existing: bool,
}

impl ColumnArgs {
    fn mode(&self) -> GradeMode {
        if self.keep_existing {
            GradeMode::KeepExisting
        } else {
            GradeMode::Override
        }
    }
}

fn parse_override(value: &str) -> Result<(String, String), String> {
    let (name, username) = value
        .split_once('=')
        .ok_or_else(|| format!("expected \"Folder Name=username\", got \"{value}\""))?;
    if name.trim().is_empty() || username.trim().is_empty() {
        return Err(format!("empty side in \"{value}\""));
    }
    Ok((name.trim().to_string(), username.trim().to_string()))
}

fn parse_due(value: &str) -> Result<NaiveDateTime, String> {
    if let Ok(at) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M") {
        return Ok(at);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(23, 59, 59))
        .ok_or_else(|| format!("not a date: \"{value}\""))
}

/// Print the stage as JSON on stdout and a summary line on stderr.
fn emit<T: Serialize>(stage: &StageResult<T>) -> ExitCode {
    match serde_json::to_string_pretty(stage) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Could not serialize stage result: {e}");
            return ExitCode::FAILURE;
        }
    }
    eprintln!("{}", RunReport::from_events(&stage.logs).headline());

    if stage.success {
        ExitCode::SUCCESS
    } else if stage.has_code(codes::ERR_FILE_LOCKED) {
        ExitCode::from(EXIT_LOCKED)
    } else {
        ExitCode::FAILURE
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    gradeloop_lib::init_tracing();
    let cli = Cli::parse();

    let settings_path = cli.settings.clone().unwrap_or_else(GraderSettings::default_path);
    let settings = match GraderSettings::load(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        version = gradeloop_lib::config::APP_VERSION,
        roster = %cli.roster.display(),
        downloads = %cli.downloads.display(),
        "gradeloop starting"
    );

    let paths = ClassPaths::from_roster_and_downloads(&cli.roster, &cli.downloads);
    let config = StaticConfig::new().with_class(CLI_CLASS, paths);
    let resolver = cli
        .overrides
        .iter()
        .fold(NameResolver::new(), |r, (name, username)| r.with_override(name, username));

    let mut orchestrator = Orchestrator::new(Arc::new(config), settings).with_resolver(resolver);
    if let Some(root) = &cli.archive_root {
        orchestrator = orchestrator.with_archive_root(root);
    }

    match cli.command {
        Command::Process { zip } => emit(&orchestrator.process(CLI_CLASS, zip.as_deref())),
        Command::Extract { column, pdf } => {
            let request = ExtractRequest {
                grade_column: column.column.clone(),
                mode: column.mode(),
                graded_pdf: pdf,
            };
            emit(&orchestrator.extract(CLI_CLASS, &request).await)
        }
        Command::Split { pdf } => emit(&orchestrator.split(CLI_CLASS, pdf.as_deref())),
        Command::Clear => emit(&orchestrator.clear(CLI_CLASS)),
        Command::Complete {
            column,
            points,
            due,
            zip,
        } => {
            let request = CompletionRequest {
                grade_column: column.column.clone(),
                mode: column.mode(),
                points,
                due,
                source_zip: zip,
            };
            emit(&orchestrator.complete(CLI_CLASS, &request))
        }
    }
}
