use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::*;
use cutterstat_core::handler::{ExportHandler, ImportHandler, StatisticHandler};
use cutterstat_core::{DocumentKind, MemoryStore, ProgressStatus, StatConfig};
use std::path::{Path, PathBuf};

mod formatter;

#[derive(Parser)]
#[command(name = "cutterstat")]
#[command(about = "Aggregate tool-cutter consumption workbooks into a statistics template", long_about = None)]
#[command(version)]
struct Cli {
    /// Detail workbooks to import (xls or xlsx)
    #[arg(value_name = "FILE", required = true)]
    files: Vec<PathBuf>,

    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Password of the imported workbooks
    #[arg(short, long)]
    password: Option<String>,

    /// Path of the exported statistics workbook
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Kind of the exported workbook; inferred from the output extension when omitted
    #[arg(short, long, value_enum)]
    kind: Option<KindArg>,

    /// Encrypt the exported workbook with this password
    #[arg(long)]
    output_password: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "human")]
    format: OutputFormat,

    /// Log codec decisions and progress
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Xls,
    Xlsx,
}

impl From<KindArg> for DocumentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Xls => DocumentKind::Xls,
            KindArg::Xlsx => DocumentKind::Xlsx,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable colored output
    Human,
    /// JSON output for scripting
    Json,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let outcome = run(&cli).and_then(|report| match cli.format {
        OutputFormat::Human => {
            formatter::print_human(&report);
            Ok(())
        }
        OutputFormat::Json => formatter::print_json(&report),
    });

    if let Err(e) = outcome {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(2);
    }
}

fn load_config(path: Option<&Path>) -> Result<StatConfig> {
    if let Some(config_path) = path {
        return StatConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    // Fall back to a config in the current directory, then to the defaults
    let default_config_path = PathBuf::from("cutterstat.toml");
    if default_config_path.exists() {
        StatConfig::from_file(&default_config_path).with_context(|| {
            format!(
                "Failed to load config from {}",
                default_config_path.display()
            )
        })
    } else {
        Ok(StatConfig::default())
    }
}

fn run(cli: &Cli) -> Result<formatter::Report> {
    let config = load_config(cli.config.as_deref())?;
    config.validate().context("Invalid configuration")?;

    let kind = match cli.kind {
        Some(kind) => kind.into(),
        None => DocumentKind::from_path(&cli.output).with_context(|| {
            format!(
                "Cannot infer the kind of {}; pass --kind",
                cli.output.display()
            )
        })?,
    };

    let observer = |status: ProgressStatus| log::debug!("progress: {:?}", status);
    let mut store = MemoryStore::new();

    let imports = ImportHandler::new(&config.import, &mut store, &observer)
        .exec_import_all(cli.files.as_slice(), cli.password.as_deref())
        .context("Failed to import the detail workbooks")?;

    let result = StatisticHandler::new(&config.statistics, &store, &observer)
        .exec_statistic()
        .context("Failed to aggregate detail records")?;

    let today = chrono::Local::now().date_naive();
    let export = ExportHandler::new(&config.export, &mut store, &observer)
        .exec_export(
            &result,
            &cli.output,
            kind,
            cli.output_password.as_deref(),
            today,
        )
        .with_context(|| format!("Failed to export {}", cli.output.display()))?;

    Ok(formatter::Report::new(imports, &result, export))
}
