//! Output formatters for run reports

use anyhow::Result;
use colored::*;
use cutterstat_core::handler::{ExportSummary, ImportSummary};
use cutterstat_core::StatisticResult;
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything one invocation did
#[derive(Serialize)]
pub struct Report {
    pub imports: Vec<ImportSummary>,
    pub tables: TableSizes,
    pub export: ExportSummary,
}

#[derive(Serialize)]
pub struct TableSizes {
    pub person: usize,
    pub device: usize,
    pub tool_cutter: usize,
}

impl Report {
    pub fn new(imports: Vec<ImportSummary>, result: &StatisticResult, export: ExportSummary) -> Self {
        Self {
            imports,
            tables: TableSizes {
                person: result.person_perspectives.len(),
                device: result.device_perspectives.len(),
                tool_cutter: result.tool_cutter_perspectives.len(),
            },
            export,
        }
    }

    fn import_error_count(&self) -> usize {
        self.imports.iter().map(|i| i.errors.len()).sum()
    }
}

/// Print the report in human-readable format with colors
pub fn print_human(report: &Report) {
    for import in &report.imports {
        println!(
            "{} {}",
            "Imported:".bold(),
            import.path.display().to_string().cyan()
        );
        println!(
            "  {} records from {} sheets",
            import.record_count, import.sheet_count
        );
        print_row_errors(
            import
                .errors
                .iter()
                .map(|e| (e.sheet_name.as_str(), e.row_index, e.message.as_str())),
        );
        println!();
    }

    println!("{}", "Statistics:".bold().underline());
    println!("  {} {}", "Person rows:".bold(), report.tables.person);
    println!("  {} {}", "Device rows:".bold(), report.tables.device);
    println!("  {} {}", "Tool cutter rows:".bold(), report.tables.tool_cutter);
    println!();

    let export = &report.export;
    let lock = if export.encrypted { " (encrypted)" } else { "" };
    println!(
        "{} {} [{}]{}",
        "Exported:".bold(),
        export.path.display().to_string().cyan(),
        export.kind,
        lock
    );
    println!("  {} rows written", export.written_rows);
    print_row_errors(
        export
            .errors
            .iter()
            .map(|e| (e.sheet_name.as_str(), e.row_index, e.message.as_str())),
    );
    println!();

    let failed = report.import_error_count() + export.errors.len();
    if failed == 0 {
        println!("{}", "✓ Every row was processed".green().bold());
    } else {
        println!("{} {}", "Rows with errors:".yellow().bold(), failed);
    }
}

/// Row errors grouped by sheet, rows ascending
fn print_row_errors<'a>(errors: impl Iterator<Item = (&'a str, u32, &'a str)>) {
    let mut by_sheet: BTreeMap<&str, Vec<(u32, &str)>> = BTreeMap::new();
    for (sheet, row, message) in errors {
        by_sheet.entry(sheet).or_default().push((row, message));
    }

    for (sheet, mut rows) in by_sheet {
        rows.sort_by_key(|(row, _)| *row);
        println!("  {} {}", "Sheet:".bold(), sheet.cyan().bold());
        for (row, message) in rows {
            println!(
                "    {} [{}] {}",
                "WARN".yellow().bold(),
                format!("row {}", row.saturating_add(1)).bright_black(),
                message
            );
        }
    }
}

/// Print the report in JSON format
pub fn print_json(report: &Report) -> Result<()> {
    let output = serde_json::json!({
        "imports": report.imports,
        "tables": report.tables,
        "export": report.export,
        "summary": {
            "records": report.imports.iter().map(|i| i.record_count).sum::<usize>(),
            "import_errors": report.import_error_count(),
            "export_errors": report.export.errors.len(),
        }
    });

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
