//! Configuration for the import, statistic and export runs

use anyhow::Result;
use chrono::format::{Item, StrftimeItems};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatConfig {
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

impl StatConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: StatConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject configurations no run could succeed with
    pub fn validate(&self) -> Result<()> {
        full_match_regex(&self.import.valid_sheet_name_regex).map_err(|e| {
            anyhow::anyhow!("Configuration error: invalid import.valid_sheet_name_regex: {}", e)
        })?;

        let usage = &self.statistics.returning_usage;
        for (key, pattern) in [("g01", &usage.g01), ("g02", &usage.g02), ("g03", &usage.g03)] {
            full_match_regex(pattern).map_err(|e| {
                anyhow::anyhow!(
                    "Configuration error: invalid statistics.returning_usage.{}: {}",
                    key,
                    e
                )
            })?;
        }

        if !is_valid_date_format(&self.export.statistics_date_format) {
            anyhow::bail!(
                "Configuration error: invalid export.statistics_date_format '{}'",
                self.export.statistics_date_format
            );
        }

        if self.export.month_names.len() != 12 {
            anyhow::bail!(
                "Configuration error: export.month_names must have 12 entries, found {}",
                self.export.month_names.len()
            );
        }

        let indexes = [
            self.export.person.sheet_index,
            self.export.device.sheet_index,
            self.export.tool_cutter.sheet_index,
        ];
        let distinct: HashSet<usize> = indexes.iter().copied().collect();
        if distinct.len() != indexes.len() {
            anyhow::bail!("Configuration error: export sheet indexes must be distinct");
        }

        Ok(())
    }
}

/// True when every specifier of a chrono format string is recognized
pub fn is_valid_date_format(format: &str) -> bool {
    StrftimeItems::new(format).all(|item| !matches!(item, Item::Error))
}

/// Compile a pattern that must match the whole input, not a substring
pub fn full_match_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Only sheets whose whole name matches are imported
    pub valid_sheet_name_regex: String,
    pub first_data_row: u32,
    pub column_index: ImportColumns,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            valid_sheet_name_regex: ".*".to_string(),
            first_data_row: 1,
            column_index: ImportColumns::default(),
        }
    }
}

/// Source column of every detail record field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportColumns {
    pub tool_cutter_type: u32,
    pub device: u32,
    pub consuming_quantity: u32,
    pub worth: u32,
    pub consuming_person: u32,
    pub consuming_date: u32,
    pub remark: u32,
    pub returning_quantity: u32,
    pub returning_usage_info: u32,
    /// Not read when absent
    pub tool_cutter_code: Option<u32>,
}

impl Default for ImportColumns {
    fn default() -> Self {
        Self {
            tool_cutter_type: 0,
            device: 1,
            consuming_quantity: 2,
            worth: 3,
            consuming_person: 4,
            consuming_date: 5,
            remark: 6,
            returning_quantity: 7,
            returning_usage_info: 8,
            tool_cutter_code: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub returning_usage: ReturningUsagePatterns,
}

/// Patterns classifying returning usage notes, checked G01 first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReturningUsagePatterns {
    pub g01: String,
    pub g02: String,
    pub g03: String,
}

impl Default for ReturningUsagePatterns {
    fn default() -> Self {
        Self {
            g01: ".*G01.*".to_string(),
            g02: ".*G02.*".to_string(),
            g03: ".*G03.*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Display names for months 0 to 11
    pub month_names: Vec<String>,
    /// chrono format of the statistics date column
    pub statistics_date_format: String,
    pub template: TemplatePaths,
    pub person: PersonSheetLayout,
    pub device: DeviceSheetLayout,
    pub tool_cutter: ToolCutterSheetLayout,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            month_names: (1..=12).map(|month| format!("{}月", month)).collect(),
            statistics_date_format: "%Y-%m-%d".to_string(),
            template: TemplatePaths::default(),
            person: PersonSheetLayout::default(),
            device: DeviceSheetLayout::default(),
            tool_cutter: ToolCutterSheetLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatePaths {
    pub xls: PathBuf,
    pub xlsx: PathBuf,
}

impl Default for TemplatePaths {
    fn default() -> Self {
        Self {
            xls: PathBuf::from("conf/data-export/template.xls"),
            xlsx: PathBuf::from("conf/data-export/template.xlsx"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonSheetLayout {
    pub sheet_index: usize,
    pub first_data_row: u32,
    pub column_index: PersonColumns,
}

impl Default for PersonSheetLayout {
    fn default() -> Self {
        Self {
            sheet_index: 0,
            first_data_row: 1,
            column_index: PersonColumns::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonColumns {
    pub month: u32,
    pub name: u32,
    pub tool_cutter_type: u32,
    pub consuming_quantity: u32,
    pub worth: u32,
    pub returning_quantity: u32,
    pub device: u32,
    pub year: u32,
    pub statistics_date: u32,
    pub tool_cutter_code: u32,
    pub returning_usage_g01_quantity: u32,
    pub returning_usage_g02_quantity: u32,
    pub returning_usage_g03_quantity: u32,
}

impl Default for PersonColumns {
    fn default() -> Self {
        Self {
            month: 0,
            name: 1,
            tool_cutter_type: 2,
            consuming_quantity: 3,
            worth: 4,
            returning_quantity: 5,
            device: 6,
            year: 7,
            statistics_date: 8,
            tool_cutter_code: 9,
            returning_usage_g01_quantity: 10,
            returning_usage_g02_quantity: 11,
            returning_usage_g03_quantity: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSheetLayout {
    pub sheet_index: usize,
    pub first_data_row: u32,
    pub column_index: DeviceColumns,
}

impl Default for DeviceSheetLayout {
    fn default() -> Self {
        Self {
            sheet_index: 1,
            first_data_row: 1,
            column_index: DeviceColumns::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceColumns {
    pub month: u32,
    pub device: u32,
    pub tool_cutter_type: u32,
    pub consuming_quantity: u32,
    pub worth: u32,
    pub year: u32,
    pub statistics_date: u32,
    pub tool_cutter_code: u32,
}

impl Default for DeviceColumns {
    fn default() -> Self {
        Self {
            month: 0,
            device: 1,
            tool_cutter_type: 2,
            consuming_quantity: 3,
            worth: 4,
            year: 5,
            statistics_date: 6,
            tool_cutter_code: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCutterSheetLayout {
    pub sheet_index: usize,
    pub first_data_row: u32,
    pub column_index: ToolCutterColumns,
}

impl Default for ToolCutterSheetLayout {
    fn default() -> Self {
        Self {
            sheet_index: 2,
            first_data_row: 1,
            column_index: ToolCutterColumns::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCutterColumns {
    pub month: u32,
    pub tool_cutter_type: u32,
    pub consuming_quantity: u32,
    pub worth: u32,
    pub year: u32,
    pub statistics_date: u32,
    pub tool_cutter_code: u32,
}

impl Default for ToolCutterColumns {
    fn default() -> Self {
        Self {
            month: 0,
            tool_cutter_type: 1,
            consuming_quantity: 2,
            worth: 3,
            year: 4,
            statistics_date: 5,
            tool_cutter_code: 6,
        }
    }
}
