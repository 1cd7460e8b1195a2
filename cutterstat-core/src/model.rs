//! Records flowing through the import, statistic and export runs

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One consumption event read from an import row
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DetailRecord {
    pub tool_cutter_type: Option<String>,
    pub device: Option<String>,
    pub consuming_quantity: Option<i32>,
    pub worth: Option<Decimal>,
    pub consuming_person: Option<String>,
    pub consuming_date: Option<NaiveDate>,
    pub remark: Option<String>,
    pub sheet_name: String,
    pub returning_quantity: Option<i32>,
    pub returning_usage_info: Option<String>,
    pub tool_cutter_code: Option<String>,
}

impl DetailRecord {
    /// Calendar year of the consuming date
    pub fn year(&self) -> Option<i32> {
        self.consuming_date.map(|date| date.year())
    }

    /// Zero-based month (0 = January) of the consuming date
    pub fn month(&self) -> Option<u32> {
        self.consuming_date.map(|date| date.month0())
    }
}

/// Sub-classification of a returned tool cutter, derived from the usage note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageGrade {
    G01,
    G02,
    G03,
}

impl fmt::Display for UsageGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UsageGrade::G01 => "G01",
            UsageGrade::G02 => "G02",
            UsageGrade::G03 => "G03",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersonPerspectiveKey {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub name: Option<String>,
    pub tool_cutter_type: Option<String>,
    pub device: Option<String>,
    pub tool_cutter_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePerspectiveKey {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub tool_cutter_type: Option<String>,
    pub device: Option<String>,
    pub tool_cutter_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolCutterPerspectiveKey {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub tool_cutter_type: Option<String>,
    pub tool_cutter_code: Option<String>,
}

/// Consumption aggregated by person, tool cutter type, device and code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonPerspective {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub name: Option<String>,
    pub tool_cutter_type: Option<String>,
    pub device: Option<String>,
    pub tool_cutter_code: Option<String>,
    pub consuming_quantity: i32,
    pub worth: Decimal,
    pub returning_quantity: i32,
    pub returning_usage_g01_quantity: i32,
    pub returning_usage_g02_quantity: i32,
    pub returning_usage_g03_quantity: i32,
}

/// Consumption aggregated by device, tool cutter type and code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePerspective {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub tool_cutter_type: Option<String>,
    pub device: Option<String>,
    pub tool_cutter_code: Option<String>,
    pub consuming_quantity: i32,
    pub worth: Decimal,
}

/// Consumption aggregated by tool cutter type and code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCutterPerspective {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub tool_cutter_type: Option<String>,
    pub tool_cutter_code: Option<String>,
    pub consuming_quantity: i32,
    pub worth: Decimal,
}

/// The three perspective tables, each in first-seen key order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticResult {
    pub person_perspectives: Vec<PersonPerspective>,
    pub device_perspectives: Vec<DevicePerspective>,
    pub tool_cutter_perspectives: Vec<ToolCutterPerspective>,
}

impl StatisticResult {
    /// Number of rows an export of this result writes
    pub fn row_count(&self) -> usize {
        self.person_perspectives.len()
            + self.device_perspectives.len()
            + self.tool_cutter_perspectives.len()
    }
}

/// A row that could not be imported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportErrorInfo {
    pub id: Uuid,
    pub sheet_name: String,
    pub row_index: u32,
    pub message: String,
}

impl ImportErrorInfo {
    pub fn new(sheet_name: impl Into<String>, row_index: u32, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sheet_name: sheet_name.into(),
            row_index,
            message: message.into(),
        }
    }
}

/// A row that could not be exported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportErrorInfo {
    pub id: Uuid,
    pub sheet_name: String,
    pub row_index: u32,
    pub message: String,
}

impl ExportErrorInfo {
    pub fn new(sheet_name: impl Into<String>, row_index: u32, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sheet_name: sheet_name.into(),
            row_index,
            message: message.into(),
        }
    }
}
