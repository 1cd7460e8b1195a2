//! Tabular Record Extractor
//!
//! Turns the rows of every selected sheet into [`DetailRecord`]s. Each row
//! is extracted on its own: a cell that cannot be coerced fails only its
//! row, which becomes an [`ImportErrorInfo`]. Formula cells are recomputed
//! from the sheet; see [`formula`].

pub mod coerce;
pub mod formula;

use crate::codec::{DocumentKind, OpenedDocument};
use crate::config::{ImportConfig, full_match_regex};
use crate::error::Result;
use crate::model::{DetailRecord, ImportErrorInfo};
use calamine::{Data, Range, Reader, Sheets, Xls, Xlsx};
use formula::{CellRef, Evaluator};
use regex::Regex;
use std::io::Cursor;

/// Outcome of extracting one row
pub type RowOutcome = std::result::Result<DetailRecord, ImportErrorInfo>;

/// Decrypted workbook opened for reading
pub struct Workbook {
    sheets: Sheets<Cursor<Vec<u8>>>,
}

impl Workbook {
    pub fn open(document: OpenedDocument) -> Result<Self> {
        let cursor = Cursor::new(document.bytes);
        let sheets = match document.kind {
            DocumentKind::Xlsx => Sheets::Xlsx(Xlsx::new(cursor).map_err(calamine::Error::Xlsx)?),
            DocumentKind::Xls => Sheets::Xls(Xls::new(cursor).map_err(calamine::Error::Xls)?),
        };
        Ok(Self { sheets })
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names()
    }

    pub fn sheet(&mut self, name: &str) -> Result<SheetData> {
        let values = self.sheets.worksheet_range(name)?;
        let formulas = self.sheets.worksheet_formula(name)?;
        Ok(SheetData {
            name: name.to_string(),
            values,
            formulas,
        })
    }
}

/// Cached values and formulas of one sheet
pub struct SheetData {
    pub name: String,
    values: Range<Data>,
    formulas: Range<String>,
}

impl SheetData {
    /// Zero-based index of the last row holding a value or a formula
    pub fn last_row(&self) -> Option<u32> {
        let values = self.values.end().map(|(row, _)| row);
        let formulas = self.formulas.end().map(|(row, _)| row);
        values.max(formulas)
    }

    /// Cell value with its formula, if any, evaluated
    fn cell(&self, row: u32, col: u32) -> std::result::Result<Option<Data>, String> {
        Evaluator::new(&self.values, &self.formulas).cell(CellRef { row, col })
    }

    fn row_is_empty(&self, row: u32) -> bool {
        let no_values = match (self.values.start(), self.values.end()) {
            (Some((first, start_col)), Some((_, end_col))) if row >= first => (start_col..=end_col)
                .all(|col| matches!(self.values.get_value((row, col)), None | Some(Data::Empty))),
            _ => true,
        };
        let no_formulas = match (self.formulas.start(), self.formulas.end()) {
            (Some((first, start_col)), Some((_, end_col))) if row >= first => (start_col..=end_col)
                .all(|col| self.formulas.get_value((row, col)).is_none_or(String::is_empty)),
            _ => true,
        };
        no_values && no_formulas
    }
}

/// Extracts detail records from sheets selected by a full-match name filter
pub struct RecordExtractor<'a> {
    config: &'a ImportConfig,
    sheet_filter: Regex,
}

impl<'a> RecordExtractor<'a> {
    pub fn new(config: &'a ImportConfig) -> std::result::Result<Self, regex::Error> {
        Ok(Self {
            config,
            sheet_filter: full_match_regex(&config.valid_sheet_name_regex)?,
        })
    }

    pub fn accepts(&self, sheet_name: &str) -> bool {
        self.sheet_filter.is_match(sheet_name)
    }

    /// Load every sheet whose name passes the filter, in workbook order
    pub fn select_sheets(&self, workbook: &mut Workbook) -> Result<Vec<SheetData>> {
        let mut selected = Vec::new();
        for name in workbook.sheet_names() {
            if self.accepts(&name) {
                selected.push(workbook.sheet(&name)?);
            } else {
                log::debug!("skipping sheet '{}'", name);
            }
        }
        Ok(selected)
    }

    /// Rows from the first data row through the last populated row
    pub fn data_rows(&self, sheet: &SheetData) -> std::ops::Range<u32> {
        match sheet.last_row() {
            Some(last) if last >= self.config.first_data_row => self.config.first_data_row..last + 1,
            _ => 0..0,
        }
    }

    pub fn row_count(&self, sheets: &[SheetData]) -> usize {
        sheets.iter().map(|s| self.data_rows(s).len()).sum()
    }

    pub fn rows<'s>(&'s self, sheet: &'s SheetData) -> impl Iterator<Item = RowOutcome> + 's {
        self.data_rows(sheet).map(move |row| self.extract_row(sheet, row))
    }

    pub fn extract_row(&self, sheet: &SheetData, row: u32) -> RowOutcome {
        self.read_row(sheet, row).map_err(|cause| {
            ImportErrorInfo::new(
                sheet.name.as_str(),
                row,
                format!("row {} could not be imported: {}", row + 1, cause),
            )
        })
    }

    fn read_row(&self, sheet: &SheetData, row: u32) -> std::result::Result<DetailRecord, String> {
        if sheet.row_is_empty(row) {
            return Err("row is missing".to_string());
        }

        let columns = &self.config.column_index;

        Ok(DetailRecord {
            tool_cutter_type: field(
                sheet,
                row,
                columns.tool_cutter_type,
                "tool cutter type",
                coerce::text,
            )?,
            device: field(sheet, row, columns.device, "device", coerce::text)?,
            consuming_quantity: field(
                sheet,
                row,
                columns.consuming_quantity,
                "consuming quantity",
                coerce::integer,
            )?,
            worth: field(sheet, row, columns.worth, "worth", coerce::decimal)?,
            consuming_person: field(
                sheet,
                row,
                columns.consuming_person,
                "consuming person",
                coerce::text,
            )?,
            consuming_date: field(
                sheet,
                row,
                columns.consuming_date,
                "consuming date",
                coerce::date,
            )?,
            remark: field(sheet, row, columns.remark, "remark", coerce::text)?,
            sheet_name: sheet.name.clone(),
            returning_quantity: field(
                sheet,
                row,
                columns.returning_quantity,
                "returning quantity",
                coerce::integer,
            )?,
            returning_usage_info: field(
                sheet,
                row,
                columns.returning_usage_info,
                "returning usage",
                coerce::text,
            )?,
            tool_cutter_code: match columns.tool_cutter_code {
                Some(col) => field(sheet, row, col, "tool cutter code", coerce::text)?,
                None => None,
            },
        })
    }
}

/// Read one cell and coerce it, naming the field in any error
fn field<T>(
    sheet: &SheetData,
    row: u32,
    col: u32,
    name: &str,
    coerce: impl Fn(Option<&Data>) -> std::result::Result<T, String>,
) -> std::result::Result<T, String> {
    sheet
        .cell(row, col)
        .and_then(|value| coerce(value.as_ref()))
        .map_err(|e| format!("{}: {}", name, e))
}

/// Split row outcomes into records and errors, keeping their order
pub fn partition(
    outcomes: impl IntoIterator<Item = RowOutcome>,
) -> (Vec<DetailRecord>, Vec<ImportErrorInfo>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(record) => records.push(record),
            Err(error) => errors.push(error),
        }
    }
    (records, errors)
}
