//! Template Writer
//!
//! Writes the perspective tables into a pre-styled template. Row `i` of a
//! table lands on `first_data_row + i`; each column takes its style from the
//! template's reference row, read once per column and reused for every row.
//! A row that cannot be written becomes an [`ExportErrorInfo`] and the
//! remaining rows are still written.

pub mod xls_template;
pub mod xlsx_template;

use crate::codec::{DocumentKind, OpenedDocument};
use crate::config::{DeviceColumns, ExportConfig, PersonColumns, ToolCutterColumns};
use crate::error::{Error, Result};
use crate::model::{
    DevicePerspective, ExportErrorInfo, PersonPerspective, StatisticResult, ToolCutterPerspective,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::fmt::Write as _;

pub use xls_template::XlsTemplate;
pub use xlsx_template::XlsxTemplate;

/// Value written into one cell
#[derive(Debug, Clone, PartialEq)]
pub enum CellData {
    Text(String),
    Number(f64),
}

impl CellData {
    fn text(value: Option<&str>) -> Self {
        CellData::Text(value.unwrap_or_default().to_string())
    }

    fn integer(value: i32) -> Self {
        CellData::Number(f64::from(value))
    }

    fn decimal(value: Decimal) -> Self {
        CellData::Number(value.to_f64().unwrap_or_default())
    }
}

/// One sheet of a template open for writing
pub trait TemplateSheet {
    type Style: Clone;

    fn name(&self) -> &str;

    /// Style of an existing cell, or the default style when the cell is absent
    fn cell_style(&self, row: u32, col: u32) -> Result<Self::Style>;

    fn write_cell(&mut self, row: u32, col: u32, value: &CellData, style: &Self::Style)
    -> Result<()>;
}

/// A template workbook whose sheets are taken out, written and put back
pub trait TemplateWorkbook {
    type Sheet: TemplateSheet;

    fn take_sheet(&mut self, index: usize) -> Result<Self::Sheet>;

    fn put_sheet(&mut self, sheet: Self::Sheet) -> Result<()>;

    fn into_bytes(self) -> Result<Vec<u8>>;
}

/// Per-column style read from the reference row on first use
pub struct StyleCache<S> {
    reference_row: u32,
    styles: HashMap<u32, S>,
}

impl<S: Clone> StyleCache<S> {
    pub fn new(reference_row: u32) -> Self {
        Self {
            reference_row,
            styles: HashMap::new(),
        }
    }

    pub fn style_for<T>(&mut self, sheet: &T, col: u32) -> Result<S>
    where
        T: TemplateSheet<Style = S>,
    {
        if let Some(style) = self.styles.get(&col) {
            return Ok(style.clone());
        }
        let style = sheet.cell_style(self.reference_row, col)?;
        self.styles.insert(col, style.clone());
        Ok(style)
    }
}

/// Values shared by every row of one export
pub struct RowContext<'a> {
    month_names: &'a [String],
    statistics_date: String,
}

impl<'a> RowContext<'a> {
    /// Fails when the date format holds a specifier chrono cannot render
    pub fn new(config: &'a ExportConfig, statistics_date: NaiveDate) -> Result<Self> {
        let mut rendered = String::new();
        write!(
            rendered,
            "{}",
            statistics_date.format(&config.statistics_date_format)
        )
        .map_err(|_| {
            Error::malformed(format!(
                "statistics date format '{}' cannot be rendered",
                config.statistics_date_format
            ))
        })?;
        Ok(Self {
            month_names: &config.month_names,
            statistics_date: rendered,
        })
    }

    /// Display name of a zero-based month; empty when unknown
    fn month(&self, month: Option<u32>) -> CellData {
        let name = month.and_then(|m| self.month_names.get(m as usize));
        CellData::text(name.map(String::as_str))
    }

    fn statistics_date(&self) -> CellData {
        CellData::Text(self.statistics_date.clone())
    }
}

/// A perspective that renders to one row of cells
pub trait TableRow {
    type Columns;

    fn cells(&self, columns: &Self::Columns, context: &RowContext<'_>) -> Vec<(u32, CellData)>;
}

impl TableRow for PersonPerspective {
    type Columns = PersonColumns;

    fn cells(&self, columns: &PersonColumns, context: &RowContext<'_>) -> Vec<(u32, CellData)> {
        vec![
            (columns.month, context.month(self.month)),
            (columns.name, CellData::text(self.name.as_deref())),
            (columns.tool_cutter_type, CellData::text(self.tool_cutter_type.as_deref())),
            (columns.consuming_quantity, CellData::integer(self.consuming_quantity)),
            (columns.worth, CellData::decimal(self.worth)),
            (columns.returning_quantity, CellData::integer(self.returning_quantity)),
            (columns.device, CellData::text(self.device.as_deref())),
            (columns.year, CellData::integer(self.year.unwrap_or_default())),
            (columns.statistics_date, context.statistics_date()),
            (columns.tool_cutter_code, CellData::text(self.tool_cutter_code.as_deref())),
            (
                columns.returning_usage_g01_quantity,
                CellData::integer(self.returning_usage_g01_quantity),
            ),
            (
                columns.returning_usage_g02_quantity,
                CellData::integer(self.returning_usage_g02_quantity),
            ),
            (
                columns.returning_usage_g03_quantity,
                CellData::integer(self.returning_usage_g03_quantity),
            ),
        ]
    }
}

impl TableRow for DevicePerspective {
    type Columns = DeviceColumns;

    fn cells(&self, columns: &DeviceColumns, context: &RowContext<'_>) -> Vec<(u32, CellData)> {
        vec![
            (columns.month, context.month(self.month)),
            (columns.device, CellData::text(self.device.as_deref())),
            (columns.tool_cutter_type, CellData::text(self.tool_cutter_type.as_deref())),
            (columns.consuming_quantity, CellData::integer(self.consuming_quantity)),
            (columns.worth, CellData::decimal(self.worth)),
            (columns.year, CellData::integer(self.year.unwrap_or_default())),
            (columns.statistics_date, context.statistics_date()),
            (columns.tool_cutter_code, CellData::text(self.tool_cutter_code.as_deref())),
        ]
    }
}

impl TableRow for ToolCutterPerspective {
    type Columns = ToolCutterColumns;

    fn cells(&self, columns: &ToolCutterColumns, context: &RowContext<'_>) -> Vec<(u32, CellData)> {
        vec![
            (columns.month, context.month(self.month)),
            (columns.tool_cutter_type, CellData::text(self.tool_cutter_type.as_deref())),
            (columns.consuming_quantity, CellData::integer(self.consuming_quantity)),
            (columns.worth, CellData::decimal(self.worth)),
            (columns.year, CellData::integer(self.year.unwrap_or_default())),
            (columns.statistics_date, context.statistics_date()),
            (columns.tool_cutter_code, CellData::text(self.tool_cutter_code.as_deref())),
        ]
    }
}

/// Write `rows` into `sheet`, calling `on_row` after each row, written or not
pub fn write_table<S, R>(
    sheet: &mut S,
    first_data_row: u32,
    columns: &R::Columns,
    rows: &[R],
    context: &RowContext<'_>,
    on_row: &mut dyn FnMut(),
) -> Vec<ExportErrorInfo>
where
    S: TemplateSheet,
    R: TableRow,
{
    let mut styles = StyleCache::new(first_data_row);
    let mut errors = Vec::new();

    for (ordinal, row) in rows.iter().enumerate() {
        let target = u32::try_from(ordinal)
            .ok()
            .and_then(|ordinal| first_data_row.checked_add(ordinal));
        let written = match target {
            Some(target) => write_row(sheet, &mut styles, target, row.cells(columns, context)),
            None => Err(Error::CellOutOfBounds {
                row: u32::MAX,
                col: 0,
            }),
        };
        if let Err(e) = written {
            let row_index = target.unwrap_or(u32::MAX);
            log::warn!(
                "sheet '{}': row {} could not be exported: {}",
                sheet.name(),
                row_index,
                e
            );
            errors.push(ExportErrorInfo::new(
                sheet.name(),
                row_index,
                format!("row {} could not be exported: {}", row_index.saturating_add(1), e),
            ));
        }
        on_row();
    }
    errors
}

fn write_row<S: TemplateSheet>(
    sheet: &mut S,
    styles: &mut StyleCache<S::Style>,
    row: u32,
    cells: Vec<(u32, CellData)>,
) -> Result<()> {
    for (col, value) in cells {
        let style = styles.style_for(sheet, col)?;
        sheet.write_cell(row, col, &value, &style)?;
    }
    Ok(())
}

/// Write all three perspective tables into their configured sheets
pub fn write_statistic<W: TemplateWorkbook>(
    workbook: &mut W,
    config: &ExportConfig,
    result: &StatisticResult,
    statistics_date: NaiveDate,
    on_row: &mut dyn FnMut(),
) -> Result<Vec<ExportErrorInfo>> {
    let context = RowContext::new(config, statistics_date)?;
    let mut errors = Vec::new();

    let mut sheet = workbook.take_sheet(config.person.sheet_index)?;
    errors.extend(write_table(
        &mut sheet,
        config.person.first_data_row,
        &config.person.column_index,
        &result.person_perspectives,
        &context,
        on_row,
    ));
    workbook.put_sheet(sheet)?;

    let mut sheet = workbook.take_sheet(config.device.sheet_index)?;
    errors.extend(write_table(
        &mut sheet,
        config.device.first_data_row,
        &config.device.column_index,
        &result.device_perspectives,
        &context,
        on_row,
    ));
    workbook.put_sheet(sheet)?;

    let mut sheet = workbook.take_sheet(config.tool_cutter.sheet_index)?;
    errors.extend(write_table(
        &mut sheet,
        config.tool_cutter.first_data_row,
        &config.tool_cutter.column_index,
        &result.tool_cutter_perspectives,
        &context,
        on_row,
    ));
    workbook.put_sheet(sheet)?;

    Ok(errors)
}

/// A loaded template of either kind
pub enum Template {
    Xls(XlsTemplate),
    Xlsx(XlsxTemplate),
}

impl Template {
    pub fn load(document: OpenedDocument) -> Result<Self> {
        Ok(match document.kind {
            DocumentKind::Xls => Template::Xls(XlsTemplate::load(document.bytes)?),
            DocumentKind::Xlsx => Template::Xlsx(XlsxTemplate::load(document.bytes)?),
        })
    }

    pub fn kind(&self) -> DocumentKind {
        match self {
            Template::Xls(_) => DocumentKind::Xls,
            Template::Xlsx(_) => DocumentKind::Xlsx,
        }
    }

    pub fn write_statistic(
        &mut self,
        config: &ExportConfig,
        result: &StatisticResult,
        statistics_date: NaiveDate,
        on_row: &mut dyn FnMut(),
    ) -> Result<Vec<ExportErrorInfo>> {
        match self {
            Template::Xls(template) => {
                write_statistic(template, config, result, statistics_date, on_row)
            }
            Template::Xlsx(template) => {
                write_statistic(template, config, result, statistics_date, on_row)
            }
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Template::Xls(template) => template.into_bytes(),
            Template::Xlsx(template) => template.into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::str::FromStr;

    /// Records every write and counts style lookups
    struct MockSheet {
        style_reads: Cell<usize>,
        writes: Vec<(u32, u32, CellData, Rc<String>)>,
        fail_on_row: Option<u32>,
    }

    impl MockSheet {
        fn new() -> Self {
            Self {
                style_reads: Cell::new(0),
                writes: Vec::new(),
                fail_on_row: None,
            }
        }

        fn value_at(&self, row: u32, col: u32) -> Option<&CellData> {
            self.writes
                .iter()
                .find(|(r, c, _, _)| *r == row && *c == col)
                .map(|(_, _, value, _)| value)
        }
    }

    impl TemplateSheet for MockSheet {
        type Style = Rc<String>;

        fn name(&self) -> &str {
            "Mock"
        }

        fn cell_style(&self, row: u32, col: u32) -> Result<Rc<String>> {
            self.style_reads.set(self.style_reads.get() + 1);
            Ok(Rc::new(format!("style {}:{}", row, col)))
        }

        fn write_cell(&mut self, row: u32, col: u32, value: &CellData, style: &Rc<String>) -> Result<()> {
            if self.fail_on_row == Some(row) {
                return Err(Error::CellOutOfBounds { row, col });
            }
            self.writes.push((row, col, value.clone(), Rc::clone(style)));
            Ok(())
        }
    }

    fn tool_cutter(month: Option<u32>, quantity: i32) -> ToolCutterPerspective {
        ToolCutterPerspective {
            year: Some(2024),
            month,
            tool_cutter_type: Some("X".to_string()),
            tool_cutter_code: None,
            consuming_quantity: quantity,
            worth: Decimal::from_str("15.50").unwrap(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
    }

    #[test]
    fn test_style_read_once_per_column() {
        let config = ExportConfig::default();
        let context = RowContext::new(&config, date()).unwrap();
        let rows: Vec<ToolCutterPerspective> = (0..100).map(|i| tool_cutter(Some(3), i)).collect();
        let columns = ToolCutterColumns {
            month: 9,
            tool_cutter_type: 9,
            consuming_quantity: 9,
            worth: 9,
            year: 9,
            statistics_date: 9,
            tool_cutter_code: 9,
        };
        let mut sheet = MockSheet::new();
        let mut ticks = 0;

        let errors = write_table(&mut sheet, 1, &columns, &rows, &context, &mut || ticks += 1);

        assert!(errors.is_empty());
        assert_eq!(ticks, 100);
        assert_eq!(sheet.style_reads.get(), 1);
        assert_eq!(sheet.writes.len(), 700);
        let first = &sheet.writes[0].3;
        assert!(sheet.writes.iter().all(|(_, _, _, style)| Rc::ptr_eq(style, first)));
    }

    #[test]
    fn test_rows_land_after_first_data_row() {
        let config = ExportConfig::default();
        let context = RowContext::new(&config, date()).unwrap();
        let rows = vec![tool_cutter(Some(3), 5), tool_cutter(None, 7)];
        let columns = &config.tool_cutter.column_index;
        let mut sheet = MockSheet::new();

        write_table(&mut sheet, 4, columns, &rows, &context, &mut || {});

        assert_eq!(sheet.value_at(4, 0), Some(&CellData::Text("4月".to_string())));
        assert_eq!(sheet.value_at(4, 2), Some(&CellData::Number(5.0)));
        assert_eq!(sheet.value_at(4, 3), Some(&CellData::Number(15.5)));
        assert_eq!(sheet.value_at(4, 4), Some(&CellData::Number(2024.0)));
        assert_eq!(sheet.value_at(4, 5), Some(&CellData::Text("2024-05-06".to_string())));
        assert_eq!(sheet.value_at(4, 6), Some(&CellData::Text(String::new())));
        assert_eq!(sheet.value_at(5, 0), Some(&CellData::Text(String::new())));
        assert_eq!(sheet.value_at(5, 2), Some(&CellData::Number(7.0)));
    }

    #[test]
    fn test_out_of_range_month_is_empty() {
        let config = ExportConfig::default();
        let context = RowContext::new(&config, date()).unwrap();
        assert_eq!(context.month(Some(12)), CellData::Text(String::new()));
        assert_eq!(context.month(Some(0)), CellData::Text("1月".to_string()));
    }

    #[test]
    fn test_failed_row_is_isolated() {
        let config = ExportConfig::default();
        let context = RowContext::new(&config, date()).unwrap();
        let rows = vec![tool_cutter(Some(0), 1), tool_cutter(Some(1), 2), tool_cutter(Some(2), 3)];
        let mut sheet = MockSheet::new();
        sheet.fail_on_row = Some(2);
        let mut ticks = 0;

        let errors = write_table(
            &mut sheet,
            1,
            &config.tool_cutter.column_index,
            &rows,
            &context,
            &mut || ticks += 1,
        );

        assert_eq!(ticks, 3);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_index, 2);
        assert_eq!(errors[0].sheet_name, "Mock");
        assert_eq!(sheet.value_at(3, 2), Some(&CellData::Number(3.0)));
    }

    #[test]
    fn test_person_row_defaults() {
        let config = ExportConfig::default();
        let context = RowContext::new(&config, date()).unwrap();
        let person = PersonPerspective {
            year: None,
            month: None,
            name: None,
            tool_cutter_type: None,
            device: None,
            tool_cutter_code: None,
            consuming_quantity: 0,
            worth: Decimal::ZERO,
            returning_quantity: 0,
            returning_usage_g01_quantity: 0,
            returning_usage_g02_quantity: 4,
            returning_usage_g03_quantity: 0,
        };

        let cells = person.cells(&config.person.column_index, &context);
        assert_eq!(cells.len(), 13);
        assert!(cells.contains(&(0, CellData::Text(String::new()))));
        assert!(cells.contains(&(7, CellData::Number(0.0))));
        assert!(cells.contains(&(11, CellData::Number(4.0))));
    }

    #[test]
    fn test_unrenderable_date_format_is_an_error() {
        let config = ExportConfig {
            statistics_date_format: "%Y-%Q".to_string(),
            ..ExportConfig::default()
        };
        assert!(matches!(
            RowContext::new(&config, date()),
            Err(Error::Malformed(_))
        ));
    }
}
