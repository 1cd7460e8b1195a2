//! xls template back end
//!
//! The target sheet's cell table (ROW and cell records) is unpacked into a
//! row/column map, written, and packed back. Records before and after the
//! cell table are kept as they are. INDEX and DBCELL hold stream offsets
//! that go stale once the table changes, so they are dropped.

use super::{CellData, TemplateSheet, TemplateWorkbook};
use crate::codec::biff::{
    self, ARRAY, BLANK, BOOLERR, DBCELL, DIMENSIONS, FORMULA, INDEX, LABEL, LABELSST, MULBLANK,
    MULRK, NUMBER, RK, ROW, RSTRING, Record, SHRFMLA, STRING, TABLE, WorkbookStream,
};
use crate::codec::{read_stream, replace_stream, workbook_stream_name};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::io::Cursor;

const MAX_ROW: u32 = 65_535;
const MAX_COL: u32 = 255;
const MAX_LABEL_CHARS: usize = 255;

/// XF index of the default cell style
const DEFAULT_XF: u16 = 0x000F;
const WINDOW2: u16 = 0x023E;
const ROWS_PER_BLOCK: usize = 32;

pub struct XlsTemplate {
    container: Vec<u8>,
    stream_name: &'static str,
    workbook: WorkbookStream,
}

impl XlsTemplate {
    pub fn load(container: Vec<u8>) -> Result<Self> {
        let mut compound = cfb::CompoundFile::open(Cursor::new(&container[..]))?;
        let stream_name = workbook_stream_name(&compound)
            .ok_or_else(|| Error::malformed("xls container has no Workbook stream"))?;
        let stream = read_stream(&mut compound, stream_name)?;
        drop(compound);

        Ok(Self {
            workbook: WorkbookStream::parse(&stream)?,
            container,
            stream_name,
        })
    }
}

impl TemplateWorkbook for XlsTemplate {
    type Sheet = XlsSheet;

    fn take_sheet(&mut self, index: usize) -> Result<XlsSheet> {
        let name = self
            .workbook
            .sheet_name(index)
            .ok_or(Error::SheetNotFound(index))?;
        let records = std::mem::take(self.workbook.sheet_mut(index)?);
        XlsSheet::parse(index, name, records)
    }

    fn put_sheet(&mut self, sheet: XlsSheet) -> Result<()> {
        let index = sheet.index;
        *self.workbook.sheet_mut(index)? = sheet.into_records();
        Ok(())
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        replace_stream(&self.container, self.stream_name, &self.workbook.to_bytes())
    }
}

/// One worksheet substream with its cell table unpacked
pub struct XlsSheet {
    index: usize,
    name: String,
    prefix: Vec<Record>,
    /// ROW records by row
    rows: BTreeMap<u16, Record>,
    /// Cell record, plus the records that belong to a FORMULA, by (row, column)
    cells: BTreeMap<(u16, u16), Vec<Record>>,
    suffix: Vec<Record>,
}

#[derive(PartialEq)]
enum Phase {
    Prefix,
    Table,
    Suffix,
}

fn is_cell(id: u16) -> bool {
    matches!(
        id,
        BLANK | NUMBER | LABEL | BOOLERR | RK | LABELSST | MULRK | MULBLANK | FORMULA | RSTRING
    )
}

fn follows_formula(id: u16) -> bool {
    matches!(id, STRING | SHRFMLA | ARRAY | TABLE)
}

impl XlsSheet {
    fn parse(index: usize, name: String, records: Vec<Record>) -> Result<Self> {
        let mut sheet = Self {
            index,
            name,
            prefix: Vec::new(),
            rows: BTreeMap::new(),
            cells: BTreeMap::new(),
            suffix: Vec::new(),
        };
        let mut phase = Phase::Prefix;
        let mut last_cell: Option<(u16, u16)> = None;

        for record in records {
            if phase != Phase::Suffix && (record.id == ROW || is_cell(record.id)) {
                phase = Phase::Table;
                last_cell = sheet.add_table_record(record)?;
                continue;
            }
            match phase {
                Phase::Prefix => {
                    if record.id == INDEX {
                        continue;
                    }
                    let ends_prefix = record.id == DIMENSIONS;
                    sheet.prefix.push(record);
                    if ends_prefix {
                        phase = Phase::Table;
                    }
                }
                Phase::Table if record.id == DBCELL => {}
                Phase::Table if follows_formula(record.id) => {
                    let group = last_cell.and_then(|key| sheet.cells.get_mut(&key));
                    match group {
                        Some(group) => group.push(record),
                        None => {
                            return Err(Error::malformed(format!(
                                "record 0x{:04X} does not follow a formula",
                                record.id
                            )));
                        }
                    }
                }
                Phase::Table | Phase::Suffix => {
                    phase = Phase::Suffix;
                    sheet.suffix.push(record);
                }
            }
        }

        if phase == Phase::Prefix {
            // no DIMENSIONS and no cells: the table goes before the view settings
            let split = sheet
                .prefix
                .iter()
                .position(|r| r.id == WINDOW2 || r.id == biff::EOF)
                .unwrap_or(sheet.prefix.len());
            sheet.suffix = sheet.prefix.split_off(split);
        }
        Ok(sheet)
    }

    /// File a ROW or cell record; returns the cell it belongs to
    fn add_table_record(&mut self, record: Record) -> Result<Option<(u16, u16)>> {
        let truncated = || Error::malformed(format!("record 0x{:04X} is truncated", record.id));
        let row = record.u16_at(0).ok_or_else(truncated)?;
        if record.id == ROW {
            self.rows.insert(row, record);
            return Ok(None);
        }
        let first_col = record.u16_at(2).ok_or_else(truncated)?;

        match record.id {
            MULRK => {
                let count = record.data.len().saturating_sub(6) / 6;
                for i in 0..count {
                    let at = 4 + i * 6;
                    let mut data = Vec::with_capacity(10);
                    data.extend_from_slice(&row.to_le_bytes());
                    data.extend_from_slice(&(first_col + i as u16).to_le_bytes());
                    data.extend_from_slice(&record.data[at..at + 6]);
                    self.cells
                        .insert((row, first_col + i as u16), vec![Record::new(RK, data)]);
                }
                Ok(None)
            }
            MULBLANK => {
                let count = record.data.len().saturating_sub(6) / 2;
                for i in 0..count {
                    let at = 4 + i * 2;
                    let mut data = Vec::with_capacity(6);
                    data.extend_from_slice(&row.to_le_bytes());
                    data.extend_from_slice(&(first_col + i as u16).to_le_bytes());
                    data.extend_from_slice(&record.data[at..at + 2]);
                    self.cells
                        .insert((row, first_col + i as u16), vec![Record::new(BLANK, data)]);
                }
                Ok(None)
            }
            _ => {
                self.cells.insert((row, first_col), vec![record]);
                Ok(Some((row, first_col)))
            }
        }
    }

    fn into_records(mut self) -> Vec<Record> {
        self.update_dimensions();

        let mut row_numbers: Vec<u16> = self.rows.keys().copied().collect();
        row_numbers.extend(self.cells.keys().map(|(row, _)| *row));
        row_numbers.sort_unstable();
        row_numbers.dedup();

        let mut records = std::mem::take(&mut self.prefix);
        for block in row_numbers.chunks(ROWS_PER_BLOCK) {
            for row in block {
                records.push(self.row_record(*row));
            }
            for row in block {
                for (_, group) in self.cells.range((*row, 0)..=(*row, u16::MAX)) {
                    records.extend(group.iter().cloned());
                }
            }
        }
        records.append(&mut self.suffix);
        records
    }

    /// ROW record with its column span refreshed
    fn row_record(&self, row: u16) -> Record {
        let mut record = self.rows.get(&row).cloned().unwrap_or_else(|| {
            let mut data = Vec::with_capacity(16);
            data.extend_from_slice(&row.to_le_bytes());
            data.extend_from_slice(&[0, 0, 0, 0]);
            data.extend_from_slice(&0x00FFu16.to_le_bytes());
            data.extend_from_slice(&[0, 0, 0, 0]);
            data.extend_from_slice(&0x0100u16.to_le_bytes());
            data.extend_from_slice(&DEFAULT_XF.to_le_bytes());
            Record::new(ROW, data)
        });

        let mut cols = self
            .cells
            .range((row, 0)..=(row, u16::MAX))
            .map(|((_, col), _)| *col);
        if let Some(first) = cols.next() {
            let last = cols.last().unwrap_or(first);
            set_u16(&mut record, 2, first);
            set_u16(&mut record, 4, last + 1);
        }
        record
    }

    fn update_dimensions(&mut self) {
        let Some(record) = self.prefix.iter_mut().find(|r| r.id == DIMENSIONS) else {
            return;
        };
        if record.data.len() < 12 {
            return;
        }
        let (mut first_row, mut last_row) = (u32::MAX, 0u32);
        let (mut first_col, mut last_col) = (u16::MAX, 0u16);
        for (row, col) in self.cells.keys() {
            first_row = first_row.min(u32::from(*row));
            last_row = last_row.max(u32::from(*row));
            first_col = first_col.min(*col);
            last_col = last_col.max(*col);
        }
        if first_row == u32::MAX {
            record.data[..12].fill(0);
            return;
        }
        record.data[0..4].copy_from_slice(&first_row.to_le_bytes());
        record.data[4..8].copy_from_slice(&(last_row + 1).to_le_bytes());
        record.data[8..10].copy_from_slice(&first_col.to_le_bytes());
        record.data[10..12].copy_from_slice(&(last_col + 1).to_le_bytes());
    }
}

fn set_u16(record: &mut Record, offset: usize, value: u16) {
    if let Some(slot) = record.data.get_mut(offset..offset + 2) {
        slot.copy_from_slice(&value.to_le_bytes());
    }
}

impl TemplateSheet for XlsSheet {
    /// XF index
    type Style = u16;

    fn name(&self) -> &str {
        &self.name
    }

    fn cell_style(&self, row: u32, col: u32) -> Result<u16> {
        let (Ok(row), Ok(col)) = (u16::try_from(row), u16::try_from(col)) else {
            return Ok(DEFAULT_XF);
        };
        Ok(self
            .cells
            .get(&(row, col))
            .and_then(|group| group.first())
            .and_then(|record| record.u16_at(4))
            .unwrap_or(DEFAULT_XF))
    }

    fn write_cell(&mut self, row: u32, col: u32, value: &CellData, style: &u16) -> Result<()> {
        if row > MAX_ROW || col > MAX_COL {
            return Err(Error::CellOutOfBounds { row, col });
        }
        let (row, col) = (row as u16, col as u16);

        let mut data = Vec::new();
        data.extend_from_slice(&row.to_le_bytes());
        data.extend_from_slice(&col.to_le_bytes());
        data.extend_from_slice(&style.to_le_bytes());
        let record = match value {
            CellData::Text(text) => {
                if text.encode_utf16().count() > MAX_LABEL_CHARS {
                    return Err(Error::malformed(format!(
                        "text longer than {} characters does not fit an xls cell",
                        MAX_LABEL_CHARS
                    )));
                }
                biff::write_unicode_string(&mut data, text);
                Record::new(LABEL, data)
            }
            CellData::Number(number) => {
                data.extend_from_slice(&number.to_le_bytes());
                Record::new(NUMBER, data)
            }
        };
        self.cells.insert((row, col), vec![record]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::biff::fixtures::{label, number, workbook};
    use crate::codec::fixtures::xls_container;
    use calamine::{Data, Reader, Xls};

    fn rk(row: u16, col: u16, xf: u16, value: i32) -> Record {
        let mut data = Vec::new();
        data.extend_from_slice(&row.to_le_bytes());
        data.extend_from_slice(&col.to_le_bytes());
        data.extend_from_slice(&xf.to_le_bytes());
        data.extend_from_slice(&(((value as u32) << 2) | 0x02).to_le_bytes());
        Record::new(RK, data)
    }

    fn template() -> XlsTemplate {
        let stream = workbook(&[
            ("Person", vec![label(0, 0, 15, "Month"), number(1, 0, 20, 0.0)]),
            ("Device", vec![]),
        ]);
        XlsTemplate::load(xls_container(&stream)).unwrap()
    }

    #[test]
    fn test_style_comes_from_reference_cell() {
        let mut template = template();
        let sheet = template.take_sheet(0).unwrap();
        assert_eq!(sheet.name(), "Person");
        assert_eq!(sheet.cell_style(1, 0).unwrap(), 20);
        assert_eq!(sheet.cell_style(1, 4).unwrap(), DEFAULT_XF);
    }

    #[test]
    fn test_mulrk_is_expanded() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes());
        for (xf, value) in [(16u16, 7i32), (17, 8)] {
            data.extend_from_slice(&xf.to_le_bytes());
            data.extend_from_slice(&(((value as u32) << 2) | 0x02).to_le_bytes());
        }
        data.extend_from_slice(&2u16.to_le_bytes());

        let sheet = XlsSheet::parse(
            0,
            "S".to_string(),
            vec![Record::new(MULRK, data), rk(4, 0, 18, 1)],
        )
        .unwrap();
        assert_eq!(sheet.cell_style(3, 1).unwrap(), 16);
        assert_eq!(sheet.cell_style(3, 2).unwrap(), 17);
        assert_eq!(sheet.cell_style(4, 0).unwrap(), 18);
    }

    #[test]
    fn test_cell_limits() {
        let mut template = template();
        let mut sheet = template.take_sheet(0).unwrap();
        let result = sheet.write_cell(MAX_ROW + 1, 0, &CellData::Number(1.0), &DEFAULT_XF);
        assert!(matches!(result, Err(Error::CellOutOfBounds { .. })));
        let result = sheet.write_cell(0, MAX_COL + 1, &CellData::Number(1.0), &DEFAULT_XF);
        assert!(matches!(result, Err(Error::CellOutOfBounds { .. })));
        let long = "x".repeat(MAX_LABEL_CHARS + 1);
        assert!(sheet.write_cell(0, 0, &CellData::Text(long), &DEFAULT_XF).is_err());
    }

    #[test]
    fn test_written_cells_are_readable() {
        let mut template = template();
        let mut sheet = template.take_sheet(0).unwrap();
        let style = sheet.cell_style(1, 0).unwrap();
        sheet
            .write_cell(1, 0, &CellData::Text("4月".to_string()), &style)
            .unwrap();
        sheet.write_cell(2, 1, &CellData::Number(5.5), &style).unwrap();
        template.put_sheet(sheet).unwrap();

        let mut device = template.take_sheet(1).unwrap();
        device.write_cell(1, 0, &CellData::Text("D1".to_string()), &DEFAULT_XF).unwrap();
        template.put_sheet(device).unwrap();

        let bytes = template.into_bytes().unwrap();
        let mut xls = Xls::new(Cursor::new(bytes)).unwrap();
        let person = xls.worksheet_range("Person").unwrap();
        assert_eq!(person.get_value((0, 0)), Some(&Data::String("Month".to_string())));
        assert_eq!(person.get_value((1, 0)), Some(&Data::String("4月".to_string())));
        assert_eq!(person.get_value((2, 1)), Some(&Data::Float(5.5)));

        let device = xls.worksheet_range("Device").unwrap();
        assert_eq!(device.get_value((1, 0)), Some(&Data::String("D1".to_string())));
    }
}
