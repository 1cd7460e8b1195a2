//! xlsx template back end
//!
//! The target worksheet's `sheetData` is rebuilt from a row/cell table in
//! which untouched cells keep their original markup. Every other part of
//! the package is copied unchanged, except the calculation chain which
//! would otherwise point at stale cells.

use super::{CellData, TemplateSheet, TemplateWorkbook};
use crate::error::{Error, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

const MAX_ROW: u32 = 1_048_575;
const MAX_COL: u32 = 16_383;

const CALC_CHAIN_PART: &str = "xl/calcChain.xml";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";

pub struct XlsxTemplate {
    /// Package parts in archive order
    parts: Vec<(String, Vec<u8>)>,
    /// Sheet name and worksheet part, in workbook order
    sheets: Vec<(String, String)>,
}

impl XlsxTemplate {
    pub fn load(bytes: Vec<u8>) -> Result<Self> {
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;
        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            parts.push((file.name().to_string(), data));
        }

        let mut template = Self {
            parts,
            sheets: Vec::new(),
        };
        let workbook = template.part_text(WORKBOOK_PART)?;
        let rels = template.part_text(WORKBOOK_RELS_PART)?;
        template.sheets = resolve_sheets(&workbook, &rels)?;
        Ok(template)
    }

    fn part(&self, name: &str) -> Option<&Vec<u8>> {
        self.parts.iter().find(|(n, _)| n == name).map(|(_, data)| data)
    }

    fn part_text(&self, name: &str) -> Result<String> {
        let data = self
            .part(name)
            .ok_or_else(|| Error::malformed(format!("package has no {} part", name)))?;
        String::from_utf8(data.clone())
            .map_err(|_| Error::malformed(format!("{} is not valid UTF-8", name)))
    }
}

impl TemplateWorkbook for XlsxTemplate {
    type Sheet = XlsxSheet;

    fn take_sheet(&mut self, index: usize) -> Result<XlsxSheet> {
        let (name, part) = self
            .sheets
            .get(index)
            .cloned()
            .ok_or(Error::SheetNotFound(index))?;
        let xml = self.part_text(&part)?;
        XlsxSheet::parse(name, part, &xml)
    }

    fn put_sheet(&mut self, sheet: XlsxSheet) -> Result<()> {
        let xml = sheet.to_xml()?;
        match self.parts.iter_mut().find(|(n, _)| *n == sheet.part) {
            Some((_, data)) => *data = xml.into_bytes(),
            None => return Err(Error::malformed(format!("package has no {} part", sheet.part))),
        }
        Ok(())
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buf));
            for (name, data) in &self.parts {
                let data = match name.as_str() {
                    CALC_CHAIN_PART => continue,
                    CONTENT_TYPES_PART => remove_calc_chain_content_type(data)?,
                    WORKBOOK_RELS_PART => remove_calc_chain_relationship(data)?,
                    _ => data.clone(),
                };
                zip.start_file(name.as_str(), FileOptions::<()>::default())?;
                zip.write_all(&data)?;
            }
            zip.finish()?;
        }
        Ok(buf)
    }
}

/// One worksheet part, split around its `sheetData`
pub struct XlsxSheet {
    name: String,
    part: String,
    head: String,
    tail: String,
    rows: BTreeMap<u32, XlsxRow>,
}

#[derive(Default)]
struct XlsxRow {
    /// Raw attributes other than `r` and `spans`
    attributes: Vec<(String, String)>,
    style: Option<String>,
    /// Raw `<c>` markup by column
    cells: BTreeMap<u32, String>,
}

impl XlsxSheet {
    fn parse(name: String, part: String, xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut head = None;
        let mut tail = None;
        let mut rows = BTreeMap::new();
        let mut current: Option<(u32, XlsxRow)> = None;
        let mut next_row = 0u32;
        let mut next_col = 0u32;

        loop {
            let before = reader.buffer_position() as usize;
            let event = reader.read_event()?;
            let after = reader.buffer_position() as usize;
            match event {
                Event::Start(e) if e.local_name().as_ref() == b"sheetData" => {
                    head = Some(xml[..after].to_string());
                }
                Event::Empty(e) if e.local_name().as_ref() == b"sheetData" => {
                    head = Some(format!("{}<sheetData>", &xml[..before]));
                    tail = Some(format!("</sheetData>{}", &xml[after..]));
                }
                Event::End(e) if e.local_name().as_ref() == b"sheetData" => {
                    tail = Some(xml[before..].to_string());
                }
                Event::Start(e) if head.is_some() && e.local_name().as_ref() == b"row" => {
                    let (number, row) = parse_row(&e, next_row)?;
                    next_row = number + 1;
                    next_col = 0;
                    current = Some((number, row));
                }
                Event::Empty(e) if head.is_some() && e.local_name().as_ref() == b"row" => {
                    let (number, row) = parse_row(&e, next_row)?;
                    next_row = number + 1;
                    rows.insert(number, row);
                }
                Event::End(e) if e.local_name().as_ref() == b"row" => {
                    if let Some((number, row)) = current.take() {
                        rows.insert(number, row);
                    }
                }
                Event::Start(e) if e.local_name().as_ref() == b"c" => {
                    let col = cell_column(&e, next_col)?;
                    reader.read_to_end(e.name())?;
                    let end = reader.buffer_position() as usize;
                    if let Some((_, row)) = current.as_mut() {
                        row.cells.insert(col, xml[before..end].trim_start().to_string());
                    }
                    next_col = col + 1;
                }
                Event::Empty(e) if e.local_name().as_ref() == b"c" => {
                    let col = cell_column(&e, next_col)?;
                    if let Some((_, row)) = current.as_mut() {
                        row.cells.insert(col, xml[before..after].trim_start().to_string());
                    }
                    next_col = col + 1;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        match (head, tail) {
            (Some(head), Some(tail)) => Ok(Self {
                name,
                part,
                head,
                tail,
                rows,
            }),
            _ => Err(Error::malformed("worksheet has no sheetData element")),
        }
    }

    fn to_xml(&self) -> Result<String> {
        let mut xml = update_dimension(&self.head, self.used_range())?;
        for (number, row) in &self.rows {
            xml.push_str(&format!("<row r=\"{}\"", number + 1));
            for (key, value) in &row.attributes {
                xml.push_str(&format!(" {}=\"{}\"", key, value));
            }
            if row.cells.is_empty() {
                xml.push_str("/>");
                continue;
            }
            xml.push('>');
            for cell in row.cells.values() {
                xml.push_str(cell);
            }
            xml.push_str("</row>");
        }
        xml.push_str(&self.tail);
        Ok(xml)
    }

    fn used_range(&self) -> Option<((u32, u32), (u32, u32))> {
        let first_row = *self.rows.iter().find(|(_, r)| !r.cells.is_empty())?.0;
        let last_row = *self.rows.iter().rev().find(|(_, r)| !r.cells.is_empty())?.0;
        let cols = self.rows.values().flat_map(|r| r.cells.keys().copied());
        let first_col = cols.clone().min()?;
        let last_col = cols.max()?;
        Some(((first_row, first_col), (last_row, last_col)))
    }
}

impl TemplateSheet for XlsxSheet {
    /// Raw value of the `s` attribute, `None` for the default style
    type Style = Option<String>;

    fn name(&self) -> &str {
        &self.name
    }

    fn cell_style(&self, row: u32, col: u32) -> Result<Option<String>> {
        let Some(template_row) = self.rows.get(&row) else {
            return Ok(None);
        };
        match template_row.cells.get(&col) {
            Some(cell) => {
                let mut reader = Reader::from_str(cell);
                match reader.read_event()? {
                    Event::Start(e) | Event::Empty(e) => attribute(&e, b"s"),
                    _ => Ok(None),
                }
            }
            None => Ok(template_row.style.clone()),
        }
    }

    fn write_cell(
        &mut self,
        row: u32,
        col: u32,
        value: &CellData,
        style: &Option<String>,
    ) -> Result<()> {
        if row > MAX_ROW || col > MAX_COL {
            return Err(Error::CellOutOfBounds { row, col });
        }
        let reference = cell_reference(row, col);
        let style = style
            .as_ref()
            .map(|s| format!(" s=\"{}\"", s))
            .unwrap_or_default();
        let markup = match value {
            CellData::Text(text) => format!(
                "<c r=\"{}\"{} t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                reference,
                style,
                quick_xml::escape::escape(text.as_str())
            ),
            CellData::Number(number) => {
                format!("<c r=\"{}\"{}><v>{}</v></c>", reference, style, number)
            }
        };
        self.rows.entry(row).or_default().cells.insert(col, markup);
        Ok(())
    }
}

fn parse_row(e: &BytesStart<'_>, default_number: u32) -> Result<(u32, XlsxRow)> {
    let mut number = default_number;
    let mut row = XlsxRow::default();
    for attr in e.attributes() {
        let attr = attr?;
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match attr.key.as_ref() {
            b"r" => {
                number = value
                    .parse::<u32>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .ok_or_else(|| Error::malformed(format!("invalid row number '{}'", value)))?;
            }
            b"spans" => {}
            key => {
                if key == b"s" {
                    row.style = Some(value.clone());
                }
                row.attributes
                    .push((String::from_utf8_lossy(key).into_owned(), value));
            }
        }
    }
    Ok((number, row))
}

fn cell_column(e: &BytesStart<'_>, default_col: u32) -> Result<u32> {
    match attribute(e, b"r")? {
        Some(reference) => parse_reference(&reference)
            .map(|(_, col)| col)
            .ok_or_else(|| Error::malformed(format!("invalid cell reference '{}'", reference))),
        None => Ok(default_col),
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// `B3` for row 2, column 1
pub fn cell_reference(row: u32, col: u32) -> String {
    let mut letters = Vec::new();
    let mut n = col;
    loop {
        letters.push(b'A' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.reverse();
    format!("{}{}", String::from_utf8_lossy(&letters), row + 1)
}

/// Zero-based (row, column) of an A1 reference
pub fn parse_reference(reference: &str) -> Option<(u32, u32)> {
    let split = reference.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = reference.split_at(split);
    if letters.is_empty() {
        return None;
    }
    let mut col: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        col = col.checked_mul(26)?.checked_add(c as u32 - 'A' as u32 + 1)?;
    }
    let row: u32 = digits.parse().ok()?;
    Some((row.checked_sub(1)?, col - 1))
}

fn update_dimension(head: &str, range: Option<((u32, u32), (u32, u32))>) -> Result<String> {
    let Some(((first_row, first_col), (last_row, last_col))) = range else {
        return Ok(head.to_string());
    };
    let reference = if (first_row, first_col) == (last_row, last_col) {
        cell_reference(first_row, first_col)
    } else {
        format!(
            "{}:{}",
            cell_reference(first_row, first_col),
            cell_reference(last_row, last_col)
        )
    };
    let pattern = Regex::new(r#"(<(?:\w+:)?dimension\s+ref=")[^"]*""#)
        .map_err(|e| Error::malformed(e.to_string()))?;
    Ok(pattern
        .replace(head, |caps: &regex::Captures<'_>| format!("{}{}\"", &caps[1], reference))
        .into_owned())
}

/// Sheet names and worksheet parts, following `r:id` through the workbook relationships
fn resolve_sheets(workbook_xml: &str, rels_xml: &str) -> Result<Vec<(String, String)>> {
    let mut targets = Vec::new();
    let mut reader = Reader::from_str(rels_xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attribute(&e, b"Id")?, attribute(&e, b"Target")?)
                {
                    targets.push((id, target));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let mut sheets = Vec::new();
    let mut reader = Reader::from_str(workbook_xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                let mut name = None;
                let mut id = None;
                for attr in e.attributes() {
                    let attr = attr?;
                    if attr.key.as_ref() == b"name" {
                        name = Some(attr.unescape_value()?.into_owned());
                    } else if attr.key.local_name().as_ref() == b"id" {
                        id = Some(attr.unescape_value()?.into_owned());
                    }
                }
                let (Some(name), Some(id)) = (name, id) else {
                    return Err(Error::malformed("workbook sheet entry lacks a name or r:id"));
                };
                let target = targets
                    .iter()
                    .find(|(rel_id, _)| *rel_id == id)
                    .map(|(_, target)| target.as_str())
                    .ok_or_else(|| {
                        Error::malformed(format!("sheet '{}' has no relationship {}", name, id))
                    })?;
                let part = match target.strip_prefix('/') {
                    Some(absolute) => absolute.to_string(),
                    None => format!("xl/{}", target),
                };
                sheets.push((name, part));
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(sheets)
}

/// Copy `xml`, dropping empty elements named `element` that `drop` selects
fn filter_elements(
    xml: &[u8],
    element: &[u8],
    drop: impl Fn(&BytesStart<'_>) -> Result<bool>,
) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(xml).map_err(|_| Error::malformed("part is not valid UTF-8"))?;
    let mut reader = Reader::from_str(text);
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.local_name().as_ref() == element => {
                if !drop(&e)? {
                    writer.write_event(Event::Empty(e))?;
                }
            }
            Event::Eof => break,
            e => writer.write_event(e)?,
        }
    }
    Ok(writer.into_inner().into_inner())
}

fn remove_calc_chain_content_type(xml: &[u8]) -> Result<Vec<u8>> {
    filter_elements(xml, b"Override", |e| {
        Ok(attribute(e, b"PartName")?.as_deref() == Some("/xl/calcChain.xml"))
    })
}

fn remove_calc_chain_relationship(xml: &[u8]) -> Result<Vec<u8>> {
    filter_elements(xml, b"Relationship", |e| {
        Ok(attribute(e, b"Type")?.is_some_and(|t| t.ends_with("/calcChain")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Value, sheet_xml, xlsx_package};

    const STYLED_SHEET: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
        r#"<dimension ref="A1:B2"/><sheetData>"#,
        r#"<row r="1" spans="1:2"><c r="A1" t="inlineStr"><is><t>Month</t></is></c><c r="B1" s="1"><v>0</v></c></row>"#,
        r#"<row r="2" s="7" customFormat="1"><c r="A2" s="3"/></row>"#,
        r#"</sheetData><pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/></worksheet>"#
    );

    fn sheet() -> XlsxSheet {
        XlsxSheet::parse("Data".to_string(), "xl/worksheets/sheet1.xml".to_string(), STYLED_SHEET)
            .unwrap()
    }

    #[test]
    fn test_references() {
        assert_eq!(cell_reference(0, 0), "A1");
        assert_eq!(cell_reference(9, 27), "AB10");
        assert_eq!(parse_reference("AB10"), Some((9, 27)));
        assert_eq!(parse_reference("XFD1048576"), Some((MAX_ROW, MAX_COL)));
        assert_eq!(parse_reference("10"), None);
    }

    #[test]
    fn test_style_lookup() {
        let sheet = sheet();
        assert_eq!(sheet.cell_style(1, 0).unwrap().as_deref(), Some("3"));
        assert_eq!(sheet.cell_style(1, 5).unwrap().as_deref(), Some("7"));
        assert_eq!(sheet.cell_style(0, 0).unwrap(), None);
        assert_eq!(sheet.cell_style(40, 0).unwrap(), None);
    }

    #[test]
    fn test_write_keeps_untouched_cells() {
        let mut sheet = sheet();
        let style = Some("3".to_string());
        sheet
            .write_cell(1, 0, &CellData::Text("Jan & Feb".to_string()), &style)
            .unwrap();
        sheet.write_cell(2, 2, &CellData::Number(15.5), &style).unwrap();

        let xml = sheet.to_xml().unwrap();
        assert!(xml.contains(r#"<c r="B1" s="1"><v>0</v></c>"#));
        assert!(xml.contains(r#"<c r="A2" s="3" t="inlineStr"><is><t xml:space="preserve">Jan &amp; Feb</t></is></c>"#));
        assert!(xml.contains(r#"<row r="3"><c r="C3" s="3"><v>15.5</v></c></row>"#));
        assert!(xml.contains(r#"<dimension ref="A1:C3"/>"#));
        assert!(xml.contains(r#"<row r="2" s="7" customFormat="1">"#));
        assert!(!xml.contains("spans"));
        assert!(xml.ends_with("</worksheet>"));
    }

    #[test]
    fn test_cell_limits() {
        let mut sheet = sheet();
        let result = sheet.write_cell(MAX_ROW + 1, 0, &CellData::Number(1.0), &None);
        assert!(matches!(result, Err(Error::CellOutOfBounds { .. })));
        let result = sheet.write_cell(0, MAX_COL + 1, &CellData::Number(1.0), &None);
        assert!(matches!(result, Err(Error::CellOutOfBounds { .. })));
    }

    #[test]
    fn test_template_roundtrip_drops_calc_chain() {
        let package = xlsx_package(
            &[
                ("First", sheet_xml(&[(0, vec![Value::Str("Header")])])),
                ("Second", sheet_xml(&[(0, vec![Value::Num(1.0)])])),
            ],
            true,
        );
        let mut template = XlsxTemplate::load(package).unwrap();
        let mut second = template.take_sheet(1).unwrap();
        assert_eq!(second.name(), "Second");
        second.write_cell(3, 1, &CellData::Number(42.0), &None).unwrap();
        template.put_sheet(second).unwrap();
        assert!(matches!(template.take_sheet(5), Err(Error::SheetNotFound(5))));

        let bytes = template.into_bytes().unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert!(archive.by_name(CALC_CHAIN_PART).is_err());

        let mut read = |name: &str| {
            let mut text = String::new();
            archive.by_name(name).unwrap().read_to_string(&mut text).unwrap();
            text
        };
        assert!(!read(CONTENT_TYPES_PART).contains("calcChain"));
        assert!(!read(WORKBOOK_RELS_PART).contains("calcChain"));
        assert!(read("xl/worksheets/sheet2.xml").contains(r#"<c r="B4"><v>42</v></c>"#));
        assert!(read("xl/worksheets/sheet1.xml").contains("Header"));
    }
}
