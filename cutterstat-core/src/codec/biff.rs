//! BIFF8 record layer of the xls `Workbook` stream

use crate::error::{Error, Result};

pub const BOF: u16 = 0x0809;
pub const EOF: u16 = 0x000A;
pub const FILEPASS: u16 = 0x002F;
pub const BOUNDSHEET: u16 = 0x0085;
pub const INTERFACEHDR: u16 = 0x00E1;
pub const SST: u16 = 0x00FC;
pub const EXTSST: u16 = 0x00FF;
pub const INDEX: u16 = 0x020B;
pub const DBCELL: u16 = 0x00D7;
pub const DIMENSIONS: u16 = 0x0200;
pub const ROW: u16 = 0x0208;
pub const BLANK: u16 = 0x0201;
pub const NUMBER: u16 = 0x0203;
pub const LABEL: u16 = 0x0204;
pub const BOOLERR: u16 = 0x0205;
pub const RK: u16 = 0x027E;
pub const LABELSST: u16 = 0x00FD;
pub const MULRK: u16 = 0x00BD;
pub const MULBLANK: u16 = 0x00BE;
pub const FORMULA: u16 = 0x0006;
pub const STRING: u16 = 0x0207;
pub const SHRFMLA: u16 = 0x04BC;
pub const ARRAY: u16 = 0x0221;
pub const TABLE: u16 = 0x0236;
pub const RSTRING: u16 = 0x00D6;

/// Record id written over FILEPASS once a stream is decrypted
pub const MASKED: u16 = 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u16,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(id: u16, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Size on disk, header included
    pub fn size(&self) -> usize {
        4 + self.data.len()
    }

    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        self.data
            .get(offset..offset + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        self.data
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
    }
}

/// Walk record headers, yielding `(offset, id, data_len)`
pub fn record_headers(stream: &[u8]) -> Result<Vec<(usize, u16, usize)>> {
    let mut headers = Vec::new();
    let mut offset = 0;
    while offset + 4 <= stream.len() {
        let id = u16::from_le_bytes([stream[offset], stream[offset + 1]]);
        let len = u16::from_le_bytes([stream[offset + 2], stream[offset + 3]]) as usize;
        if offset + 4 + len > stream.len() {
            return Err(Error::malformed(format!(
                "BIFF record 0x{:04X} at offset {} overruns the stream",
                id, offset
            )));
        }
        headers.push((offset, id, len));
        offset += 4 + len;
    }
    Ok(headers)
}

pub fn parse_records(stream: &[u8]) -> Result<Vec<Record>> {
    Ok(record_headers(stream)?
        .into_iter()
        .map(|(offset, id, len)| Record::new(id, stream[offset + 4..offset + 4 + len].to_vec()))
        .collect())
}

pub fn serialize(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.iter().map(Record::size).sum());
    for record in records {
        record.write_to(&mut out);
    }
    out
}

/// `Workbook` stream split into its globals and sheet substreams.
///
/// BOUNDSHEET records are re-pointed at their substreams on serialization,
/// so substreams may grow or shrink freely.
#[derive(Debug, Clone)]
pub struct WorkbookStream {
    pub globals: Vec<Record>,
    substreams: Vec<Vec<Record>>,
    /// Substream index targeted by each BOUNDSHEET, in globals order
    bound_sheets: Vec<usize>,
    /// Bytes after the last EOF, kept as is
    trailer: Vec<u8>,
}

impl WorkbookStream {
    pub fn parse(stream: &[u8]) -> Result<Self> {
        let headers = record_headers(stream)?;
        let mut substreams: Vec<(usize, Vec<Record>)> = Vec::new();
        let mut current: Option<(usize, Vec<Record>)> = None;
        let mut consumed = 0;
        let mut depth = 0usize;

        for (offset, id, len) in headers {
            let record = Record::new(id, stream[offset + 4..offset + 4 + len].to_vec());
            match (&mut current, id) {
                (None, BOF) => {
                    current = Some((offset, vec![record]));
                    depth = 1;
                }
                (None, _) => {
                    return Err(Error::malformed(format!(
                        "BIFF record 0x{:04X} outside of a substream",
                        id
                    )));
                }
                (Some((_, records)), _) => {
                    // embedded BOF/EOF pairs (charts) stay inside their parent substream
                    if id == BOF {
                        depth += 1;
                    } else if id == EOF {
                        depth -= 1;
                    }
                    records.push(record);
                    if depth == 0 {
                        if let Some(done) = current.take() {
                            substreams.push(done);
                        }
                        consumed = offset + 4 + len;
                    }
                }
            }
        }

        if let Some(unfinished) = current.take() {
            substreams.push(unfinished);
            consumed = stream.len();
        }

        let mut substreams = substreams.into_iter();
        let (_, globals) = substreams
            .next()
            .ok_or_else(|| Error::malformed("Workbook stream has no globals substream"))?;
        let (offsets, substreams): (Vec<usize>, Vec<Vec<Record>>) = substreams.unzip();

        let mut bound_sheets = Vec::new();
        for record in globals.iter().filter(|r| r.id == BOUNDSHEET) {
            let position = record
                .u32_at(0)
                .ok_or_else(|| Error::malformed("BOUNDSHEET record is truncated"))?
                as usize;
            let index = offsets.iter().position(|o| *o == position).ok_or_else(|| {
                Error::malformed(format!("BOUNDSHEET points at {} which starts no substream", position))
            })?;
            bound_sheets.push(index);
        }

        Ok(Self {
            globals,
            substreams,
            bound_sheets,
            trailer: stream[consumed..].to_vec(),
        })
    }

    pub fn sheet_count(&self) -> usize {
        self.bound_sheets.len()
    }

    /// Records of the sheet at `index` in workbook order
    pub fn sheet_mut(&mut self, index: usize) -> Result<&mut Vec<Record>> {
        let substream = *self
            .bound_sheets
            .get(index)
            .ok_or(Error::SheetNotFound(index))?;
        self.substreams
            .get_mut(substream)
            .ok_or(Error::SheetNotFound(index))
    }

    /// Name of the sheet at `index`, read from its BOUNDSHEET record
    pub fn sheet_name(&self, index: usize) -> Option<String> {
        let record = self
            .globals
            .iter()
            .filter(|r| r.id == BOUNDSHEET)
            .nth(index)?;
        read_short_string(record.data.get(6..)?)
    }

    /// Serialize, re-pointing every BOUNDSHEET at its substream
    pub fn to_bytes(&self) -> Vec<u8> {
        let globals_size: usize = self.globals.iter().map(Record::size).sum();
        let mut offsets = Vec::with_capacity(self.substreams.len());
        let mut offset = globals_size;
        for substream in &self.substreams {
            offsets.push(offset);
            offset += substream.iter().map(Record::size).sum::<usize>();
        }

        let mut globals = self.globals.clone();
        for (record, substream) in globals
            .iter_mut()
            .filter(|r| r.id == BOUNDSHEET)
            .zip(&self.bound_sheets)
        {
            let position = offsets[*substream] as u32;
            record.data[..4].copy_from_slice(&position.to_le_bytes());
        }

        let mut out = serialize(&globals);
        for substream in &self.substreams {
            out.extend(serialize(substream));
        }
        out.extend_from_slice(&self.trailer);
        out
    }
}

/// Add `delta` to every absolute stream offset kept in EXTSST
pub fn shift_extsst(records: &mut [Record], delta: i64) {
    for record in records.iter_mut().filter(|r| r.id == EXTSST) {
        // u16 dsst, then 8 byte ISSTInf entries starting with a u32 ib
        let mut entry = 2;
        while entry + 4 <= record.data.len() {
            let ib = u32::from_le_bytes([
                record.data[entry],
                record.data[entry + 1],
                record.data[entry + 2],
                record.data[entry + 3],
            ]);
            let shifted = (i64::from(ib) + delta).max(0) as u32;
            record.data[entry..entry + 4].copy_from_slice(&shifted.to_le_bytes());
            entry += 8;
        }
    }
}

/// ShortXLUnicodeString: u8 length, u8 flags, then the characters
fn read_short_string(data: &[u8]) -> Option<String> {
    let len = *data.first()? as usize;
    let high_byte = data.get(1)? & 0x01 != 0;
    let chars = data.get(2..)?;
    if high_byte {
        let units: Vec<u16> = chars
            .get(..len * 2)?
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Some(String::from_utf16_lossy(&units))
    } else {
        Some(chars.get(..len)?.iter().map(|b| *b as char).collect())
    }
}

/// XLUnicodeString: u16 length, u8 flags, then the characters
pub fn write_unicode_string(out: &mut Vec<u8>, value: &str) {
    let units: Vec<u16> = value.encode_utf16().collect();
    out.extend_from_slice(&(units.len() as u16).to_le_bytes());
    if units.iter().all(|unit| *unit <= 0xFF) {
        out.push(0x00);
        out.extend(units.iter().map(|unit| *unit as u8));
    } else {
        out.push(0x01);
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    }
}

/// Builders for minimal BIFF8 streams used in tests
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn bof(kind: u16) -> Record {
        let mut data = Vec::new();
        data.extend_from_slice(&0x0600u16.to_le_bytes());
        data.extend_from_slice(&kind.to_le_bytes());
        data.extend_from_slice(&0x0DBBu16.to_le_bytes());
        data.extend_from_slice(&0x07CCu16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0x0006u32.to_le_bytes());
        Record::new(BOF, data)
    }

    pub fn eof() -> Record {
        Record::new(EOF, Vec::new())
    }

    pub fn bound_sheet(name: &str) -> Record {
        let mut data = vec![0, 0, 0, 0, 0, 0];
        data.push(name.len() as u8);
        data.push(0);
        data.extend_from_slice(name.as_bytes());
        Record::new(BOUNDSHEET, data)
    }

    pub fn number(row: u16, col: u16, xf: u16, value: f64) -> Record {
        let mut data = Vec::new();
        data.extend_from_slice(&row.to_le_bytes());
        data.extend_from_slice(&col.to_le_bytes());
        data.extend_from_slice(&xf.to_le_bytes());
        data.extend_from_slice(&value.to_le_bytes());
        Record::new(NUMBER, data)
    }

    pub fn label(row: u16, col: u16, xf: u16, value: &str) -> Record {
        let mut data = Vec::new();
        data.extend_from_slice(&row.to_le_bytes());
        data.extend_from_slice(&col.to_le_bytes());
        data.extend_from_slice(&xf.to_le_bytes());
        write_unicode_string(&mut data, value);
        Record::new(LABEL, data)
    }

    /// FORMULA over `rgce`; without a cached number the record announces a
    /// string result that never follows, so readers see no value
    pub fn formula(row: u16, col: u16, xf: u16, cached: Option<f64>, rgce: &[u8]) -> Record {
        let mut data = Vec::new();
        data.extend_from_slice(&row.to_le_bytes());
        data.extend_from_slice(&col.to_le_bytes());
        data.extend_from_slice(&xf.to_le_bytes());
        match cached {
            Some(value) => data.extend_from_slice(&value.to_le_bytes()),
            None => data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0xFF, 0xFF]),
        }
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(rgce.len() as u16).to_le_bytes());
        data.extend_from_slice(rgce);
        Record::new(FORMULA, data)
    }

    /// Globals with one BOUNDSHEET per name, followed by one substream per sheet
    pub fn workbook(sheets: &[(&str, Vec<Record>)]) -> Vec<u8> {
        let mut globals = vec![bof(0x0005)];
        globals.push(Record::new(0x0042, 1200u16.to_le_bytes().to_vec()));
        for _ in 0..21 {
            globals.push(Record::new(0x00E0, vec![0; 20]));
        }
        for (name, _) in sheets {
            globals.push(bound_sheet(name));
        }
        globals.push(eof());

        let substreams: Vec<Vec<Record>> = sheets
            .iter()
            .map(|(_, cells)| {
                let mut records = vec![bof(0x0010)];
                records.extend(cells.iter().cloned());
                records.push(eof());
                records
            })
            .collect();

        let mut offset: usize = globals.iter().map(Record::size).sum();
        for (record, substream) in globals
            .iter_mut()
            .filter(|r| r.id == BOUNDSHEET)
            .zip(&substreams)
        {
            record.data[..4].copy_from_slice(&(offset as u32).to_le_bytes());
            offset += substream.iter().map(Record::size).sum::<usize>();
        }

        let mut out = serialize(&globals);
        for substream in &substreams {
            out.extend(serialize(substream));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_parse_serialize_is_identity() {
        let stream = workbook(&[
            ("First", vec![number(0, 0, 15, 1.5)]),
            ("Second", vec![label(1, 2, 15, "abc")]),
        ]);
        let parsed = WorkbookStream::parse(&stream).unwrap();
        assert_eq!(parsed.sheet_count(), 2);
        assert_eq!(parsed.sheet_name(1).as_deref(), Some("Second"));
        assert_eq!(parsed.to_bytes(), stream);
    }

    #[test]
    fn test_growing_a_sheet_moves_later_sheets() {
        let stream = workbook(&[("First", vec![]), ("Second", vec![])]);
        let mut parsed = WorkbookStream::parse(&stream).unwrap();
        parsed
            .sheet_mut(0)
            .unwrap()
            .insert(1, number(0, 0, 15, 2.0));

        let bytes = parsed.to_bytes();
        let reparsed = WorkbookStream::parse(&bytes).unwrap();
        assert_eq!(reparsed.sheet_count(), 2);

        let records = parse_records(&bytes).unwrap();
        let bound: Vec<u32> = records
            .iter()
            .filter(|r| r.id == BOUNDSHEET)
            .map(|r| r.u32_at(0).unwrap())
            .collect();
        let headers = record_headers(&bytes).unwrap();
        let sheet_bofs: Vec<u32> = headers
            .iter()
            .filter(|(_, id, _)| *id == BOF)
            .skip(1)
            .map(|(offset, _, _)| *offset as u32)
            .collect();
        assert_eq!(bound, sheet_bofs);
    }

    #[test]
    fn test_missing_sheet_index() {
        let stream = workbook(&[("Only", vec![])]);
        let mut parsed = WorkbookStream::parse(&stream).unwrap();
        assert!(matches!(parsed.sheet_mut(3), Err(Error::SheetNotFound(3))));
    }

    #[test]
    fn test_unicode_string_switches_to_utf16() {
        let mut latin = Vec::new();
        write_unicode_string(&mut latin, "abc");
        assert_eq!(latin, vec![3, 0, 0, b'a', b'b', b'c']);

        let mut wide = Vec::new();
        write_unicode_string(&mut wide, "月");
        assert_eq!(wide, vec![1, 0, 1, 0x08, 0x67]);
    }

    #[test]
    fn test_shift_extsst() {
        let mut data = 8u16.to_le_bytes().to_vec();
        data.extend_from_slice(&100u32.to_le_bytes());
        data.extend_from_slice(&[12, 0, 0, 0]);
        let mut records = vec![Record::new(EXTSST, data)];
        shift_extsst(&mut records, 58);
        assert_eq!(records[0].u32_at(2), Some(158));
        assert_eq!(records[0].u16_at(6), Some(12));
    }
}
