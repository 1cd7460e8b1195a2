//! Coercion of calamine cell values into detail record fields

use calamine::Data;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Text field. Numbers are rendered, errors fail the cell.
pub fn text(cell: Option<&Data>) -> Result<Option<String>, String> {
    match cell {
        None | Some(Data::Empty) => Ok(None),
        Some(Data::String(s)) => Ok(Some(s.clone())),
        Some(Data::Float(f)) => Ok(Some(render_number(*f))),
        Some(Data::Int(i)) => Ok(Some(i.to_string())),
        Some(Data::Bool(b)) => Ok(Some(if *b { "TRUE" } else { "FALSE" }.to_string())),
        Some(Data::DateTime(dt)) => Ok(Some(render_number(dt.as_f64()))),
        Some(Data::DateTimeIso(s)) | Some(Data::DurationIso(s)) => Ok(Some(s.clone())),
        Some(Data::Error(e)) => Err(format!("cell holds error value {:?}", e)),
    }
}

/// Integer field, truncated toward zero
pub fn integer(cell: Option<&Data>) -> Result<Option<i32>, String> {
    let Some(number) = number(cell)? else {
        return Ok(None);
    };
    let truncated = number.trunc();
    if truncated < i32::MIN as f64 || truncated > i32::MAX as f64 {
        return Err(format!("{} does not fit an integer", number));
    }
    Ok(Some(truncated as i32))
}

/// Decimal field, converted through the shortest rendering of the number
pub fn decimal(cell: Option<&Data>) -> Result<Option<Decimal>, String> {
    match cell {
        Some(Data::Int(i)) => Ok(Some(Decimal::from(*i))),
        Some(Data::String(s)) if !s.trim().is_empty() => Decimal::from_str(s.trim())
            .map(Some)
            .map_err(|_| format!("'{}' is not a number", s)),
        other => match number(other)? {
            Some(f) => Decimal::from_str(&f.to_string())
                .map(Some)
                .map_err(|e| format!("{} is not a representable decimal: {}", f, e)),
            None => Ok(None),
        },
    }
}

/// Date field from a 1900-system serial or an ISO date string
pub fn date(cell: Option<&Data>) -> Result<Option<NaiveDate>, String> {
    match cell {
        None | Some(Data::Empty) => Ok(None),
        Some(Data::Float(f)) => Ok(excel_serial_to_date(*f)),
        Some(Data::Int(i)) => Ok(excel_serial_to_date(*i as f64)),
        Some(Data::DateTime(dt)) => Ok(excel_serial_to_date(dt.as_f64())),
        Some(Data::DateTimeIso(s)) => parse_iso_date(s).map(Some),
        Some(Data::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Data::String(s)) => parse_iso_date(s.trim()).map(Some),
        Some(other) => Err(format!("{:?} is not a date", other)),
    }
}

fn number(cell: Option<&Data>) -> Result<Option<f64>, String> {
    match cell {
        None | Some(Data::Empty) => Ok(None),
        Some(Data::Float(f)) if f.is_finite() => Ok(Some(*f)),
        Some(Data::Int(i)) => Ok(Some(*i as f64)),
        Some(Data::DateTime(dt)) => Ok(Some(dt.as_f64())),
        Some(Data::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Data::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or_else(|| format!("'{}' is not a number", s)),
        Some(other) => Err(format!("{:?} is not a number", other)),
    }
}

pub(crate) fn render_number(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

fn parse_iso_date(s: &str) -> Result<NaiveDate, String> {
    let head = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").map_err(|_| format!("'{}' is not a date", s))
}

/// Convert a 1900 date system serial to a date, dropping the time of day.
///
/// Serial 1 is 1900-01-01. Serial 60 is the nonexistent 1900-02-29 and
/// lands on 1900-03-01. Negative serials have no date.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 0.0 {
        return None;
    }
    let days = serial.trunc() as u64;
    let epoch = if days < 61 {
        NaiveDate::from_ymd_opt(1899, 12, 31)?
    } else {
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };
    epoch.checked_add_days(Days::new(days))
}
