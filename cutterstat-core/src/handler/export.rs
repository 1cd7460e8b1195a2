use super::{HandlerError, HandlerResult, effective_password};
use crate::codec::{self, DocumentKind};
use crate::config::ExportConfig;
use crate::error::{Error, Result};
use crate::model::{ExportErrorInfo, StatisticResult};
use crate::progress::{IdleGuard, ProgressCounter, ProgressObserver, ProgressStatus};
use crate::store::ErrorInfoSink;
use crate::writer::Template;
use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of one export run
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub kind: DocumentKind,
    pub encrypted: bool,
    pub written_rows: usize,
    pub errors: Vec<ExportErrorInfo>,
}

/// Writes a statistic result into a copy of the configured template
pub struct ExportHandler<'a, S> {
    config: &'a ExportConfig,
    store: &'a mut S,
    observer: &'a dyn ProgressObserver,
}

impl<'a, S: ErrorInfoSink> ExportHandler<'a, S> {
    pub fn new(config: &'a ExportConfig, store: &'a mut S, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            config,
            store,
            observer,
        }
    }

    /// Export `result` to `path` as a document of `kind`.
    ///
    /// `statistics_date` is written into every row. Export errors are
    /// persisted only once the document has been saved.
    pub fn exec_export(
        &mut self,
        result: &StatisticResult,
        path: &Path,
        kind: DocumentKind,
        password: Option<&str>,
        statistics_date: NaiveDate,
    ) -> HandlerResult<ExportSummary> {
        let _idle = IdleGuard::new(self.observer);
        self.observer.on_progress(ProgressStatus::Uncertain);
        log::info!("exporting {} rows to {} ({})", result.row_count(), path.display(), kind);

        self.store.clear_export_errors()?;

        let template_path = match kind {
            DocumentKind::Xls => &self.config.template.xls,
            DocumentKind::Xlsx => &self.config.template.xlsx,
        };
        let mut template =
            load_template(template_path, kind).map_err(|source| HandlerError::TemplateLoadFailed {
                path: template_path.clone(),
                source,
            })?;

        let mut counter = ProgressCounter::new(self.observer, result.row_count());
        let errors =
            template.write_statistic(self.config, result, statistics_date, &mut || counter.tick())?;

        self.observer.on_progress(ProgressStatus::Uncertain);
        let password = effective_password(password);
        let bytes = codec::seal(kind, template.into_bytes()?, password)?;
        fs::write(path, bytes).map_err(Error::from)?;

        self.store.insert_export_errors(errors.clone())?;

        let written_rows = result.row_count() - errors.len();
        log::info!(
            "exported {} rows to {} ({} rows failed)",
            written_rows,
            path.display(),
            errors.len()
        );
        Ok(ExportSummary {
            path: path.to_path_buf(),
            kind,
            encrypted: password.is_some(),
            written_rows,
            errors,
        })
    }
}

fn load_template(path: &Path, kind: DocumentKind) -> Result<Template> {
    let template = Template::load(codec::open(fs::read(path)?, None)?)?;
    if template.kind() != kind {
        return Err(Error::UnsupportedKind(format!(
            "template is {} but {} was requested",
            template.kind(),
            kind
        )));
    }
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCutterPerspective;
    use crate::store::MemoryStore;
    use crate::testing::{Value, sheet_xml, xlsx_package};
    use calamine::{Data, Reader, Xlsx};
    use rust_decimal::Decimal;
    use std::cell::RefCell;
    use std::io::Cursor;

    fn header() -> String {
        sheet_xml(&[(0, vec![Value::Str("Month")])])
    }

    fn config(dir: &Path) -> ExportConfig {
        let template = dir.join("template.xlsx");
        fs::write(
            &template,
            xlsx_package(
                &[("Person", header()), ("Device", header()), ("Tool", header())],
                false,
            ),
        )
        .unwrap();
        let mut config = ExportConfig::default();
        config.template.xlsx = template;
        config.template.xls = dir.join("missing.xls");
        config
    }

    fn result() -> StatisticResult {
        StatisticResult {
            tool_cutter_perspectives: vec![ToolCutterPerspective {
                year: Some(2024),
                month: Some(3),
                tool_cutter_type: Some("X".to_string()),
                tool_cutter_code: None,
                consuming_quantity: 5,
                worth: Decimal::new(1550, 2),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_export_writes_tool_cutter_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let output = dir.path().join("out.xlsx");
        let mut store = MemoryStore::new();

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let summary = ExportHandler::new(&config, &mut store, &crate::progress::NoProgress)
            .exec_export(&result(), &output, DocumentKind::Xlsx, None, date)
            .unwrap();
        assert_eq!(summary.written_rows, 1);
        assert!(summary.errors.is_empty());
        assert!(!summary.encrypted);

        let mut xlsx = Xlsx::new(Cursor::new(fs::read(&output).unwrap())).unwrap();
        let range = xlsx.worksheet_range("Tool").unwrap();
        let columns = &config.tool_cutter.column_index;
        let cell = |col: u32| range.get_value((1, col)).cloned();
        assert_eq!(cell(columns.month), Some(Data::String("4月".to_string())));
        assert_eq!(cell(columns.consuming_quantity), Some(Data::Float(5.0)));
        assert_eq!(cell(columns.worth), Some(Data::Float(15.5)));
        assert_eq!(
            cell(columns.statistics_date),
            Some(Data::String("2024-05-01".to_string()))
        );
    }

    #[test]
    fn test_missing_template_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut store = MemoryStore::new();

        let seen = RefCell::new(Vec::new());
        let observer = |status: ProgressStatus| seen.borrow_mut().push(status);
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let result = ExportHandler::new(&config, &mut store, &observer).exec_export(
            &result(),
            &dir.path().join("out.xls"),
            DocumentKind::Xls,
            None,
            date,
        );

        assert!(matches!(result, Err(HandlerError::TemplateLoadFailed { .. })));
        assert_eq!(seen.borrow().last(), Some(&ProgressStatus::Idle));
    }

    #[test]
    fn test_template_of_the_other_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.template.xls = config.template.xlsx.clone();
        let mut store = MemoryStore::new();

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let result = ExportHandler::new(&config, &mut store, &crate::progress::NoProgress)
            .exec_export(&result(), &dir.path().join("out.xls"), DocumentKind::Xls, None, date);
        assert!(matches!(
            result,
            Err(HandlerError::TemplateLoadFailed {
                source: Error::UnsupportedKind(_),
                ..
            })
        ));
    }
}
