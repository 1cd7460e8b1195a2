use super::{HandlerResult, effective_password};
use crate::codec;
use crate::config::ImportConfig;
use crate::error::Error;
use crate::model::ImportErrorInfo;
use crate::progress::{IdleGuard, ProgressCounter, ProgressObserver, ProgressStatus};
use crate::reader::{RecordExtractor, Workbook, partition};
use crate::store::{DetailRecordSink, ErrorInfoSink};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Outcome of one import run
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub path: PathBuf,
    pub sheet_count: usize,
    pub record_count: usize,
    pub errors: Vec<ImportErrorInfo>,
}

/// Imports detail records from a workbook into a store
pub struct ImportHandler<'a, S> {
    config: &'a ImportConfig,
    store: &'a mut S,
    observer: &'a dyn ProgressObserver,
}

impl<'a, S> ImportHandler<'a, S>
where
    S: DetailRecordSink + ErrorInfoSink,
{
    pub fn new(config: &'a ImportConfig, store: &'a mut S, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            config,
            store,
            observer,
        }
    }

    /// Import every matching sheet of the workbook at `path`.
    ///
    /// Rows that fail extraction are skipped and reported in the summary and
    /// the error sink. Previously recorded import errors are cleared first.
    pub fn exec_import(&mut self, path: &Path, password: Option<&str>) -> HandlerResult<ImportSummary> {
        let _idle = IdleGuard::new(self.observer);
        self.observer.on_progress(ProgressStatus::Uncertain);
        self.store.clear_import_errors()?;
        self.import_file(path, password)
    }

    /// Import several workbooks as one run.
    ///
    /// Import errors are cleared once before the first file, so the sink ends
    /// up holding the failed rows of every file. The run stops at the first
    /// file that cannot be opened; records of earlier files stay imported.
    pub fn exec_import_all<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        password: Option<&str>,
    ) -> HandlerResult<Vec<ImportSummary>> {
        let _idle = IdleGuard::new(self.observer);
        self.observer.on_progress(ProgressStatus::Uncertain);
        self.store.clear_import_errors()?;
        paths
            .iter()
            .map(|path| {
                let path = path.as_ref();
                self.import_file(path, password)
                    .inspect_err(|e| log::error!("import of {} failed: {}", path.display(), e))
            })
            .collect()
    }

    fn import_file(&mut self, path: &Path, password: Option<&str>) -> HandlerResult<ImportSummary> {
        log::info!("importing {}", path.display());

        let bytes = fs::read(path).map_err(Error::from)?;
        let document = codec::open(bytes, effective_password(password))?;
        let mut workbook = Workbook::open(document)?;

        let extractor = RecordExtractor::new(self.config).map_err(Error::from)?;
        let sheets = extractor.select_sheets(&mut workbook)?;
        let mut counter = ProgressCounter::new(self.observer, extractor.row_count(&sheets));

        let (records, errors) = partition(
            sheets
                .iter()
                .flat_map(|sheet| extractor.rows(sheet))
                .inspect(|outcome| {
                    if let Err(error) = outcome {
                        log::warn!("sheet '{}': {}", error.sheet_name, error.message);
                    }
                    counter.tick();
                }),
        );

        self.observer.on_progress(ProgressStatus::Uncertain);
        let record_count = records.len();
        self.store.insert_batch(records)?;
        self.store.insert_import_errors(errors.clone())?;

        log::info!(
            "imported {} records from {} sheets of {} ({} rows failed)",
            record_count,
            sheets.len(),
            path.display(),
            errors.len()
        );
        Ok(ImportSummary {
            path: path.to_path_buf(),
            sheet_count: sheets.len(),
            record_count,
            errors,
        })
    }
}
