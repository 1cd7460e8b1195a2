//! Collaborator interfaces for record and error persistence

use crate::error::Result;
use crate::model::{DetailRecord, ExportErrorInfo, ImportErrorInfo};

/// Source of the detail records a statistic run aggregates
pub trait DetailRecordSource {
    fn lookup_all(&self) -> Result<Vec<DetailRecord>>;
}

/// Destination of the detail records an import run produces
pub trait DetailRecordSink {
    fn insert_batch(&mut self, records: Vec<DetailRecord>) -> Result<()>;
}

/// Audit trail of rows that failed to import or export
pub trait ErrorInfoSink {
    fn clear_import_errors(&mut self) -> Result<()>;
    fn insert_import_errors(&mut self, errors: Vec<ImportErrorInfo>) -> Result<()>;
    fn clear_export_errors(&mut self) -> Result<()>;
    fn insert_export_errors(&mut self, errors: Vec<ExportErrorInfo>) -> Result<()>;
}

/// In-memory store backing every collaborator interface
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<DetailRecord>,
    import_errors: Vec<ImportErrorInfo>,
    export_errors: Vec<ExportErrorInfo>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[DetailRecord] {
        &self.records
    }

    pub fn import_errors(&self) -> &[ImportErrorInfo] {
        &self.import_errors
    }

    pub fn export_errors(&self) -> &[ExportErrorInfo] {
        &self.export_errors
    }
}

impl DetailRecordSource for MemoryStore {
    fn lookup_all(&self) -> Result<Vec<DetailRecord>> {
        Ok(self.records.clone())
    }
}

impl DetailRecordSink for MemoryStore {
    fn insert_batch(&mut self, records: Vec<DetailRecord>) -> Result<()> {
        self.records.extend(records);
        Ok(())
    }
}

impl ErrorInfoSink for MemoryStore {
    fn clear_import_errors(&mut self) -> Result<()> {
        self.import_errors.clear();
        Ok(())
    }

    fn insert_import_errors(&mut self, errors: Vec<ImportErrorInfo>) -> Result<()> {
        self.import_errors.extend(errors);
        Ok(())
    }

    fn clear_export_errors(&mut self) -> Result<()> {
        self.export_errors.clear();
        Ok(())
    }

    fn insert_export_errors(&mut self, errors: Vec<ExportErrorInfo>) -> Result<()> {
        self.export_errors.extend(errors);
        Ok(())
    }
}
