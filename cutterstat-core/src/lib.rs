//! Import, aggregation and template export engine for tool-cutter consumption workbooks.
//!
//! A run goes through four stages:
//!
//! 1. [`codec`] opens an xls or xlsx document, decrypting it when a password is given.
//! 2. [`reader`] extracts one [`DetailRecord`] per data row.
//! 3. [`aggregate`] folds the records into person, device and tool cutter perspectives.
//! 4. [`writer`] projects the perspectives onto a template, which [`codec`] seals again.
//!
//! The [`handler`] module wires these stages into import, statistic and export runs.

pub mod aggregate;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod model;
pub mod progress;
pub mod reader;
pub mod store;
pub mod writer;

#[cfg(test)]
mod testing;

pub use codec::DocumentKind;
pub use config::StatConfig;
pub use error::{Error, Result};
pub use handler::{
    ExportHandler, ExportSummary, HandlerError, ImportHandler, ImportSummary, StatisticHandler,
};
pub use model::{DetailRecord, ExportErrorInfo, ImportErrorInfo, StatisticResult};
pub use progress::{NoProgress, ProgressObserver, ProgressStatus};
pub use store::MemoryStore;
