use super::HandlerResult;
use crate::aggregate::{Aggregator, UsageGradeRules};
use crate::config::StatisticsConfig;
use crate::error::Error;
use crate::model::StatisticResult;
use crate::progress::{IdleGuard, ProgressCounter, ProgressObserver, ProgressStatus};
use crate::store::DetailRecordSource;

/// Aggregates every detail record of a source into the three perspectives
pub struct StatisticHandler<'a, S> {
    config: &'a StatisticsConfig,
    source: &'a S,
    observer: &'a dyn ProgressObserver,
}

impl<'a, S: DetailRecordSource> StatisticHandler<'a, S> {
    pub fn new(config: &'a StatisticsConfig, source: &'a S, observer: &'a dyn ProgressObserver) -> Self {
        Self {
            config,
            source,
            observer,
        }
    }

    pub fn exec_statistic(&self) -> HandlerResult<StatisticResult> {
        let _idle = IdleGuard::new(self.observer);
        self.observer.on_progress(ProgressStatus::Uncertain);

        let rules = UsageGradeRules::from_patterns(&self.config.returning_usage).map_err(Error::from)?;
        let records = self.source.lookup_all()?;
        log::info!("aggregating {} detail records", records.len());

        let mut counter = ProgressCounter::new(self.observer, records.len());
        let mut aggregator = Aggregator::new(&rules);
        for record in &records {
            aggregator.absorb(record)?;
            counter.tick();
        }
        let result = aggregator.finish();

        log::info!(
            "aggregated into {} person, {} device and {} tool cutter rows",
            result.person_perspectives.len(),
            result.device_perspectives.len(),
            result.tool_cutter_perspectives.len()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use crate::model::DetailRecord;
    use crate::store::{DetailRecordSink, MemoryStore};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::cell::RefCell;

    fn record(person: &str, quantity: i32, note: Option<&str>) -> DetailRecord {
        DetailRecord {
            tool_cutter_type: Some("X".to_string()),
            device: Some("D1".to_string()),
            consuming_person: Some(person.to_string()),
            consuming_quantity: Some(quantity),
            worth: Some(Decimal::new(250, 2)),
            consuming_date: NaiveDate::from_ymd_opt(2024, 4, 2),
            returning_quantity: Some(1),
            returning_usage_info: note.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_statistic_reads_whole_source() {
        let mut store = MemoryStore::new();
        store
            .insert_batch(vec![
                record("A", 2, Some("G02 chipped")),
                record("B", 1, None),
                record("A", 3, None),
            ])
            .unwrap();

        let seen = RefCell::new(Vec::new());
        let observer = |status: ProgressStatus| seen.borrow_mut().push(status);
        let config = StatisticsConfig::default();
        let result = StatisticHandler::new(&config, &store, &observer)
            .exec_statistic()
            .unwrap();

        assert_eq!(result.person_perspectives.len(), 2);
        let first = &result.person_perspectives[0];
        assert_eq!(first.name.as_deref(), Some("A"));
        assert_eq!(first.consuming_quantity, 5);
        assert_eq!(first.worth, Decimal::new(500, 2));
        assert_eq!(first.returning_usage_g02_quantity, 1);
        assert_eq!(result.device_perspectives.len(), 1);
        assert_eq!(result.device_perspectives[0].consuming_quantity, 6);

        let seen = seen.borrow();
        assert!(seen.contains(&ProgressStatus::Progress { completed: 3, total: 3 }));
        assert_eq!(seen.last(), Some(&ProgressStatus::Idle));
    }

    #[test]
    fn test_invalid_pattern_fails_the_run() {
        let store = MemoryStore::new();
        let mut config = StatisticsConfig::default();
        config.returning_usage.g01 = "(".to_string();

        let seen = RefCell::new(Vec::new());
        let observer = |status: ProgressStatus| seen.borrow_mut().push(status);
        let result = StatisticHandler::new(&config, &store, &observer).exec_statistic();

        assert!(result.is_err());
        assert_eq!(seen.borrow().last(), Some(&ProgressStatus::Idle));
    }

    #[test]
    fn test_overflowing_total_fails_the_run() {
        let mut store = MemoryStore::new();
        store
            .insert_batch(vec![record("A", i32::MAX, None), record("A", 1, None)])
            .unwrap();

        let seen = RefCell::new(Vec::new());
        let observer = |status: ProgressStatus| seen.borrow_mut().push(status);
        let config = StatisticsConfig::default();
        let result = StatisticHandler::new(&config, &store, &observer).exec_statistic();

        assert!(matches!(
            result,
            Err(HandlerError::Failed(Error::Overflow("consuming quantity")))
        ));
        assert_eq!(seen.borrow().last(), Some(&ProgressStatus::Idle));
    }
}
