//! Progress reporting for long-running runs

/// State reported to a [`ProgressObserver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Work of unknown length is in progress (loading, saving)
    Uncertain,
    /// The run is over, successfully or not
    Idle,
    /// `completed` of `total` units are done
    Progress { completed: usize, total: usize },
}

/// Receives progress updates from a run
pub trait ProgressObserver {
    fn on_progress(&self, status: ProgressStatus);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProgressStatus),
{
    fn on_progress(&self, status: ProgressStatus) {
        self(status)
    }
}

/// Observer that ignores every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _status: ProgressStatus) {}
}

/// Emits [`ProgressStatus::Idle`] when dropped.
///
/// Held for the whole run so that error returns and panics still leave the
/// observer idle.
pub struct IdleGuard<'a> {
    observer: &'a dyn ProgressObserver,
}

impl<'a> IdleGuard<'a> {
    pub fn new(observer: &'a dyn ProgressObserver) -> Self {
        Self { observer }
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.observer.on_progress(ProgressStatus::Idle);
    }
}

/// Counts completed units against a fixed total
pub(crate) struct ProgressCounter<'a> {
    observer: &'a dyn ProgressObserver,
    completed: usize,
    total: usize,
}

impl<'a> ProgressCounter<'a> {
    pub(crate) fn new(observer: &'a dyn ProgressObserver, total: usize) -> Self {
        observer.on_progress(ProgressStatus::Progress {
            completed: 0,
            total,
        });
        Self {
            observer,
            completed: 0,
            total,
        }
    }

    pub(crate) fn tick(&mut self) {
        self.completed += 1;
        self.observer.on_progress(ProgressStatus::Progress {
            completed: self.completed,
            total: self.total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_guard_emits_idle_on_early_return() {
        let seen = RefCell::new(Vec::new());
        let observer = |status: ProgressStatus| seen.borrow_mut().push(status);

        let run = || -> Result<(), String> {
            let _guard = IdleGuard::new(&observer);
            observer.on_progress(ProgressStatus::Uncertain);
            Err("boom".to_string())
        };
        assert!(run().is_err());

        assert_eq!(
            *seen.borrow(),
            vec![ProgressStatus::Uncertain, ProgressStatus::Idle]
        );
    }

    #[test]
    fn test_counter_is_monotonic() {
        let seen = RefCell::new(Vec::new());
        let observer = |status: ProgressStatus| seen.borrow_mut().push(status);

        let mut counter = ProgressCounter::new(&observer, 2);
        counter.tick();
        counter.tick();

        assert_eq!(
            *seen.borrow(),
            vec![
                ProgressStatus::Progress { completed: 0, total: 2 },
                ProgressStatus::Progress { completed: 1, total: 2 },
                ProgressStatus::Progress { completed: 2, total: 2 },
            ]
        );
    }
}
