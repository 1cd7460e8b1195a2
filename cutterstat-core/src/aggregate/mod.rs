//! Aggregation of detail records into the person, device and tool cutter perspectives
//!
//! Each perspective is a table keyed by its grouping fields. Rows come out in
//! the order their key was first seen. Accumulators are values: every record
//! produces a new accumulator that replaces the stored one.

pub mod usage_grade;

pub use usage_grade::UsageGradeRules;

use crate::error::{Error, Result};
use crate::model::{
    DetailRecord, DevicePerspective, DevicePerspectiveKey, PersonPerspective,
    PersonPerspectiveKey, StatisticResult, ToolCutterPerspective, ToolCutterPerspectiveKey,
    UsageGrade,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;

/// What one detail record adds to each perspective it falls into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub consuming_quantity: i32,
    pub worth: Decimal,
    pub returning_quantity: i32,
    pub grade: Option<UsageGrade>,
}

impl Contribution {
    pub fn of(record: &DetailRecord, rules: &UsageGradeRules) -> Self {
        Self {
            consuming_quantity: record.consuming_quantity.unwrap_or(0),
            worth: record.worth.unwrap_or(Decimal::ZERO),
            returning_quantity: record.returning_quantity.unwrap_or(0),
            grade: rules.classify(record.returning_usage_info.as_deref()),
        }
    }

    fn graded_quantity(&self, grade: UsageGrade) -> i32 {
        if self.grade == Some(grade) {
            self.returning_quantity
        } else {
            0
        }
    }
}

impl PersonPerspectiveKey {
    pub fn of(record: &DetailRecord) -> Self {
        Self {
            year: record.year(),
            month: record.month(),
            name: record.consuming_person.clone(),
            tool_cutter_type: record.tool_cutter_type.clone(),
            device: record.device.clone(),
            tool_cutter_code: record.tool_cutter_code.clone(),
        }
    }
}

impl DevicePerspectiveKey {
    pub fn of(record: &DetailRecord) -> Self {
        Self {
            year: record.year(),
            month: record.month(),
            tool_cutter_type: record.tool_cutter_type.clone(),
            device: record.device.clone(),
            tool_cutter_code: record.tool_cutter_code.clone(),
        }
    }
}

impl ToolCutterPerspectiveKey {
    pub fn of(record: &DetailRecord) -> Self {
        Self {
            year: record.year(),
            month: record.month(),
            tool_cutter_type: record.tool_cutter_type.clone(),
            tool_cutter_code: record.tool_cutter_code.clone(),
        }
    }
}

fn add_quantity(current: i32, delta: i32, field: &'static str) -> Result<i32> {
    current.checked_add(delta).ok_or(Error::Overflow(field))
}

fn add_worth(current: Decimal, delta: Decimal) -> Result<Decimal> {
    current.checked_add(delta).ok_or(Error::Overflow("worth"))
}

impl PersonPerspective {
    pub fn empty(key: &PersonPerspectiveKey) -> Self {
        Self {
            year: key.year,
            month: key.month,
            name: key.name.clone(),
            tool_cutter_type: key.tool_cutter_type.clone(),
            device: key.device.clone(),
            tool_cutter_code: key.tool_cutter_code.clone(),
            consuming_quantity: 0,
            worth: Decimal::ZERO,
            returning_quantity: 0,
            returning_usage_g01_quantity: 0,
            returning_usage_g02_quantity: 0,
            returning_usage_g03_quantity: 0,
        }
    }

    pub fn absorb(&self, contribution: &Contribution) -> Result<Self> {
        Ok(Self {
            consuming_quantity: add_quantity(
                self.consuming_quantity,
                contribution.consuming_quantity,
                "consuming quantity",
            )?,
            worth: add_worth(self.worth, contribution.worth)?,
            returning_quantity: add_quantity(
                self.returning_quantity,
                contribution.returning_quantity,
                "returning quantity",
            )?,
            returning_usage_g01_quantity: add_quantity(
                self.returning_usage_g01_quantity,
                contribution.graded_quantity(UsageGrade::G01),
                "returning usage G01 quantity",
            )?,
            returning_usage_g02_quantity: add_quantity(
                self.returning_usage_g02_quantity,
                contribution.graded_quantity(UsageGrade::G02),
                "returning usage G02 quantity",
            )?,
            returning_usage_g03_quantity: add_quantity(
                self.returning_usage_g03_quantity,
                contribution.graded_quantity(UsageGrade::G03),
                "returning usage G03 quantity",
            )?,
            ..self.clone()
        })
    }
}

impl DevicePerspective {
    pub fn empty(key: &DevicePerspectiveKey) -> Self {
        Self {
            year: key.year,
            month: key.month,
            tool_cutter_type: key.tool_cutter_type.clone(),
            device: key.device.clone(),
            tool_cutter_code: key.tool_cutter_code.clone(),
            consuming_quantity: 0,
            worth: Decimal::ZERO,
        }
    }

    pub fn absorb(&self, contribution: &Contribution) -> Result<Self> {
        Ok(Self {
            consuming_quantity: add_quantity(
                self.consuming_quantity,
                contribution.consuming_quantity,
                "consuming quantity",
            )?,
            worth: add_worth(self.worth, contribution.worth)?,
            ..self.clone()
        })
    }
}

impl ToolCutterPerspective {
    pub fn empty(key: &ToolCutterPerspectiveKey) -> Self {
        Self {
            year: key.year,
            month: key.month,
            tool_cutter_type: key.tool_cutter_type.clone(),
            tool_cutter_code: key.tool_cutter_code.clone(),
            consuming_quantity: 0,
            worth: Decimal::ZERO,
        }
    }

    pub fn absorb(&self, contribution: &Contribution) -> Result<Self> {
        Ok(Self {
            consuming_quantity: add_quantity(
                self.consuming_quantity,
                contribution.consuming_quantity,
                "consuming quantity",
            )?,
            worth: add_worth(self.worth, contribution.worth)?,
            ..self.clone()
        })
    }
}

/// Map that remembers the order keys were first inserted in
#[derive(Debug)]
struct OrderedTable<K, V> {
    positions: HashMap<K, usize>,
    values: Vec<V>,
}

impl<K: Hash + Eq, V> OrderedTable<K, V> {
    fn new() -> Self {
        Self {
            positions: HashMap::new(),
            values: Vec::new(),
        }
    }

    /// Replace the value under `key` with `update(current)`, starting from `init(key)`.
    /// A failed update leaves the table untouched.
    fn update(
        &mut self,
        key: K,
        init: impl FnOnce(&K) -> V,
        update: impl FnOnce(&V) -> Result<V>,
    ) -> Result<()> {
        match self.positions.get(&key) {
            Some(&position) => {
                let next = update(&self.values[position])?;
                self.values[position] = next;
            }
            None => {
                let next = update(&init(&key))?;
                self.positions.insert(key, self.values.len());
                self.values.push(next);
            }
        }
        Ok(())
    }

    fn into_values(self) -> Vec<V> {
        self.values
    }
}

/// Incremental fold of detail records into a [`StatisticResult`]
pub struct Aggregator<'a> {
    rules: &'a UsageGradeRules,
    person: OrderedTable<PersonPerspectiveKey, PersonPerspective>,
    device: OrderedTable<DevicePerspectiveKey, DevicePerspective>,
    tool_cutter: OrderedTable<ToolCutterPerspectiveKey, ToolCutterPerspective>,
}

impl<'a> Aggregator<'a> {
    pub fn new(rules: &'a UsageGradeRules) -> Self {
        Self {
            rules,
            person: OrderedTable::new(),
            device: OrderedTable::new(),
            tool_cutter: OrderedTable::new(),
        }
    }

    /// Fold one record into all three perspectives.
    ///
    /// Totals use checked arithmetic; an overflow fails the whole run with
    /// [`Error::Overflow`] instead of producing a clamped or wrapped figure.
    pub fn absorb(&mut self, record: &DetailRecord) -> Result<()> {
        let contribution = Contribution::of(record, self.rules);

        self.person.update(
            PersonPerspectiveKey::of(record),
            PersonPerspective::empty,
            |current| current.absorb(&contribution),
        )?;
        self.device.update(
            DevicePerspectiveKey::of(record),
            DevicePerspective::empty,
            |current| current.absorb(&contribution),
        )?;
        self.tool_cutter.update(
            ToolCutterPerspectiveKey::of(record),
            ToolCutterPerspective::empty,
            |current| current.absorb(&contribution),
        )
    }

    pub fn finish(self) -> StatisticResult {
        StatisticResult {
            person_perspectives: self.person.into_values(),
            device_perspectives: self.device.into_values(),
            tool_cutter_perspectives: self.tool_cutter.into_values(),
        }
    }
}
