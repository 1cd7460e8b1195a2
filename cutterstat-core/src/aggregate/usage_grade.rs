//! Ordered decision table mapping returning usage notes to grades

use crate::config::{ReturningUsagePatterns, full_match_regex};
use crate::model::UsageGrade;
use regex::Regex;

/// Patterns checked in order; the first full match wins
#[derive(Debug, Clone)]
pub struct UsageGradeRules {
    rules: Vec<(Regex, UsageGrade)>,
}

impl UsageGradeRules {
    pub fn new(rules: Vec<(Regex, UsageGrade)>) -> Self {
        Self { rules }
    }

    /// Build the G01, G02, G03 table from configured patterns
    pub fn from_patterns(patterns: &ReturningUsagePatterns) -> Result<Self, regex::Error> {
        Ok(Self::new(vec![
            (full_match_regex(&patterns.g01)?, UsageGrade::G01),
            (full_match_regex(&patterns.g02)?, UsageGrade::G02),
            (full_match_regex(&patterns.g03)?, UsageGrade::G03),
        ]))
    }

    pub fn classify(&self, note: Option<&str>) -> Option<UsageGrade> {
        let note = note?;
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(note))
            .map(|(_, grade)| *grade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> UsageGradeRules {
        UsageGradeRules::from_patterns(&ReturningUsagePatterns {
            g01: "worn.*".to_string(),
            g02: ".*broken.*".to_string(),
            g03: ".*".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        // matches all three patterns
        assert_eq!(rules().classify(Some("worn and broken")), Some(UsageGrade::G01));
        assert_eq!(rules().classify(Some("tip broken")), Some(UsageGrade::G02));
        assert_eq!(rules().classify(Some("lost")), Some(UsageGrade::G03));
    }

    #[test]
    fn test_null_note_has_no_grade() {
        assert_eq!(rules().classify(None), None);
    }

    #[test]
    fn test_no_match_has_no_grade() {
        let rules = UsageGradeRules::from_patterns(&ReturningUsagePatterns::default()).unwrap();
        assert_eq!(rules.classify(Some("scrap")), None);
        assert_eq!(rules.classify(Some("back as G02 spare")), Some(UsageGrade::G02));
    }
}
