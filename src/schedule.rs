use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;

use crate::error::StatusError;
use crate::models::MeetingDays;

/// Weekday indices used when a group meets "every day". Sunday (0) never has lessons.
pub const EVERY_DAY_INDICES: [u32; 6] = [1, 2, 3, 4, 5, 6];

const DEFAULT_LABELS: [(&str, u32); 14] = [
    ("Sunday", 0),
    ("Monday", 1),
    ("Tuesday", 2),
    ("Wednesday", 3),
    ("Thursday", 4),
    ("Friday", 5),
    ("Saturday", 6),
    ("Yakshanba", 0),
    ("Dushanba", 1),
    ("Seshanba", 2),
    ("Chorshanba", 3),
    ("Payshanba", 4),
    ("Juma", 5),
    ("Shanba", 6),
];

/// Mapping from a roster day label to a weekday index (0 = Sunday .. 6 = Saturday).
///
/// Lookups trim the label and ignore ASCII case.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "HashMap<String, u32>")]
pub struct WeekdayLabels {
    table: HashMap<String, u32>,
}

impl WeekdayLabels {
    pub fn new<I, S>(entries: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        let mut table = HashMap::new();
        for (label, index) in entries {
            let label = label.as_ref();
            if index > 6 {
                return Err(format!("weekday index {index} for '{label}' is outside 0..=6"));
            }
            table.insert(label.trim().to_ascii_lowercase(), index);
        }
        Ok(Self { table })
    }

    pub fn index_of(&self, label: &str) -> Option<u32> {
        self.table.get(&label.trim().to_ascii_lowercase()).copied()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for WeekdayLabels {
    fn default() -> Self {
        let table = DEFAULT_LABELS
            .iter()
            .map(|(label, index)| (label.to_ascii_lowercase(), *index))
            .collect();
        Self { table }
    }
}

impl TryFrom<HashMap<String, u32>> for WeekdayLabels {
    type Error = String;

    fn try_from(value: HashMap<String, u32>) -> Result<Self, Self::Error> {
        WeekdayLabels::new(value)
    }
}

/// Resolved set of weekdays on which a group holds lessons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingPattern {
    days: BTreeSet<u32>,
}

impl MeetingPattern {
    pub fn is_lesson_day(&self, date: NaiveDate) -> bool {
        self.days.contains(&date.weekday().num_days_from_sunday())
    }

    pub fn weekday_indices(&self) -> Vec<u32> {
        self.days.iter().copied().collect()
    }
}

/// Unrecognized labels are dropped; an empty result is a configuration error.
pub fn resolve_meeting_days(
    meeting_days: &MeetingDays,
    labels: &WeekdayLabels,
) -> Result<MeetingPattern, StatusError> {
    let days: BTreeSet<u32> = match meeting_days {
        MeetingDays::EveryDay => EVERY_DAY_INDICES.into_iter().collect(),
        MeetingDays::Labels(names) => names
            .iter()
            .filter_map(|name| labels.index_of(name))
            .collect(),
    };

    if days.is_empty() {
        let configured = meeting_days.to_labels().join(", ");
        tracing::warn!(labels = %configured, "group schedule resolved to no lesson days");
        return Err(StatusError::Configuration(format!(
            "no recognizable lesson days in [{configured}]"
        )));
    }

    Ok(MeetingPattern { days })
}
