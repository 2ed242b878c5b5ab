use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of qualifying lessons in one billing cycle.
pub const LESSONS_PER_CYCLE: u32 = 12;

/// Label the roster uses for groups that meet on every lesson day.
pub const EVERY_DAY_LABEL: &str = "Every day";

#[derive(Debug, Clone)]
pub struct Student {
    pub id: Uuid,
    pub group_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub messaging_id: Option<String>,
}

impl Student {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Registered messaging handle, ignoring blank values.
    pub fn handle(&self) -> Option<&str> {
        self.messaging_id
            .as_deref()
            .map(str::trim)
            .filter(|handle| !handle.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingDays {
    EveryDay,
    Labels(Vec<String>),
}

impl MeetingDays {
    /// Interprets stored day labels; any occurrence of the sentinel wins.
    pub fn from_labels(labels: Vec<String>) -> Self {
        if labels.iter().any(|label| label.trim() == EVERY_DAY_LABEL) {
            MeetingDays::EveryDay
        } else {
            MeetingDays::Labels(labels)
        }
    }

    pub fn to_labels(&self) -> Vec<String> {
        match self {
            MeetingDays::EveryDay => vec![EVERY_DAY_LABEL.to_string()],
            MeetingDays::Labels(labels) => labels.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub course_price: i64,
    pub meeting_days: MeetingDays,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Current,
    Debt,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Current => "current",
            PaymentKind::Debt => "debt",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "debt" => PaymentKind::Debt,
            _ => PaymentKind::Current,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Payment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub group_id: Uuid,
    pub amount: i64,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub kind: PaymentKind,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    /// Not yet settled against the payment pool.
    Active,
    Paid,
    Partial,
    Unpaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cycle {
    pub index: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub lessons_elapsed: u32,
    pub status: CycleState,
    pub paid_amount: i64,
    pub debt_amount: i64,
}

impl Cycle {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start_date <= day && self.end_date.map_or(true, |end| end >= day)
    }

    pub fn is_closed_before(&self, day: NaiveDate) -> bool {
        self.end_date.is_some_and(|end| end < day)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveCycle {
    pub index: u32,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub lessons_passed: u32,
    pub lessons_left: u32,
    pub is_paid: bool,
    pub paid_amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    Paid,
    Urgent,
    Critical,
    Warning,
    Active,
    Expired,
    Pending,
}

impl StudentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StudentStatus::Paid => "paid",
            StudentStatus::Urgent => "urgent",
            StudentStatus::Critical => "critical",
            StudentStatus::Warning => "warning",
            StudentStatus::Active => "active",
            StudentStatus::Expired => "expired",
            StudentStatus::Pending => "pending",
        }
    }

    pub fn is_due(&self) -> bool {
        matches!(
            self,
            StudentStatus::Urgent | StudentStatus::Critical | StudentStatus::Warning
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "reminder")]
    Reminder,
    #[serde(rename = "last_day_warning")]
    Deadline,
    #[serde(rename = "debt")]
    Debt,
    #[serde(rename = "manual_message")]
    Manual,
    #[serde(rename = "payment_success")]
    PaymentConfirmation,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::None => "none",
            NotificationType::Reminder => "reminder",
            NotificationType::Deadline => "last_day_warning",
            NotificationType::Debt => "debt",
            NotificationType::Manual => "manual_message",
            NotificationType::PaymentConfirmation => "payment_success",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusInfo {
    pub total_paid: i64,
    pub balance: i64,
    pub course_price: i64,
    pub debts: Vec<Cycle>,
    pub cycles: Vec<Cycle>,
    pub active_cycle: Option<ActiveCycle>,
    pub status: StudentStatus,
    pub badge_text: String,
    pub needs_notification: bool,
    pub notification_type: NotificationType,
    pub last_payment_on: Option<NaiveDate>,
}

impl StatusInfo {
    pub fn total_debt(&self) -> i64 {
        self.debts.iter().map(|cycle| cycle.debt_amount).sum()
    }

    pub fn lessons_left(&self) -> u32 {
        self.active_cycle
            .as_ref()
            .map_or(LESSONS_PER_CYCLE, |cycle| cycle.lessons_left)
    }

    pub fn is_paid_for_current_cycle(&self) -> bool {
        self.active_cycle.as_ref().is_some_and(|cycle| cycle.is_paid)
    }
}
