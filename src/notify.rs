use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cycles::REMINDER_THRESHOLD;
use crate::error::DispatchError;
use crate::models::{Group, NotificationType, StatusInfo, Student};
use crate::report::format_amount;
use crate::sink::{Dispatchable, NotificationBatch, NotificationSink};

/// Number of batches kept by [`NotificationLog`].
pub const LOG_CAPACITY: usize = 10;

/// Read side of the idempotency store.
pub trait NotifiedKeys {
    fn is_notified(&self, key: &str) -> bool;
}

impl NotifiedKeys for HashSet<String> {
    fn is_notified(&self, key: &str) -> bool {
        self.contains(key)
    }
}

pub fn idempotency_key(student_id: Uuid, day: NaiveDate) -> String {
    format!("{student_id}_{day}")
}

/// A student together with the status computed for the current pass.
#[derive(Debug, Clone, Copy)]
pub struct StudentEvaluation<'a> {
    pub student: &'a Student,
    pub group: &'a Group,
    pub status: &'a StatusInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotification {
    pub idempotency_key: String,
    pub dispatchable: Dispatchable,
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render_debt_message(student_name: &str, total_debt: i64) -> String {
    format!(
        "<b>⛔️ OUTSTANDING BALANCE</b>\n\n\
         👤 Dear <b>{}</b>!\n\n\
         Your account has an unpaid balance.\n\n\
         📉 Amount due: <b>{}</b>\n\n\
         Please settle it as soon as possible to keep your place in the group.",
        escape_html(student_name),
        format_amount(total_debt)
    )
}

pub fn render_deadline_message(student_name: &str) -> String {
    format!(
        "<b>🚨 PAYMENT DUE TODAY</b>\n\n\
         👤 Dear <b>{}</b>!\n\n\
         Your paid lesson cycle ends <b>today</b>.\n\n\
         Please make your payment today to keep attending without interruption.",
        escape_html(student_name)
    )
}

pub fn render_reminder_message(student_name: &str, lessons_left: u32) -> String {
    format!(
        "<b>⏳ PAYMENT REMINDER</b>\n\n\
         👤 Dear <b>{}</b>!\n\n\
         <b>{lessons_left}</b> lesson(s) left before your next payment is due.\n\n\
         ✨ <i>Thank you for studying with us!</i>",
        escape_html(student_name)
    )
}

fn select_template(status: &StatusInfo, student_name: &str) -> Option<(NotificationType, String)> {
    if !status.debts.is_empty() {
        return Some((
            NotificationType::Debt,
            render_debt_message(student_name, status.total_debt()),
        ));
    }
    let active = status.active_cycle.as_ref()?;
    match active.lessons_left {
        0 => Some((
            NotificationType::Deadline,
            render_deadline_message(student_name),
        )),
        left if left <= REMINDER_THRESHOLD => Some((
            NotificationType::Reminder,
            render_reminder_message(student_name, left),
        )),
        _ => None,
    }
}

/// Picks the automated notifications due on `today`, at most one per student.
///
/// Students already holding a key in `notified`, paid for the active cycle, or
/// without a messaging handle are skipped.
pub fn evaluate<K: NotifiedKeys + ?Sized>(
    students: &[StudentEvaluation<'_>],
    notified: &K,
    today: NaiveDate,
) -> Vec<PendingNotification> {
    let mut seen = HashSet::new();
    let mut pending = Vec::new();

    for entry in students {
        let status = entry.status;
        if !status.needs_notification || status.is_paid_for_current_cycle() {
            continue;
        }
        let Some(handle) = entry.student.handle() else {
            debug!(student = %entry.student.id, "no messaging handle, skipping");
            continue;
        };

        let key = idempotency_key(entry.student.id, today);
        if notified.is_notified(&key) || seen.contains(&key) {
            continue;
        }

        let student_name = entry.student.display_name();
        let Some((notification_type, message)) = select_template(status, &student_name) else {
            continue;
        };

        seen.insert(key.clone());
        pending.push(PendingNotification {
            idempotency_key: key,
            dispatchable: Dispatchable {
                handle: handle.to_string(),
                student_id: entry.student.id,
                group_id: entry.group.id,
                student_name,
                message,
                notification_type,
            },
        });
    }

    info!(count = pending.len(), %today, "evaluated automated notifications");
    pending
}

/// Keys to persist once the sink has confirmed the batch.
pub fn mark_sent(pending: &[PendingNotification]) -> Vec<String> {
    pending
        .iter()
        .map(|notification| notification.idempotency_key.clone())
        .collect()
}

/// Submits `pending` as one batch; keys are returned only when the whole batch
/// was accepted, so a failed batch is retried in full on the next run.
pub async fn deliver<S: NotificationSink + ?Sized>(
    sink: &S,
    pending: &[PendingNotification],
    date: NaiveDate,
) -> Result<Vec<String>, DispatchError> {
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    let batch = NotificationBatch {
        notifications: pending
            .iter()
            .map(|notification| notification.dispatchable.clone())
            .collect(),
        date,
    };

    match sink.submit(&batch).await {
        Ok(()) => Ok(mark_sent(pending)),
        Err(err) => {
            warn!(error = %err, count = pending.len(), "notification batch failed, keys not marked");
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    AutoGlobal,
    Manual,
    Payment,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::AutoGlobal => "auto_global",
            BatchKind::Manual => "manual",
            BatchKind::Payment => "payment",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "manual" => BatchKind::Manual,
            "payment" => BatchKind::Payment,
            _ => BatchKind::AutoGlobal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDetail {
    pub student: String,
    pub notification_type: NotificationType,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationLogEntry {
    pub recorded_at: DateTime<Utc>,
    pub count: usize,
    pub kind: BatchKind,
    pub details: Vec<LogDetail>,
}

impl NotificationLogEntry {
    pub fn for_batch(
        kind: BatchKind,
        items: &[Dispatchable],
        outcome: DeliveryOutcome,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let details = items
            .iter()
            .map(|item| LogDetail {
                student: item.student_name.clone(),
                notification_type: item.notification_type,
                outcome,
            })
            .collect::<Vec<_>>();
        Self {
            recorded_at,
            count: details.len(),
            kind,
            details,
        }
    }
}

/// Newest-first rolling history of dispatched batches.
#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    entries: VecDeque<NotificationLogEntry>,
}

impl NotificationLog {
    pub fn push(&mut self, entry: NotificationLogEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(LOG_CAPACITY);
    }

    pub fn entries(&self) -> impl Iterator<Item = &NotificationLogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::cycles::{compute_status, EngineConfig};
    use crate::models::MeetingDays;

    const PRICE: i64 = 100_000;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn group() -> Group {
        Group {
            id: Uuid::new_v4(),
            name: "Evening B".to_string(),
            course_price: PRICE,
            meeting_days: MeetingDays::Labels(vec![
                "Dushanba".to_string(),
                "Chorshanba".to_string(),
                "Juma".to_string(),
            ]),
        }
    }

    fn student(group: &Group, handle: Option<&str>) -> Student {
        Student {
            id: Uuid::new_v4(),
            group_id: group.id,
            first_name: "Bekzod".to_string(),
            last_name: "Tursunov".to_string(),
            phone: "+998935554433".to_string(),
            enrolled_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()),
            messaging_id: handle.map(str::to_string),
        }
    }

    fn status(student: &Student, group: &Group, today: NaiveDate) -> StatusInfo {
        compute_status(student, Some(group), &[], today, &EngineConfig::default()).unwrap()
    }

    struct RecordingSink {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn submit(&self, _batch: &NotificationBatch) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DispatchError::Rejected { status: 502 })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn boundary_day_yields_deadline_template() {
        let group = group();
        let student = student(&group, Some("777"));
        let today = date(2024, 1, 26);
        let info = status(&student, &group, today);
        let entries = [StudentEvaluation {
            student: &student,
            group: &group,
            status: &info,
        }];

        let pending = evaluate(&entries, &HashSet::<String>::new(), today);
        assert_eq!(pending.len(), 1);
        let item = &pending[0].dispatchable;
        assert_eq!(item.notification_type, NotificationType::Deadline);
        assert_eq!(item.handle, "777");
        assert!(item.message.contains("PAYMENT DUE TODAY"));
        assert_eq!(pending[0].idempotency_key, idempotency_key(student.id, today));
    }

    #[test]
    fn debt_wins_over_boundary_day() {
        let group = group();
        let student = student(&group, Some("777"));
        let today = date(2024, 2, 23);
        let info = status(&student, &group, today);
        assert_eq!(info.active_cycle.as_ref().unwrap().lessons_left, 0);
        let entries = [StudentEvaluation {
            student: &student,
            group: &group,
            status: &info,
        }];

        let pending = evaluate(&entries, &HashSet::<String>::new(), today);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].dispatchable.notification_type, NotificationType::Debt);
        assert!(pending[0].dispatchable.message.contains("100 000"));
    }

    #[test]
    fn reminder_reports_lessons_left() {
        let group = group();
        let student = student(&group, Some("777"));
        let today = date(2024, 1, 22);
        let info = status(&student, &group, today);
        let entries = [StudentEvaluation {
            student: &student,
            group: &group,
            status: &info,
        }];

        let pending = evaluate(&entries, &HashSet::<String>::new(), today);
        assert_eq!(pending[0].dispatchable.notification_type, NotificationType::Reminder);
        assert!(pending[0].dispatchable.message.contains("<b>2</b> lesson(s) left"));
    }

    #[test]
    fn skips_notified_unreachable_and_quiet_students() {
        let group = group();
        let today = date(2024, 1, 26);
        let notified_student = student(&group, Some("111"));
        let no_handle = student(&group, Some("   "));
        let quiet = student(&group, Some("333"));

        let notified_info = status(&notified_student, &group, today);
        let no_handle_info = status(&no_handle, &group, today);
        let quiet_info = status(&quiet, &group, date(2024, 1, 10));

        let entries = [
            StudentEvaluation {
                student: &notified_student,
                group: &group,
                status: &notified_info,
            },
            StudentEvaluation {
                student: &no_handle,
                group: &group,
                status: &no_handle_info,
            },
            StudentEvaluation {
                student: &quiet,
                group: &group,
                status: &quiet_info,
            },
        ];
        let mut notified = HashSet::new();
        notified.insert(idempotency_key(notified_student.id, today));

        assert!(evaluate(&entries, &notified, today).is_empty());
    }

    #[test]
    fn at_most_one_notification_per_student_per_pass() {
        let group = group();
        let student = student(&group, Some("777"));
        let today = date(2024, 1, 26);
        let first = status(&student, &group, today);
        let recomputed = status(&student, &group, today);
        let entries = [
            StudentEvaluation {
                student: &student,
                group: &group,
                status: &first,
            },
            StudentEvaluation {
                student: &student,
                group: &group,
                status: &recomputed,
            },
        ];

        let pending = evaluate(&entries, &HashSet::<String>::new(), today);
        assert_eq!(pending.len(), 1);
        assert_eq!(mark_sent(&pending), vec![idempotency_key(student.id, today)]);
    }

    #[test]
    fn names_are_escaped_in_templates() {
        let message = render_deadline_message("Tom <script>");
        assert!(message.contains("Tom &lt;script&gt;"));
    }

    #[tokio::test]
    async fn failed_batch_marks_no_keys() {
        let group = group();
        let student = student(&group, Some("777"));
        let today = date(2024, 1, 26);
        let info = status(&student, &group, today);
        let entries = [StudentEvaluation {
            student: &student,
            group: &group,
            status: &info,
        }];
        let pending = evaluate(&entries, &HashSet::<String>::new(), today);

        let failing = RecordingSink {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let result = deliver(&failing, &pending, today).await;
        assert!(matches!(result, Err(DispatchError::Rejected { status: 502 })));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        let working = RecordingSink {
            calls: AtomicUsize::new(0),
            fail: false,
        };
        let keys = deliver(&working, &pending, today).await.unwrap();
        assert_eq!(keys, mark_sent(&pending));
    }

    #[tokio::test]
    async fn empty_batch_skips_sink() {
        let sink = RecordingSink {
            calls: AtomicUsize::new(0),
            fail: true,
        };
        let keys = deliver(&sink, &[], date(2024, 1, 26)).await.unwrap();
        assert!(keys.is_empty());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn log_keeps_newest_ten_batches() {
        let mut log = NotificationLog::default();
        for minute in 0..12 {
            let at = Utc.with_ymd_and_hms(2024, 1, 26, 9, minute, 0).unwrap();
            log.push(NotificationLogEntry::for_batch(
                BatchKind::AutoGlobal,
                &[],
                DeliveryOutcome::Success,
                at,
            ));
        }

        assert_eq!(log.len(), LOG_CAPACITY);
        let newest = log.entries().next().unwrap();
        assert_eq!(newest.recorded_at.format("%M").to_string(), "11");
    }
}
