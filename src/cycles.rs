use chrono::{DateTime, FixedOffset, Months, NaiveDate, Offset, Utc};
use tracing::debug;

use crate::error::StatusError;
use crate::models::{
    ActiveCycle, Cycle, CycleState, Group, NotificationType, Payment, StatusInfo, Student,
    StudentStatus, LESSONS_PER_CYCLE,
};
use crate::schedule::{resolve_meeting_days, MeetingPattern, WeekdayLabels};

/// Lessons-left threshold at which a reminder becomes due.
pub const REMINDER_THRESHOLD: u32 = 3;

pub const DEFAULT_HORIZON_YEARS: u32 = 2;

/// Longest ledger the engine will build, whatever horizon is requested.
pub const MAX_HORIZON_YEARS: u32 = 50;

/// Tashkent time, UTC+05:00.
pub const DEFAULT_UTC_OFFSET_SECS: i32 = 5 * 3600;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub labels: WeekdayLabels,
    pub horizon_years: u32,
    /// Offset of the center's wall clock; calendar days are cut at its midnight.
    pub utc_offset: FixedOffset,
}

impl EngineConfig {
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.utc_offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.local_date(Utc::now())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            labels: WeekdayLabels::default(),
            horizon_years: DEFAULT_HORIZON_YEARS,
            utc_offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_SECS)
                .unwrap_or_else(|| Utc.fix()),
        }
    }
}

/// Result of settling the payment pool against a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub cycles: Vec<Cycle>,
    pub debts: Vec<Cycle>,
    pub active_index: Option<usize>,
    pub active_paid: bool,
    pub active_paid_amount: i64,
    pub balance: i64,
}

fn open_cycle(index: u32, start_date: NaiveDate) -> Cycle {
    Cycle {
        index,
        start_date,
        end_date: None,
        lessons_elapsed: 0,
        status: CycleState::Active,
        paid_amount: 0,
        debt_amount: 0,
    }
}

/// Splits the days from `enrolled_on` up to the horizon into 12-lesson cycles.
///
/// A cycle closes on its 12th lesson day and the next one opens on the following
/// calendar day, whatever its weekday. The trailing, still open cycle is kept
/// with `end_date == None`.
pub fn build_cycle_ledger(
    enrolled_on: NaiveDate,
    pattern: &MeetingPattern,
    horizon_years: u32,
) -> Vec<Cycle> {
    let limit = horizon_years
        .min(MAX_HORIZON_YEARS)
        .checked_mul(12)
        .and_then(|months| enrolled_on.checked_add_months(Months::new(months)))
        .unwrap_or(NaiveDate::MAX);

    let mut cycles = Vec::new();
    let mut current = open_cycle(1, enrolled_on);
    let mut day = enrolled_on;

    while day <= limit {
        if pattern.is_lesson_day(day) {
            current.lessons_elapsed += 1;
            if current.lessons_elapsed == LESSONS_PER_CYCLE {
                current.end_date = Some(day);
                let Some(next_start) = day.succ_opt() else {
                    break;
                };
                let next = open_cycle(current.index + 1, next_start);
                cycles.push(std::mem::replace(&mut current, next));
            }
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    cycles.push(current);
    cycles
}

/// Settles cycles that closed before `today` against the pooled payment total,
/// oldest first, then the active cycle with whatever is left.
pub fn allocate_payments(
    mut cycles: Vec<Cycle>,
    payments: &[Payment],
    course_price: i64,
    today: NaiveDate,
) -> Allocation {
    let mut pool: i64 = payments.iter().map(|payment| payment.amount).sum();
    let mut debts = Vec::new();

    for cycle in cycles.iter_mut().filter(|cycle| cycle.is_closed_before(today)) {
        if pool >= course_price {
            cycle.status = CycleState::Paid;
            cycle.paid_amount = course_price;
            pool -= course_price;
        } else if pool > 0 {
            cycle.status = CycleState::Partial;
            cycle.paid_amount = pool;
            cycle.debt_amount = course_price - pool;
            pool = 0;
            debts.push(cycle.clone());
        } else {
            cycle.status = CycleState::Unpaid;
            cycle.debt_amount = course_price;
            debts.push(cycle.clone());
        }
    }

    let active_index = cycles.iter().position(|cycle| cycle.contains(today));
    let mut active_paid = false;
    let mut active_paid_amount = 0;

    if let Some(cycle) = active_index.and_then(|index| cycles.get_mut(index)) {
        if pool >= course_price {
            cycle.status = CycleState::Paid;
            cycle.paid_amount = course_price;
            pool -= course_price;
            active_paid = true;
            active_paid_amount = course_price;
        } else if pool > 0 {
            cycle.paid_amount = pool;
            active_paid_amount = pool;
        }
    }

    Allocation {
        cycles,
        debts,
        active_index,
        active_paid,
        active_paid_amount,
        balance: pool,
    }
}

/// Lesson days in `from..=through`, capped at one cycle's worth.
pub fn count_lessons(pattern: &MeetingPattern, from: NaiveDate, through: NaiveDate) -> u32 {
    let mut count = 0;
    let mut day = from;
    while day <= through && count < LESSONS_PER_CYCLE {
        if pattern.is_lesson_day(day) {
            count += 1;
        }
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    count
}

fn classify_active(active: &ActiveCycle) -> (StudentStatus, String) {
    if active.is_paid {
        return (StudentStatus::Paid, "Paid".to_string());
    }
    if active.lessons_passed == LESSONS_PER_CYCLE {
        (StudentStatus::Urgent, "Payment required now".to_string())
    } else if active.lessons_left == 1 {
        (StudentStatus::Critical, "Last lesson remaining".to_string())
    } else if (1..=REMINDER_THRESHOLD).contains(&active.lessons_left) {
        (
            StudentStatus::Warning,
            format!("{} lessons left, payment due soon", active.lessons_left),
        )
    } else {
        (StudentStatus::Active, "Active".to_string())
    }
}

/// Computes the billing position of `student` in `group` as of `today`.
///
/// Only payments belonging to the student are considered. The function is pure:
/// identical inputs always produce identical output.
pub fn compute_status(
    student: &Student,
    group: Option<&Group>,
    payments: &[Payment],
    today: NaiveDate,
    config: &EngineConfig,
) -> Result<StatusInfo, StatusError> {
    let group = group.ok_or_else(|| {
        StatusError::Unknown(format!("student {} has no group", student.id))
    })?;
    let enrolled_at = student.enrolled_at.ok_or_else(|| {
        StatusError::Unknown(format!("student {} has no enrollment date", student.id))
    })?;
    if group.course_price <= 0 {
        return Err(StatusError::Configuration(format!(
            "group {} has non-positive course price {}",
            group.name, group.course_price
        )));
    }

    let pattern = resolve_meeting_days(&group.meeting_days, &config.labels)?;

    let mut own_payments: Vec<Payment> = payments
        .iter()
        .filter(|payment| payment.student_id == student.id)
        .cloned()
        .collect();
    own_payments.sort_by(|a, b| a.date.cmp(&b.date).then(a.created_at.cmp(&b.created_at)));
    let total_paid: i64 = own_payments.iter().map(|payment| payment.amount).sum();

    let ledger = build_cycle_ledger(config.local_date(enrolled_at), &pattern, config.horizon_years);
    let allocation = allocate_payments(ledger, &own_payments, group.course_price, today);

    let active_cycle = allocation
        .active_index
        .and_then(|index| allocation.cycles.get(index))
        .map(|cycle| {
            let lessons_passed = count_lessons(&pattern, cycle.start_date, today);
            ActiveCycle {
                index: cycle.index,
                start_date: cycle.start_date,
                end_date: cycle.end_date,
                lessons_passed,
                lessons_left: LESSONS_PER_CYCLE - lessons_passed,
                is_paid: allocation.active_paid,
                paid_amount: allocation.active_paid_amount,
            }
        });

    let (mut status, mut badge_text) = match &active_cycle {
        Some(active) => classify_active(active),
        None => (StudentStatus::Pending, "New / pending".to_string()),
    };

    let debts = allocation.debts;
    if !debts.is_empty() {
        if status == StudentStatus::Urgent {
            badge_text = "Debt + payment due today".to_string();
        } else {
            status = StudentStatus::Expired;
            badge_text = format!("{} unpaid cycle(s)", debts.len());
        }
    }

    let active_paid = active_cycle.as_ref().is_some_and(|active| active.is_paid);
    let lessons_left = active_cycle.as_ref().map(|active| active.lessons_left);
    let near_deadline = lessons_left.is_some_and(|left| left <= REMINDER_THRESHOLD);
    let needs_notification = !active_paid && (near_deadline || !debts.is_empty());

    let notification_type = if !needs_notification {
        NotificationType::None
    } else if !debts.is_empty() {
        NotificationType::Debt
    } else if lessons_left == Some(0) {
        NotificationType::Deadline
    } else {
        NotificationType::Reminder
    };

    debug!(
        student = %student.id,
        lesson_days = ?pattern.weekday_indices(),
        status = status.as_str(),
        debts = debts.len(),
        "computed billing status"
    );

    Ok(StatusInfo {
        total_paid,
        balance: allocation.balance,
        course_price: group.course_price,
        debts,
        cycles: allocation.cycles,
        active_cycle,
        status,
        badge_text,
        needs_notification,
        notification_type,
        last_payment_on: own_payments.last().map(|payment| payment.date),
    })
}
