use chrono::NaiveDate;

use crate::error::ValidationError;
use crate::models::{Group, NotificationType, PaymentKind, StatusInfo, Student};
use crate::report::format_amount;
use crate::sink::Dispatchable;

/// Validates an operator-composed message and wraps it for the sink.
///
/// Billing state is not consulted and the daily idempotency gate does not apply.
pub fn prepare_manual_message(
    group: Option<&Group>,
    student: Option<&Student>,
    text: &str,
) -> Result<Dispatchable, ValidationError> {
    let group = group.ok_or(ValidationError::GroupNotSelected)?;
    let student = student.ok_or(ValidationError::StudentNotSelected)?;
    let message = text.trim();
    if message.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    let handle = student.handle().ok_or_else(|| ValidationError::MissingHandle {
        student: student.display_name(),
    })?;

    Ok(Dispatchable {
        handle: handle.to_string(),
        student_id: student.id,
        group_id: group.id,
        student_name: student.display_name(),
        message: message.to_string(),
        notification_type: NotificationType::Manual,
    })
}

pub fn validate_payment(amount: i64, date: Option<NaiveDate>) -> Result<NaiveDate, ValidationError> {
    if amount <= 0 {
        return Err(ValidationError::InvalidAmount(amount));
    }
    date.ok_or(ValidationError::MissingDate)
}

/// Note stored with a payment; debt payments name the cycle they settle.
pub fn payment_note(
    kind: PaymentKind,
    debt_cycle: Option<u32>,
    status: Option<&StatusInfo>,
) -> Result<String, ValidationError> {
    match (kind, debt_cycle) {
        (PaymentKind::Debt, Some(index)) => {
            let cycle = status
                .and_then(|info| info.debts.iter().find(|cycle| cycle.index == index))
                .ok_or(ValidationError::UnknownDebtCycle(index))?;
            let end = cycle
                .end_date
                .map(|end| end.to_string())
                .unwrap_or_default();
            Ok(format!("Debt payment: {} - {}", cycle.start_date, end))
        }
        _ => Ok("Current payment".to_string()),
    }
}

/// Receipt for a recorded payment, or `None` when the student cannot be reached.
pub fn prepare_payment_confirmation(
    student: &Student,
    group: &Group,
    amount: i64,
    paid_on: NaiveDate,
) -> Option<Dispatchable> {
    let handle = student.handle()?;
    let student_name = student.display_name();
    let message = format!(
        "Hello {student_name}! We received your payment of {} on {}. Thank you!",
        format_amount(amount),
        paid_on.format("%d.%m.%Y")
    );

    Some(Dispatchable {
        handle: handle.to_string(),
        student_id: student.id,
        group_id: group.id,
        student_name,
        message,
        notification_type: NotificationType::PaymentConfirmation,
    })
}
