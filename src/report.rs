use std::fmt::Write;

use chrono::NaiveDate;

use crate::error::StatusError;
use crate::models::{Group, Payment, StatusInfo, Student, StudentStatus};

/// Groups digits in thousands: `1200000` -> `1 200 000`.
pub fn format_amount(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        grouped.push('-');
    }
    for (position, digit) in digits.chars().enumerate() {
        if position > 0 && (digits.len() - position) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(digit);
    }
    grouped
}

#[derive(Debug, Clone)]
pub struct RosterRow {
    pub student: Student,
    pub outcome: Result<StatusInfo, StatusError>,
}

impl RosterRow {
    pub fn badge(&self) -> &str {
        match &self.outcome {
            Ok(info) => info.badge_text.as_str(),
            Err(err) => err.badge_text(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupRoster {
    pub group: Group,
    pub rows: Vec<RosterRow>,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StatusFilter {
    All,
    Paid,
    Debtors,
    /// Warning, critical or urgent.
    Due,
}

impl StatusFilter {
    fn matches(&self, outcome: &Result<StatusInfo, StatusError>) -> bool {
        match (self, outcome) {
            (StatusFilter::All, _) => true,
            (_, Err(_)) => false,
            (StatusFilter::Paid, Ok(info)) => info.status == StudentStatus::Paid,
            (StatusFilter::Debtors, Ok(info)) => !info.debts.is_empty(),
            (StatusFilter::Due, Ok(info)) => info.status.is_due(),
        }
    }
}

/// Case-insensitive name search combined with a status tab.
pub fn filter_students<'a>(
    rows: &'a [RosterRow],
    query: &str,
    filter: StatusFilter,
) -> Vec<&'a RosterRow> {
    let needle = query.trim().to_lowercase();
    rows.iter()
        .filter(|row| {
            needle.is_empty() || row.student.display_name().to_lowercase().contains(&needle)
        })
        .filter(|row| filter.matches(&row.outcome))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSummary {
    pub total_students: usize,
    pub paid_students: usize,
    pub debtors: usize,
    pub due_students: usize,
    pub unresolved: usize,
    pub total_income: i64,
    pub total_debt: i64,
}

pub fn summarize_group(rows: &[RosterRow], payments: &[Payment]) -> GroupSummary {
    let mut summary = GroupSummary {
        total_students: rows.len(),
        total_income: payments.iter().map(|payment| payment.amount).sum(),
        ..GroupSummary::default()
    };

    for row in rows {
        match &row.outcome {
            Ok(info) => {
                if info.is_paid_for_current_cycle() {
                    summary.paid_students += 1;
                }
                if !info.debts.is_empty() {
                    summary.debtors += 1;
                    summary.total_debt += info.total_debt();
                }
                if info.status.is_due() {
                    summary.due_students += 1;
                }
            }
            Err(_) => summary.unresolved += 1,
        }
    }

    summary
}

pub fn build_report(rosters: &[GroupRoster], today: NaiveDate) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Tuition Billing Report");
    let _ = writeln!(output, "Generated for {today}");

    if rosters.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "No groups recorded.");
        return output;
    }

    for roster in rosters {
        let summary = summarize_group(&roster.rows, &roster.payments);

        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "## {} (course price {})",
            roster.group.name,
            format_amount(roster.group.course_price)
        );
        let _ = writeln!(
            output,
            "- Students: {} ({} paid, {} due soon, {} in debt, {} unresolved)",
            summary.total_students,
            summary.paid_students,
            summary.due_students,
            summary.debtors,
            summary.unresolved
        );
        let _ = writeln!(output, "- Income: {}", format_amount(summary.total_income));
        let _ = writeln!(output, "- Outstanding debt: {}", format_amount(summary.total_debt));
        let _ = writeln!(output);

        if roster.rows.is_empty() {
            let _ = writeln!(output, "No students enrolled.");
            continue;
        }

        let _ = writeln!(output, "| Student | Status | Lessons left | Debt |");
        let _ = writeln!(output, "|---|---|---|---|");
        for row in roster.rows.iter() {
            let (lessons_left, debt) = match &row.outcome {
                Ok(info) => (
                    info.active_cycle
                        .as_ref()
                        .map_or("-".to_string(), |cycle| cycle.lessons_left.to_string()),
                    format_amount(info.total_debt()),
                ),
                Err(_) => ("-".to_string(), "-".to_string()),
            };
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                row.student.display_name(),
                row.badge(),
                lessons_left,
                debt
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::{compute_status, EngineConfig};
    use crate::models::{MeetingDays, PaymentKind};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn group() -> Group {
        Group {
            id: Uuid::new_v4(),
            name: "Math 7".to_string(),
            course_price: 100_000,
            meeting_days: MeetingDays::Labels(vec![
                "Tuesday".to_string(),
                "Thursday".to_string(),
            ]),
        }
    }

    fn student(group: &Group, first_name: &str, enrolled: Option<NaiveDate>) -> Student {
        Student {
            id: Uuid::new_v4(),
            group_id: group.id,
            first_name: first_name.to_string(),
            last_name: "Sobirov".to_string(),
            phone: format!("+99890{first_name}"),
            enrolled_at: enrolled
                .map(|day| Utc.from_utc_datetime(&day.and_hms_opt(10, 0, 0).unwrap())),
            messaging_id: None,
        }
    }

    fn payment(student: &Student, amount: i64) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            student_id: student.id,
            group_id: student.group_id,
            amount,
            date: date(2024, 1, 2),
            created_at: Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap(),
            kind: PaymentKind::Current,
            note: "Current payment".to_string(),
        }
    }

    fn roster(today: NaiveDate) -> GroupRoster {
        let group = group();
        let paid = student(&group, "Jasur", Some(date(2024, 1, 2)));
        let debtor = student(&group, "Madina", Some(date(2023, 11, 7)));
        let unknown = student(&group, "Otabek", None);
        let payments = vec![payment(&paid, 100_000)];

        let rows = [paid, debtor, unknown]
            .into_iter()
            .map(|student| RosterRow {
                outcome: compute_status(
                    &student,
                    Some(&group),
                    &payments,
                    today,
                    &EngineConfig::default(),
                ),
                student,
            })
            .collect();

        GroupRoster {
            group,
            rows,
            payments,
        }
    }

    #[test]
    fn amounts_are_grouped_in_thousands() {
        assert_eq!(format_amount(0), "0");
        assert_eq!(format_amount(950), "950");
        assert_eq!(format_amount(1_000), "1 000");
        assert_eq!(format_amount(1_200_000), "1 200 000");
        assert_eq!(format_amount(-40_000), "-40 000");
    }

    #[test]
    fn summary_counts_each_bucket() {
        let roster = roster(date(2024, 1, 16));
        let summary = summarize_group(&roster.rows, &roster.payments);

        assert_eq!(summary.total_students, 3);
        assert_eq!(summary.paid_students, 1);
        assert_eq!(summary.debtors, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.total_income, 100_000);
        assert!(summary.total_debt >= 100_000);
    }

    #[test]
    fn filters_combine_search_and_tab() {
        let roster = roster(date(2024, 1, 16));

        assert_eq!(filter_students(&roster.rows, "", StatusFilter::All).len(), 3);
        let debtors = filter_students(&roster.rows, "", StatusFilter::Debtors);
        assert_eq!(debtors.len(), 1);
        assert_eq!(debtors[0].student.first_name, "Madina");

        let paid = filter_students(&roster.rows, "jas", StatusFilter::Paid);
        assert_eq!(paid.len(), 1);
        assert!(filter_students(&roster.rows, "jas", StatusFilter::Debtors).is_empty());
    }

    #[test]
    fn report_lists_groups_and_badges() {
        let roster = roster(date(2024, 1, 16));
        let report = build_report(&[roster], date(2024, 1, 16));

        assert!(report.contains("# Tuition Billing Report"));
        assert!(report.contains("## Math 7 (course price 100 000)"));
        assert!(report.contains("| Jasur Sobirov | Paid |"));
        assert!(report.contains("| Otabek Sobirov | Unknown | - | - |"));
    }

    #[test]
    fn report_without_groups() {
        let report = build_report(&[], date(2024, 1, 16));
        assert!(report.contains("No groups recorded."));
    }
}
