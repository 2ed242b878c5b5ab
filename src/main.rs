use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

mod config;
mod cycles;
mod db;
mod dispatch;
mod error;
mod models;
mod notify;
mod report;
mod schedule;
mod sink;

use crate::config::AppConfig;
use crate::cycles::EngineConfig;
use crate::models::{Group, Payment, PaymentKind};
use crate::notify::{
    BatchKind, DeliveryOutcome, NotificationLog, NotificationLogEntry, StudentEvaluation,
};
use crate::report::{GroupRoster, RosterRow, StatusFilter};
use crate::sink::{Dispatchable, HttpSink, NotificationBatch, NotificationSink};

#[derive(Parser)]
#[command(name = "cycle-billing")]
#[command(about = "Lesson-cycle billing and payment reminders for a tutoring center", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import groups and students from a CSV file
    ImportStudents {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Import payments from a CSV file
    ImportPayments {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Show the billing status of every student
    Status {
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long, value_enum, default_value_t = StatusFilter::All)]
        filter: StatusFilter,
        #[arg(long)]
        json: bool,
    },
    /// Send today's automated payment notifications
    Notify {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Send an operator-written message to one student
    Message {
        #[arg(long)]
        group: String,
        /// Student phone number
        #[arg(long)]
        student: String,
        #[arg(long)]
        text: String,
    },
    /// Record a payment and send a confirmation
    Pay {
        /// Student phone number
        #[arg(long)]
        student: String,
        #[arg(long)]
        amount: i64,
        /// Day the money was received (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Index of the unpaid cycle this payment settles
        #[arg(long)]
        debt_cycle: Option<u32>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Show recently dispatched notification batches
    History {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cycle_billing=info,warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn today_or(date: Option<NaiveDate>, engine: &EngineConfig) -> NaiveDate {
    date.unwrap_or_else(|| engine.today())
}

fn find_group(groups: Vec<Group>, name: &str) -> anyhow::Result<Group> {
    groups
        .into_iter()
        .find(|group| group.name == name)
        .with_context(|| format!("group '{name}' not found"))
}

/// Keeps the run's own error ahead of a failed unlock, which is only logged.
fn finish_locked<T>(result: anyhow::Result<T>, released: anyhow::Result<()>) -> anyhow::Result<T> {
    if let Err(err) = released {
        warn!(error = %err, "notification lock was not released cleanly");
    }
    result
}

fn roster_row_json(roster: &GroupRoster, row: &RosterRow) -> serde_json::Value {
    match &row.outcome {
        Ok(info) => serde_json::json!({
            "group": roster.group.name,
            "student": row.student.display_name(),
            "phone": row.student.phone,
            "status": info,
        }),
        Err(err) => serde_json::json!({
            "group": roster.group.name,
            "student": row.student.display_name(),
            "phone": row.student.phone,
            "error": err.to_string(),
        }),
    }
}

/// One JSON array covering every roster.
fn status_json(rosters: &[GroupRoster], search: &str, filter: StatusFilter) -> serde_json::Value {
    rosters
        .iter()
        .flat_map(|roster| {
            report::filter_students(&roster.rows, search, filter)
                .into_iter()
                .map(move |row| roster_row_json(roster, row))
        })
        .collect()
}

async fn load_rosters(
    pool: &PgPool,
    group: Option<&str>,
    today: NaiveDate,
    engine: &EngineConfig,
) -> anyhow::Result<Vec<GroupRoster>> {
    let groups = db::fetch_groups(pool, group).await?;
    if let Some(name) = group {
        anyhow::ensure!(!groups.is_empty(), "group '{name}' not found");
    }

    let mut rosters = Vec::with_capacity(groups.len());
    for group in groups {
        let students = db::fetch_students(pool, group.id).await?;
        let payments = db::fetch_group_payments(pool, group.id).await?;
        let rows = students
            .into_iter()
            .map(|student| {
                let outcome =
                    cycles::compute_status(&student, Some(&group), &payments, today, engine);
                if let Err(err) = &outcome {
                    warn!(student = %student.id, group = %group.name, error = %err, "status unavailable");
                }
                RosterRow { student, outcome }
            })
            .collect();
        rosters.push(GroupRoster {
            group,
            rows,
            payments,
        });
    }

    Ok(rosters)
}

async fn send_single(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    kind: BatchKind,
    item: Dispatchable,
    date: NaiveDate,
) -> anyhow::Result<bool> {
    let batch = NotificationBatch {
        notifications: vec![item],
        date,
    };
    let outcome = match sink.submit(&batch).await {
        Ok(()) => DeliveryOutcome::Success,
        Err(err) => {
            warn!(error = %err, kind = kind.as_str(), "notification not delivered");
            DeliveryOutcome::Failed
        }
    };
    let entry = NotificationLogEntry::for_batch(kind, &batch.notifications, outcome, Utc::now());
    db::record_dispatch(pool, &entry).await?;
    Ok(outcome == DeliveryOutcome::Success)
}

async fn run_notify(
    pool: &PgPool,
    config: &AppConfig,
    today: NaiveDate,
    dry_run: bool,
) -> anyhow::Result<()> {
    let rosters = load_rosters(pool, None, today, &config.engine).await?;
    let notified = db::fetch_notified_keys(pool, today).await?;

    let evaluations: Vec<StudentEvaluation<'_>> = rosters
        .iter()
        .flat_map(|roster| {
            roster.rows.iter().filter_map(move |row| {
                row.outcome.as_ref().ok().map(|status| StudentEvaluation {
                    student: &row.student,
                    group: &roster.group,
                    status,
                })
            })
        })
        .collect();

    let pending = notify::evaluate(&evaluations, &notified, today);
    if pending.is_empty() {
        println!("No notifications due for {today}.");
        return Ok(());
    }

    if dry_run {
        println!("{} notifications due for {today}:", pending.len());
        for notification in &pending {
            let item = &notification.dispatchable;
            println!(
                "- {} [{}] via {}",
                item.student_name,
                item.notification_type.as_str(),
                item.handle
            );
        }
        return Ok(());
    }

    let sink = HttpSink::new(config.sink_url.clone())?;
    let items: Vec<Dispatchable> = pending
        .iter()
        .map(|notification| notification.dispatchable.clone())
        .collect();

    match notify::deliver(&sink, &pending, today).await {
        Ok(keys) => {
            db::record_notified_keys(pool, &pending, &keys, today).await?;
            let entry = NotificationLogEntry::for_batch(
                BatchKind::AutoGlobal,
                &items,
                DeliveryOutcome::Success,
                Utc::now(),
            );
            db::record_dispatch(pool, &entry).await?;
            info!(count = keys.len(), %today, "notification batch recorded");
            println!("Sent {} payment notifications.", keys.len());
        }
        Err(err) => {
            let entry = NotificationLogEntry::for_batch(
                BatchKind::AutoGlobal,
                &items,
                DeliveryOutcome::Failed,
                Utc::now(),
            );
            db::record_dispatch(pool, &entry).await?;
            println!(
                "Notification batch failed ({err}); {} notifications will be retried on the next run.",
                items.len()
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::ImportStudents { csv } => {
            let imported = db::import_students(&pool, &csv).await?;
            println!("Imported {imported} students from {}.", csv.display());
        }
        Commands::ImportPayments { csv } => {
            let inserted = db::import_payments(&pool, &csv).await?;
            println!("Inserted {inserted} payments from {}.", csv.display());
        }
        Commands::Status {
            group,
            date,
            search,
            filter,
            json,
        } => {
            let today = today_or(date, &config.engine);
            let rosters = load_rosters(&pool, group.as_deref(), today, &config.engine).await?;

            if json {
                let document = status_json(&rosters, &search, filter);
                println!("{}", serde_json::to_string_pretty(&document)?);
                return Ok(());
            }

            for roster in &rosters {
                let rows = report::filter_students(&roster.rows, &search, filter);
                println!("{} ({} students):", roster.group.name, roster.rows.len());
                if rows.is_empty() {
                    println!("  No matching students.");
                }
                for row in rows {
                    match &row.outcome {
                        Ok(info) => println!(
                            "  - {} ({}) {} | lessons left {} | debt {} | balance {}",
                            row.student.display_name(),
                            row.student.phone,
                            info.badge_text,
                            info.lessons_left(),
                            report::format_amount(info.total_debt()),
                            report::format_amount(info.balance)
                        ),
                        Err(err) => println!(
                            "  - {} ({}) {}: {err}",
                            row.student.display_name(),
                            row.student.phone,
                            row.badge()
                        ),
                    }
                }
            }
        }
        Commands::Notify { date, dry_run } => {
            let today = today_or(date, &config.engine);
            let lock = db::acquire_notify_lock(&pool).await?;
            let result = run_notify(&pool, &config, today, dry_run).await;
            finish_locked(result, db::release_notify_lock(lock).await)?;
        }
        Commands::Message {
            group,
            student,
            text,
        } => {
            let target_group = find_group(db::fetch_groups(&pool, Some(&group)).await?, &group)?;
            let target_student = db::fetch_students(&pool, target_group.id)
                .await?
                .into_iter()
                .find(|candidate| candidate.phone == student.trim())
                .with_context(|| format!("no student with phone {student} in group '{group}'"))?;

            let item = dispatch::prepare_manual_message(
                Some(&target_group),
                Some(&target_student),
                &text,
            )?;
            let sink = HttpSink::new(config.sink_url.clone())?;
            let student_name = item.student_name.clone();
            if send_single(&pool, &sink, BatchKind::Manual, item, config.engine.today()).await? {
                println!("Message sent to {student_name}.");
            } else {
                println!("Message to {student_name} could not be delivered.");
            }
        }
        Commands::Pay {
            student,
            amount,
            date,
            debt_cycle,
        } => {
            let paid_on = dispatch::validate_payment(amount, date)?;
            let target = db::find_student_by_phone(&pool, &student)
                .await?
                .with_context(|| format!("no student with phone {student}"))?;
            let group = db::fetch_group(&pool, target.group_id)
                .await?
                .with_context(|| format!("student {} has no group", target.id))?;

            let kind = if debt_cycle.is_some() {
                PaymentKind::Debt
            } else {
                PaymentKind::Current
            };
            let status = if debt_cycle.is_some() {
                let payments = db::fetch_group_payments(&pool, group.id).await?;
                Some(cycles::compute_status(
                    &target,
                    Some(&group),
                    &payments,
                    config.engine.today(),
                    &config.engine,
                )?)
            } else {
                None
            };
            let note = dispatch::payment_note(kind, debt_cycle, status.as_ref())?;

            let payment = Payment {
                id: Uuid::new_v4(),
                student_id: target.id,
                group_id: group.id,
                amount,
                date: paid_on,
                created_at: Utc::now(),
                kind,
                note,
            };
            db::insert_payment(&pool, &payment).await?;
            println!(
                "Recorded {} for {} on {paid_on}.",
                report::format_amount(amount),
                target.display_name()
            );

            match dispatch::prepare_payment_confirmation(&target, &group, amount, paid_on) {
                Some(item) => {
                    let sink = HttpSink::new(config.sink_url.clone())?;
                    if !send_single(&pool, &sink, BatchKind::Payment, item, paid_on).await? {
                        println!("Payment confirmation could not be delivered.");
                    }
                }
                None => info!(student = %target.id, "no messaging handle, confirmation skipped"),
            }
        }
        Commands::Report { group, date, out } => {
            let today = today_or(date, &config.engine);
            let rosters = load_rosters(&pool, group.as_deref(), today, &config.engine).await?;
            let report = report::build_report(&rosters, today);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::History { limit } => {
            let mut log = NotificationLog::default();
            for entry in db::fetch_dispatch_log(&pool, limit.max(1)).await?.into_iter().rev() {
                log.push(entry);
            }

            if log.is_empty() {
                println!("No notifications dispatched yet.");
                return Ok(());
            }

            println!("Last {} notification batch(es):", log.len());
            for entry in log.entries() {
                println!(
                    "{} [{}] {} message(s)",
                    entry.recorded_at.format("%Y-%m-%d %H:%M"),
                    entry.kind.as_str(),
                    entry.count
                );
                for detail in &entry.details {
                    let outcome = match detail.outcome {
                        DeliveryOutcome::Success => "sent",
                        DeliveryOutcome::Failed => "failed",
                    };
                    println!(
                        "  - {}: {} ({outcome})",
                        detail.student,
                        detail.notification_type.as_str()
                    );
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusError;
    use crate::models::{MeetingDays, Student};

    fn group(name: &str) -> Group {
        Group {
            id: Uuid::new_v4(),
            name: name.to_string(),
            course_price: 400_000,
            meeting_days: MeetingDays::EveryDay,
        }
    }

    #[test]
    fn missing_group_is_named_in_error() {
        let err = find_group(vec![group("English Beginners")], "Englsh Beginners").unwrap_err();
        assert_eq!(err.to_string(), "group 'Englsh Beginners' not found");

        let found = find_group(vec![group("Math Olympiad")], "Math Olympiad").unwrap();
        assert_eq!(found.name, "Math Olympiad");
    }

    #[test]
    fn run_error_survives_failed_unlock() {
        let result: anyhow::Result<()> = finish_locked(
            Err(anyhow::anyhow!("sink unreachable")),
            Err(anyhow::anyhow!("connection reset")),
        );
        assert_eq!(result.unwrap_err().to_string(), "sink unreachable");

        let result = finish_locked(Ok(3), Err(anyhow::anyhow!("connection reset")));
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn json_status_is_a_single_array_across_groups() {
        let rosters: Vec<GroupRoster> = ["English Beginners", "Math Olympiad"]
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                let group = group(name);
                let student = Student {
                    id: Uuid::new_v4(),
                    group_id: group.id,
                    first_name: format!("Student{index}"),
                    last_name: "Karimova".to_string(),
                    phone: format!("+99890000000{index}"),
                    enrolled_at: None,
                    messaging_id: None,
                };
                GroupRoster {
                    group,
                    rows: vec![RosterRow {
                        student,
                        outcome: Err(StatusError::Unknown("no enrollment date".to_string())),
                    }],
                    payments: Vec::new(),
                }
            })
            .collect();

        let document = status_json(&rosters, "", StatusFilter::All);
        let items = document.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["group"], "English Beginners");
        assert_eq!(items[1]["group"], "Math Olympiad");
        assert!(items[1]["error"].as_str().unwrap().contains("no enrollment date"));
    }
}
