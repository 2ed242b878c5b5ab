use std::collections::HashSet;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::models::{Group, MeetingDays, Payment, PaymentKind, Student};
use crate::notify::{BatchKind, LogDetail, NotificationLogEntry, PendingNotification};

/// Advisory lock key serializing notification runs across processes.
const NOTIFY_LOCK_KEY: i64 = 0x6379_636c_6562_696c;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn upsert_group(
    pool: &PgPool,
    id: Uuid,
    name: &str,
    course_price: i64,
    meeting_days: &[String],
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO lesson_billing.groups (id, name, course_price, meeting_days)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (name) DO UPDATE
        SET course_price = EXCLUDED.course_price, meeting_days = EXCLUDED.meeting_days
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(name)
    .bind(course_price)
    .bind(meeting_days)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

#[allow(clippy::too_many_arguments)]
async fn upsert_student(
    pool: &PgPool,
    id: Uuid,
    group_id: Uuid,
    first_name: &str,
    last_name: &str,
    phone: &str,
    enrolled_at: Option<DateTime<Utc>>,
    messaging_id: Option<&str>,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO lesson_billing.students
        (id, group_id, first_name, last_name, phone, enrolled_at, messaging_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (phone) DO UPDATE
        SET group_id = EXCLUDED.group_id,
            first_name = EXCLUDED.first_name,
            last_name = EXCLUDED.last_name,
            enrolled_at = EXCLUDED.enrolled_at,
            messaging_id = EXCLUDED.messaging_id
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(group_id)
    .bind(first_name)
    .bind(last_name)
    .bind(phone)
    .bind(enrolled_at)
    .bind(messaging_id)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let groups = vec![
        (
            Uuid::parse_str("8f0c2a4e-5d1b-4c3a-9e7f-1a2b3c4d5e6f")?,
            "English Beginners",
            400_000_i64,
            vec!["Dushanba", "Chorshanba", "Juma"],
        ),
        (
            Uuid::parse_str("2b6d9e1f-7a3c-4f5e-8d2b-6c9a1e3f5b7d")?,
            "Math Olympiad",
            550_000_i64,
            vec!["Every day"],
        ),
    ];

    let mut group_ids = Vec::new();
    for (id, name, price, days) in groups {
        let days: Vec<String> = days.into_iter().map(str::to_string).collect();
        group_ids.push(upsert_group(pool, id, name, price, &days).await?);
    }

    let students = vec![
        (
            Uuid::parse_str("c1a5e7f9-3b2d-4e6a-8c0f-2d4b6a8c0e1f")?,
            group_ids[0],
            "Aziza",
            "Karimova",
            "+998901112233",
            Utc.with_ymd_and_hms(2026, 8, 3, 9, 0, 0)
                .single()
                .context("invalid seed timestamp")?,
            Some("100000001"),
        ),
        (
            Uuid::parse_str("d2b6f8a0-4c3e-4f7b-9d1a-3e5c7b9d1f2a")?,
            group_ids[0],
            "Bekzod",
            "Tursunov",
            "+998935554433",
            Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0)
                .single()
                .context("invalid seed timestamp")?,
            Some("100000002"),
        ),
        (
            Uuid::parse_str("e3c7a9b1-5d4f-4a8c-8e2b-4f6d8c0e2a3b")?,
            group_ids[1],
            "Dilnoza",
            "Rahimova",
            "+998907778899",
            Utc.with_ymd_and_hms(2026, 9, 14, 9, 0, 0)
                .single()
                .context("invalid seed timestamp")?,
            None,
        ),
    ];

    let mut student_ids = Vec::new();
    for (id, group_id, first_name, last_name, phone, enrolled_at, messaging_id) in students {
        let id = upsert_student(
            pool,
            id,
            group_id,
            first_name,
            last_name,
            phone,
            Some(enrolled_at),
            messaging_id,
        )
        .await?;
        student_ids.push((id, group_id));
    }

    let payments = vec![
        ("seed-001", 0, 400_000_i64, NaiveDate::from_ymd_opt(2026, 8, 3)),
        ("seed-002", 1, 400_000_i64, NaiveDate::from_ymd_opt(2026, 6, 1)),
        ("seed-003", 1, 150_000_i64, NaiveDate::from_ymd_opt(2026, 7, 20)),
        ("seed-004", 2, 550_000_i64, NaiveDate::from_ymd_opt(2026, 9, 14)),
    ];

    for (source_key, student_index, amount, paid_on) in payments {
        let (student_id, group_id) = student_ids[student_index];
        let paid_on = paid_on.context("invalid date")?;
        sqlx::query(
            r#"
            INSERT INTO lesson_billing.payments
            (id, student_id, group_id, amount, paid_on, kind, note, source_key)
            VALUES ($1, $2, $3, $4, $5, 'current', 'Current payment', $6)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student_id)
        .bind(group_id)
        .bind(amount)
        .bind(paid_on)
        .bind(source_key)
        .execute(pool)
        .await?;
    }

    Ok(())
}

fn group_from_row(row: &PgRow) -> Group {
    Group {
        id: row.get("id"),
        name: row.get("name"),
        course_price: row.get("course_price"),
        meeting_days: MeetingDays::from_labels(row.get("meeting_days")),
    }
}

fn student_from_row(row: &PgRow) -> Student {
    Student {
        id: row.get("id"),
        group_id: row.get("group_id"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        phone: row.get("phone"),
        enrolled_at: row.get("enrolled_at"),
        messaging_id: row.get("messaging_id"),
    }
}

fn payment_from_row(row: &PgRow) -> Payment {
    let kind: String = row.get("kind");
    Payment {
        id: row.get("id"),
        student_id: row.get("student_id"),
        group_id: row.get("group_id"),
        amount: row.get("amount"),
        date: row.get("paid_on"),
        created_at: row.get("created_at"),
        kind: PaymentKind::parse(&kind),
        note: row.get("note"),
    }
}

pub async fn fetch_groups(pool: &PgPool, name: Option<&str>) -> anyhow::Result<Vec<Group>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, course_price, meeting_days
        FROM lesson_billing.groups
        WHERE $1::TEXT IS NULL OR name = $1
        ORDER BY name
        "#,
    )
    .bind(name)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(group_from_row).collect())
}

pub async fn fetch_group(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<Group>> {
    let row = sqlx::query(
        "SELECT id, name, course_price, meeting_days FROM lesson_billing.groups WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(group_from_row))
}

pub async fn fetch_students(pool: &PgPool, group_id: Uuid) -> anyhow::Result<Vec<Student>> {
    let rows = sqlx::query(
        r#"
        SELECT id, group_id, first_name, last_name, phone, enrolled_at, messaging_id
        FROM lesson_billing.students
        WHERE group_id = $1
        ORDER BY first_name, last_name
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(student_from_row).collect())
}

pub async fn find_student_by_phone(pool: &PgPool, phone: &str) -> anyhow::Result<Option<Student>> {
    let row = sqlx::query(
        r#"
        SELECT id, group_id, first_name, last_name, phone, enrolled_at, messaging_id
        FROM lesson_billing.students
        WHERE phone = $1
        "#,
    )
    .bind(phone.trim())
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(student_from_row))
}

pub async fn fetch_group_payments(pool: &PgPool, group_id: Uuid) -> anyhow::Result<Vec<Payment>> {
    let rows = sqlx::query(
        r#"
        SELECT id, student_id, group_id, amount, paid_on, kind, note, created_at
        FROM lesson_billing.payments
        WHERE group_id = $1
        ORDER BY paid_on, created_at
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(payment_from_row).collect())
}

pub async fn insert_payment(pool: &PgPool, payment: &Payment) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO lesson_billing.payments
        (id, student_id, group_id, amount, paid_on, kind, note, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(payment.id)
    .bind(payment.student_id)
    .bind(payment.group_id)
    .bind(payment.amount)
    .bind(payment.date)
    .bind(payment.kind.as_str())
    .bind(&payment.note)
    .bind(payment.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn import_students(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        group_name: String,
        course_price: i64,
        meeting_days: String,
        first_name: String,
        last_name: String,
        phone: String,
        enrolled_at: DateTime<Utc>,
        messaging_id: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut imported = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let days: Vec<String> = row
            .meeting_days
            .split(';')
            .map(|day| day.trim().to_string())
            .filter(|day| !day.is_empty())
            .collect();
        let group_id =
            upsert_group(pool, Uuid::new_v4(), &row.group_name, row.course_price, &days).await?;

        upsert_student(
            pool,
            Uuid::new_v4(),
            group_id,
            row.first_name.trim(),
            row.last_name.trim(),
            row.phone.trim(),
            Some(row.enrolled_at),
            row.messaging_id.as_deref().filter(|id| !id.trim().is_empty()),
        )
        .await?;
        imported += 1;
    }

    Ok(imported)
}

pub async fn import_payments(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        phone: String,
        amount: i64,
        paid_on: NaiveDate,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let student = find_student_by_phone(pool, &row.phone)
            .await?
            .with_context(|| format!("no student with phone {}", row.phone))?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO lesson_billing.payments
            (id, student_id, group_id, amount, paid_on, kind, note, source_key)
            VALUES ($1, $2, $3, $4, $5, 'current', 'Imported payment', $6)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(student.id)
        .bind(student.group_id)
        .bind(row.amount)
        .bind(row.paid_on)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn fetch_notified_keys(pool: &PgPool, day: NaiveDate) -> anyhow::Result<HashSet<String>> {
    let rows = sqlx::query("SELECT key FROM lesson_billing.notification_keys WHERE sent_on = $1")
        .bind(day)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(|row| row.get("key")).collect())
}

/// Persists the keys of one confirmed batch in a single transaction.
pub async fn record_notified_keys(
    pool: &PgPool,
    sent: &[PendingNotification],
    keys: &[String],
    day: NaiveDate,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for notification in sent
        .iter()
        .filter(|notification| keys.contains(&notification.idempotency_key))
    {
        sqlx::query(
            r#"
            INSERT INTO lesson_billing.notification_keys
            (key, student_id, notification_type, sent_on)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&notification.idempotency_key)
        .bind(notification.dispatchable.student_id)
        .bind(notification.dispatchable.notification_type.as_str())
        .bind(day)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn record_dispatch(pool: &PgPool, entry: &NotificationLogEntry) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO lesson_billing.dispatch_log (id, recorded_at, kind, count, details)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(entry.recorded_at)
    .bind(entry.kind.as_str())
    .bind(i32::try_from(entry.count).unwrap_or(i32::MAX))
    .bind(Json(&entry.details))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_dispatch_log(
    pool: &PgPool,
    limit: i64,
) -> anyhow::Result<Vec<NotificationLogEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT recorded_at, kind, count, details
        FROM lesson_billing.dispatch_log
        ORDER BY recorded_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let kind: String = row.get("kind");
        let count: i32 = row.get("count");
        let details: Json<Vec<LogDetail>> = row.try_get("details")?;
        entries.push(NotificationLogEntry {
            recorded_at: row.get("recorded_at"),
            count: usize::try_from(count).unwrap_or_default(),
            kind: BatchKind::parse(&kind),
            details: details.0,
        });
    }

    Ok(entries)
}

/// Holds a session-level advisory lock until [`release_notify_lock`] is called.
pub async fn acquire_notify_lock(pool: &PgPool) -> anyhow::Result<PoolConnection<Postgres>> {
    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(NOTIFY_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .context("failed to take notification lock")?;
    Ok(conn)
}

/// On failure the connection is closed rather than pooled, ending the session
/// and with it the lock.
pub async fn release_notify_lock(mut conn: PoolConnection<Postgres>) -> anyhow::Result<()> {
    let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(NOTIFY_LOCK_KEY)
        .execute(&mut *conn)
        .await;
    if let Err(err) = unlocked {
        let _ = conn.close().await;
        return Err(err).context("failed to release notification lock");
    }
    Ok(())
}
