use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::NotificationType;

pub const DEFAULT_SINK_URL: &str = "http://localhost:8000/send-notifications";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// One message ready for the outbound sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatchable {
    pub handle: String,
    pub student_id: Uuid,
    pub group_id: Uuid,
    pub student_name: String,
    pub message: String,
    pub notification_type: NotificationType,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationBatch {
    pub notifications: Vec<Dispatchable>,
    pub date: NaiveDate,
}

/// Accepts or rejects a whole batch; there is no per-item acknowledgement.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn submit(&self, batch: &NotificationBatch) -> Result<(), DispatchError>;
}

pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpSink {
    async fn submit(&self, batch: &NotificationBatch) -> Result<(), DispatchError> {
        let body = serde_json::to_vec(batch)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = status.as_u16(), "notification sink rejected batch");
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
            });
        }

        info!(
            url = %self.url,
            count = batch.notifications.len(),
            "notification batch accepted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn batch_serializes_with_wire_field_names() {
        let batch = NotificationBatch {
            notifications: vec![Dispatchable {
                handle: "5550001".to_string(),
                student_id: Uuid::nil(),
                group_id: Uuid::nil(),
                student_name: "Aziza Karimova".to_string(),
                message: "hello".to_string(),
                notification_type: NotificationType::Deadline,
            }],
            date: NaiveDate::from_ymd_opt(2024, 1, 26).unwrap(),
        };

        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["date"], "2024-01-26");
        let item = &value["notifications"][0];
        assert_eq!(item["handle"], "5550001");
        assert_eq!(item["studentName"], "Aziza Karimova");
        assert_eq!(item["notificationType"], "last_day_warning");
        assert!(item.get("studentId").is_some());
        assert!(item.get("groupId").is_some());
    }

    fn sample_batch() -> NotificationBatch {
        NotificationBatch {
            notifications: vec![Dispatchable {
                handle: "5550002".to_string(),
                student_id: Uuid::nil(),
                group_id: Uuid::nil(),
                student_name: "Bekzod Tursunov".to_string(),
                message: "<b>PAYMENT REMINDER</b>".to_string(),
                notification_type: NotificationType::Reminder,
            }],
            date: NaiveDate::from_ymd_opt(2024, 1, 22).unwrap(),
        }
    }

    #[tokio::test]
    async fn accepted_batch_is_posted_as_json() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/send-notifications"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(serde_json::json!({
                "date": "2024-01-22",
                "notifications": [{
                    "handle": "5550002",
                    "studentName": "Bekzod Tursunov",
                    "notificationType": "reminder"
                }]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpSink::new(format!("{}/send-notifications", server.uri())).unwrap();
        sink.submit(&sample_batch()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_rejects_batch() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/send-notifications"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let sink = HttpSink::new(format!("{}/send-notifications", server.uri())).unwrap();
        let result = sink.submit(&sample_batch()).await;
        assert!(matches!(result, Err(DispatchError::Rejected { status: 502 })));
    }
}
