//! Optional push of persisted opportunities to an external dashboard.

use std::time::Duration;

use async_trait::async_trait;
use ppof_core::{Item, Opportunity};
use ppof_http::{FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::config::DashboardConfig;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("dashboard push failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("dashboard client setup failed: {0}")]
    Setup(String),
}

/// At-least-once sink; records are keyed so the receiving side can upsert.
#[async_trait]
pub trait DashboardSink: Send + Sync {
    async fn push(&self, opportunity: &Opportunity, items: &[Item]) -> Result<(), ExportError>;
}

pub fn item_key(control_number: &str, sequence: i64) -> String {
    format!("{control_number}#{sequence}")
}

pub fn dashboard_payload(opportunity: &Opportunity, items: &[Item]) -> JsonValue {
    let items = items
        .iter()
        .map(|item| {
            let award = item.award.clone().unwrap_or_default();
            json!({
                "key": item_key(&opportunity.control_number, item.sequence),
                "sequence": item.sequence,
                "description": item.description,
                "quantity": item.quantity,
                "unit": item.unit,
                "estimated_unit_value": item.estimated_unit_value,
                "estimated_total_value": item.estimated_total_value,
                "winner_id": award.winner_id,
                "winner_name": award.winner_name,
                "awarded_unit_value": award.unit_value,
                "awarded_total_value": award.total_value,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "key": opportunity.control_number,
        "opportunity": {
            "control_number": opportunity.control_number,
            "organization_id": opportunity.organization.registration_id,
            "organization_name": opportunity.organization.name,
            "jurisdiction": opportunity.organization.jurisdiction.as_str(),
            "state_code": opportunity.organization.state_code,
            "title": opportunity.title,
            "status": opportunity.status.as_str(),
            "published_at": opportunity.published_at,
            "estimated_value": opportunity.estimated_value,
            "awarded_value": opportunity.awarded_value,
            "size_bucket": opportunity.size_bucket().as_str(),
        },
        "items": items,
    })
}

/// JSON-over-HTTP sink with its own token bucket, separate from the upstream budget.
#[derive(Debug)]
pub struct HttpDashboardSink {
    http: HttpFetcher,
    url: String,
}

impl HttpDashboardSink {
    pub fn new(config: &DashboardConfig, user_agent: &str) -> Result<Self, ExportError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(15),
            user_agent: Some(user_agent.to_string()),
            bearer_token: config.token.clone(),
            global_concurrency: 2,
            token_bucket: Some(TokenBucketConfig::per_second(config.requests_per_second)),
            ..HttpClientConfig::default()
        })
        .map_err(|e| ExportError::Setup(e.to_string()))?;
        Ok(Self {
            http,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl DashboardSink for HttpDashboardSink {
    async fn push(&self, opportunity: &Opportunity, items: &[Item]) -> Result<(), ExportError> {
        let payload = dashboard_payload(opportunity, items);
        self.http.post_json(&self.url, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use ppof_core::{JurisdictionLevel, OpportunityRef, OpportunityStatus, Organization};

    fn opportunity() -> Opportunity {
        Opportunity {
            control_number: "c-1".into(),
            reference: OpportunityRef::new("1", 2025, 1),
            organization: Organization {
                registration_id: "1".into(),
                name: "Org".into(),
                jurisdiction: JurisdictionLevel::State,
                sector: None,
                state_code: Some("MG".into()),
            },
            title: "Lacres".into(),
            description: String::new(),
            status: OpportunityStatus::Open,
            published_at: None,
            estimated_value: Some(60_000.0),
            awarded_value: None,
            modality: None,
            municipality_code: None,
        }
    }

    fn item(sequence: i64) -> Item {
        Item {
            sequence,
            description: "Lacre".into(),
            quantity: Some(1.0),
            unit: None,
            estimated_unit_value: None,
            estimated_total_value: None,
            has_result: false,
            is_relevant: true,
            award: None,
        }
    }

    #[test]
    fn payload_is_keyed_by_natural_identifiers() {
        let payload = dashboard_payload(&opportunity(), &[item(3)]);
        assert_eq!(payload["key"], "c-1");
        assert_eq!(payload["items"][0]["key"], "c-1#3");
        assert_eq!(payload["opportunity"]["size_bucket"], "medium");
        assert_eq!(payload["opportunity"]["jurisdiction"], "state");
    }

    #[tokio::test]
    async fn http_sink_posts_with_token() {
        let received: Arc<Mutex<Vec<(String, JsonValue)>>> = Arc::default();
        let router = Router::new()
            .route(
                "/push",
                post(
                    |State(received): State<Arc<Mutex<Vec<(String, JsonValue)>>>>,
                     headers: HeaderMap,
                     Json(body): Json<JsonValue>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        received.lock().unwrap().push((auth, body));
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let sink = HttpDashboardSink::new(
            &DashboardConfig {
                url: format!("http://{addr}/push"),
                token: Some("dash-token".into()),
                requests_per_second: 5,
            },
            "ppof-test",
        )
        .unwrap();
        sink.push(&opportunity(), &[item(1), item(2)]).await.unwrap();

        let received = received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "Bearer dash-token");
        assert_eq!(received[0].1["items"].as_array().map(Vec::len), Some(2));
    }
}
