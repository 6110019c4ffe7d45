use chrono::Utc;
use strum::Display;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::database::request_record::RequestRecord;
use crate::database::usage::{current_period_key, UsageDelta, UsageWindow};
use crate::database::{Db, DbResult};
use crate::utils::billing::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    UpstreamError,
    Cancelled,
    /// Admission or model-resolution rejection; `reason` is the
    /// machine-readable error type (rate_limited, quota_exceeded, ...).
    #[strum(to_string = "rejected:{reason}")]
    Rejected { reason: &'static str },
}

/// Everything the ledger needs about one finished request.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub owner_id: String,
    pub api_key_id: Option<String>,
    pub model: String,
    pub usage: Usage,
    pub cost_micro: i64,
    pub http_status: i32,
    pub latency_ms: i64,
    pub is_streaming: bool,
    pub status: OutcomeStatus,
}

/// Best-effort writer for the request ledger and the monthly usage windows.
/// Outcomes go through a channel to a background worker so persistence never
/// sits on the response path; a write failure is logged loudly and dropped,
/// it must never fail a request that already succeeded upstream.
#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<RequestOutcome>,
}

impl UsageRecorder {
    pub fn start(db: Db) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestOutcome>();
        tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                if let Err(e) = persist(&db, &outcome) {
                    tracing::error!(
                        owner_id = %outcome.owner_id,
                        model = %outcome.model,
                        "failed to persist request outcome: {}",
                        e
                    );
                }
            }
        });
        Self { tx }
    }

    pub fn record(&self, outcome: RequestOutcome) {
        if self.tx.send(outcome).is_err() {
            tracing::error!("usage recorder worker is gone, dropping outcome");
        }
    }
}

fn persist(db: &Db, outcome: &RequestOutcome) -> DbResult<()> {
    let record = RequestRecord {
        id: Uuid::new_v4().to_string(),
        owner_id: outcome.owner_id.clone(),
        api_key_id: outcome.api_key_id.clone(),
        model: outcome.model.clone(),
        prompt_tokens: outcome.usage.prompt_tokens,
        completion_tokens: outcome.usage.completion_tokens,
        total_tokens: outcome.usage.total_tokens,
        cost_micro: outcome.cost_micro,
        http_status: outcome.http_status,
        latency_ms: outcome.latency_ms,
        is_streaming: outcome.is_streaming,
        status: outcome.status.to_string(),
        created_at: Utc::now().timestamp_millis(),
    };
    RequestRecord::insert(db, &record)?;

    UsageWindow::apply(
        db,
        &outcome.owner_id,
        &current_period_key(),
        UsageDelta {
            tokens: outcome.usage.total_tokens,
            requests: 1,
            cost_micro: outcome.cost_micro,
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::test_db;
    use std::time::Duration;

    fn outcome(owner: &str, tokens: i64, status: OutcomeStatus) -> RequestOutcome {
        RequestOutcome {
            owner_id: owner.to_string(),
            api_key_id: Some("key-1".to_string()),
            model: "kimi".to_string(),
            usage: Usage {
                prompt_tokens: tokens / 2,
                completion_tokens: tokens - tokens / 2,
                total_tokens: tokens,
            },
            cost_micro: 5,
            http_status: 200,
            latency_ms: 42,
            is_streaming: false,
            status,
        }
    }

    async fn wait_for_records(db: &Db, owner: &str, expected: usize) -> Vec<RequestRecord> {
        for _ in 0..100 {
            let rows = RequestRecord::list_for_owner(db, owner, 10).unwrap();
            if rows.len() >= expected {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("recorder never persisted {} records", expected);
    }

    #[tokio::test]
    async fn outcomes_land_in_ledger_and_usage_window() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        recorder.record(outcome("owner-1", 100, OutcomeStatus::Success));
        recorder.record(outcome("owner-1", 40, OutcomeStatus::Success));

        let rows = wait_for_records(&db, "owner-1", 2).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == "success"));

        let window = UsageWindow::get(&db, "owner-1", &current_period_key())
            .unwrap()
            .unwrap();
        assert_eq!(window.total_tokens, 140);
        assert_eq!(window.total_requests, 2);
        assert_eq!(window.total_cost_micro, 10);
    }

    #[tokio::test]
    async fn rejected_outcomes_carry_their_reason() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        recorder.record(outcome(
            "owner-3",
            0,
            OutcomeStatus::Rejected {
                reason: "rate_limited",
            },
        ));
        let rows = wait_for_records(&db, "owner-3", 1).await;
        assert_eq!(rows[0].status, "rejected:rate_limited");
        assert_eq!(rows[0].total_tokens, 0);
    }

    #[tokio::test]
    async fn failed_outcomes_are_recorded_with_their_status() {
        let (db, _dir) = test_db();
        let recorder = UsageRecorder::start(db.clone());

        recorder.record(outcome("owner-2", 0, OutcomeStatus::UpstreamError));
        let rows = wait_for_records(&db, "owner-2", 1).await;
        assert_eq!(rows[0].status, "upstream_error");
        assert_eq!(rows[0].total_tokens, 0);
    }
}
