//! End-to-end probes against the downstream API layer.

use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::warn;

use super::health;
use crate::core::model::{E2ECheck, E2ELayer, E2ESummary, Status};
use crate::core::topology::{EndpointContract, IntegrationCheck, IntegrationPolicy, SourceDescriptor};
use crate::core::warehouse::{TableStats, WarehouseError};

/// What a single HTTP call came back with.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Timeout, refused connection, DNS failure.
    Transport(String),
    /// Non-success HTTP status.
    HttpStatus(u16),
    /// Success status but the body is not JSON.
    InvalidBody(String),
    Body(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub elapsed_ms: u64,
    pub outcome: ProbeOutcome,
}

#[derive(Clone)]
pub struct ProbeClient {
    client: Client,
    base_url: String,
}

impl ProbeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// One timed GET. Never fails: every problem is captured in the outcome.
    pub async fn fetch(&self, path: &str) -> Probe {
        let url = format!("{}{}", self.base_url, path);
        let started = Instant::now();

        let outcome = match self.client.get(&url).send().await {
            Err(e) if e.is_timeout() => ProbeOutcome::Transport("Request timed out".to_string()),
            Err(e) => ProbeOutcome::Transport(e.to_string()),
            Ok(resp) => {
                let status = resp.status();
                if !status.is_success() {
                    ProbeOutcome::HttpStatus(status.as_u16())
                } else {
                    match resp.json::<Value>().await {
                        Ok(body) => ProbeOutcome::Body(body),
                        Err(e) => ProbeOutcome::InvalidBody(e.to_string()),
                    }
                }
            }
        };

        if !matches!(outcome, ProbeOutcome::Body(_)) {
            warn!(url = %url, outcome = ?outcome, "Endpoint probe failed");
        }

        Probe {
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// Records at `pointer`. An array yields its items, any other non-null
/// value is a single record, and null or a missing path yields nothing.
pub fn resolve_records<'a>(body: &'a Value, pointer: &str) -> Option<Vec<&'a Value>> {
    match body.pointer(pointer)? {
        Value::Null => None,
        Value::Array(items) => Some(items.iter().collect()),
        other => Some(vec![other]),
    }
}

fn failure_reason(outcome: &ProbeOutcome) -> Option<String> {
    match outcome {
        ProbeOutcome::Transport(e) => Some(format!("Request failed: {}", e)),
        ProbeOutcome::HttpStatus(code) => Some(format!("HTTP {}", code)),
        ProbeOutcome::InvalidBody(e) => Some(format!("Response is not JSON: {}", e)),
        ProbeOutcome::Body(_) => None,
    }
}

fn missing_fields(record: &Value, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|f| record.get(f.as_str()).is_none_or(Value::is_null))
        .cloned()
        .collect()
}

pub fn classify_endpoint(contract: &EndpointContract, probe: &Probe) -> E2ECheck {
    let mut check = E2ECheck {
        name: contract.name.clone(),
        layer: E2ELayer::Api,
        status: Status::Error,
        message: String::new(),
        response_time: Some(probe.elapsed_ms),
        record_count: None,
        errors: None,
    };

    let body = match &probe.outcome {
        ProbeOutcome::Body(body) => body,
        other => {
            let reason = failure_reason(other).unwrap_or_default();
            check.message = reason.clone();
            check.errors = Some(vec![reason]);
            return check;
        }
    };

    let Some(records) = resolve_records(body, &contract.data_pointer) else {
        let reason = format!("No data at {}", contract.data_pointer);
        check.message = reason.clone();
        check.errors = Some(vec![reason]);
        return check;
    };

    check.record_count = Some(records.len());
    let mut errors = Vec::new();
    if records.len() < contract.min_records {
        errors.push(format!(
            "Expected at least {} records, got {}",
            contract.min_records,
            records.len()
        ));
    }
    if let Some(first) = records.first() {
        let missing = missing_fields(first, &contract.required_fields);
        if !missing.is_empty() {
            errors.push(format!("Missing required fields: {}", missing.join(", ")));
        }
    }

    if errors.is_empty() {
        check.status = Status::Healthy;
        check.message = format!("{} records", records.len());
    } else {
        check.status = Status::Warning;
        check.message = errors.join("; ");
        check.errors = Some(errors);
    }
    check
}

/// Integration flows compose several calls. Each check declares how partial
/// data is treated; the two policies are deliberately kept separate.
pub fn classify_integration(check: &IntegrationCheck, probes: &[Probe]) -> E2ECheck {
    let mut failures = Vec::new();
    let mut total_records = 0;
    let mut ok_steps = 0;

    for (step, probe) in check.steps.iter().zip(probes) {
        let reason = match &probe.outcome {
            ProbeOutcome::Body(body) => match resolve_records(body, &step.data_pointer) {
                Some(records) if !records.is_empty() => {
                    total_records += records.len();
                    ok_steps += 1;
                    None
                }
                _ => Some("returned no data".to_string()),
            },
            other => failure_reason(other),
        };
        if let Some(reason) = reason {
            failures.push(format!("{}: {}", step.path, reason));
        }
    }

    let steps = check.steps.len();
    let status = if ok_steps == steps {
        Status::Healthy
    } else {
        match check.policy {
            IntegrationPolicy::RequireAll => Status::Error,
            IntegrationPolicy::DegradeToWarning if ok_steps > 0 => Status::Warning,
            IntegrationPolicy::DegradeToWarning => Status::Error,
        }
    };

    E2ECheck {
        name: check.name.clone(),
        layer: E2ELayer::Integration,
        status,
        message: if failures.is_empty() {
            format!("All {} steps returned data", steps)
        } else {
            format!("{} of {} steps returned data", ok_steps, steps)
        },
        response_time: Some(probes.iter().map(|p| p.elapsed_ms).sum()),
        record_count: Some(total_records),
        errors: if failures.is_empty() {
            None
        } else {
            Some(failures)
        },
    }
}

/// Source-layer check: is the channel's table populated and fresh.
pub fn source_check(
    source: &SourceDescriptor,
    stats: &Result<TableStats, WarehouseError>,
    elapsed_ms: u64,
    today: NaiveDate,
) -> E2ECheck {
    let eval = health::evaluate(stats, source.freshness_threshold_days, today);
    let record_count = stats.as_ref().ok().map(|s| s.row_count.max(0) as usize);
    E2ECheck {
        name: format!("{} table", source.name),
        layer: E2ELayer::Source,
        status: eval.status,
        message: eval
            .issues
            .first()
            .cloned()
            .unwrap_or_else(|| format!("Updated {}", eval.freshness_label.to_lowercase())),
        response_time: Some(elapsed_ms),
        record_count,
        errors: if eval.issues.is_empty() {
            None
        } else {
            Some(eval.issues)
        },
    }
}

pub fn summarize(checks: &[E2ECheck]) -> E2ESummary {
    let timed: Vec<u64> = checks.iter().filter_map(|c| c.response_time).collect();
    let avg_response_time = if timed.is_empty() {
        None
    } else {
        Some(timed.iter().sum::<u64>() as f64 / timed.len() as f64)
    };

    let mut summary = E2ESummary {
        total: checks.len() as u32,
        avg_response_time,
        ..Default::default()
    };
    for check in checks {
        match check.status {
            Status::Healthy => summary.healthy += 1,
            Status::Warning => summary.warning += 1,
            Status::Error => summary.error += 1,
            Status::Idle => {}
        }
    }
    summary
}
