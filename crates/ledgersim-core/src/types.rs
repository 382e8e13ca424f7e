use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneStatus {
    Ok,
    Degraded,
    Down,
}

impl ZoneStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "OK" => Some(ZoneStatus::Ok),
            "DEGRADED" => Some(ZoneStatus::Degraded),
            "DOWN" => Some(ZoneStatus::Down),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneStatus::Ok => "OK",
            ZoneStatus::Degraded => "DEGRADED",
            ZoneStatus::Down => "DOWN",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneControls {
    pub zone_id: String,
    pub writes_blocked: bool,
    pub cross_zone_throttle: i32,
    pub spool_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl ZoneControls {
    pub fn defaults(zone_id: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            zone_id: zone_id.into(),
            writes_blocked: false,
            cross_zone_throttle: 100,
            spool_enabled: false,
            updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub zone_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "DEBIT",
            Direction::Credit => "CREDIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub id: i64,
    pub txn_id: uuid::Uuid,
    pub account_id: String,
    pub direction: String,
    pub amount_units: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: uuid::Uuid,
    pub request_id: String,
    pub payload_hash: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_units: i64,
    pub zone_id: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDetail {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub postings: Vec<Posting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: String,
    pub balance_units: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: uuid::Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpoolStatus {
    Pending,
    Applied,
    Failed,
}

impl SpoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpoolStatus::Pending => "PENDING",
            SpoolStatus::Applied => "APPLIED",
            SpoolStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpooledTransfer {
    pub id: uuid::Uuid,
    pub request_id: String,
    pub payload_hash: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_units: i64,
    pub zone_id: String,
    pub metadata: Value,
    pub status: String,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Open,
    Ack,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Ack => "ACK",
            IncidentStatus::Resolved => "RESOLVED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: uuid::Uuid,
    pub zone_id: String,
    pub related_txn_id: Option<uuid::Uuid>,
    pub severity: String,
    pub status: String,
    pub title: String,
    pub details: Value,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub target_type: String,
    pub target_id: String,
    pub reason: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

// --- Request/response DTOs for the HTTP surface ---

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub request_id: String,
    pub from_account: String,
    pub to_account: String,
    pub amount_units: i64,
    pub zone_id: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Applied(Transaction),
    Spooled { spool_id: uuid::Uuid, request_id: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetZoneStatusRequest {
    pub status: String,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetControlsRequest {
    pub writes_blocked: bool,
    pub cross_zone_throttle: i32,
    pub spool_enabled: bool,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRequest {
    #[serde(default = "default_replay_limit")]
    pub limit: i64,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_replay_limit() -> i64 {
    50
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplaySummary {
    pub applied: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpoolSummary {
    pub pending: i64,
    pub applied: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentAction {
    Ack,
    Assign,
    Resolve,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncidentActionRequest {
    pub action: IncidentAction,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub zones: Vec<Zone>,
    pub zone_controls: Vec<ZoneControls>,
    pub accounts: Vec<Account>,
    pub balances: Vec<Balance>,
    pub incidents: Vec<Incident>,
    pub spooled_transfers: Vec<SpooledTransfer>,
    pub audit_log: Vec<AuditEntry>,
}

/// Upper bounds applied when building a snapshot, per the operator export
/// contract — not a general pagination limit.
pub const SNAPSHOT_INCIDENT_CAP: i64 = 5000;
pub const SNAPSHOT_SPOOL_CAP: i64 = 5000;
pub const SNAPSHOT_AUDIT_CAP: i64 = 2000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_status_parses_case_insensitively() {
        assert_eq!(ZoneStatus::parse("down"), Some(ZoneStatus::Down));
        assert_eq!(ZoneStatus::parse("DOWN"), Some(ZoneStatus::Down));
        assert_eq!(ZoneStatus::parse("sideways"), None);
    }

    #[test]
    fn controls_defaults_match_spec() {
        let now = Utc::now();
        let controls = ZoneControls::defaults("zone-eu", now);
        assert!(!controls.writes_blocked);
        assert_eq!(controls.cross_zone_throttle, 100);
        assert!(!controls.spool_enabled);
    }
}
