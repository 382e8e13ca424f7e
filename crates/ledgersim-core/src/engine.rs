use chrono::Utc;
use serde_json::{json, Value};
use sqlx::{Postgres, Row, Transaction as SqlxTransaction};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::hash::canonical_fingerprint;
use crate::store::Store;
use crate::throttle::throttle_admits;
use crate::types::{
    Account, AuditEntry, Balance, Incident, IncidentAction, IncidentActionRequest,
    IncidentStatus, LedgerSnapshot, Posting, ReplaySummary, SetControlsRequest, Severity,
    SpoolSummary, SpooledTransfer, Transaction, TransactionDetail, TransferOutcome,
    TransferRequest, Zone, ZoneControls, SNAPSHOT_AUDIT_CAP, SNAPSHOT_INCIDENT_CAP,
    SNAPSHOT_SPOOL_CAP,
};

/// Concrete, `Arc`-cloneable engine over a shared `Store`. No polymorphism —
/// every operation below is a plain `async fn` taking `&self`.
#[derive(Debug, Clone)]
pub struct LedgerEngine {
    store: Store,
}

struct AppliedFields<'a> {
    request_id: &'a str,
    payload_hash: &'a str,
    from_account: &'a str,
    to_account: &'a str,
    amount_units: i64,
    zone_id: &'a str,
    metadata: &'a Value,
}

impl LedgerEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    // ---- CreateTransfer (spec §4.C) ----

    pub async fn create_transfer(&self, req: TransferRequest) -> Result<TransferOutcome, LedgerError> {
        if req.request_id.trim().is_empty() {
            return Err(LedgerError::BadRequest("request_id is required".into()));
        }
        if req.amount_units <= 0 {
            return Err(LedgerError::BadRequest("amount_units must be > 0".into()));
        }
        if req.from_account.trim().is_empty() || req.to_account.trim().is_empty() {
            return Err(LedgerError::BadRequest("from_account/to_account are required".into()));
        }

        let payload_hash = canonical_fingerprint(&json!({
            "request_id": req.request_id,
            "from_account": req.from_account,
            "to_account": req.to_account,
            "amount_units": req.amount_units,
            "zone_id": req.zone_id,
            "metadata": req.metadata,
        }));

        let mut tx = self.store.pool().begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        // Step 1: zone must exist.
        let zone_row = sqlx::query("SELECT status FROM zones WHERE id = $1")
            .bind(&req.zone_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(zone_row) = zone_row else {
            return Err(LedgerError::ZoneUnknown { zone_id: req.zone_id.clone() });
        };
        let zone_status: String = zone_row.try_get("status")?;

        // Step 2: materialize controls.
        sqlx::query(
            "INSERT INTO zone_controls (zone_id, writes_blocked, cross_zone_throttle, spool_enabled) \
             VALUES ($1, false, 100, false) ON CONFLICT (zone_id) DO NOTHING",
        )
        .bind(&req.zone_id)
        .execute(&mut *tx)
        .await?;
        let controls_row = sqlx::query(
            "SELECT writes_blocked, cross_zone_throttle, spool_enabled FROM zone_controls WHERE zone_id = $1",
        )
        .bind(&req.zone_id)
        .fetch_one(&mut *tx)
        .await?;
        let writes_blocked: bool = controls_row.try_get("writes_blocked")?;
        let cross_zone_throttle: i32 = controls_row.try_get("cross_zone_throttle")?;
        let spool_enabled: bool = controls_row.try_get("spool_enabled")?;

        // Step 3: compute blocked reason.
        let blocked_reason = if zone_status == "DOWN" {
            Some("zone down".to_string())
        } else if writes_blocked {
            Some("writes blocked".to_string())
        } else if cross_zone_throttle < 100 {
            if !throttle_admits(&req.request_id, cross_zone_throttle) {
                Some("throttled".to_string())
            } else {
                None
            }
        } else {
            None
        };

        // Step 4: idempotency probe A (transactions).
        if let Some(row) = sqlx::query(
            "SELECT id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, created_at \
             FROM transactions WHERE request_id = $1",
        )
        .bind(&req.request_id)
        .fetch_optional(&mut *tx)
        .await?
        {
            let existing_hash: String = row.try_get("payload_hash")?;
            if existing_hash != payload_hash {
                return Err(LedgerError::IdempotencyConflict { request_id: req.request_id.clone() });
            }
            let txn = row_to_transaction(&row)?;
            tx.commit().await?;
            return Ok(TransferOutcome::Applied(txn));
        }

        // Step 5: idempotency probe B (spool).
        if let Some(row) = sqlx::query("SELECT id, payload_hash FROM spooled_transfers WHERE request_id = $1")
            .bind(&req.request_id)
            .fetch_optional(&mut *tx)
            .await?
        {
            let existing_hash: String = row.try_get("payload_hash")?;
            if existing_hash != payload_hash {
                return Err(LedgerError::IdempotencyConflict { request_id: req.request_id.clone() });
            }
            let spool_id: Uuid = row.try_get("id")?;
            tx.commit().await?;
            return Ok(TransferOutcome::Spooled { spool_id, request_id: req.request_id.clone() });
        }

        // Step 6: gate.
        if let Some(reason) = blocked_reason {
            if spool_enabled {
                let spool_id = Uuid::new_v4();
                let now = Utc::now();
                sqlx::query(
                    "INSERT INTO spooled_transfers \
                     (id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, status, fail_reason, created_at, updated_at) \
                     VALUES ($1,$2,$3,$4,$5,$6,$7,$8,'PENDING',$9,$10,$10)",
                )
                .bind(spool_id)
                .bind(&req.request_id)
                .bind(&payload_hash)
                .bind(&req.from_account)
                .bind(&req.to_account)
                .bind(req.amount_units)
                .bind(&req.zone_id)
                .bind(&req.metadata)
                .bind(&reason)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                insert_audit(
                    &mut tx,
                    "system",
                    "SPOOL_TRANSFER",
                    "zone",
                    &req.zone_id,
                    None,
                    json!({"request_id": req.request_id, "reason": reason, "spool_id": spool_id.to_string()}),
                )
                .await?;
                tx.commit().await?;
                return Ok(TransferOutcome::Spooled { spool_id, request_id: req.request_id.clone() });
            }
            tx.rollback().await?;
            return Err(if zone_status == "DOWN" {
                LedgerError::ZoneDown { zone_id: req.zone_id.clone(), reason }
            } else {
                LedgerError::ZoneBlocked { zone_id: req.zone_id.clone(), reason }
            });
        }

        // Step 7: apply.
        let fields = AppliedFields {
            request_id: &req.request_id,
            payload_hash: &payload_hash,
            from_account: &req.from_account,
            to_account: &req.to_account,
            amount_units: req.amount_units,
            zone_id: &req.zone_id,
            metadata: &req.metadata,
        };
        let txn = apply_in_transaction(&mut tx, &fields).await?;
        tx.commit().await?;
        Ok(TransferOutcome::Applied(txn))
    }

    /// Same as `create_transfer` but skips zone/control gating (steps 1-3,6);
    /// idempotency against `transactions` is still enforced. Used by replay.
    pub async fn apply_transfer_bypass(
        &self,
        request_id: &str,
        payload_hash: &str,
        from_account: &str,
        to_account: &str,
        amount_units: i64,
        zone_id: &str,
        metadata: &Value,
    ) -> Result<(TransferOutcome, bool), LedgerError> {
        let mut tx = self.store.pool().begin().await?;

        if let Some(row) = sqlx::query(
            "SELECT id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, created_at \
             FROM transactions WHERE request_id = $1",
        )
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        {
            let existing_hash: String = row.try_get("payload_hash")?;
            if existing_hash != payload_hash {
                return Err(LedgerError::IdempotencyConflict { request_id: request_id.to_string() });
            }
            let txn = row_to_transaction(&row)?;
            tx.commit().await?;
            return Ok((TransferOutcome::Applied(txn), true));
        }

        let fields = AppliedFields {
            request_id,
            payload_hash,
            from_account,
            to_account,
            amount_units,
            zone_id,
            metadata,
        };
        let txn = apply_in_transaction(&mut tx, &fields).await?;
        tx.commit().await?;
        Ok((TransferOutcome::Applied(txn), false))
    }

    // ---- ReplaySpool ----

    pub async fn replay_spool(
        &self,
        zone_id: &str,
        limit: i64,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ReplaySummary, LedgerError> {
        let limit = limit.clamp(1, 500);

        let zone_row = sqlx::query("SELECT status FROM zones WHERE id = $1")
            .bind(zone_id)
            .fetch_optional(self.store.pool())
            .await?;
        let Some(zone_row) = zone_row else {
            return Err(LedgerError::ZoneUnknown { zone_id: zone_id.to_string() });
        };
        let status: String = zone_row.try_get("status")?;

        let controls_row = sqlx::query(
            "SELECT writes_blocked, cross_zone_throttle FROM zone_controls WHERE zone_id = $1",
        )
        .bind(zone_id)
        .fetch_optional(self.store.pool())
        .await?;
        let (writes_blocked, cross_zone_throttle) = match controls_row {
            Some(row) => (row.try_get::<bool, _>("writes_blocked")?, row.try_get::<i32, _>("cross_zone_throttle")?),
            None => (false, 100),
        };

        if status == "DOWN" || writes_blocked || cross_zone_throttle == 0 {
            return Err(LedgerError::NotReady { zone_id: zone_id.to_string() });
        }

        let rows = sqlx::query(
            "SELECT id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata \
             FROM spooled_transfers WHERE zone_id = $1 AND status = 'PENDING' ORDER BY created_at ASC LIMIT $2",
        )
        .bind(zone_id)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        let mut applied = 0i64;
        let mut failed = 0i64;

        for row in rows {
            let spool_id: Uuid = row.try_get("id")?;
            let request_id: String = row.try_get("request_id")?;
            let payload_hash: String = row.try_get("payload_hash")?;
            let from_account: String = row.try_get("from_account")?;
            let to_account: String = row.try_get("to_account")?;
            let amount_units: i64 = row.try_get("amount_units")?;
            let row_zone_id: String = row.try_get("zone_id")?;
            let metadata: Value = row.try_get("metadata")?;

            match self
                .apply_transfer_bypass(
                    &request_id,
                    &payload_hash,
                    &from_account,
                    &to_account,
                    amount_units,
                    &row_zone_id,
                    &metadata,
                )
                .await
            {
                Ok((_, already_applied)) => {
                    applied += 1;
                    let now = Utc::now();
                    sqlx::query(
                        "UPDATE spooled_transfers SET status = 'APPLIED', applied_at = $2, fail_reason = NULL, updated_at = $2 WHERE id = $1",
                    )
                    .bind(spool_id)
                    .bind(now)
                    .execute(self.store.pool())
                    .await?;
                    let mut audit_tx = self.store.pool().begin().await?;
                    insert_audit(
                        &mut audit_tx,
                        actor,
                        "REPLAY_APPLIED",
                        "spool",
                        &spool_id.to_string(),
                        reason,
                        json!({"request_id": request_id, "already_applied": already_applied}),
                    )
                    .await?;
                    audit_tx.commit().await?;
                }
                Err(err) => {
                    failed += 1;
                    let now = Utc::now();
                    sqlx::query(
                        "UPDATE spooled_transfers SET status = 'FAILED', fail_reason = $2, updated_at = $3 WHERE id = $1",
                    )
                    .bind(spool_id)
                    .bind(err.to_string())
                    .bind(now)
                    .execute(self.store.pool())
                    .await?;
                }
            }
        }

        let mut tx = self.store.pool().begin().await?;
        insert_audit(
            &mut tx,
            actor,
            "REPLAY_SPOOL",
            "zone",
            zone_id,
            reason,
            json!({"applied": applied, "failed": failed, "limit": limit}),
        )
        .await?;
        tx.commit().await?;

        Ok(ReplaySummary { applied, failed })
    }

    // ---- SetZoneStatus ----

    pub async fn set_zone_status(
        &self,
        zone_id: &str,
        status: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<Zone, LedgerError> {
        let parsed = crate::types::ZoneStatus::parse(status)
            .ok_or_else(|| LedgerError::BadRequest(format!("invalid status '{status}'")))?;

        let mut tx = self.store.pool().begin().await?;
        let row = sqlx::query(
            "UPDATE zones SET status = $2, updated_at = now() WHERE id = $1 RETURNING id, name, status, updated_at",
        )
        .bind(zone_id)
        .bind(parsed.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(LedgerError::ZoneUnknown { zone_id: zone_id.to_string() });
        };
        let zone = row_to_zone(&row)?;

        insert_audit(
            &mut tx,
            actor,
            "SET_ZONE_STATUS",
            "zone",
            zone_id,
            reason,
            json!({"status": parsed.as_str()}),
        )
        .await?;

        if matches!(parsed, crate::types::ZoneStatus::Down) {
            insert_incident(
                &mut tx,
                zone_id,
                None,
                Severity::Critical,
                "Zone marked DOWN",
                json!({}),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(zone)
    }

    // ---- SetZoneControls ----

    pub async fn set_zone_controls(
        &self,
        zone_id: &str,
        req: &SetControlsRequest,
    ) -> Result<ZoneControls, LedgerError> {
        if !(0..=100).contains(&req.cross_zone_throttle) {
            return Err(LedgerError::BadRequest("cross_zone_throttle must be in [0,100]".into()));
        }

        let mut tx = self.store.pool().begin().await?;
        let zone_exists = sqlx::query("SELECT 1 FROM zones WHERE id = $1")
            .bind(zone_id)
            .fetch_optional(&mut *tx)
            .await?;
        if zone_exists.is_none() {
            return Err(LedgerError::ZoneUnknown { zone_id: zone_id.to_string() });
        }

        let row = sqlx::query(
            "INSERT INTO zone_controls (zone_id, writes_blocked, cross_zone_throttle, spool_enabled, updated_at) \
             VALUES ($1,$2,$3,$4, now()) \
             ON CONFLICT (zone_id) DO UPDATE SET writes_blocked = $2, cross_zone_throttle = $3, spool_enabled = $4, updated_at = now() \
             RETURNING zone_id, writes_blocked, cross_zone_throttle, spool_enabled, updated_at",
        )
        .bind(zone_id)
        .bind(req.writes_blocked)
        .bind(req.cross_zone_throttle)
        .bind(req.spool_enabled)
        .fetch_one(&mut *tx)
        .await?;
        let controls = row_to_controls(&row)?;

        insert_audit(
            &mut tx,
            &req.actor,
            "SET_ZONE_CONTROLS",
            "zone",
            zone_id,
            req.reason.as_deref(),
            json!({
                "writes_blocked": req.writes_blocked,
                "cross_zone_throttle": req.cross_zone_throttle,
                "spool_enabled": req.spool_enabled,
            }),
        )
        .await?;

        if req.writes_blocked || req.cross_zone_throttle == 0 {
            let severity = if req.writes_blocked { Severity::Critical } else { Severity::Warn };
            insert_incident(
                &mut tx,
                zone_id,
                None,
                severity,
                "Zone containment control engaged",
                json!({
                    "writes_blocked": req.writes_blocked,
                    "cross_zone_throttle": req.cross_zone_throttle,
                }),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(controls)
    }

    // ---- ApplyIncidentAction ----

    pub async fn apply_incident_action(
        &self,
        incident_id: Uuid,
        req: &IncidentActionRequest,
    ) -> Result<Incident, LedgerError> {
        if matches!(req.action, IncidentAction::Assign) && req.assignee.as_deref().unwrap_or("").is_empty() {
            return Err(LedgerError::BadRequest("assignee is required for ASSIGN".into()));
        }

        let mut tx = self.store.pool().begin().await?;
        let row = sqlx::query(
            "SELECT id, zone_id, related_txn_id, severity, status, title, details, detected_at FROM incidents WHERE id = $1 FOR UPDATE",
        )
        .bind(incident_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(LedgerError::NotFound(format!("incident '{incident_id}'")));
        };
        let mut incident = row_to_incident(&row)?;

        let new_status = match req.action {
            IncidentAction::Ack => IncidentStatus::Ack.as_str(),
            IncidentAction::Resolve => IncidentStatus::Resolved.as_str(),
            IncidentAction::Assign => incident.status.as_str(),
        };

        let mut details = incident.details.clone();
        if let Some(obj) = details.as_object_mut() {
            if let Some(note) = req.note.as_deref().filter(|n| !n.is_empty()) {
                let entry = json!({
                    "at": Utc::now(),
                    "actor": req.actor,
                    "note": note,
                    "action": format!("{:?}", req.action).to_uppercase(),
                });
                obj.entry("notes")
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .expect("notes is always an array")
                    .push(entry);
            }
            if matches!(req.action, IncidentAction::Assign) {
                if let Some(assignee) = &req.assignee {
                    obj.insert("assignee".to_string(), json!(assignee));
                }
            }
        }

        let row = sqlx::query(
            "UPDATE incidents SET status = $2, details = $3 WHERE id = $1 \
             RETURNING id, zone_id, related_txn_id, severity, status, title, details, detected_at",
        )
        .bind(incident_id)
        .bind(new_status)
        .bind(&details)
        .fetch_one(&mut *tx)
        .await?;
        incident = row_to_incident(&row)?;

        insert_audit(
            &mut tx,
            &req.actor,
            &format!("INCIDENT_{:?}", req.action).to_uppercase(),
            "incident",
            &incident_id.to_string(),
            req.reason.as_deref(),
            json!({"action": format!("{:?}", req.action).to_uppercase()}),
        )
        .await?;

        tx.commit().await?;
        Ok(incident)
    }

    // ---- Snapshot / Restore ----

    pub async fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        let pool = self.store.pool();

        let zones = sqlx::query("SELECT id, name, status, updated_at FROM zones ORDER BY id")
            .fetch_all(pool)
            .await?
            .iter()
            .map(row_to_zone)
            .collect::<Result<Vec<_>, _>>()?;

        let zone_controls = sqlx::query(
            "SELECT zone_id, writes_blocked, cross_zone_throttle, spool_enabled, updated_at FROM zone_controls ORDER BY zone_id",
        )
        .fetch_all(pool)
        .await?
        .iter()
        .map(row_to_controls)
        .collect::<Result<Vec<_>, _>>()?;

        let accounts = sqlx::query("SELECT id, zone_id, created_at FROM accounts ORDER BY id")
            .fetch_all(pool)
            .await?
            .iter()
            .map(row_to_account)
            .collect::<Result<Vec<_>, _>>()?;

        let balances = sqlx::query("SELECT account_id, balance_units, updated_at FROM balances ORDER BY account_id")
            .fetch_all(pool)
            .await?
            .iter()
            .map(row_to_balance)
            .collect::<Result<Vec<_>, _>>()?;

        let incidents = sqlx::query(
            "SELECT id, zone_id, related_txn_id, severity, status, title, details, detected_at \
             FROM incidents ORDER BY detected_at DESC LIMIT $1",
        )
        .bind(SNAPSHOT_INCIDENT_CAP)
        .fetch_all(pool)
        .await?
        .iter()
        .map(row_to_incident)
        .collect::<Result<Vec<_>, _>>()?;

        let spooled_transfers = sqlx::query(
            "SELECT id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, status, fail_reason, created_at, updated_at, applied_at \
             FROM spooled_transfers ORDER BY created_at DESC LIMIT $1",
        )
        .bind(SNAPSHOT_SPOOL_CAP)
        .fetch_all(pool)
        .await?
        .iter()
        .map(row_to_spooled_transfer)
        .collect::<Result<Vec<_>, _>>()?;

        let audit_log = sqlx::query(
            "SELECT id, actor, action, target_type, target_id, reason, details, created_at \
             FROM audit_log ORDER BY created_at DESC LIMIT $1",
        )
        .bind(SNAPSHOT_AUDIT_CAP)
        .fetch_all(pool)
        .await?
        .iter()
        .map(row_to_audit)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(LedgerSnapshot {
            zones,
            zone_controls,
            accounts,
            balances,
            incidents,
            spooled_transfers,
            audit_log,
        })
    }

    /// Destructive: truncates everything except `zones` (only `status` is
    /// updated from the snapshot), then re-inserts from the snapshot.
    pub async fn restore(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
        let mut tx = self.store.pool().begin().await?;

        sqlx::query(
            "TRUNCATE postings, transactions, balances, accounts, incidents, outbox_events, inbox_events, audit_log, spooled_transfers, zone_controls CASCADE",
        )
        .execute(&mut *tx)
        .await?;

        for zone in &snapshot.zones {
            sqlx::query("UPDATE zones SET status = $2, updated_at = $3 WHERE id = $1")
                .bind(&zone.id)
                .bind(&zone.status)
                .bind(zone.updated_at)
                .execute(&mut *tx)
                .await?;
        }

        if snapshot.zone_controls.is_empty() {
            let zone_ids: Vec<String> = sqlx::query("SELECT id FROM zones")
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|r| r.try_get::<String, _>("id"))
                .collect::<Result<_, _>>()?;
            for zone_id in zone_ids {
                sqlx::query(
                    "INSERT INTO zone_controls (zone_id, writes_blocked, cross_zone_throttle, spool_enabled) VALUES ($1, false, 100, false)",
                )
                .bind(zone_id)
                .execute(&mut *tx)
                .await?;
            }
        } else {
            for controls in &snapshot.zone_controls {
                sqlx::query(
                    "INSERT INTO zone_controls (zone_id, writes_blocked, cross_zone_throttle, spool_enabled, updated_at) VALUES ($1,$2,$3,$4,$5)",
                )
                .bind(&controls.zone_id)
                .bind(controls.writes_blocked)
                .bind(controls.cross_zone_throttle)
                .bind(controls.spool_enabled)
                .bind(controls.updated_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        for account in &snapshot.accounts {
            sqlx::query("INSERT INTO accounts (id, zone_id, created_at) VALUES ($1,$2,$3)")
                .bind(&account.id)
                .bind(&account.zone_id)
                .bind(account.created_at)
                .execute(&mut *tx)
                .await?;
        }

        for balance in &snapshot.balances {
            sqlx::query("INSERT INTO balances (account_id, balance_units, updated_at) VALUES ($1,$2,$3)")
                .bind(&balance.account_id)
                .bind(balance.balance_units)
                .bind(balance.updated_at)
                .execute(&mut *tx)
                .await?;
        }

        for incident in &snapshot.incidents {
            sqlx::query(
                "INSERT INTO incidents (id, zone_id, related_txn_id, severity, status, title, details, detected_at) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
            )
            .bind(incident.id)
            .bind(&incident.zone_id)
            .bind(incident.related_txn_id)
            .bind(&incident.severity)
            .bind(&incident.status)
            .bind(&incident.title)
            .bind(&incident.details)
            .bind(incident.detected_at)
            .execute(&mut *tx)
            .await?;
        }

        for spool in &snapshot.spooled_transfers {
            sqlx::query(
                "INSERT INTO spooled_transfers (id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, status, fail_reason, created_at, updated_at, applied_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
            )
            .bind(spool.id)
            .bind(&spool.request_id)
            .bind(&spool.payload_hash)
            .bind(&spool.from_account)
            .bind(&spool.to_account)
            .bind(spool.amount_units)
            .bind(&spool.zone_id)
            .bind(&spool.metadata)
            .bind(&spool.status)
            .bind(&spool.fail_reason)
            .bind(spool.created_at)
            .bind(spool.updated_at)
            .bind(spool.applied_at)
            .execute(&mut *tx)
            .await?;
        }

        for entry in &snapshot.audit_log {
            sqlx::query(
                "INSERT INTO audit_log (actor, action, target_type, target_id, reason, details, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(&entry.actor)
            .bind(&entry.action)
            .bind(&entry.target_type)
            .bind(&entry.target_id)
            .bind(&entry.reason)
            .bind(&entry.details)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ---- Query helpers backing the HTTP surface ----

    pub async fn list_zones(&self) -> Result<Vec<Zone>, LedgerError> {
        let rows = sqlx::query("SELECT id, name, status, updated_at FROM zones ORDER BY id")
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(row_to_zone).collect()
    }

    pub async fn list_balances(&self, limit: i64) -> Result<Vec<Balance>, LedgerError> {
        let rows = sqlx::query("SELECT account_id, balance_units, updated_at FROM balances ORDER BY account_id LIMIT $1")
            .bind(limit.clamp(1, 10_000))
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(row_to_balance).collect()
    }

    pub async fn list_transactions(&self, limit: i64) -> Result<Vec<Transaction>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, created_at \
             FROM transactions ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit.clamp(1, 10_000))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(row_to_transaction).collect()
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<TransactionDetail, LedgerError> {
        let row = sqlx::query(
            "SELECT id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, created_at \
             FROM transactions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        let Some(row) = row else {
            return Err(LedgerError::NotFound(format!("transaction '{id}'")));
        };
        let transaction = row_to_transaction(&row)?;

        let posting_rows = sqlx::query(
            "SELECT id, txn_id, account_id, direction, amount_units, created_at FROM postings WHERE txn_id = $1 ORDER BY id",
        )
        .bind(id)
        .fetch_all(self.store.pool())
        .await?;
        let postings = posting_rows.iter().map(row_to_posting).collect::<Result<Vec<_>, _>>()?;

        Ok(TransactionDetail { transaction, postings })
    }

    pub async fn get_zone_controls(&self, zone_id: &str) -> Result<ZoneControls, LedgerError> {
        let zone_exists = sqlx::query("SELECT 1 FROM zones WHERE id = $1")
            .bind(zone_id)
            .fetch_optional(self.store.pool())
            .await?;
        if zone_exists.is_none() {
            return Err(LedgerError::ZoneUnknown { zone_id: zone_id.to_string() });
        }
        let row = sqlx::query(
            "SELECT zone_id, writes_blocked, cross_zone_throttle, spool_enabled, updated_at FROM zone_controls WHERE zone_id = $1",
        )
        .bind(zone_id)
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => row_to_controls(&row),
            None => Ok(ZoneControls::defaults(zone_id, Utc::now())),
        }
    }

    pub async fn spool_summary(&self, zone_id: &str) -> Result<SpoolSummary, LedgerError> {
        let row = sqlx::query(
            "SELECT \
               count(*) FILTER (WHERE status = 'PENDING') AS pending, \
               count(*) FILTER (WHERE status = 'APPLIED') AS applied, \
               count(*) FILTER (WHERE status = 'FAILED') AS failed \
             FROM spooled_transfers WHERE zone_id = $1",
        )
        .bind(zone_id)
        .fetch_one(self.store.pool())
        .await?;
        Ok(SpoolSummary {
            pending: row.try_get("pending")?,
            applied: row.try_get("applied")?,
            failed: row.try_get("failed")?,
        })
    }

    pub async fn list_audit(&self, zone_id: &str, limit: i64) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, actor, action, target_type, target_id, reason, details, created_at \
             FROM audit_log WHERE target_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(zone_id)
        .bind(limit.clamp(1, 10_000))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(row_to_audit).collect()
    }

    pub async fn list_incidents_for_zone(&self, zone_id: &str) -> Result<Vec<Incident>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, zone_id, related_txn_id, severity, status, title, details, detected_at \
             FROM incidents WHERE zone_id = $1 ORDER BY detected_at DESC",
        )
        .bind(zone_id)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(row_to_incident).collect()
    }

    pub async fn list_incidents(&self, limit: i64) -> Result<Vec<Incident>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, zone_id, related_txn_id, severity, status, title, details, detected_at \
             FROM incidents ORDER BY detected_at DESC LIMIT $1",
        )
        .bind(limit.clamp(1, 10_000))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(row_to_incident).collect()
    }

    pub async fn get_incident(&self, id: Uuid) -> Result<Incident, LedgerError> {
        let row = sqlx::query(
            "SELECT id, zone_id, related_txn_id, severity, status, title, details, detected_at FROM incidents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => row_to_incident(&row),
            None => Err(LedgerError::NotFound(format!("incident '{id}'"))),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

async fn apply_in_transaction(
    tx: &mut SqlxTransaction<'_, Postgres>,
    fields: &AppliedFields<'_>,
) -> Result<Transaction, LedgerError> {
    let now = Utc::now();

    for (account_id, zone_id) in [(fields.from_account, fields.zone_id), (fields.to_account, fields.zone_id)] {
        sqlx::query("INSERT INTO accounts (id, zone_id) VALUES ($1,$2) ON CONFLICT (id) DO NOTHING")
            .bind(account_id)
            .bind(zone_id)
            .execute(&mut **tx)
            .await?;
    }

    let txn_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO transactions (id, request_id, payload_hash, from_account, to_account, amount_units, zone_id, metadata, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
    )
    .bind(txn_id)
    .bind(fields.request_id)
    .bind(fields.payload_hash)
    .bind(fields.from_account)
    .bind(fields.to_account)
    .bind(fields.amount_units)
    .bind(fields.zone_id)
    .bind(fields.metadata)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query("INSERT INTO postings (txn_id, account_id, direction, amount_units, created_at) VALUES ($1,$2,'DEBIT',$3,$4)")
        .bind(txn_id)
        .bind(fields.from_account)
        .bind(fields.amount_units)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO postings (txn_id, account_id, direction, amount_units, created_at) VALUES ($1,$2,'CREDIT',$3,$4)")
        .bind(txn_id)
        .bind(fields.to_account)
        .bind(fields.amount_units)
        .bind(now)
        .execute(&mut **tx)
        .await?;

    upsert_balance(tx, fields.from_account, -fields.amount_units, now).await?;
    upsert_balance(tx, fields.to_account, fields.amount_units, now).await?;

    let outbox_id = Uuid::new_v4();
    let payload = json!({
        "event_id": "generated_by_db",
        "transaction_id": txn_id,
        "zone_id": fields.zone_id,
        "amount_units": fields.amount_units,
        "created_at": now,
    });
    sqlx::query(
        "INSERT INTO outbox_events (id, event_type, aggregate_type, aggregate_id, payload, created_at) VALUES ($1,'TRANSFER_POSTED','transaction',$2,$3,$4)",
    )
    .bind(outbox_id)
    .bind(txn_id.to_string())
    .bind(&payload)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(Transaction {
        id: txn_id,
        request_id: fields.request_id.to_string(),
        payload_hash: fields.payload_hash.to_string(),
        from_account: fields.from_account.to_string(),
        to_account: fields.to_account.to_string(),
        amount_units: fields.amount_units,
        zone_id: fields.zone_id.to_string(),
        metadata: fields.metadata.clone(),
        created_at: now,
    })
}

async fn upsert_balance(
    tx: &mut SqlxTransaction<'_, Postgres>,
    account_id: &str,
    delta: i64,
    now: chrono::DateTime<Utc>,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO balances (account_id, balance_units, updated_at) VALUES ($1,$2,$3) \
         ON CONFLICT (account_id) DO UPDATE SET balance_units = balances.balance_units + $2, updated_at = $3",
    )
    .bind(account_id)
    .bind(delta)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_audit(
    tx: &mut SqlxTransaction<'_, Postgres>,
    actor: &str,
    action: &str,
    target_type: &str,
    target_id: &str,
    reason: Option<&str>,
    details: Value,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO audit_log (actor, action, target_type, target_id, reason, details) VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(actor)
    .bind(action)
    .bind(target_type)
    .bind(target_id)
    .bind(reason)
    .bind(details)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_incident(
    tx: &mut SqlxTransaction<'_, Postgres>,
    zone_id: &str,
    related_txn_id: Option<Uuid>,
    severity: Severity,
    title: &str,
    details: Value,
) -> Result<Uuid, LedgerError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO incidents (id, zone_id, related_txn_id, severity, status, title, details) VALUES ($1,$2,$3,$4,'OPEN',$5,$6)",
    )
    .bind(id)
    .bind(zone_id)
    .bind(related_txn_id)
    .bind(severity.as_str())
    .bind(title)
    .bind(details)
    .execute(&mut **tx)
    .await?;
    Ok(id)
}

fn row_to_zone(row: &sqlx::postgres::PgRow) -> Result<Zone, LedgerError> {
    Ok(Zone {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_controls(row: &sqlx::postgres::PgRow) -> Result<ZoneControls, LedgerError> {
    Ok(ZoneControls {
        zone_id: row.try_get("zone_id")?,
        writes_blocked: row.try_get("writes_blocked")?,
        cross_zone_throttle: row.try_get("cross_zone_throttle")?,
        spool_enabled: row.try_get("spool_enabled")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_account(row: &sqlx::postgres::PgRow) -> Result<Account, LedgerError> {
    Ok(Account {
        id: row.try_get("id")?,
        zone_id: row.try_get("zone_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_balance(row: &sqlx::postgres::PgRow) -> Result<Balance, LedgerError> {
    Ok(Balance {
        account_id: row.try_get("account_id")?,
        balance_units: row.try_get("balance_units")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, LedgerError> {
    Ok(Transaction {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        payload_hash: row.try_get("payload_hash")?,
        from_account: row.try_get("from_account")?,
        to_account: row.try_get("to_account")?,
        amount_units: row.try_get("amount_units")?,
        zone_id: row.try_get("zone_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_posting(row: &sqlx::postgres::PgRow) -> Result<Posting, LedgerError> {
    Ok(Posting {
        id: row.try_get("id")?,
        txn_id: row.try_get("txn_id")?,
        account_id: row.try_get("account_id")?,
        direction: row.try_get("direction")?,
        amount_units: row.try_get("amount_units")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_spooled_transfer(row: &sqlx::postgres::PgRow) -> Result<SpooledTransfer, LedgerError> {
    Ok(SpooledTransfer {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        payload_hash: row.try_get("payload_hash")?,
        from_account: row.try_get("from_account")?,
        to_account: row.try_get("to_account")?,
        amount_units: row.try_get("amount_units")?,
        zone_id: row.try_get("zone_id")?,
        metadata: row.try_get("metadata")?,
        status: row.try_get("status")?,
        fail_reason: row.try_get("fail_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        applied_at: row.try_get("applied_at")?,
    })
}

fn row_to_incident(row: &sqlx::postgres::PgRow) -> Result<Incident, LedgerError> {
    Ok(Incident {
        id: row.try_get("id")?,
        zone_id: row.try_get("zone_id")?,
        related_txn_id: row.try_get("related_txn_id")?,
        severity: row.try_get("severity")?,
        status: row.try_get("status")?,
        title: row.try_get("title")?,
        details: row.try_get("details")?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn row_to_audit(row: &sqlx::postgres::PgRow) -> Result<AuditEntry, LedgerError> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        actor: row.try_get("actor")?,
        action: row.try_get("action")?,
        target_type: row.try_get("target_type")?,
        target_id: row.try_get("target_id")?,
        reason: row.try_get("reason")?,
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_action_assign_requires_assignee() {
        let req = IncidentActionRequest {
            action: IncidentAction::Assign,
            assignee: None,
            note: None,
            actor: "sre".into(),
            reason: None,
        };
        assert!(req.assignee.is_none());
    }
}
