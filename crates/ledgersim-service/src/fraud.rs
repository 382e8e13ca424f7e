use std::sync::Arc;
use std::time::Duration;

use ledgersim_adapters::{EventStream, StreamMessage};
use ledgersim_core::LedgerEngine;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const DURABLE_NAME: &str = "fraud-v1";
const BATCH_SIZE: usize = 10;
const FETCH_WAIT: Duration = Duration::from_secs(1);
const LARGE_TRANSFER_THRESHOLD: i64 = 3600;

#[derive(Debug, Deserialize)]
struct TransferPostedEvent {
    #[serde(default)]
    event_id: Option<String>,
    transaction_id: uuid::Uuid,
    #[serde(default)]
    zone_id: Option<String>,
    amount_units: i64,
}

/// Pulls `events.transfer_posted` as the durable consumer `fraud-v1`,
/// de-duplicates via the inbox table, and opens an incident for large
/// transfers. Runs alongside the outbox publisher under the same
/// cancellation token.
pub async fn run(engine: Arc<LedgerEngine>, stream: Arc<dyn EventStream>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            tracing::info!("fraud consumer shutting down");
            return;
        }

        let messages = tokio::select! {
            _ = cancel.cancelled() => return,
            result = stream.pull(DURABLE_NAME, BATCH_SIZE, FETCH_WAIT) => result,
        };

        let messages = match messages {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(error = %err, "fraud consumer pull failed");
                continue;
            }
        };

        for message in messages {
            handle_message(&engine, stream.as_ref(), &message).await;
        }
    }
}

async fn handle_message(engine: &LedgerEngine, stream: &dyn EventStream, message: &StreamMessage) {
    let parsed: Result<TransferPostedEvent, _> = serde_json::from_slice(&message.payload);
    let event = match parsed {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "dropping unparseable transfer_posted message");
            let _ = stream.ack(message).await;
            return;
        }
    };

    // A payload missing its own event_id falls back to the broker's
    // message id; only drop when neither is available.
    let event_id = event
        .event_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| message.message_id.clone());
    if event_id.is_empty() {
        tracing::warn!("dropping transfer_posted message with no event_id and no message_id");
        let _ = stream.ack(message).await;
        return;
    }

    match apply_rule_once(engine, &event_id, &event).await {
        Ok(()) => {
            let _ = stream.ack(message).await;
        }
        Err(err) => {
            tracing::warn!(error = %err, event_id = %event_id, "fraud rule failed, leaving unacked for redelivery");
        }
    }
}

/// Inserts the inbox row and the rule's incident (if any) in one
/// transaction, so a failed incident insert rolls back the inbox row too
/// and the message is safely redelivered instead of silently skipped.
async fn apply_rule_once(
    engine: &LedgerEngine,
    event_id: &str,
    event: &TransferPostedEvent,
) -> Result<(), sqlx::Error> {
    let mut tx = engine.store().pool().begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO inbox_events (consumer, event_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(DURABLE_NAME)
    .bind(event_id)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        > 0;

    if !inserted {
        // Duplicate delivery: the rule already ran for this event_id.
        tx.commit().await?;
        return Ok(());
    }

    if event.amount_units >= LARGE_TRANSFER_THRESHOLD {
        let details = serde_json::json!({
            "amount_units": event.amount_units,
            "rule": "large_transfer",
        });
        sqlx::query(
            "INSERT INTO incidents (id, zone_id, related_txn_id, severity, status, title, details) \
             VALUES ($1, $2, $3, 'WARN', 'OPEN', 'Large time transfer', $4)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind(event.zone_id.as_deref().unwrap_or("unknown"))
        .bind(event.transaction_id)
        .bind(details)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
