use std::sync::Arc;
use std::time::Duration;

use ledgersim_adapters::EventStream;
use ledgersim_core::LedgerEngine;
use serde_json::Value;
use sqlx::Row;
use tokio_util::sync::CancellationToken;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const BATCH_SIZE: i64 = 50;
const SENTINEL_EVENT_ID: &str = "generated_by_db";

/// Drains unpublished outbox rows to the event stream every 250ms, up to 50
/// rows per tick, stopping the batch on the first publish failure so the
/// row stays eligible for the next tick.
pub async fn run(engine: Arc<LedgerEngine>, stream: Arc<dyn EventStream>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("outbox publisher shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = publish_tick(&engine, stream.as_ref()).await {
                    tracing::warn!(error = %err, "outbox publish tick failed");
                }
            }
        }
    }
}

async fn publish_tick(engine: &LedgerEngine, stream: &dyn EventStream) -> Result<(), sqlx::Error> {
    let pool = engine.store().pool();
    let rows = sqlx::query(
        "SELECT id, payload FROM outbox_events WHERE published_at IS NULL ORDER BY created_at ASC LIMIT $1",
    )
    .bind(BATCH_SIZE)
    .fetch_all(pool)
    .await?;

    let mut published = 0;
    for row in rows {
        let id: uuid::Uuid = row.try_get("id")?;
        let mut payload: Value = row.try_get("payload")?;
        rewrite_sentinel(&mut payload, &id);

        let bytes = serde_json::to_vec(&payload).expect("outbox payload always serializes");
        match stream.publish("events.transfer_posted", &id.to_string(), &bytes).await {
            Ok(()) => {
                sqlx::query("UPDATE outbox_events SET published_at = now() WHERE id = $1")
                    .bind(id)
                    .execute(pool)
                    .await?;
                published += 1;
            }
            Err(err) => {
                tracing::warn!(error = %err, outbox_id = %id, "publish failed, retrying next tick");
                break;
            }
        }
    }
    tracing::debug!(published, "outbox publish tick complete");
    Ok(())
}

fn rewrite_sentinel(payload: &mut Value, outbox_id: &uuid::Uuid) {
    let Some(obj) = payload.as_object_mut() else { return };
    let needs_rewrite = match obj.get("event_id") {
        Some(Value::String(s)) => s == SENTINEL_EVENT_ID,
        None => true,
        _ => false,
    };
    if needs_rewrite {
        obj.insert("event_id".to_string(), Value::String(outbox_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rewrites_sentinel_event_id() {
        let id = uuid::Uuid::new_v4();
        let mut payload = json!({"event_id": "generated_by_db", "transaction_id": "abc"});
        rewrite_sentinel(&mut payload, &id);
        assert_eq!(payload["event_id"], id.to_string());
    }

    #[test]
    fn leaves_non_sentinel_event_id_untouched() {
        let id = uuid::Uuid::new_v4();
        let mut payload = json!({"event_id": "already-set"});
        rewrite_sentinel(&mut payload, &id);
        assert_eq!(payload["event_id"], "already-set");
    }

    #[test]
    fn fills_missing_event_id() {
        let id = uuid::Uuid::new_v4();
        let mut payload = json!({"transaction_id": "abc"});
        rewrite_sentinel(&mut payload, &id);
        assert_eq!(payload["event_id"], id.to_string());
    }
}
