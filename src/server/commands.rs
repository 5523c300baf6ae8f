use serde_json::json;
use tracing::warn;

use super::init::Context;
use crate::{sender::Sender, server::error::Result, storage::Storage};

const NULL: &str = "null";
const OK: &str = "ok";
const NOTIFY_SUBJECT: &str = "Notification";

/// Set a key-value pair, optionally expiring after `seconds`
pub fn set(key: &str, value: String, storage: &Storage, seconds: u64) -> Result<String> {
    storage.insert(key.to_string(), value, seconds)?;
    Ok(OK.into())
}

/// Get a value, `null` when missing or expired
pub fn get(key: &str, storage: &Storage) -> Result<String> {
    Ok(storage.get(key)?.unwrap_or_else(|| NULL.into()))
}

/// Delete a key, answering with the deleted key or `null`
pub fn delete(key: &str, storage: &Storage) -> Result<String> {
    Ok(storage.delete(key)?.unwrap_or_else(|| NULL.into()))
}

pub fn expires_in(key: &str, storage: &Storage) -> Result<String> {
    Ok(storage
        .expires_in(key)?
        .map(|secs| secs.to_string())
        .unwrap_or_else(|| NULL.into()))
}

/// Hand a message to the configured sender. Delivery failures are answered,
/// not propagated: the connection stays usable.
pub async fn notify(recipient: &str, message: &str, sender: &dyn Sender) -> Result<String> {
    match sender.send(recipient, NOTIFY_SUBJECT, message).await {
        Ok(()) => Ok(OK.into()),
        Err(err) => {
            warn!(recipient, error = %err, "notification failed");
            Ok("error:notify failed".into())
        }
    }
}

pub fn info(ctx: &Context) -> Result<String> {
    let payload = json!({
        "storage": ctx.storage.stats(),
        "sender": ctx.sender.backend(),
        "tls": ctx.tls.is_some(),
    });
    Ok(payload.to_string())
}
