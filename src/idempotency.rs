use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

// Redis-backed replay cache for `Idempotency-Key`. Failures degrade to a
// cache miss; the in-memory map in the router covers the no-Redis case.

fn namespaced(key: &str) -> String {
    format!("rehoming:idem:{key}")
}

pub async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target: "rehoming.api", error = %err, "idempotency_redis_unavailable");
            return None;
        }
    };
    let s = conn
        .get::<_, Option<String>>(namespaced(key))
        .await
        .ok()
        .flatten();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set<T: Serialize>(client: &redis::Client, key: &str, value: &T, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(namespaced(key), json, ttl_secs).await;
    }
}

pub fn ttl_from_env() -> u64 {
    std::env::var("IDEMPOTENCY_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(3600)
}
