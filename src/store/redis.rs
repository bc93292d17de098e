//! Redis-backed counter store.
//!
//! Counters are plain string keys holding decimal integers with a
//! millisecond TTL. Admission runs as a Lua script so the read, the optional
//! creation and the increment happen as one atomic step on the server, which
//! keeps the quota exact across every process sharing the instance.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{parse_counter, Admission, CounterStore};
use crate::config::StoreConfig;
use crate::error::{Result, TollgateError};

/// Error code raised by the admission script for non-integer counters.
const MALFORMED_CODE: &str = "MALFORMED";

/// KEYS[1] = counter key, ARGV[1] = capacity, ARGV[2] = window in ms.
///
/// Returns `{admitted, count, pttl}`. A counter that somehow lost its expiry
/// is given the window again so it cannot stay saturated forever.
const ADMIT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
local current
if not raw then
  redis.call('SET', KEYS[1], 0, 'PX', ARGV[2])
  current = 0
else
  if not string.match(raw, '^%d+$') then
    return redis.error_reply('MALFORMED ' .. raw)
  end
  current = tonumber(raw)
end

local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  ttl = tonumber(ARGV[2])
end

if current < tonumber(ARGV[1]) then
  current = redis.call('INCR', KEYS[1])
  return {1, current, ttl}
end
return {0, current, ttl}
"#;

/// Counter store backed by a shared Redis instance.
///
/// Cloning is cheap; clones share one multiplexed, auto-reconnecting
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    admit_script: Script,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the configured Redis instance.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        info!(url = %sanitize_url(&config.url), "Connecting to counter store");

        let client = Client::open(config.url.as_str())?;
        let connect = ConnectionManager::new(client);
        let connection = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| TollgateError::Timeout(config.connect_timeout()))??;

        info!("Counter store connected");
        Ok(Self {
            connection,
            admit_script: Script::new(ADMIT_SCRIPT),
            timeout: config.timeout(),
        })
    }

    /// Release the connection at shutdown.
    pub async fn close(self) {
        info!("Closing counter store connection");
        drop(self.connection);
    }

    /// Run a Redis future under the store deadline.
    async fn bounded<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(TollgateError::from),
            Err(_) => Err(TollgateError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = self.bounded(conn.get(key)).await?;
        raw.map(|raw| parse_counter(key, &raw)).transpose()
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let millis = window_millis(ttl);
        self.bounded(conn.pset_ex::<_, _, ()>(key, value, millis))
            .await
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let value: i64 = self
            .bounded(conn.incr(key, 1_i64))
            .await
            .map_err(|e| malformed_or(key, e))?;
        u64::try_from(value).map_err(|_| TollgateError::MalformedCounterValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.connection.clone();
        let millis: i64 = self.bounded(conn.pttl(key)).await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        debug!("Performing counter store health check");
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn is_atomic(&self) -> bool {
        true
    }

    /// Runs the admission script under the store deadline.
    ///
    /// A `Timeout` only means no reply arrived in time. The script may still
    /// have run on the server, so the counter can be one higher than any
    /// admitted request accounts for.
    async fn admit(&self, key: &str, capacity: u64, window: Duration) -> Result<Admission> {
        let mut conn = self.connection.clone();
        let mut invocation = self.admit_script.key(key);
        invocation.arg(capacity).arg(window_millis(window));

        let (admitted, count, ttl): (i64, i64, i64) = match tokio::time::timeout(
            self.timeout,
            invocation.invoke_async(&mut conn),
        )
        .await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) if e.code() == Some(MALFORMED_CODE) => {
                return Err(TollgateError::MalformedCounterValue {
                    key: key.to_string(),
                    value: e.detail().unwrap_or_default().to_string(),
                });
            }
            Ok(Err(e)) => return Err(malformed_or(key, e.into())),
            Err(_) => return Err(TollgateError::Timeout(self.timeout)),
        };

        Ok(Admission {
            admitted: admitted == 1,
            count: u64::try_from(count).unwrap_or_default(),
            reset_after: u64::try_from(ttl).ok().map(Duration::from_millis),
        })
    }
}

/// Redis rejects `INCR` on non-integer values with a plain error reply;
/// surface that as a malformed counter rather than an outage.
fn malformed_or(key: &str, err: TollgateError) -> TollgateError {
    match err {
        TollgateError::StoreUnavailable(message) if message.contains("not an integer") => {
            TollgateError::MalformedCounterValue {
                key: key.to_string(),
                value: message,
            }
        }
        other => other,
    }
}

/// Windows below one millisecond are rejected by `RatePolicy`, so this only
/// rounds sub-millisecond remainders.
fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Hide the password when logging a connection URL.
pub(crate) fn sanitize_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid_url".to_string(),
    }
}
