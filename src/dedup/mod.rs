use async_trait::async_trait;
use log::debug;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, ProtocolVersion, RedisConnectionInfo};

use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Records which event ids have already entered the pipeline, so a
/// poll cadence much shorter than event lifetimes stays idempotent.
#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn seen(&self, event_id: &str) -> Result<bool>;
    async fn mark_seen(&self, event_id: &str) -> Result<()>;
}

/// Redis backed seen store. Every mark carries a TTL so ids age out on
/// their own and the keyspace stays bounded.
pub struct RedisSeenStore {
    conn: MultiplexedConnection,
    ttl_secs: u64,
}

impl RedisSeenStore {
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        let (host, port) = match config.addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid cache address: {}", config.addr)))?;
                (host.to_string(), port)
            }
            None => (config.addr.clone(), 6379),
        };

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: config.db,
                username: None,
                password: (!config.password.is_empty()).then(|| config.password.clone()),
                protocol: if config.protocol == 2 {
                    ProtocolVersion::RESP2
                } else {
                    ProtocolVersion::RESP3
                },
            },
        };
        let client = redis::Client::open(info)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            conn,
            ttl_secs: config.seen_ttl_secs,
        })
    }
}

#[async_trait]
impl SeenStore for RedisSeenStore {
    async fn seen(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(event_id).await?;
        Ok(value.as_deref() == Some(event_id))
    }

    async fn mark_seen(&self, event_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(event_id, event_id, self.ttl_secs).await?;
        debug!("marked {} as seen for {}s", event_id, self.ttl_secs);
        Ok(())
    }
}
