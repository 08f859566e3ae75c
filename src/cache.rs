use md5::{Digest, Md5};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Redis-backed cache for raw extraction results, keyed by video id.
#[derive(Clone)]
pub struct InfoCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl InfoCache {
    pub async fn connect(host: &str, port: u16, ttl_secs: u64) -> Option<Self> {
        let url = format!("redis://{host}:{port}");
        match redis::Client::open(url.as_str()) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    info!("Redis connected at {host}:{port}");
                    Some(Self { conn, ttl_secs })
                }
                Err(e) => {
                    warn!("Redis connection failed: {e}. Caching disabled.");
                    None
                }
            },
            Err(e) => {
                warn!("Redis client creation failed: {e}. Caching disabled.");
                None
            }
        }
    }

    pub async fn get(&self, video_id: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        match conn.get::<_, Option<String>>(cache_key(video_id)).await {
            Ok(Some(cached)) => {
                debug!("Cache HIT for {video_id}");
                Some(cached)
            }
            Ok(None) => {
                debug!("Cache MISS for {video_id}");
                None
            }
            Err(e) => {
                warn!("Redis get error: {e}");
                None
            }
        }
    }

    pub async fn put(&self, video_id: &str, info_json: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(cache_key(video_id), info_json, self.ttl_secs)
            .await
        {
            warn!("Redis set error: {e}");
        } else {
            debug!("Cached info for {video_id} (TTL: {}s)", self.ttl_secs);
        }
    }

    /// Drop a cached entry whose stream URLs stopped working.
    pub async fn invalidate(&self, video_id: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(cache_key(video_id)).await {
            warn!("Redis delete error: {e}");
        }
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

fn cache_key(video_id: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(video_id.as_bytes());
    format!("youtube:info:{:x}", hasher.finalize())
}
