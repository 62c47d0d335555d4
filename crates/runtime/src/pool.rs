//! Connection pool: one shared connect future per server name.
//!
//! Concurrent first-connectors share a single in-flight future; a failed
//! connect is evicted under the map lock before the error reaches any
//! caller, so the next `connect` starts fresh. Skip-cache connects bypass
//! the map entirely.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};

use mcporter_client::McpClient;
use mcporter_domain::{Error, Result};

use crate::oauth::OauthSession;

/// A live `(client, transport, session)` tuple for one server. The client
/// owns the transport; the OAuth session (when present) owns the loopback
/// listener and token cache handle.
pub struct Connection {
    pub name: String,
    pub client: McpClient,
    pub oauth: Option<OauthSession>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Orderly teardown: client (and its transport) first, then the OAuth
    /// session. Individual failures are ignored.
    pub async fn close(&self) {
        self.client.close().await;
        if let Some(session) = &self.oauth {
            session.close();
        }
    }
}

type SharedConnect = Shared<BoxFuture<'static, std::result::Result<Arc<Connection>, Arc<Error>>>>;

struct Entry {
    generation: u64,
    future: SharedConnect,
}

/// `map[name] → shared connect future`, guarded by an async mutex.
pub struct ConnectionPool {
    entries: tokio::sync::Mutex<HashMap<String, Entry>>,
    next_generation: std::sync::atomic::AtomicU64,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::Mutex::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Return the cached connection for `name`, creating it with `connect`
    /// if absent. Concurrent callers share one in-flight future.
    pub async fn get_or_connect<F>(&self, name: &str, connect: F) -> Result<Arc<Connection>>
    where
        F: std::future::Future<Output = Result<Arc<Connection>>> + Send + 'static,
    {
        let (future, generation) = {
            let mut entries = self.entries.lock().await;
            match entries.get(name) {
                Some(entry) => (entry.future.clone(), entry.generation),
                None => {
                    let generation = self
                        .next_generation
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let future: SharedConnect =
                        connect.map(|r| r.map_err(Arc::new)).boxed().shared();
                    entries.insert(
                        name.to_string(),
                        Entry {
                            generation,
                            future: future.clone(),
                        },
                    );
                    (future, generation)
                }
            }
        };

        match future.await {
            Ok(connection) => Ok(connection),
            Err(err) => {
                // Evict before the caller observes the failure, but only
                // if the entry is still ours (a fresh attempt may already
                // be in flight under the same name).
                let mut entries = self.entries.lock().await;
                if entries
                    .get(name)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    entries.remove(name);
                }
                Err(Error::Pooled(err))
            }
        }
    }

    /// Whether a pooled entry (resolved or in-flight) exists for `name`.
    pub async fn contains(&self, name: &str) -> bool {
        self.entries.lock().await.contains_key(name)
    }

    /// Remove and tear down the entry for `name`, if any. A still-in-flight
    /// connect is abandoned rather than awaited: dropping the future drops
    /// its partial resources, and `close` never blocks behind a wedged
    /// connect.
    pub async fn close(&self, name: &str) {
        let entry = self.entries.lock().await.remove(name);
        if let Some(entry) = entry {
            if let Some(Ok(connection)) = entry.future.peek() {
                connection.clone().close().await;
            }
        }
    }

    /// Tear down every pooled entry concurrently.
    pub async fn close_all(&self) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let teardowns = drained.into_iter().map(|entry| async move {
            if let Some(Ok(connection)) = entry.future.peek() {
                connection.clone().close().await;
            }
        });
        futures::future::join_all(teardowns).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_connection(name: &str) -> Arc<Connection> {
        // A connection whose transport is a closed scripted stub is enough
        // for pool bookkeeping tests.
        struct NullTransport;
        #[async_trait::async_trait]
        impl mcporter_client::McpTransport for NullTransport {
            async fn send_request(
                &self,
                _method: &str,
                _params: Option<serde_json::Value>,
            ) -> Result<mcporter_client::protocol::JsonRpcResponse> {
                Err(Error::Transport("null transport".into()))
            }
            async fn send_notification(
                &self,
                _method: &str,
                _params: Option<serde_json::Value>,
            ) -> Result<()> {
                Ok(())
            }
            fn is_alive(&self) -> bool {
                false
            }
            async fn close(&self) {}
        }

        Arc::new(Connection {
            name: name.to_string(),
            client: McpClient::new(Box::new(NullTransport), "test"),
            oauth: None,
        })
    }

    #[tokio::test]
    async fn concurrent_connects_share_one_future() {
        let pool = Arc::new(ConnectionPool::new());
        let attempts = Arc::new(AtomicUsize::new(0));

        let connect = |attempts: Arc<AtomicUsize>| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok(fake_connection("x"))
        };

        let a = {
            let pool = pool.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move { pool.get_or_connect("x", connect(attempts)).await })
        };
        let b = {
            let pool = pool.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move { pool.get_or_connect("x", connect(attempts)).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_evicts_the_entry() {
        let pool = ConnectionPool::new();

        let err = pool
            .get_or_connect("x", async { Err(Error::Transport("boom".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Transport(_)));
        assert!(!pool.contains("x").await);

        // The next connect starts fresh and can succeed.
        let conn = pool
            .get_or_connect("x", async { Ok(fake_connection("x")) })
            .await
            .unwrap();
        assert_eq!(conn.name, "x");
        assert!(pool.contains("x").await);
    }

    #[tokio::test]
    async fn both_sharers_of_a_failed_future_see_the_failure() {
        let pool = Arc::new(ConnectionPool::new());
        let second_ran = Arc::new(AtomicUsize::new(0));

        let slow_failure = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Err(Error::Transport("boom".into()))
        };

        let a = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_or_connect("x", slow_failure).await })
        };
        // Let the first connect install its future before the second joins.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let b = {
            let pool = pool.clone();
            let second_ran = second_ran.clone();
            tokio::spawn(async move {
                let fallback = async move {
                    second_ran.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transport("second".into()))
                };
                pool.get_or_connect("x", fallback).await
            })
        };

        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        // The second caller shared the in-flight future instead of
        // starting its own connect.
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
        assert!(!pool.contains("x").await);
    }

    #[tokio::test]
    async fn close_removes_the_entry() {
        let pool = ConnectionPool::new();
        pool.get_or_connect("x", async { Ok(fake_connection("x")) })
            .await
            .unwrap();
        assert!(pool.contains("x").await);
        pool.close("x").await;
        assert!(!pool.contains("x").await);
    }

    #[tokio::test]
    async fn close_all_drains_everything() {
        let pool = ConnectionPool::new();
        for name in ["a", "b", "c"] {
            pool.get_or_connect(name, async move { Ok(fake_connection(name)) })
                .await
                .unwrap();
        }
        pool.close_all().await;
        for name in ["a", "b", "c"] {
            assert!(!pool.contains(name).await);
        }
    }

    #[tokio::test]
    async fn close_of_unknown_name_is_a_no_op() {
        let pool = ConnectionPool::new();
        pool.close("ghost").await;
    }
}
