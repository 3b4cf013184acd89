//! Server liveness watchdog for user instances.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::client::IpcClient;
use super::protocol::Empty;
use crate::config::KeepAliveConfig;
use crate::module::builtin::PING;
use crate::shutdown::ShutdownCoordinator;

/// Ping the server every interval; trigger shutdown after too many misses.
pub fn spawn_keep_alive(
    client: IpcClient,
    config: KeepAliveConfig,
    shutdown: Arc<ShutdownCoordinator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(config.interval) => {}
            }

            match PING.invoke(&client, &Empty {}).await {
                Ok(pong) => {
                    if failures > 0 {
                        tracing::info!(generation = pong.generation, "server reachable again");
                    }
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, max = config.max_failures, "server ping failed");
                    if failures >= config.max_failures {
                        tracing::error!("server unreachable, stopping user instance");
                        shutdown.trigger("server unreachable");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_missing_server_triggers_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let client = IpcClient::connect(dir.path().join("gone.sock"));
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let config = KeepAliveConfig {
            interval: Duration::from_millis(10),
            max_failures: 2,
        };

        let handle = spawn_keep_alive(client, config, shutdown.clone());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watchdog did not give up")
            .unwrap();
        assert!(!shutdown.is_accepting());
    }

    #[tokio::test]
    async fn test_watchdog_stops_on_shutdown() {
        let client = IpcClient::connect("/nonexistent/im.sock");
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let config = KeepAliveConfig {
            interval: Duration::from_secs(3600),
            max_failures: 3,
        };
        let handle = spawn_keep_alive(client, config, shutdown.clone());
        shutdown.trigger("test");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
