//! Port lifecycle: one spawned task per server engine.
//!
//! A [`PortRuntime`] owns the task that drives a [`ServerEngine`] and the
//! cancellation token that stops it. Stopping is orderly: cancel the token,
//! let the engine close its transport, drain remaining passes until the
//! engine reports closed, then join the task and hand back its final
//! counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::logging::SharedSink;
use crate::server::{EngineStats, ServerEngine};

/// How long `stop` waits for the engine task to wind down
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running port: an engine task plus its stop handle
pub struct PortRuntime {
    name: String,
    sink: SharedSink,
    token: CancellationToken,
    handle: Option<JoinHandle<Box<dyn ServerEngine>>>,
}

impl PortRuntime {
    /// Spawn the engine loop on a new task
    pub fn spawn(name: &str, mut engine: Box<dyn ServerEngine>, sink: SharedSink) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();
        let task_sink = Arc::clone(&sink);
        let label = engine.describe();
        sink.info(&label, "port started");

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    result = engine.process() => {
                        if let Err(e) = result {
                            if e.is_idle_timeout() {
                                continue;
                            }
                            task_sink.error(&engine.describe(), 0, &e.to_string());
                            if e.is_transport_error() {
                                // Cannot bind, open or keep the transport; the
                                // port is dead until reconfigured
                                break;
                            }
                        }
                    }
                }
            }
            engine.close().await;
            while !engine.is_closed() {
                if engine.process().await.is_err() {
                    break;
                }
            }
            engine
        });

        Self {
            name: name.to_string(),
            sink,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the engine task is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop the port and return the engine's final counters
    ///
    /// `None` means the task could not be joined (panic or wind-down
    /// timeout).
    pub async fn stop(mut self) -> Option<EngineStats> {
        self.token.cancel();
        let handle = self.handle.take()?;
        let stats = match timeout(STOP_TIMEOUT, handle).await {
            Ok(Ok(engine)) => Some(engine.stats()),
            Ok(Err(_)) => None,
            Err(_) => None,
        };
        self.sink.info(&self.name, "port stopped");
        stats
    }
}

impl Drop for PortRuntime {
    fn drop(&mut self) {
        // A dropped port must not leave its task spinning
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SimError, SimResult};
    use crate::logging::NullSink;
    use async_trait::async_trait;

    struct StubEngine {
        passes: u64,
        closed: bool,
        fail: bool,
    }

    impl StubEngine {
        fn new(fail: bool) -> Self {
            Self { passes: 0, closed: false, fail }
        }
    }

    #[async_trait]
    impl ServerEngine for StubEngine {
        fn describe(&self) -> String {
            "stub".to_string()
        }

        async fn process(&mut self) -> SimResult<()> {
            self.passes += 1;
            if self.fail {
                return Err(SimError::connection("transport down"));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn stats(&self) -> EngineStats {
            EngineStats {
                requests_total: self.passes,
                ..Default::default()
            }
        }
    }

    #[tokio::test]
    async fn test_port_runs_passes_until_stopped() {
        let port = PortRuntime::spawn("p1", Box::new(StubEngine::new(false)), Arc::new(NullSink));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(port.is_running());

        let stats = port.stop().await.unwrap();
        assert!(stats.requests_total > 0, "engine never ran a pass");
    }

    #[tokio::test]
    async fn test_port_dies_on_transport_error() {
        let port = PortRuntime::spawn("p2", Box::new(StubEngine::new(true)), Arc::new(NullSink));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!port.is_running());

        // Stop still joins cleanly and hands back counters
        let stats = port.stop().await.unwrap();
        assert_eq!(stats.requests_total, 1);
    }

    #[tokio::test]
    async fn test_stop_is_prompt() {
        let port = PortRuntime::spawn("p3", Box::new(StubEngine::new(false)), Arc::new(NullSink));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = std::time::Instant::now();
        port.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
