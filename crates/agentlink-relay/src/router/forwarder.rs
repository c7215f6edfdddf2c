//! Tool router that turns `execute_tool` calls into correlated request /
//! response exchanges over an agent's socket.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use agentlink_core::config::RelaySettings;

use crate::breaker::{CircuitBreakers, Permit};
use crate::error::ToolError;
use crate::protocol::Envelope;
use crate::registry::{AgentConnection, ConnectionRegistry, PendingOutcome};

/// Routes tool calls to the calling user's agent.
#[derive(Clone)]
pub struct ToolRouter {
    registry: Arc<ConnectionRegistry>,
    breakers: Arc<CircuitBreakers>,
    /// Tools allowed through while the agent's tool server is down.
    tools_without_tool_server: Arc<HashSet<String>>,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        breakers: Arc<CircuitBreakers>,
        settings: &RelaySettings,
    ) -> Self {
        Self {
            registry,
            breakers,
            tools_without_tool_server: Arc::new(
                settings.tools_without_tool_server.iter().cloned().collect(),
            ),
            default_timeout: settings.default_tool_timeout(),
            max_timeout: Duration::try_from_secs_f64(settings.max_tool_timeout_secs.max(0.0))
                .unwrap_or(Duration::MAX),
        }
    }

    /// Execute `tool_name` on the user's agent and wait for its result.
    ///
    /// `timeout` defaults to the configured default and must lie in
    /// `(0, max]`. The exchange runs on its own task, so a caller that stops
    /// waiting still has its pending entry and breaker permit settled.
    pub async fn execute_tool(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ToolError> {
        if tool_name.trim().is_empty() {
            return Err(ToolError::InvalidRequest("tool_name must not be empty".into()));
        }
        let timeout = self.resolve_timeout(timeout)?;

        let router = self.clone();
        let user_id = user_id.to_string();
        let tool_name = tool_name.to_string();
        let task = tokio::spawn(async move {
            router
                .run_exchange(&user_id, &tool_name, &arguments, timeout)
                .await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Tool exchange task failed");
                Err(ToolError::ToolExecution(format!("Tool exchange failed: {e}")))
            }
        }
    }

    fn resolve_timeout(&self, requested: Option<Duration>) -> Result<Duration, ToolError> {
        let Some(requested) = requested else {
            return Ok(self.default_timeout);
        };
        if requested.is_zero() || requested > self.max_timeout {
            return Err(ToolError::InvalidRequest(format!(
                "timeout must be greater than 0 and at most {}s",
                self.max_timeout.as_secs()
            )));
        }
        Ok(requested)
    }

    async fn run_exchange(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let permit = self.breakers.try_acquire(user_id).await.map_err(|rejected| {
            debug!(user_id = %user_id, tool_name = %tool_name, "Circuit open, rejecting call");
            ToolError::CircuitOpen {
                retry_after: rejected.retry_after,
            }
        })?;

        let started = Instant::now();
        let result = self
            .send_and_wait(user_id, tool_name, arguments, timeout)
            .await;

        match &result {
            Ok((_, conn)) => {
                self.breakers.record_success(user_id, permit).await;
                // Best-effort: skipped if the connection has been replaced.
                self.registry
                    .record_command(user_id, &conn.connection_id)
                    .await;
                info!(
                    user_id = %user_id,
                    tool_name = %tool_name,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Tool call succeeded"
                );
            }
            Err(e) if e.trips_breaker() => {
                self.breakers.record_failure(user_id, permit).await;
                warn!(
                    user_id = %user_id,
                    tool_name = %tool_name,
                    error_code = e.code(),
                    error = %e,
                    "Tool call failed"
                );
            }
            Err(e) => {
                self.breakers.release(user_id, permit).await;
                debug!(user_id = %user_id, tool_name = %tool_name, error_code = e.code(), "Tool call not sent");
            }
        }

        result.map(|(value, _)| value)
    }

    async fn send_and_wait(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<(Value, Arc<AgentConnection>), ToolError> {
        let conn = self
            .registry
            .get(user_id)
            .await
            .ok_or(ToolError::NoActiveConnection)?;

        if !self.tools_without_tool_server.contains(tool_name) && !conn.tool_server_connected().await
        {
            return Err(ToolError::McpNotConnected);
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;

        // Register before sending so a fast response always finds its slot.
        let Some(mut response_rx) = conn
            .register_pending(correlation_id.clone(), tool_name, deadline)
            .await
        else {
            return Err(ToolError::NoActiveConnection);
        };

        debug!(
            user_id = %user_id,
            correlation_id = %correlation_id,
            tool_name = %tool_name,
            "Sending tool request"
        );
        let request = Envelope::tool_request(&correlation_id, tool_name, arguments);
        // Queueing counts against the deadline. Teardown or expiry while the
        // queue is full resolves the entry, which ends the wait as well.
        let queued = tokio::select! {
            queued = timeout_at(deadline, conn.send(request)) => queued,
            outcome = &mut response_rx => {
                let outcome = outcome.unwrap_or(PendingOutcome::ConnectionLost);
                return Self::outcome_result(outcome, timeout).map(|value| (value, conn));
            }
        };
        match queued {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                conn.take_pending(&correlation_id).await;
                return Err(ToolError::ConnectionLost);
            }
            Err(_) => warn!(
                connection_id = %conn.connection_id,
                correlation_id = %correlation_id,
                "Outbound queue full until the tool deadline"
            ),
        }

        let outcome = Self::wait_for(&conn, &correlation_id, response_rx, deadline, timeout).await?;
        Ok((outcome, conn))
    }

    /// Wait for the first of: the agent's response, teardown, or the
    /// deadline. On a deadline the entry is removed, unless a resolver got
    /// there first, in which case its outcome wins.
    async fn wait_for(
        conn: &AgentConnection,
        correlation_id: &str,
        mut response_rx: oneshot::Receiver<PendingOutcome>,
        deadline: Instant,
        limit: Duration,
    ) -> Result<Value, ToolError> {
        let outcome = match timeout_at(deadline, &mut response_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => PendingOutcome::ConnectionLost,
            Err(_) => {
                if conn.take_pending(correlation_id).await {
                    warn!(
                        connection_id = %conn.connection_id,
                        correlation_id = %correlation_id,
                        "Tool request timed out"
                    );
                    return Err(ToolError::ToolTimeout { timeout: limit });
                }
                response_rx
                    .await
                    .unwrap_or(PendingOutcome::ConnectionLost)
            }
        };
        Self::outcome_result(outcome, limit)
    }

    fn outcome_result(outcome: PendingOutcome, limit: Duration) -> Result<Value, ToolError> {
        match outcome {
            PendingOutcome::Response(Ok(value)) => Ok(value),
            PendingOutcome::Response(Err(message)) => Err(ToolError::ToolExecution(message)),
            PendingOutcome::ConnectionLost => Err(ToolError::ConnectionLost),
            PendingOutcome::Expired => Err(ToolError::ToolTimeout { timeout: limit }),
        }
    }

    /// Hand an agent's reply to whoever is waiting on `correlation_id`.
    ///
    /// Replies for unknown, timed-out or already-resolved requests are
    /// discarded; returns whether a caller was waiting.
    pub async fn resolve(
        &self,
        conn: &AgentConnection,
        correlation_id: &str,
        reply: Result<Value, String>,
    ) -> bool {
        let delivered = conn
            .complete_pending(correlation_id, PendingOutcome::Response(reply))
            .await;
        if !delivered {
            debug!(
                connection_id = %conn.connection_id,
                correlation_id = %correlation_id,
                "Discarding late or unknown tool response"
            );
        }
        delivered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::EnvelopeType;
    use crate::registry::{AgentMetadata, ToolServerStatus};

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        breakers: Arc<CircuitBreakers>,
        router: ToolRouter,
    }

    fn harness(threshold: u32) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let breakers = Arc::new(CircuitBreakers::with_cooldowns(
            threshold,
            Duration::from_millis(50),
            Duration::from_secs(1),
        ));
        let router = ToolRouter::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            &RelaySettings::default(),
        );
        Harness {
            registry,
            breakers,
            router,
        }
    }

    async fn connect(h: &Harness, user: &str) -> (Arc<AgentConnection>, mpsc::Receiver<Envelope>) {
        connect_with_capacity(h, user, 16).await
    }

    async fn connect_with_capacity(
        h: &Harness,
        user: &str,
        capacity: usize,
    ) -> (Arc<AgentConnection>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = h
            .registry
            .install(user, "cred", AgentMetadata::default(), tx)
            .await;
        h.registry
            .update_tool_server_status(
                user,
                &conn.connection_id,
                ToolServerStatus {
                    connected: true,
                    tools_count: 3,
                    ..Default::default()
                },
            )
            .await;
        (conn, rx)
    }

    /// Answers every tool request it sees with `reply`.
    fn spawn_agent(
        router: ToolRouter,
        conn: Arc<AgentConnection>,
        mut rx: mpsc::Receiver<Envelope>,
        reply: Result<Value, String>,
    ) {
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if env.kind == EnvelopeType::ToolRequest {
                    let cid = env.correlation_id.clone().unwrap();
                    router.resolve(&conn, &cid, reply.clone()).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn round_trip_returns_agent_result() {
        let h = harness(5);
        let (conn, rx) = connect(&h, "u1").await;
        spawn_agent(h.router.clone(), Arc::clone(&conn), rx, Ok(json!({"spawned": "Cube_1"})));

        let result = h
            .router
            .execute_tool("u1", "spawn_actor", Map::new(), None)
            .await
            .unwrap();

        assert_eq!(result, json!({"spawned": "Cube_1"}));
        let snap = conn.snapshot().await;
        assert_eq!(snap.commands_executed, 1);
        assert_eq!(snap.pending_requests, 0);
    }

    #[tokio::test]
    async fn request_envelope_carries_arguments() {
        let h = harness(5);
        let (_conn, mut rx) = connect(&h, "u1").await;

        let mut args = Map::new();
        args.insert("name".into(), json!("Cube_1"));
        let router = h.router.clone();
        let call = tokio::spawn(async move {
            router
                .execute_tool("u1", "spawn_actor", args, Some(Duration::from_millis(50)))
                .await
        });

        let env = rx.recv().await.unwrap();
        assert_eq!(env.kind, EnvelopeType::ToolRequest);
        assert_eq!(env.payload["tool_name"], "spawn_actor");
        assert_eq!(env.payload["arguments"]["name"], "Cube_1");
        assert!(env.correlation_id.is_some());

        assert!(matches!(
            call.await.unwrap(),
            Err(ToolError::ToolTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn agent_error_becomes_tool_execution_error() {
        let h = harness(5);
        let (conn, rx) = connect(&h, "u1").await;
        spawn_agent(h.router.clone(), conn, rx, Err("Actor not found".into()));

        let err = h
            .router
            .execute_tool("u1", "delete_actor", Map::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::ToolExecution("Actor not found".into()));
        assert_eq!(h.breakers.snapshot("u1").await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn no_connection_does_not_touch_breaker() {
        let h = harness(1);
        for _ in 0..3 {
            let err = h
                .router
                .execute_tool("ghost", "spawn_actor", Map::new(), None)
                .await
                .unwrap_err();
            assert_eq!(err, ToolError::NoActiveConnection);
        }
        assert_eq!(h.breakers.snapshot("ghost").await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn tool_server_down_is_reported_except_for_allowed_tools() {
        let h = harness(5);
        let (tx, mut rx) = mpsc::channel(16);
        let conn = h
            .registry
            .install("u1", "cred", AgentMetadata::default(), tx)
            .await;

        let err = h
            .router
            .execute_tool("u1", "spawn_actor", Map::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ToolError::McpNotConnected);

        let router = h.router.clone();
        let conn2 = Arc::clone(&conn);
        tokio::spawn(async move {
            let env = rx.recv().await.unwrap();
            let cid = env.correlation_id.unwrap();
            router.resolve(&conn2, &cid, Ok(json!("pong"))).await;
        });
        let pong = h
            .router
            .execute_tool("u1", "ping", Map::new(), None)
            .await
            .unwrap();
        assert_eq!(pong, json!("pong"));
    }

    #[tokio::test]
    async fn timeout_removes_pending_and_ignores_late_reply() {
        let h = harness(5);
        let (conn, mut rx) = connect(&h, "u1").await;

        let err = h
            .router
            .execute_tool("u1", "slow", Map::new(), Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ToolError::ToolTimeout {
                timeout: Duration::from_millis(30)
            }
        );
        assert_eq!(conn.pending_count().await, 0);

        let env = rx.recv().await.unwrap();
        let cid = env.correlation_id.unwrap();
        assert!(!h.router.resolve(&conn, &cid, Ok(json!(1))).await);
        assert_eq!(conn.snapshot().await.commands_executed, 0);
    }

    #[tokio::test]
    async fn teardown_fails_in_flight_calls() {
        let h = harness(5);
        let (_conn, _rx) = connect(&h, "u1").await;

        let router = h.router.clone();
        let call = tokio::spawn(async move {
            router
                .execute_tool("u1", "slow", Map::new(), Some(Duration::from_secs(5)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registry
            .remove("u1", crate::registry::DisconnectReason::ClientClosed)
            .await;

        assert_eq!(call.await.unwrap(), Err(ToolError::ConnectionLost));
        assert_eq!(h.breakers.snapshot("u1").await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_writing() {
        let h = harness(2);
        let (_conn, mut rx) = connect(&h, "u1").await;

        for _ in 0..2 {
            let err = h
                .router
                .execute_tool("u1", "slow", Map::new(), Some(Duration::from_millis(10)))
                .await
                .unwrap_err();
            assert!(matches!(err, ToolError::ToolTimeout { .. }));
        }
        // Drain the two requests that were sent.
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let err = h
            .router
            .execute_tool("u1", "slow", Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CircuitOpen { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_bad_timeouts_and_empty_names() {
        let h = harness(5);
        assert!(matches!(
            h.router
                .execute_tool("u1", "t", Map::new(), Some(Duration::ZERO))
                .await,
            Err(ToolError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.router
                .execute_tool("u1", "t", Map::new(), Some(Duration::from_secs(3600)))
                .await,
            Err(ToolError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.router.execute_tool("u1", "  ", Map::new(), None).await,
            Err(ToolError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_calls_for_one_user_resolve_independently() {
        let h = harness(5);
        let (conn, mut rx) = connect(&h, "u1").await;

        let router = h.router.clone();
        let agent_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(env) = rx.recv().await {
                seen.push(env);
                if seen.len() == 3 {
                    // Answer in reverse order.
                    for env in seen.iter().rev() {
                        let cid = env.correlation_id.clone().unwrap();
                        let reply = env.payload["arguments"]["n"].clone();
                        router.resolve(&agent_conn, &cid, Ok(reply)).await;
                    }
                }
            }
        });

        let calls: Vec<_> = (0..3)
            .map(|n| {
                let router = h.router.clone();
                tokio::spawn(async move {
                    let mut args = Map::new();
                    args.insert("n".into(), json!(n));
                    router.execute_tool("u1", "echo", args, None).await
                })
            })
            .collect();

        for (n, call) in calls.into_iter().enumerate() {
            assert_eq!(call.await.unwrap().unwrap(), json!(n));
        }
        assert_eq!(conn.snapshot().await.commands_executed, 3);
    }

    #[tokio::test]
    async fn full_outbound_queue_times_out_at_deadline() {
        let h = harness(5);
        let (conn, _rx) = connect_with_capacity(&h, "u1", 1).await;
        assert!(conn.try_send(Envelope::heartbeat()));

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            h.router
                .execute_tool("u1", "spawn_actor", Map::new(), Some(Duration::from_millis(50))),
        )
        .await
        .unwrap();

        assert_eq!(
            result,
            Err(ToolError::ToolTimeout {
                timeout: Duration::from_millis(50)
            })
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn teardown_while_queue_full_fails_call() {
        let h = harness(5);
        let (conn, _rx) = connect_with_capacity(&h, "u1", 1).await;
        assert!(conn.try_send(Envelope::heartbeat()));

        let router = h.router.clone();
        let call = tokio::spawn(async move {
            router
                .execute_tool("u1", "spawn_actor", Map::new(), Some(Duration::from_secs(10)))
                .await
        });
        while conn.pending_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.registry
            .remove("u1", crate::registry::DisconnectReason::HeartbeatTimeout)
            .await;

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ToolError::ConnectionLost));
    }

    #[tokio::test]
    async fn half_open_admits_one_trial_onto_the_socket() {
        let h = harness(1);
        let (conn, mut rx) = connect(&h, "u1").await;

        let err = h
            .router
            .execute_tool("u1", "slow", Map::new(), Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ToolTimeout { .. }));
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let router = h.router.clone();
        let trial = tokio::spawn(async move {
            router
                .execute_tool("u1", "spawn_actor", Map::new(), Some(Duration::from_secs(2)))
                .await
        });
        let request = rx.recv().await.unwrap();
        assert_eq!(request.kind, EnvelopeType::ToolRequest);

        let err = h
            .router
            .execute_tool("u1", "spawn_actor", Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CircuitOpen { .. }));
        assert!(rx.try_recv().is_err());

        let cid = request.correlation_id.unwrap();
        assert!(h.router.resolve(&conn, &cid, Ok(json!("ok"))).await);
        assert_eq!(trial.await.unwrap(), Ok(json!("ok")));
        assert_eq!(
            h.breakers.snapshot("u1").await.state,
            crate::breaker::CircuitState::Closed
        );
    }
}
