#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use vigil_channels::*;
    use vigil_core::{Event, EventBus, EventKind, Severity};

    struct Harness {
        _dir: TempDir,
        cursor_path: std::path::PathBuf,
        bus: EventBus,
        inbound: Arc<Mutex<Vec<String>>>,
        system: Arc<Mutex<Vec<Event>>>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let cursor_path = dir.path().join("transport").join("cursor.json");
            let bus = EventBus::in_memory();
            let inbound = Arc::new(Mutex::new(Vec::new()));
            let system = Arc::new(Mutex::new(Vec::new()));

            let i = inbound.clone();
            bus.subscribe(
                |e| e.kind == EventKind::InboundMessage,
                move |e| {
                    i.lock().push(e.payload_str("message_id").unwrap_or_default().to_string());
                    Ok(())
                },
            );
            let s = system.clone();
            bus.subscribe(
                |e| e.kind == EventKind::System,
                move |e| {
                    s.lock().push(e.clone());
                    Ok(())
                },
            );
            Self {
                _dir: dir,
                cursor_path,
                bus,
                inbound,
                system,
            }
        }

        fn transport(&self, inner: Arc<ScriptedTransport>) -> Arc<ResilientTransport> {
            Arc::new(ResilientTransport::new(
                inner,
                self.bus.clone(),
                settings(),
                self.cursor_path.clone(),
            ))
        }

        fn inbound(&self) -> Vec<String> {
            self.inbound.lock().clone()
        }

        fn system_codes(&self) -> Vec<String> {
            self.system
                .lock()
                .iter()
                .filter_map(|e| e.code().map(str::to_string))
                .collect()
        }
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            poll_interval: Duration::from_millis(20),
            max_send_attempts: 3,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            typing_timeout: Duration::from_millis(50),
        }
    }

    fn msg(id: &str, second: u32) -> InboundMessage {
        ScriptedTransport::message(
            id,
            "conv-1",
            "operator",
            &format!("text {id}"),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, second).unwrap(),
        )
    }

    fn transient(reason: &str) -> TransportError {
        TransportError::Transient(reason.into())
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    fn spawn(rt: &Arc<ResilientTransport>) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(rt.clone().run(cancel.clone()));
        (cancel, handle)
    }

    // ── Streaming ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_streamed_message_is_published() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
        assert!(inner.push_stream(msg("m1", 1)).await);
        assert!(wait_until(|| h.inbound() == vec!["m1"]).await);
        assert_eq!(rt.cursor().as_deref(), Some("m1"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_catches_up_on_messages_sent_during_drop() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
        inner.push_stream(msg("m1", 1)).await;
        assert!(wait_until(|| h.inbound() == vec!["m1"]).await);

        inner.add_history(msg("m2", 2));
        inner.break_stream(transient("reset")).await;

        assert!(wait_until(|| h.inbound() == vec!["m1", "m2"]).await);
        assert!(inner.poll_count() >= 1);
        assert!(wait_until(|| inner.is_streaming() && rt.state() == ConnectionState::Streaming).await);

        inner.push_stream(msg("m3", 3)).await;
        assert!(wait_until(|| h.inbound() == vec!["m1", "m2", "m3"]).await);
        assert_eq!(rt.cursor().as_deref(), Some("m3"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_catches_up_on_messages_sent_while_stopped() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        {
            let rt = h.transport(inner.clone());
            let (cancel, handle) = spawn(&rt);
            assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
            inner.push_stream(msg("m1", 1)).await;
            assert!(wait_until(|| h.inbound().len() == 1).await);
            cancel.cancel();
            handle.await.unwrap();
        }

        inner.close_stream();
        inner.add_history(msg("m2", 2));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| h.inbound() == vec!["m1", "m2"]).await);
        assert_eq!(rt.state(), ConnectionState::Streaming);
        assert!(!h.system_codes().contains(&"transport.degraded".to_string()));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_first_start_does_not_replay_history() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.add_history(msg("ancient", 1));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.inbound().is_empty());
        assert_eq!(inner.poll_count(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_state_watch_reports_changes() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        let rt = h.transport(inner);
        let mut watch = rt.subscribe_state();
        assert_eq!(*watch.borrow(), ConnectionState::Disconnected);

        let (cancel, handle) = spawn(&rt);
        tokio::time::timeout(Duration::from_secs(2), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*watch.borrow(), ConnectionState::Streaming);

        cancel.cancel();
        handle.await.unwrap();
    }

    // ── Degraded polling ───────────────────────────────────────

    #[tokio::test]
    async fn test_dead_stream_endpoint_falls_back_to_polling() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.refuse_connects(transient("connection refused"));
        inner.add_history(msg("m1", 1));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| matches!(rt.state(), ConnectionState::Degraded { .. })).await);
        assert!(wait_until(|| h.inbound() == vec!["m1"]).await);
        assert!(inner.connect_count() >= 3);
        assert!(h.system_codes().contains(&"transport.degraded".to_string()));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_outage_messages_delivered_once_in_send_order() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
        inner.push_stream(msg("m1", 1)).await;
        assert!(wait_until(|| h.inbound().len() == 1).await);

        // Stream dies and stays dead; traffic arrives out of order meanwhile.
        inner.refuse_connects(transient("stream endpoint down"));
        inner.add_history(msg("m3", 3));
        inner.add_history(msg("m2", 2));
        inner.break_stream(transient("socket reset")).await;

        assert!(wait_until(|| h.inbound().len() == 3).await);
        assert_eq!(h.inbound(), vec!["m1", "m2", "m3"]);

        // Further polls must not republish anything.
        let polls = inner.poll_count();
        assert!(wait_until(|| inner.poll_count() >= polls + 2).await);
        assert_eq!(h.inbound().len(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_to_streaming_after_good_polls() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.refuse_connects(transient("down"));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| matches!(rt.state(), ConnectionState::Degraded { .. })).await);
        inner.allow_connects();
        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
        assert!(inner.poll_count() >= 2);
        assert!(h.system_codes().contains(&"transport.recovered".to_string()));

        inner.push_stream(msg("live", 9)).await;
        assert!(wait_until(|| h.inbound() == vec!["live"]).await);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_failure_backs_off_then_counts_up() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.refuse_connects(transient("down"));
        inner.queue_poll_error(transient("HTTP 503"));
        inner.queue_poll_error(transient("HTTP 503"));
        let rt = h.transport(inner.clone());
        let mut watch = rt.subscribe_state();
        let (cancel, handle) = spawn(&rt);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let watcher = tokio::spawn(async move {
            while watch.changed().await.is_ok() {
                s.lock().push(*watch.borrow());
            }
        });

        assert!(wait_until(|| seen.lock().contains(&ConnectionState::Degraded { consecutive_failures: 2 })).await);
        assert!(seen.lock().contains(&ConnectionState::Reconnecting { consecutive_failures: 1 }));

        cancel.cancel();
        handle.await.unwrap();
        watcher.abort();
    }

    // ── Auth ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_auth_failure_halts_supervisor() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.queue_connect_error(TransportError::Auth("HTTP 401".into()));
        let rt = h.transport(inner.clone());
        let (_cancel, handle) = spawn(&rt);

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(rt.state(), ConnectionState::Disconnected);
        assert!(rt.is_halted());
        assert_eq!(inner.connect_count(), 1);

        let auth = h
            .system
            .lock()
            .iter()
            .find(|e| e.code() == Some("transport.auth_failed"))
            .cloned()
            .unwrap();
        assert_eq!(auth.severity, Severity::High);
    }

    // ── Persistence ────────────────────────────────────────────

    #[tokio::test]
    async fn test_seen_ids_survive_restart() {
        let h = Harness::new();
        {
            let inner = Arc::new(ScriptedTransport::new("relay"));
            let rt = h.transport(inner.clone());
            let (cancel, handle) = spawn(&rt);
            assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);
            inner.push_stream(msg("m1", 1)).await;
            inner.push_stream(msg("m2", 2)).await;
            assert!(wait_until(|| h.inbound().len() == 2).await);
            cancel.cancel();
            handle.await.unwrap();
        }
        assert!(h.cursor_path.exists());

        // A relay that lost our cursor replays everything it retains.
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.refuse_connects(transient("down"));
        inner.add_history(msg("m1", 1));
        inner.add_history(msg("m4", 4));
        let rt = h.transport(inner.clone());
        assert!(rt.has_seen("m1"));
        let (cancel, handle) = spawn(&rt);

        assert!(wait_until(|| h.inbound().len() == 3).await);
        assert_eq!(h.inbound(), vec!["m1", "m2", "m4"]);

        cancel.cancel();
        handle.await.unwrap();
    }

    // ── Outbound ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_send_reply_retries_transient_failures() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.queue_send_error(transient("HTTP 502"));
        inner.queue_send_error(transient("HTTP 502"));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);
        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);

        let receipt = rt.send_reply("conv-1", "hello").await.unwrap();
        assert!(receipt.message_id.is_some());
        assert_eq!(inner.sent(), vec![("conv-1".to_string(), "hello".to_string())]);
        assert_eq!(
            inner.typing_calls(),
            vec![("conv-1".to_string(), true), ("conv-1".to_string(), false)]
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_reply_exhaustion_surfaces_failure() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        for _ in 0..3 {
            inner.queue_send_error(transient("HTTP 503"));
        }
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);
        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);

        let err = rt.send_reply("conv-1", "hello").await.unwrap_err();
        assert!(!err.is_auth());
        assert!(inner.sent().is_empty());

        let failed = h
            .system
            .lock()
            .iter()
            .find(|e| e.code() == Some("transport.send_failed"))
            .cloned()
            .unwrap();
        assert_eq!(failed.severity, Severity::High);
        assert_eq!(failed.payload_str("conversation_id"), Some("conv-1"));
        // Typing is switched off even when sending fails.
        assert_eq!(inner.typing_calls().last(), Some(&("conv-1".to_string(), false)));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_fast() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        let rt = h.transport(inner.clone());

        assert!(rt.send_reply("conv-1", "hello").await.is_err());
        assert!(inner.sent().is_empty());
        assert!(h.system_codes().contains(&"transport.send_failed".to_string()));
    }

    #[tokio::test]
    async fn test_slow_typing_indicator_does_not_delay_reply() {
        let h = Harness::new();
        let inner = Arc::new(ScriptedTransport::new("relay"));
        inner.set_typing_delay(Duration::from_secs(10));
        let rt = h.transport(inner.clone());
        let (cancel, handle) = spawn(&rt);
        assert!(wait_until(|| rt.state() == ConnectionState::Streaming).await);

        let started = Instant::now();
        rt.send_reply("conv-1", "quick").await.unwrap();
        // Two typing calls, each capped at 50ms.
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(inner.sent().len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
