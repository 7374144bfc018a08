#[cfg(test)]
mod tests {
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;

    use vigil_channels::{ConnectionState, ScriptedTransport, Transport};
    use vigil_config::{ConfigLoader, VigilConfig};
    use vigil_core::{StatePaths, VigilError};
    use vigil_llm::{MockProvider, ProviderChain};
    use vigil_runtime::{AffectChannel, Daemon, RuntimeContext, StateLock, read_status};

    fn config(dir: &TempDir) -> VigilConfig {
        let mut config = VigilConfig::default();
        config.runtime.state_dir = Some(dir.path().to_path_buf());
        config.runtime.heartbeat_secs = 1;
        config
    }

    fn chain(reply: &str) -> ProviderChain {
        let mut chain = ProviderChain::default();
        chain.push(Arc::new(MockProvider::new("mock").with_response(reply)));
        chain
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    struct Running {
        ctx: Arc<RuntimeContext>,
        cancel: CancellationToken,
        handle: JoinHandle<vigil_core::Result<()>>,
    }

    impl Running {
        async fn stop(self) {
            self.cancel.cancel();
            self.handle.await.unwrap().unwrap();
        }
    }

    fn spawn(daemon: Daemon) -> Running {
        let ctx = Arc::clone(daemon.context());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(cancel.clone()));
        Running { ctx, cancel, handle }
    }

    // ── Single instance ────────────────────────────────────────

    #[tokio::test]
    async fn test_second_daemon_on_same_state_dir_is_refused() {
        let dir = TempDir::new().unwrap();
        let _first = Daemon::start(config(&dir), None, ProviderChain::default()).unwrap();

        let second = Daemon::start(config(&dir), None, ProviderChain::default());
        assert!(matches!(second, Err(VigilError::LockHeld { .. })));
        assert!(StateLock::is_held(&StatePaths::with_root(dir.path())));
    }

    #[tokio::test]
    async fn test_lock_released_after_stop() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::start(config(&dir), None, ProviderChain::default()).unwrap();
        spawn(daemon).stop().await;

        assert!(!StateLock::is_held(&StatePaths::with_root(dir.path())));
        assert!(Daemon::start(config(&dir), None, ProviderChain::default()).is_ok());
    }

    // ── End to end ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_console_status_reports_streaming_transport() {
        let dir = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedTransport::new("relay"));
        let mut daemon = Daemon::start(
            config(&dir),
            Some(scripted.clone() as Arc<dyn Transport>),
            ProviderChain::default(),
        )
        .unwrap();
        let mut console = daemon.take_console().unwrap();
        let input = daemon.local_input();
        let mut state = daemon.transport().unwrap().subscribe_state();
        let running = spawn(daemon);

        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Streaming))
            .await
            .unwrap()
            .unwrap();

        input.submit("status").unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), console.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.contains("transport: streaming"), "{reply}");
        assert!(running.ctx.sessions.keys().unwrap().is_empty());

        running.stop().await;
    }

    #[tokio::test]
    async fn test_transport_message_is_answered_and_remembered() {
        let dir = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedTransport::new("relay"));
        let daemon = Daemon::start(
            config(&dir),
            Some(scripted.clone() as Arc<dyn Transport>),
            chain("hello alice"),
        )
        .unwrap();
        let running = spawn(daemon);

        assert!(wait_until(|| scripted.is_streaming()).await);
        assert!(
            scripted
                .push_stream(ScriptedTransport::message("m1", "c1", "alice", "hi there", Utc::now()))
                .await
        );

        assert!(wait_until(|| !scripted.sent().is_empty()).await);
        assert_eq!(scripted.sent()[0], ("c1".to_string(), "hello alice".to_string()));

        let transcript = running.ctx.sessions.transcript("relay:c1").unwrap();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].text, "hi there");

        running.stop().await;
    }

    #[tokio::test]
    async fn test_console_chat_without_transport() {
        let dir = TempDir::new().unwrap();
        let mut daemon = Daemon::start(config(&dir), None, chain("pong")).unwrap();
        let mut console = daemon.take_console().unwrap();
        let input = daemon.local_input();
        let running = spawn(daemon);

        input.submit("ping").unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), console.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, "pong");
        assert_eq!(running.ctx.sessions.keys().unwrap(), vec!["local:console".to_string()]);

        running.stop().await;
    }

    // ── Status & shutdown ──────────────────────────────────────

    #[tokio::test]
    async fn test_status_written_while_running_and_after_stop() {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::with_root(dir.path());
        let daemon = Daemon::start(config(&dir), None, chain("unused")).unwrap();
        let input = daemon.local_input();
        let running = spawn(daemon);

        assert!(wait_until(|| matches!(read_status(&paths), Ok(Some(s)) if s.running)).await);
        let status = read_status(&paths).unwrap().unwrap();
        assert_eq!(status.pid, std::process::id());
        assert_eq!(status.providers, vec!["mock".to_string()]);
        assert!(status.transport.is_none());

        running.stop().await;

        let status = read_status(&paths).unwrap().unwrap();
        assert!(!status.running);
        assert!(paths.affect_file().exists());
        assert!(input.submit("anyone there?").is_err());
    }

    #[tokio::test]
    async fn test_jobs_survive_restart() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::start(config(&dir), None, ProviderChain::default()).unwrap();
        daemon
            .context()
            .scheduler
            .add("every day at 9am check the backups", None)
            .await
            .unwrap();
        spawn(daemon).stop().await;

        let daemon = Daemon::start(config(&dir), None, ProviderChain::default()).unwrap();
        assert_eq!(daemon.context().scheduler.len().await, 1);
    }

    // ── Reload ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reloaded_affect_settings_reach_the_heartbeat() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("vigil.toml");
        let loader = ConfigLoader::from_config(config(&dir), config_path.clone());
        let daemon = Daemon::start(config(&dir), None, ProviderChain::default())
            .unwrap()
            .with_live_config(loader.shared());
        let running = spawn(daemon);

        std::fs::write(
            &config_path,
            format!(
                "[runtime]\nstate_dir = {:?}\nheartbeat_secs = 1\n\n[affect]\ndecay_rate = 1.0\n\n[affect.baseline]\ndrive = 0.9\n",
                dir.path().display().to_string()
            ),
        )
        .unwrap();
        loader.reload().unwrap();

        let ctx = Arc::clone(&running.ctx);
        assert!(
            wait_until(|| {
                let affect = ctx.affect.lock();
                (affect.baseline(AffectChannel::Drive) - 0.9).abs() < 1e-9
            })
            .await
        );
        running.stop().await;
    }
}
