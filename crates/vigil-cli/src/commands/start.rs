use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_config::{ConfigLoader, TransportKind, VigilConfig};
use vigil_core::{Result, VigilError};
use vigil_runtime::{Daemon, chain_from_config, transport_from_config};

pub(super) async fn cmd_start(config: VigilConfig, config_loader: ConfigLoader, interactive: bool) -> Result<()> {
    let paths = config.state_paths();
    println!("🔭 Vigil v{}", env!("CARGO_PKG_VERSION"));
    println!("   State dir: {}", paths.root().display());
    println!("   Life stage: {}", config.runtime.life_stage);

    // The daemon follows the loader's live config for settings it can apply in place.
    let _watcher = match config_loader.watch() {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config watcher disabled");
            None
        }
    };

    let chain = chain_from_config(&config)?;
    if chain.is_empty() {
        eprintln!("⚠️  No inference providers configured. Replies will be canned.");
        eprintln!("   Add one to vigil.toml:");
        eprintln!("   [[providers]]");
        eprintln!("   name = \"local\"");
        eprintln!("   kind = \"openai\"");
        eprintln!("   base_url = \"http://localhost:11434/v1\"");
        eprintln!("   model = \"llama3\"");
        eprintln!();
    }

    let transport = transport_from_config(&config)?;
    match config.transport.kind {
        TransportKind::None => println!("   Transport: none (console only)"),
        TransportKind::Relay => println!(
            "   Transport: relay at {}",
            config.transport.relay_url.as_deref().unwrap_or("?")
        ),
    }
    println!();

    let mut daemon = Daemon::start(config, transport, chain)?.with_live_config(config_loader.shared());
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupt received");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "cannot listen for ctrl-c"),
            }
        });
    }

    // Console replies: jobs scheduled from the console report back here too.
    if let Some(mut console) = daemon.take_console() {
        tokio::spawn(async move {
            while let Some(reply) = console.recv().await {
                println!("\x1b[32mvigil>\x1b[0m {reply}");
                println!();
            }
        });
    }

    let input = daemon.local_input();
    let runner = tokio::spawn(daemon.run(cancel.clone()));

    if interactive {
        println!("   Type a message, '/help' for commands, 'exit' or Ctrl+C to quit");
        println!();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            eprint!("\x1b[36myou>\x1b[0m ");
            std::io::stderr().flush().ok();

            let line = tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                },
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if matches!(trimmed, "exit" | "quit" | "/exit") {
                println!("👋 Goodbye!");
                break;
            }
            if let Err(e) = input.submit(trimmed) {
                eprintln!("\x1b[31m❌ {e}\x1b[0m");
            }
        }
        cancel.cancel();
    }

    runner
        .await
        .map_err(|e| VigilError::Other(anyhow::anyhow!("daemon task failed: {e}")))?
}
