use chrono::NaiveDateTime;

use vigil_config::VigilConfig;
use vigil_core::{EventBus, Result};
use vigil_runtime::Scheduler;

use super::{JobsAction, ensure_stopped};

pub(super) async fn cmd_jobs(config: &VigilConfig, action: JobsAction) -> Result<()> {
    let paths = config.state_paths();
    match action {
        JobsAction::List => {
            let scheduler = Scheduler::load(paths.jobs_file(), EventBus::in_memory())?;
            let jobs = scheduler.list().await;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
                return Ok(());
            }
            println!("\x1b[1mScheduled jobs\x1b[0m ({})", jobs.len());
            println!("{}", "-".repeat(80));
            for job in &jobs {
                println!(
                    "{}  \x1b[36m{}\x1b[0m  next {}  last {}",
                    job.short_id(),
                    job.schedule.recurrence,
                    format_run(job.next_run_at),
                    format_run(job.last_run_at)
                );
                println!("   {}", job.action());
            }
            Ok(())
        }
        JobsAction::Add { phrase } => {
            ensure_stopped(&paths)?;
            paths.ensure_dirs()?;
            let scheduler = Scheduler::load(paths.jobs_file(), EventBus::in_memory())?;
            let job = scheduler.add(&phrase.join(" "), None).await?;
            println!(
                "✅ Scheduled {} ({}): {}",
                job.short_id(),
                job.schedule.recurrence,
                job.action()
            );
            println!("   Next run: {}", format_run(job.next_run_at));
            match config.runtime.operator_target() {
                Some(target) => println!("   Results go to {}", target.session_key()),
                None => println!("   💡 No runtime.operator_conversation set; results will only be logged."),
            }
            Ok(())
        }
        JobsAction::Remove { id } => {
            ensure_stopped(&paths)?;
            let scheduler = Scheduler::load(paths.jobs_file(), EventBus::in_memory())?;
            let job = scheduler.remove(&id).await?;
            println!("✅ Removed {}: {}", job.short_id(), job.action());
            Ok(())
        }
    }
}

fn format_run(at: Option<NaiveDateTime>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}
