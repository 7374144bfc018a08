use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use vigil_config::VigilConfig;
use vigil_core::{AuditLog, EventBus, OperatorIdentity, Result, StatePaths};

use crate::affect::AffectState;
use crate::identity;
use crate::scheduler::Scheduler;
use crate::session::SessionStore;

/// Everything the runtime's components share, loaded from the state
/// directory.
pub struct RuntimeContext {
    pub config: VigilConfig,
    pub paths: StatePaths,
    pub bus: EventBus,
    pub sessions: Arc<SessionStore>,
    pub scheduler: Arc<Scheduler>,
    pub affect: Arc<Mutex<AffectState>>,
    pub identity: Option<OperatorIdentity>,
    pub started_at: DateTime<Utc>,
}

impl RuntimeContext {
    /// Create the state layout, then load identity, affect, and jobs.
    pub fn init(config: VigilConfig) -> Result<Self> {
        let paths = config.state_paths();
        paths.ensure_dirs()?;

        let bus = EventBus::new(AuditLog::new(paths.audit_dir()));
        let identity = identity::load(&paths).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring unreadable identity file");
            None
        });
        if identity.is_none() {
            warn!("no operator imprinted; run `vigil imprint <id>`");
        }
        let affect = AffectState::load(&paths.affect_file(), &config.affect, config.runtime.life_stage)?;
        let scheduler = Scheduler::load(paths.jobs_file(), bus.clone())?;

        info!(
            state_dir = %paths.root().display(),
            life_stage = %config.runtime.life_stage,
            operator = identity.as_ref().map(|i| i.operator_id.as_str()).unwrap_or("-"),
            "runtime context ready"
        );

        Ok(Self {
            sessions: Arc::new(SessionStore::new(paths.clone())),
            scheduler: Arc::new(scheduler),
            affect: Arc::new(Mutex::new(affect)),
            config,
            paths,
            bus,
            identity,
            started_at: Utc::now(),
        })
    }

    /// Persist the final affect snapshot.
    pub fn shutdown(&self) -> Result<()> {
        self.affect.lock().persist(&self.paths.affect_file())?;
        info!("runtime context persisted");
        Ok(())
    }
}
