//! HTTP front-end application state for the novaadapt execution
//! orchestrator: a flat bag of `Arc`-wrapped subsystem handles the router
//! closes over via `axum::extract::State`, plus a per-key
//! `Arc<RwLock<HashMap<..>>>` rate limiter below.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use novaadapt_core::{
    ActionLog, Agent, AuditStore, AuditStoreConfig, ExecutionTransport, IdempotencyStore,
    IdempotencyStoreConfig, JobManager, NoopTransport, PlanExecutor, PlanStore, ServerConfig,
};
use novaadapt_observability::Metrics;
use novaadapt_providers::ModelRouter;

mod http;

pub use http::serve;

/// Number of fixed job-manager workers. Not exposed as an env var; the
/// queue capacity below is generous relative to it so `submit` rarely
/// blocks.
const JOB_WORKER_COUNT: usize = 4;
const JOB_QUEUE_CAPACITY: usize = 256;

/// Everything an HTTP handler needs.
/// Every store owns its own file and lock; this struct only
/// holds `Arc` handles so cloning it per-request is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub plans: Arc<PlanStore>,
    pub jobs: Arc<JobManager>,
    pub action_log: Arc<ActionLog>,
    pub idempotency: Arc<IdempotencyStore>,
    pub audit: Arc<AuditStore>,
    pub router: Arc<ModelRouter>,
    pub agent: Arc<Agent>,
    pub transport: Arc<dyn ExecutionTransport>,
    pub executor: Arc<PlanExecutor>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub async fn build(config: ServerConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;

        let audit_config = AuditStoreConfig {
            retention: config.audit_ttl,
            cleanup_interval: config.cleanup_interval,
            ..AuditStoreConfig::default()
        };
        let idempotency_config = IdempotencyStoreConfig {
            retention: config.idempotency_ttl,
            cleanup_interval: config.cleanup_interval,
        };

        let plans = PlanStore::open(config.plans_db_path()).await?;
        let jobs = JobManager::new(config.jobs_db_path(), JOB_WORKER_COUNT, JOB_QUEUE_CAPACITY).await?;
        let action_log = ActionLog::open(config.action_log_db_path()).await?;
        let idempotency =
            IdempotencyStore::open_with_config(config.idempotency_db_path(), idempotency_config).await?;
        let audit = AuditStore::open(config.audit_db_path(), audit_config).await?;

        let router = Arc::new(load_or_seed_router(&config)?);
        let action_log = Arc::new(action_log);
        let transport: Arc<dyn ExecutionTransport> = Arc::new(NoopTransport);
        let agent = Arc::new(Agent::new(router.clone(), transport.clone(), action_log.clone()));
        let plans = Arc::new(plans);
        let executor = Arc::new(PlanExecutor::new(plans.clone(), transport.clone(), action_log.clone()));

        Ok(AppState {
            config: Arc::new(config),
            plans,
            jobs: Arc::new(jobs),
            action_log,
            idempotency: Arc::new(idempotency),
            audit: Arc::new(audit),
            router,
            agent,
            transport,
            executor,
            metrics: Arc::new(Metrics::new()),
            rate_limiter: Arc::new(RateLimiter::new()),
            started_at: Utc::now(),
        })
    }
}

/// Loads the model router config from `models.json`, seeding a single
/// offline placeholder endpoint on first run so the engine still starts
/// and serves `/health` before an operator
/// has configured real model endpoints.
fn load_or_seed_router(config: &ServerConfig) -> anyhow::Result<ModelRouter> {
    let path = config.models_config_path();
    if !path.exists() {
        seed_default_models_file(&path)?;
    }
    ModelRouter::from_config_file(&path)
}

fn seed_default_models_file(path: &Path) -> anyhow::Result<()> {
    let seed = serde_json::json!({
        "default_model": "offline",
        "models": [{
            "name": "offline",
            "provider": "openai-compatible",
            "base_url": "http://127.0.0.1:0",
            "model": "offline-placeholder"
        }]
    });
    std::fs::write(path, serde_json::to_vec_pretty(&seed)?)?;
    Ok(())
}

/// Sliding-window rate limiter keyed by client: `requests_per_second`
/// sustained with a `burst` allowance, tracked as a per-key queue of
/// recent request timestamps.
pub struct RateLimiter {
    windows: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request at `key` is allowed under `rps`
    /// sustained with `burst` extra capacity. `rps == 0` disables limiting
    /// entirely.
    pub async fn allow(&self, key: &str, rps: u32, burst: u32) -> bool {
        if rps == 0 {
            return true;
        }
        let capacity = (rps + burst).max(1) as usize;
        let now = Instant::now();
        let mut guard = self.windows.write().await;
        let window = guard.entry(key.to_string()).or_insert_with(VecDeque::new);
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > Duration::from_secs(1) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= capacity {
            return false;
        }
        window.push_back(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
