use std::sync::Arc;
use std::time::Instant;

use tracing::warn;
use uuid::Uuid;

use ax_cache::rate::RateControl;
use ax_cache::LiveCache;
use ax_core::config::Config;
use ax_core::crypto::EnvKey;
use ax_core::report_token::ReportTokenService;
use ax_harness::shutdown::ShutdownSignal;
use ax_queue::TaskPublisher;
use ax_store::StoreDb;

use crate::auth::AuthKeys;
use crate::dispatch::Dispatcher;
use crate::rooms::RoomHub;
use crate::scheduler::CronScheduler;

/// Shared application state for all HTTP/WS handlers.
pub struct ApiState {
    pub store: Arc<StoreDb>,
    pub cache: Arc<LiveCache>,
    pub queue: Arc<dyn TaskPublisher>,
    pub rooms: RoomHub,
    pub rate: RateControl,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: CronScheduler,
    pub auth_keys: AuthKeys,
    pub report_tokens: ReportTokenService,
    pub env_key: Option<EnvKey>,
    pub config: Config,
    /// Teardown coordinator; detached background work registers drain
    /// guards here so shutdown can wait for it.
    pub shutdown: ShutdownSignal,
    pub start_time: Instant,
}

impl ApiState {
    /// Wire the state graph together from the infrastructure handles.
    ///
    /// Missing secrets get per-process random values with a warning — fine
    /// for development, loud enough to catch in production.
    pub fn new(
        config: Config,
        store: Arc<StoreDb>,
        cache: Arc<LiveCache>,
        queue: Arc<dyn TaskPublisher>,
    ) -> Self {
        let rooms = RoomHub::new();

        let jwt_secret = if config.auth.jwt_secret.is_empty() {
            warn!("no JWT secret configured, generating an ephemeral one");
            Uuid::new_v4().to_string()
        } else {
            config.auth.jwt_secret.clone()
        };
        let auth_keys = AuthKeys::new(jwt_secret.as_bytes(), config.auth.jwt_ttl_secs);

        let report_secret = if config.security.report_token_secret.is_empty() {
            warn!("no report token secret configured, generating an ephemeral one");
            Uuid::new_v4().to_string()
        } else {
            config.security.report_token_secret.clone()
        };
        let report_tokens = ReportTokenService::new(report_secret.as_bytes());

        let env_key = if config.security.env_encryption_key.is_empty() {
            None
        } else {
            match EnvKey::from_base64(&config.security.env_encryption_key) {
                Ok(key) => Some(key),
                Err(err) => {
                    warn!(error = %err, "invalid env encryption key, secrets disabled");
                    None
                }
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            rooms.clone(),
            env_key.clone(),
            config.security.inject_env_vars.clone(),
        ));
        let scheduler = CronScheduler::new(Arc::clone(&dispatcher));
        let rate = RateControl::new(Arc::clone(&cache));

        Self {
            store,
            cache,
            queue,
            rooms,
            rate,
            dispatcher,
            scheduler,
            auth_keys,
            report_tokens,
            env_key,
            config,
            shutdown: ShutdownSignal::new(),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
