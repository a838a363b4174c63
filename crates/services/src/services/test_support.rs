//! Fakes and a pre-wired service stack for orchestration tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use db::{
    DBService,
    models::test_utils::{create_test_workspace_with, setup_test_pool},
    models::workspace::SubscriptionStatus,
};
use serde_json::json;
use uuid::Uuid;

use super::cache::MemoryKv;
use super::channels::{
    ChannelClient, ChannelError, ChannelPayload, ChannelReceipt, ChannelRegistry,
    CredentialError, CredentialProvider,
};
use super::events::{AlertError, AlertTransport, DbEventSink};
use super::killswitch::KillSwitch;
use super::locks::LockManager;
use super::modes::ModeService;
use super::plans::{PlanCatalog, PlanLimiter};
use super::publisher::{PublishConfig, PublishEngine};
use super::stability::{EnvSecretSource, StabilityConfig, StabilityGuard};

/// Channel client that records payloads and mints sequential external ids.
/// Queued errors are consumed one call at a time.
#[derive(Default)]
pub(crate) struct FakeChannelClient {
    published: Mutex<Vec<ChannelPayload>>,
    errors: Mutex<Vec<ChannelError>>,
    counter: AtomicU64,
}

impl FakeChannelClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push_error(&self, error: ChannelError) {
        self.errors.lock().unwrap().push(error);
    }

    pub(crate) fn published_payloads(&self) -> Vec<ChannelPayload> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelClient for FakeChannelClient {
    async fn publish(
        &self,
        _access_token: &str,
        payload: &ChannelPayload,
    ) -> Result<ChannelReceipt, ChannelError> {
        let queued = {
            let mut errors = self.errors.lock().unwrap();
            if errors.is_empty() { None } else { Some(errors.remove(0)) }
        };
        if let Some(error) = queued {
            return Err(error);
        }

        self.published.lock().unwrap().push(payload.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ChannelReceipt {
            external_id: format!("ext-{n}"),
            raw: json!({ "id": format!("ext-{n}") }),
        })
    }
}

pub(crate) struct StaticCredentials {
    token: Mutex<Option<String>>,
}

impl StaticCredentials {
    pub(crate) fn new(token: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(token.map(String::from)),
        })
    }

    pub(crate) fn set_token(&self, token: Option<&str>) {
        *self.token.lock().unwrap() = token.map(String::from);
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self, _workspace_id: Uuid) -> Result<Option<String>, CredentialError> {
        Ok(self.token.lock().unwrap().clone())
    }
}

/// Credential provider whose backend is down, for check-isolation tests.
pub(crate) struct BrokenCredentials;

#[async_trait]
impl CredentialProvider for BrokenCredentials {
    async fn access_token(&self, _workspace_id: Uuid) -> Result<Option<String>, CredentialError> {
        Err(CredentialError::Backend("credential store unreachable".into()))
    }
}

#[derive(Default)]
pub(crate) struct RecordingAlerts {
    sent: Mutex<Vec<(String, String)>>,
    healthy: AtomicBool,
}

impl RecordingAlerts {
    pub(crate) fn new() -> Arc<Self> {
        let alerts = Self::default();
        alerts.healthy.store(true, Ordering::SeqCst);
        Arc::new(alerts)
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertTransport for RecordingAlerts {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), AlertError> {
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }

    async fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

pub(crate) struct Harness {
    pub db: DBService,
    pub kv: Arc<MemoryKv>,
    pub workspace_id: Uuid,
    pub locks: LockManager,
    pub modes: ModeService,
    pub kill: KillSwitch,
    pub limiter: PlanLimiter,
    pub client: Arc<FakeChannelClient>,
    pub credentials: Arc<StaticCredentials>,
    pub engine: PublishEngine,
    pub events: Arc<DbEventSink>,
}

impl Harness {
    /// Guard over the harness stack with default thresholds, in-process
    /// secrets via the environment and no alert transport.
    pub(crate) fn stability_guard(&self) -> StabilityGuard {
        StabilityGuard::new(
            self.db.clone(),
            self.locks.clone(),
            self.modes.clone(),
            self.credentials.clone(),
            None,
            self.kill.clone(),
            self.events.clone(),
            Arc::new(EnvSecretSource),
            StabilityConfig::default(),
        )
    }
}

pub(crate) async fn harness() -> Harness {
    harness_with("free").await
}

pub(crate) async fn harness_with(plan: &str) -> Harness {
    let pool = setup_test_pool().await;
    let workspace_id = create_test_workspace_with(&pool, plan, SubscriptionStatus::Active).await;
    let db = DBService { pool };

    let kv = Arc::new(MemoryKv::new());
    let locks = LockManager::new(kv.clone(), "testns");
    let modes = ModeService::new(db.clone(), kv.clone(), "testns");
    let kill = KillSwitch::new(kv.clone(), "testns");
    let limiter = PlanLimiter::new(db.clone(), PlanCatalog::builtin());
    let client = FakeChannelClient::new();
    let credentials = StaticCredentials::new(Some("token-abc"));
    let channels = ChannelRegistry::new()
        .with_short_form(client.clone())
        .with_instagram(client.clone());
    let engine = PublishEngine::new(
        db.clone(),
        modes.clone(),
        limiter.clone(),
        channels,
        credentials.clone(),
        kill.clone(),
        PublishConfig::default(),
    );
    let events = Arc::new(DbEventSink::new(db.clone()));

    Harness {
        db,
        kv,
        workspace_id,
        locks,
        modes,
        kill,
        limiter,
        client,
        credentials,
        engine,
        events,
    }
}
