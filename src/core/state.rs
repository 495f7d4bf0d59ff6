// src/core/state.rs

//! Process-wide state (spec §4.I): the single active config, workdir,
//! registered roles, locks, and worker handles, bundled into one explicitly
//! constructed `Applier` object passed to all public operations — per the
//! spec's design note against ad hoc global mutable state.

use crate::core::document::Doc;
use crate::core::errors::AppError;
use crate::core::membership::Membership;
use crate::core::pool::Pool;
use crate::core::roles::RoleRegistry;
use crate::core::sharding::{LoggingShardingService, ShardingService};
use crate::core::view::ReadOnlyView;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// One request to the single-threaded applier worker: the already-persisted
/// document to install, plus a channel to report the outcome back to the
/// caller of `apply()`.
pub struct ApplyRequest {
    pub doc: Doc,
    pub reply: oneshot::Sender<Result<(), AppError>>,
}

/// Handle to the running failover worker (spec §4.H), used to cancel it
/// when failover is turned off or the role enabling it is disabled.
pub struct FailoverHandle {
    pub cancel: tokio_util::sync::CancellationToken,
    pub join: JoinHandle<()>,
}

/// The process-wide applier object. One instance per running daemon; the
/// RPC endpoints all bind to this single instance (spec §9).
pub struct Applier {
    pub workdir: PathBuf,
    pub my_uuid: String,

    pub active: RwLock<Option<ReadOnlyView>>,
    pub roles: RoleRegistry,

    /// The `clusterwide` process-wide lock serializing outgoing 2PC rounds
    /// (spec §5). `true` while a round initiated by this instance is in
    /// flight; contention returns `Atomic` immediately, no queuing.
    pub clusterwide_lock: AtomicBool,

    /// Service registry: which role names (plus the two vshard pseudo-roles)
    /// currently have a live handler installed.
    pub service_registry: DashSet<String>,
    pub is_master: AtomicBool,

    pub membership: Arc<dyn Membership>,
    pub pool: Arc<dyn Pool>,
    pub storage_service: Arc<dyn ShardingService>,
    pub router_service: Arc<dyn ShardingService>,

    /// The single-slot channel feeding the applier worker (spec §4.E, §9).
    apply_tx: mpsc::Sender<ApplyRequest>,
    worker_alive: AtomicBool,

    pub failover: Mutex<Option<FailoverHandle>>,

    /// Set once after construction so internal workers (the failover
    /// worker) can obtain a strong `Arc<Applier>` of their own to spawn
    /// self-referential tasks.
    self_weak: std::sync::OnceLock<Weak<Applier>>,
}

impl Applier {
    pub fn new(
        workdir: PathBuf,
        my_uuid: String,
        membership: Arc<dyn Membership>,
        pool: Arc<dyn Pool>,
    ) -> Arc<Self> {
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let applier = Arc::new(Applier {
            workdir,
            my_uuid,
            active: RwLock::new(None),
            roles: RoleRegistry::new(),
            clusterwide_lock: AtomicBool::new(false),
            service_registry: DashSet::new(),
            is_master: AtomicBool::new(false),
            membership,
            pool,
            storage_service: Arc::new(LoggingShardingService::new("vshard-storage")),
            router_service: Arc::new(LoggingShardingService::new("vshard-router")),
            apply_tx,
            worker_alive: AtomicBool::new(true),
            failover: Mutex::new(None),
            self_weak: std::sync::OnceLock::new(),
        });
        let _ = applier.self_weak.set(Arc::downgrade(&applier));
        crate::core::applier::spawn_worker(applier.clone(), apply_rx);
        applier
    }

    /// Upgrades this instance's own weak self-reference, for workers that
    /// need to spawn tasks holding a strong `Arc<Applier>`.
    pub fn arc(&self) -> Arc<Applier> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .expect("Applier::arc called before construction completed")
    }

    /// Acquires the `clusterwide` lock, failing fast with `Atomic` on
    /// contention. No queuing, per spec §5.
    pub fn try_lock_clusterwide(&self) -> Result<ClusterwideGuard<'_>, AppError> {
        if self
            .clusterwide_lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Atomic);
        }
        Ok(ClusterwideGuard { applier: self })
    }

    pub fn get_readonly(&self, section: Option<&str>) -> Result<ReadOnlyView, AppError> {
        let active = self.active.read();
        let doc = active
            .as_ref()
            .ok_or_else(|| AppError::ConfigLoad("no active configuration loaded".into()))?
            .get()
            .clone();
        crate::core::view::get_readonly(&doc, section)
    }

    pub fn get_deepcopy(&self, section: Option<&str>) -> Result<crate::core::view::DeepCopyView, AppError> {
        let active = self.active.read();
        let doc = active
            .as_ref()
            .ok_or_else(|| AppError::ConfigLoad("no active configuration loaded".into()))?
            .get()
            .clone();
        crate::core::view::get_deepcopy(&doc, section)
    }

    pub fn active_doc(&self) -> Option<Doc> {
        self.active.read().as_ref().map(|v| v.get().clone())
    }

    /// Persists `doc` to disk then submits it to the applier worker,
    /// waiting for the outcome (spec §4.E, §9: "the public `apply()` waits
    /// for the worker to be ready, persists the config to disk, then
    /// submits").
    pub async fn apply(&self, doc: Doc) -> Result<(), AppError> {
        crate::core::store::save_active(&self.workdir, &doc)?;
        self.submit_to_worker(doc).await
    }

    /// Hands `doc` to the single-threaded applier worker and awaits the
    /// pipeline's outcome. The worker channel is the sole serialization point
    /// for `run_pipeline` (spec §4.E/§5): every caller that wants the pipeline
    /// run — `apply()` and a participant's `commit_2pc` alike — goes through
    /// here instead of invoking `run_pipeline` directly, so two concurrent
    /// commits on a participant can't race on `active`/`service_registry`.
    pub(crate) async fn submit_to_worker(&self, doc: Doc) -> Result<(), AppError> {
        if !self.worker_alive.load(Ordering::SeqCst) {
            return Err(AppError::ConfigApply("applier worker is dead".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyRequest { doc, reply: reply_tx })
            .await
            .map_err(|_| AppError::ConfigApply("applier worker is dead".into()))?;
        reply_rx
            .await
            .map_err(|_| AppError::ConfigApply("applier worker is dead".into()))?
    }

    pub fn mark_worker_dead(&self) {
        self.worker_alive.store(false, Ordering::SeqCst);
    }
}

/// RAII guard releasing the `clusterwide` lock on drop (covers all exits,
/// per spec §4.F step 2 "release on all exits").
pub struct ClusterwideGuard<'a> {
    applier: &'a Applier,
}

impl Drop for ClusterwideGuard<'_> {
    fn drop(&mut self) {
        self.applier.clusterwide_lock.store(false, Ordering::SeqCst);
    }
}

/// The peer RPC endpoints bind to this single process-wide instance (spec
/// §9). A participant's "prepare" is validate + exclusive-create
/// `config.prepare.yml`; "commit" loads the prepared file, promotes it over
/// `config.yml`, and runs the local applier; "abort" unlinks the prepare
/// file.
#[async_trait::async_trait]
impl crate::core::rpc::RpcHandler for Applier {
    async fn load_from_file(&self) -> Result<String, AppError> {
        let doc = self
            .active_doc()
            .ok_or_else(|| AppError::ConfigLoad("no active configuration loaded".into()))?;
        serde_yaml::to_string(&doc).map_err(|e| AppError::ConfigLoad(e.to_string()))
    }

    async fn prepare_2pc(&self, yaml: String) -> Result<(), AppError> {
        let new: Doc = serde_yaml::from_str(&yaml)?;
        let old = self.active_doc();
        crate::core::validator::validate(&new, old.as_ref(), &self.roles)?;
        crate::core::store::write_exclusive(&crate::core::store::prepare_path(&self.workdir), &new)
    }

    async fn commit_2pc(&self) -> Result<(), AppError> {
        let prepare = crate::core::store::prepare_path(&self.workdir);
        let active = crate::core::store::active_path(&self.workdir);
        let backup = crate::core::store::backup_path(&self.workdir);
        let doc = crate::core::store::load(&prepare)?;
        crate::core::store::promote(&prepare, &active, &backup)?;
        self.submit_to_worker(doc).await
    }

    async fn abort_2pc(&self) -> Result<(), AppError> {
        crate::core::store::unlink(&crate::core::store::prepare_path(&self.workdir))
    }

    async fn validate_config(&self, yaml: String) -> Result<(), AppError> {
        let new: Doc = serde_yaml::from_str(&yaml)?;
        let old = self.active_doc();
        crate::core::validator::validate(&new, old.as_ref(), &self.roles)
    }

    async fn apply_config(&self, yaml: String) -> Result<(), AppError> {
        let new: Doc = serde_yaml::from_str(&yaml)?;
        self.apply(new).await
    }

    async fn patch_clusterwide(&self, yaml: String) -> Result<(), AppError> {
        let patch: serde_yaml::Mapping = serde_yaml::from_str(&yaml)?;
        crate::core::coordinator::patch_clusterwide(self, &patch).await
    }
}
