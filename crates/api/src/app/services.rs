//! Service wiring for the daemon.
//!
//! Without `database.url` every store lives in memory and the course
//! directory is seeded from `[[courses]]`. With it, all stores and the
//! course directory are PostgreSQL-backed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use lcbackup_infra::archive::{ArchiveService, CommandArchiveService, ManifestArchiveService};
use lcbackup_infra::blob::{BlobStore, BlobStoreError, FsBlobStore, InMemoryBlobStore};
use lcbackup_infra::catalog::{BackupCatalog, CatalogStore, InMemoryCatalogStore};
use lcbackup_infra::config::{AppConfig, ConfigError};
use lcbackup_infra::directory::{CourseDirectory, CourseDirectoryError, InMemoryCourseDirectory};
use lcbackup_infra::jobs::{
    ExclusivityLock, InMemoryExclusivityLock, InMemoryJobQueue, JobQueue, JobRunner, JobRunnerHandle, RunnerConfig,
    RunnerDeps, RunnerError, RunnerStats,
};
use lcbackup_infra::postgres::{
    self, PgContext, PostgresCatalogStore, PostgresCourseDirectory, PostgresExclusivityLock, PostgresJobQueue,
    PostgresProcessLinkStore, PostgresUploadRecordStore,
};
use lcbackup_infra::process::{InMemoryProcessLinkStore, ProcessLinkStore, ProcessStateBridge};
use lcbackup_infra::upload::{
    InMemoryUploadRecordStore, RemoteError, S3RemoteStore, S3RemoteStoreFactory, UploadRecordStore, UploadService,
};

/// Budget of a manual connectivity check.
pub const CONNECTION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Directory(#[from] CourseDirectoryError),
    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Everything the handlers need.
pub struct AppServices {
    deps: RunnerDeps,
    bridge: ProcessStateBridge,
    runner_config: RunnerConfig,
    runners: Mutex<Option<JobRunnerHandle>>,
}

impl AppServices {
    pub fn new(deps: RunnerDeps, links: Arc<dyn ProcessLinkStore>, runner_config: RunnerConfig) -> Self {
        let bridge = ProcessStateBridge::new(deps.queue.clone(), links, deps.upload.clone());
        Self {
            deps,
            bridge,
            runner_config,
            runners: Mutex::new(None),
        }
    }

    pub fn bridge(&self) -> &ProcessStateBridge {
        &self.bridge
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.deps.queue
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.deps.catalog
    }

    pub fn upload(&self) -> Option<&UploadService> {
        self.deps.upload.as_deref()
    }

    /// Start the runner pool. A second call is a no-op.
    pub fn start_runners(&self) -> Result<(), RunnerError> {
        let mut runners = self
            .runners
            .lock()
            .map_err(|_| RunnerError::Spawn("runner handle poisoned".to_string()))?;
        if runners.is_none() {
            let handle = JobRunner::spawn_pool(self.deps.clone(), self.runner_config.clone())?;
            info!(workers = handle.workers(), "job runners started");
            *runners = Some(handle);
        }
        Ok(())
    }

    /// Stop the pool, waiting for in-flight jobs.
    pub fn stop_runners(&self) {
        let handle = match self.runners.lock() {
            Ok(mut runners) => runners.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.shutdown();
            info!("job runners stopped");
        }
    }

    pub fn runner_stats(&self) -> Option<RunnerStats> {
        self.runners.lock().ok()?.as_ref().map(JobRunnerHandle::stats)
    }
}

/// Wire the daemon from `config`. Must run inside the Tokio runtime.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, ServicesError> {
    config.validate()?;
    let handle = Handle::current();

    let blobs: Arc<dyn BlobStore> = match &config.storage.blob_root {
        Some(root) => Arc::new(FsBlobStore::open(root)?),
        None => {
            warn!("storage.blob_root not set; archives are kept in memory");
            Arc::new(InMemoryBlobStore::new())
        }
    };

    let (stores, archives) = match config.database.url {
        Some(_) => {
            let pool = postgres::connect(&config.database).await?;
            postgres::migrate(&pool).await?;
            let cx = PgContext::new(pool, handle.clone());
            let stores = Stores {
                queue: Arc::new(PostgresJobQueue::new(cx.clone())),
                lock: Arc::new(PostgresExclusivityLock::new(cx.clone())),
                links: Arc::new(PostgresProcessLinkStore::new(cx.clone())),
                records: Arc::new(PostgresUploadRecordStore::new(cx.clone())),
                catalog: Arc::new(PostgresCatalogStore::new(cx.clone())),
                courses: Arc::new(PostgresCourseDirectory::new(cx, &config.database.course_table())?),
            };
            let archives: Arc<dyn ArchiveService> =
                Arc::new(CommandArchiveService::new(config.archive.command.clone(), blobs.clone()));
            info!("using postgres stores");
            (stores, archives)
        }
        None => {
            let directory = Arc::new(InMemoryCourseDirectory::with_courses(config.courses.iter().cloned()));
            let archives: Arc<dyn ArchiveService> = if config.archive.command.is_empty() {
                Arc::new(ManifestArchiveService::new(blobs.clone(), directory.clone()))
            } else {
                Arc::new(CommandArchiveService::new(config.archive.command.clone(), blobs.clone()))
            };
            let stores = Stores {
                queue: InMemoryJobQueue::arc(),
                lock: Arc::new(InMemoryExclusivityLock::new()),
                links: Arc::new(InMemoryProcessLinkStore::new()),
                records: Arc::new(InMemoryUploadRecordStore::new()),
                catalog: Arc::new(InMemoryCatalogStore::new()),
                courses: directory,
            };
            warn!(courses = config.courses.len(), "database.url not set; using in-memory stores");
            (stores, archives)
        }
    };

    let factory = Arc::new(S3RemoteStoreFactory::new(handle.clone()));
    let upload = match &config.upload {
        Some(settings) => {
            let remote = S3RemoteStore::from_settings(settings, handle)?;
            info!(bucket = %settings.bucket, region = %settings.region, "default remote store enabled");
            UploadService::new(Arc::new(remote), stores.records.clone(), settings.key_prefix.clone())
                .with_factory(factory)
        }
        None => {
            info!("no default remote store; only step instance remotes are used");
            UploadService::per_instance(factory, stores.records.clone())
        }
    };

    let catalog = Arc::new(BackupCatalog::new(
        stores.catalog,
        blobs.clone(),
        archives.clone(),
        config.archive.restore_timeout,
    ));
    let deps = RunnerDeps {
        queue: stores.queue,
        lock: stores.lock,
        courses: stores.courses,
        archives,
        blobs,
        catalog,
        upload: Some(Arc::new(upload)),
    };
    Ok(AppServices::new(deps, stores.links, config.runner.clone()))
}

struct Stores {
    queue: Arc<dyn JobQueue>,
    lock: Arc<dyn ExclusivityLock>,
    links: Arc<dyn ProcessLinkStore>,
    records: Arc<dyn UploadRecordStore>,
    catalog: Arc<dyn CatalogStore>,
    courses: Arc<dyn CourseDirectory>,
}
