//! Statistics Repository Module
//!
//! Domain layer over [`LockedDocumentStore`]. Owns the three shared documents
//! under `<base>/Stats/` and exposes the record/query/reset API used by the
//! analysis and packing workflows.
//!
//! Counter updates and history appends are separate atomic writes. A crash
//! between them leaves the counters and the history out of step; nothing here
//! tries to reconcile them.

use crate::config::StatsConfig;
use crate::document_store::LockedDocumentStore;
use crate::error::StatsRepositoryError;
use crate::logging::instance_id;
use crate::platform_lock::{FileLock, Fs2FileLock};
use crate::retry::RetryPolicy;
use crate::stats_types::{
    ClientId, ClientStats, GlobalStats, HistoryCounts, HistoryEntry, HistoryLog, Metadata,
    DEFAULT_HISTORY_CAP,
};
use crate::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const STATS_DIR_NAME: &str = "Stats";
pub const GLOBAL_STATS_FILE: &str = "global_stats.json";
pub const ANALYSIS_HISTORY_FILE: &str = "analysis_history.json";
pub const PACKING_HISTORY_FILE: &str = "packing_history.json";

/// All history entries recorded for one session, newest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionHistory {
    pub analysis: Vec<HistoryEntry>,
    pub packing: Vec<HistoryEntry>,
}

/// Builder for [`StatsRepository`] with injectable lock and retry policies
pub struct StatsRepositoryBuilder {
    base_path: PathBuf,
    lock: Arc<dyn FileLock>,
    read_retry: RetryPolicy,
    write_retry: RetryPolicy,
    history_cap: usize,
    backup_corrupt_files: bool,
    temp_file_max_age: Duration,
}

impl StatsRepositoryBuilder {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            lock: Arc::new(Fs2FileLock),
            read_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::default(),
            history_cap: DEFAULT_HISTORY_CAP,
            backup_corrupt_files: true,
            temp_file_max_age: Duration::from_secs(3600),
        }
    }

    pub fn file_lock(mut self, lock: Arc<dyn FileLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    pub fn backup_corrupt_files(mut self, enabled: bool) -> Self {
        self.backup_corrupt_files = enabled;
        self
    }

    pub fn temp_file_max_age(mut self, age: Duration) -> Self {
        self.temp_file_max_age = age;
        self
    }

    /// Create the `Stats/` directory, clear orphaned temp files and create any
    /// missing document with defaults
    pub fn build(self) -> std::result::Result<StatsRepository, StatsRepositoryError> {
        let stats_dir = self.base_path.join(STATS_DIR_NAME);
        std::fs::create_dir_all(&stats_dir).map_err(|e| {
            error!("Failed to create statistics directory: path={:?}, error={}", stats_dir, e);
            StatsRepositoryError::from(crate::StoreError::DocumentUnavailable(format!(
                "Failed to create {:?}: {}",
                stats_dir, e
            )))
        })?;

        if let Err(e) = LockedDocumentStore::cleanup_temp_files(&stats_dir, self.temp_file_max_age) {
            warn!("Temp file cleanup failed (non-fatal): dir={:?}, error={}", stats_dir, e);
        }

        let store = LockedDocumentStore::new()
            .with_lock(self.lock)
            .with_read_retry(self.read_retry)
            .with_write_retry(self.write_retry)
            .with_backup_corrupt_files(self.backup_corrupt_files);

        let repository = StatsRepository {
            stats_dir,
            store,
            history_cap: self.history_cap,
            instance_id: instance_id(),
            write_mutex: Mutex::new(()),
        };
        repository.initialize_documents();

        info!(
            "Statistics repository ready: dir={:?}, history_cap={}",
            repository.stats_dir, repository.history_cap
        );
        Ok(repository)
    }
}

/// Shared statistics repository
///
/// Cheap to share behind an `Arc`; all methods take `&self`. Writers in this
/// process queue on an internal mutex before competing for the file lock.
#[derive(Debug)]
pub struct StatsRepository {
    stats_dir: PathBuf,
    store: LockedDocumentStore,
    history_cap: usize,
    instance_id: String,
    write_mutex: Mutex<()>,
}

impl StatsRepository {
    /// Repository with default lock and retry policies under `base_path/Stats`
    pub fn new(base_path: impl Into<PathBuf>) -> std::result::Result<Self, StatsRepositoryError> {
        Self::builder(base_path).build()
    }

    pub fn builder(base_path: impl Into<PathBuf>) -> StatsRepositoryBuilder {
        StatsRepositoryBuilder::new(base_path)
    }

    pub fn from_config(config: &StatsConfig) -> std::result::Result<Self, StatsRepositoryError> {
        Self::builder(&config.base_path)
            .read_retry(RetryPolicy::from_settings(config.read_retry.clone()))
            .write_retry(RetryPolicy::from_settings(config.write_retry.clone()))
            .history_cap(config.history_cap)
            .backup_corrupt_files(config.backup_corrupt_files)
            .temp_file_max_age(config.temp_file_max_age)
            .build()
    }

    pub fn stats_dir(&self) -> &Path {
        &self.stats_dir
    }

    pub fn global_stats_path(&self) -> PathBuf {
        self.stats_dir.join(GLOBAL_STATS_FILE)
    }

    pub fn analysis_history_path(&self) -> PathBuf {
        self.stats_dir.join(ANALYSIS_HISTORY_FILE)
    }

    pub fn packing_history_path(&self) -> PathBuf {
        self.stats_dir.join(PACKING_HISTORY_FILE)
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    /// Record one analysis run
    ///
    /// Returns `false` instead of failing so that statistics never abort the
    /// analysis workflow; the cause is logged.
    pub fn record_analysis(
        &self,
        client_id: &str,
        session_id: &str,
        orders_count: u64,
        fulfillable_count: u64,
        metadata: Option<Metadata>,
    ) -> bool {
        let client = ClientId::new(client_id);
        if client.is_empty() {
            warn!("Ignoring analysis record without client id: session_id={}", session_id);
            return false;
        }

        let _guard = self.lock_writes();
        let counts = HistoryCounts::Analysis {
            orders_count,
            fulfillable_count,
        };
        let result = self
            .store
            .update(&self.global_stats_path(), GlobalStats::default, |stats: &mut GlobalStats| {
                stats.apply_analysis(&client, session_id, orders_count, Utc::now())
            })
            .and_then(|new_session| {
                if !new_session {
                    debug!("Session already counted: client_id={}, session_id={}", client, session_id);
                }
                let entry = self.new_entry(&client, session_id, counts.clone(), None, metadata.clone());
                self.append_history(&self.analysis_history_path(), entry)
            });

        match result {
            Ok(()) => {
                info!(
                    "Recorded analysis: client_id={}, session_id={}, orders={}, fulfillable={}",
                    client, session_id, orders_count, fulfillable_count
                );
                true
            }
            Err(e) => {
                error!(
                    "Failed to record analysis statistics: client_id={}, session_id={}, error={}",
                    client, session_id, e
                );
                false
            }
        }
    }

    /// Record one packing run
    ///
    /// Sessions are counted once per client whichever tool records them first,
    /// so analysing and then packing one session counts one session.
    pub fn record_packing(
        &self,
        client_id: &str,
        session_id: &str,
        orders_packed: u64,
        worker_id: Option<&str>,
        metadata: Option<Metadata>,
    ) -> bool {
        let client = ClientId::new(client_id);
        if client.is_empty() {
            warn!("Ignoring packing record without client id: session_id={}", session_id);
            return false;
        }

        let _guard = self.lock_writes();
        let counts = HistoryCounts::Packing { orders_packed };
        let worker = worker_id.map(str::to_string);

        let result = self
            .store
            .update(&self.global_stats_path(), GlobalStats::default, |stats: &mut GlobalStats| {
                stats.apply_packing(&client, session_id, orders_packed, Utc::now())
            })
            .and_then(|new_session| {
                if !new_session {
                    debug!("Session already counted: client_id={}, session_id={}", client, session_id);
                }
                let entry = self.new_entry(&client, session_id, counts.clone(), worker.clone(), metadata.clone());
                self.append_history(&self.packing_history_path(), entry)
            });

        match result {
            Ok(()) => {
                info!(
                    "Recorded packing: client_id={}, session_id={}, orders_packed={}, worker_id={:?}",
                    client, session_id, orders_packed, worker
                );
                true
            }
            Err(e) => {
                error!(
                    "Failed to record packing statistics: client_id={}, session_id={}, error={}",
                    client, session_id, e
                );
                false
            }
        }
    }

    pub fn get_global_stats(&self) -> std::result::Result<GlobalStats, StatsRepositoryError> {
        self.read_global().map_err(|e| self.query_error("global statistics", e))
    }

    pub fn get_client_stats(
        &self,
        client_id: &str,
    ) -> std::result::Result<Option<ClientStats>, StatsRepositoryError> {
        let client = ClientId::new(client_id);
        let stats = self.get_global_stats()?;
        Ok(stats.client(&client).copied())
    }

    /// Per-client counters for every client seen so far
    pub fn get_all_client_stats(
        &self,
    ) -> std::result::Result<BTreeMap<ClientId, ClientStats>, StatsRepositoryError> {
        Ok(self.get_global_stats()?.by_client)
    }

    /// Analysis entries, newest first
    pub fn get_analysis_history(
        &self,
        client_id: Option<&str>,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<HistoryEntry>, StatsRepositoryError> {
        self.query_history(&self.analysis_history_path(), client_id, limit)
    }

    /// Packing entries, newest first
    pub fn get_packing_history(
        &self,
        client_id: Option<&str>,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<HistoryEntry>, StatsRepositoryError> {
        self.query_history(&self.packing_history_path(), client_id, limit)
    }

    pub fn get_session_history(
        &self,
        session_id: &str,
    ) -> std::result::Result<SessionHistory, StatsRepositoryError> {
        let analysis = self
            .read_history(&self.analysis_history_path())
            .map_err(|e| self.query_error("analysis history", e))?;
        let packing = self
            .read_history(&self.packing_history_path())
            .map_err(|e| self.query_error("packing history", e))?;
        Ok(SessionHistory {
            analysis: analysis.session_entries(session_id),
            packing: packing.session_entries(session_id),
        })
    }

    /// Overwrite all three documents with defaults; does nothing unless `confirm`
    pub fn reset_stats(&self, confirm: bool) -> bool {
        if !confirm {
            info!("Statistics reset requested without confirmation, ignoring");
            return false;
        }

        let _guard = self.lock_writes();
        let result = self
            .store
            .write(&self.global_stats_path(), &GlobalStats::default())
            .and_then(|()| self.store.write(&self.analysis_history_path(), &HistoryLog::new()))
            .and_then(|()| self.store.write(&self.packing_history_path(), &HistoryLog::new()));

        match result {
            Ok(()) => {
                warn!("Statistics reset: dir={:?}, instance={}", self.stats_dir, self.instance_id);
                true
            }
            Err(e) => {
                error!("Failed to reset statistics: dir={:?}, error={}", self.stats_dir, e);
                false
            }
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn new_entry(
        &self,
        client: &ClientId,
        session_id: &str,
        counts: HistoryCounts,
        worker_id: Option<String>,
        metadata: Option<Metadata>,
    ) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            client_id: client.clone(),
            session_id: session_id.to_string(),
            counts,
            worker_id,
            recorded_by: self.instance_id.clone(),
            metadata: metadata.unwrap_or_default(),
        }
    }

    fn append_history(&self, path: &Path, entry: HistoryEntry) -> Result<()> {
        let cap = self.history_cap;
        let dropped = self
            .store
            .update(path, HistoryLog::new, |log: &mut HistoryLog| {
                log.append(entry.clone(), cap)
            })?;
        if dropped > 0 {
            debug!("History trimmed to cap: path={:?}, dropped={}, cap={}", path, dropped, cap);
        }
        Ok(())
    }

    fn read_global(&self) -> Result<GlobalStats> {
        let stats: GlobalStats = self.store.read(&self.global_stats_path(), GlobalStats::default)?;
        if !stats.is_consistent() {
            warn!(
                "Global statistics totals differ from per-client sums: total_analyzed={}, total_packed={}",
                stats.total_orders_analyzed, stats.total_orders_packed
            );
        }
        Ok(stats)
    }

    fn read_history(&self, path: &Path) -> Result<HistoryLog> {
        self.store.read(path, HistoryLog::new)
    }

    fn query_history(
        &self,
        path: &Path,
        client_id: Option<&str>,
        limit: Option<usize>,
    ) -> std::result::Result<Vec<HistoryEntry>, StatsRepositoryError> {
        let log = self
            .read_history(path)
            .map_err(|e| self.query_error("history", e))?;
        let client = client_id.map(ClientId::new);
        Ok(log.newest_first(client.as_ref(), limit))
    }

    fn query_error(&self, what: &str, err: crate::StoreError) -> StatsRepositoryError {
        error!("Failed to read {}: dir={:?}, error={}", what, self.stats_dir, err);
        StatsRepositoryError::from(err)
    }

    fn initialize_documents(&self) {
        let global = self.global_stats_path();
        if !global.exists() {
            if let Err(e) = self.store.update(&global, GlobalStats::default, |_: &mut GlobalStats| ()) {
                warn!("Could not create global statistics (will retry on first write): error={}", e);
            }
        }
        for path in [self.analysis_history_path(), self.packing_history_path()] {
            if !path.exists() {
                if let Err(e) = self.store.update(&path, HistoryLog::new, |_: &mut HistoryLog| ()) {
                    warn!("Could not create history log (will retry on first write): path={:?}, error={}", path, e);
                }
            }
        }
    }
}
