//! Undo-logged groups of file mutations.
//!
//! Mutations are applied eagerly by the caller (or by [`TransactionScope`]);
//! the log only keeps the pre-image of each path and the order of operations
//! so the group can be undone if the unit of work fails.

use core::result::Result as StdResult;
use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use maestro_core::sync::IgnoreLock as _;
use maestro_core::{
    AgentId, FileOperationKind, OrchestrationError, Result, TransactionConfig, TransactionId,
    TransactionStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::BoundedCache;
use crate::events::{EngineEvent, EventChannel};
use crate::isolation::LockVerifier;
use crate::workspace::WorkspaceFs;

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    /// What happened to the file
    pub kind: FileOperationKind,
    /// Path as given to the workspace file system
    pub path: PathBuf,
    /// Free-form description of the action
    pub action: String,
    /// When the mutation was applied
    pub timestamp: SystemTime,
}

impl FileOperation {
    /// Operation stamped with the current time.
    pub fn now(kind: FileOperationKind, path: impl Into<PathBuf>, action: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            action: action.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// A path-scoped problem noticed during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssue {
    /// Affected path
    pub path: PathBuf,
    /// Description
    pub message: String,
}

/// Outcome of a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    /// Paths restored to their pre-image
    pub restored: usize,
    /// Created paths removed
    pub deleted: usize,
    /// Per-file failures; the remaining files were still processed
    pub errors: Vec<FileIssue>,
    /// Non-fatal observations (external locks, concurrent edits)
    pub warnings: Vec<FileIssue>,
    /// Status after the call
    pub status: TransactionStatus,
    /// The transaction had already finished rolling back; nothing was done
    pub already_finished: bool,
}

struct Backup {
    content: Vec<u8>,
    captured_at: SystemTime,
}

struct TransactionRecord {
    owner: Option<AgentId>,
    status: TransactionStatus,
    files: Vec<PathBuf>,
    backups: HashMap<PathBuf, Backup>,
    operations: Vec<FileOperation>,
}

impl TransactionRecord {
    fn touches(&self, path: &Path) -> bool {
        self.files.iter().any(|file| file == path)
    }

    fn touch(&mut self, path: &Path) {
        if !self.touches(path) {
            self.files.push(path.to_path_buf());
        }
    }
}

/// Rollback input, taken out of the record so no lock is held during I/O.
struct RollbackPlan {
    owner: Option<AgentId>,
    files: Vec<PathBuf>,
    backups: HashMap<PathBuf, Backup>,
    operations: Vec<FileOperation>,
}

/// Tracks transactions from `begin` until their retention period ends.
pub struct TransactionLog {
    active: Mutex<HashMap<TransactionId, TransactionRecord>>,
    finished: Mutex<BoundedCache<TransactionId, TransactionStatus>>,
    fs: Arc<dyn WorkspaceFs>,
    lock_verifier: Option<Arc<dyn LockVerifier>>,
    events: EventChannel,
}

impl TransactionLog {
    /// Create a log that restores files through `fs`.
    pub fn new(fs: Arc<dyn WorkspaceFs>, config: &TransactionConfig, events: EventChannel) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(BoundedCache::new(config.max_retained, config.gc_grace())),
            fs,
            lock_verifier: None,
            events,
        }
    }

    /// Consult `verifier` during rollback to warn about external lock holders.
    #[must_use]
    pub fn with_lock_verifier(mut self, verifier: Arc<dyn LockVerifier>) -> Self {
        self.lock_verifier = Some(verifier);
        self
    }

    /// Start a transaction, generating an id if none is given.
    ///
    /// # Errors
    /// Returns [`OrchestrationError::TransactionConflict`] if the id is already
    /// active or still retained.
    pub fn begin(&self, id: Option<TransactionId>) -> Result<TransactionId> {
        self.start(None, id)
    }

    /// Start a transaction on behalf of `owner`. Locks held by the owner are
    /// not reported during rollback.
    ///
    /// # Errors
    /// Returns [`OrchestrationError::TransactionConflict`] if the id is already
    /// active or still retained.
    pub fn begin_owned(&self, owner: &AgentId, id: Option<TransactionId>) -> Result<TransactionId> {
        self.start(Some(owner.clone()), id)
    }

    fn start(&self, owner: Option<AgentId>, id: Option<TransactionId>) -> Result<TransactionId> {
        let id = id.unwrap_or_else(TransactionId::generate);
        if self.finished.lock_ignore_poison().contains_key(&id) {
            return Err(OrchestrationError::TransactionConflict(id));
        }

        let mut active = self.active.lock_ignore_poison();
        if active.contains_key(&id) {
            return Err(OrchestrationError::TransactionConflict(id));
        }
        active.insert(
            id.clone(),
            TransactionRecord {
                owner,
                status: TransactionStatus::Active,
                files: Vec::new(),
                backups: HashMap::new(),
                operations: Vec::new(),
            },
        );
        drop(active);

        debug!("Transaction {} started", id);
        Ok(id)
    }

    /// Append an already-applied mutation to the operation log.
    ///
    /// # Errors
    /// Returns an error if the transaction is unknown or not active.
    pub fn record_operation(&self, id: &TransactionId, operation: FileOperation) -> Result<()> {
        let mut active = self.active.lock_ignore_poison();
        let record = Self::active_record(&mut active, id, "record")?;
        record.touch(&operation.path);
        record.operations.push(operation);
        Ok(())
    }

    /// Capture the pre-image of `path`.
    ///
    /// Only the first touch counts: once a path has a backup or a recorded
    /// operation in this transaction, later calls are ignored. Returns
    /// whether the content was stored.
    ///
    /// # Errors
    /// Returns an error if the transaction is unknown or not active.
    pub fn store_backup(&self, id: &TransactionId, path: &Path, content: Vec<u8>) -> Result<bool> {
        let mut active = self.active.lock_ignore_poison();
        let record = Self::active_record(&mut active, id, "back up")?;
        if record.touches(path) {
            return Ok(false);
        }
        record.touch(path);
        record.backups.insert(
            path.to_path_buf(),
            Backup {
                content,
                captured_at: SystemTime::now(),
            },
        );
        Ok(true)
    }

    /// Commit: discard backups and retain the record for observation.
    /// No file system work is done.
    ///
    /// # Errors
    /// Returns an error if the transaction is unknown or not active.
    pub fn commit(&self, id: &TransactionId) -> Result<()> {
        let mut active = self.active.lock_ignore_poison();
        let record = match active.get_mut(id) {
            Some(record) => record,
            None => {
                drop(active);
                return Err(self.missing(id, "commit"));
            }
        };
        if record.status != TransactionStatus::Active {
            return Err(OrchestrationError::InvalidTransactionState {
                id: id.clone(),
                status: record.status,
                operation: "commit",
            });
        }
        record.status = TransactionStatus::Committing;
        let files = record.files.len();
        active.remove(id);
        drop(active);

        self.retain(id, TransactionStatus::Committed);
        info!("Transaction {} committed ({} files)", id, files);
        self.events.send(EngineEvent::TransactionCommitted {
            transaction_id: id.clone(),
            files,
        });
        Ok(())
    }

    /// Undo the transaction.
    ///
    /// Every backed-up path gets its pre-image back; every path whose first
    /// operation was a create is removed. Per-file failures are collected and
    /// do not stop the remaining files. The transaction ends `RollbackFailed`
    /// if there were failures and nothing could be restored or removed,
    /// `RolledBack` otherwise. Calling it again after it finished is a no-op.
    ///
    /// # Errors
    /// Returns an error if the transaction is unknown or already committed.
    pub async fn rollback(&self, id: &TransactionId) -> Result<RollbackReport> {
        let plan = match self.begin_rollback(id)? {
            Ok(plan) => plan,
            Err(status) => {
                debug!("Transaction {} already {:?}, rollback skipped", id, status);
                return Ok(RollbackReport {
                    restored: 0,
                    deleted: 0,
                    errors: Vec::new(),
                    warnings: Vec::new(),
                    status,
                    already_finished: true,
                });
            }
        };

        info!(
            "Rolling back transaction {} ({} files, {} backups)",
            id,
            plan.files.len(),
            plan.backups.len()
        );
        let mut report = RollbackReport {
            restored: 0,
            deleted: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            status: TransactionStatus::RollingBack,
            already_finished: false,
        };

        let first_kinds = first_operation_kinds(&plan.operations);
        for path in &plan.files {
            if let Some(backup) = plan.backups.get(path) {
                self.check_lock(path, plan.owner.as_ref(), &mut report).await;
                match self.fs.write(path, &backup.content).await {
                    Ok(()) => report.restored += 1,
                    Err(error) => {
                        warn!("Failed to restore {}: {}", path.display(), error);
                        report.errors.push(FileIssue {
                            path: path.clone(),
                            message: error.to_string(),
                        });
                    }
                }
                continue;
            }

            if first_kinds.get(path.as_path()) != Some(&FileOperationKind::Create) {
                continue;
            }
            self.check_lock(path, plan.owner.as_ref(), &mut report).await;
            self.check_external_edit(path, &plan.operations, &mut report)
                .await;
            match self.fs.remove(path).await {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!("Failed to remove {}: {}", path.display(), error);
                    report.errors.push(FileIssue {
                        path: path.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }

        report.status = if !report.errors.is_empty() && report.restored + report.deleted == 0 {
            TransactionStatus::RollbackFailed
        } else {
            TransactionStatus::RolledBack
        };

        self.active.lock_ignore_poison().remove(id);
        self.retain(id, report.status);

        for warning in &report.warnings {
            self.events.send(EngineEvent::RollbackWarning {
                transaction_id: id.clone(),
                path: warning.path.clone(),
                message: warning.message.clone(),
            });
        }
        info!(
            "Transaction {} finished rollback as {:?}: {} restored, {} deleted, {} errors",
            id,
            report.status,
            report.restored,
            report.deleted,
            report.errors.len()
        );
        self.events.send(EngineEvent::TransactionRolledBack {
            transaction_id: id.clone(),
            status: report.status,
            errors: report.errors.len(),
        });
        Ok(report)
    }

    /// Move an active transaction to `RollingBack` and take its undo data.
    /// The inner `Err` carries the status of a transaction that needs no work.
    fn begin_rollback(
        &self,
        id: &TransactionId,
    ) -> Result<StdResult<RollbackPlan, TransactionStatus>> {
        let mut active = self.active.lock_ignore_poison();
        let Some(record) = active.get_mut(id) else {
            drop(active);
            return match self.status(id) {
                Some(TransactionStatus::Committed) => {
                    Err(OrchestrationError::InvalidTransactionState {
                        id: id.clone(),
                        status: TransactionStatus::Committed,
                        operation: "roll back",
                    })
                }
                Some(status) if status.is_terminal() => Ok(Err(status)),
                Some(status) => Err(OrchestrationError::InvalidTransactionState {
                    id: id.clone(),
                    status,
                    operation: "roll back",
                }),
                None => Err(OrchestrationError::TransactionNotFound(id.clone())),
            };
        };

        match record.status {
            TransactionStatus::Active => {}
            TransactionStatus::RollingBack => return Ok(Err(TransactionStatus::RollingBack)),
            status => {
                return Err(OrchestrationError::InvalidTransactionState {
                    id: id.clone(),
                    status,
                    operation: "roll back",
                });
            }
        }

        record.status = TransactionStatus::RollingBack;
        Ok(Ok(RollbackPlan {
            owner: record.owner.clone(),
            files: record.files.clone(),
            backups: mem::take(&mut record.backups),
            operations: mem::take(&mut record.operations),
        }))
    }

    async fn check_lock(&self, path: &Path, owner: Option<&AgentId>, report: &mut RollbackReport) {
        let Some(verifier) = &self.lock_verifier else {
            return;
        };
        let Some(info) = verifier.lock_info(path).await else {
            return;
        };
        if owner == Some(&info.holder) || !verifier.verify_lock(&info.lock_id, &info.holder).await {
            return;
        }

        let message = format!("locked by {} during rollback", info.holder);
        warn!("{}: {}", path.display(), message);
        report.warnings.push(FileIssue {
            path: path.to_path_buf(),
            message,
        });
    }

    async fn check_external_edit(
        &self,
        path: &Path,
        operations: &[FileOperation],
        report: &mut RollbackReport,
    ) {
        let Some(last_recorded) = operations
            .iter()
            .filter(|operation| operation.path == path)
            .map(|operation| operation.timestamp)
            .max()
        else {
            return;
        };

        match self.fs.modified(path).await {
            Ok(Some(modified)) if modified > last_recorded => {
                let message =
                    "modified after it was recorded; it may have been edited externally".to_owned();
                warn!("{}: {}", path.display(), message);
                report.warnings.push(FileIssue {
                    path: path.to_path_buf(),
                    message,
                });
            }
            Ok(_) => {}
            Err(error) => debug!("Could not stat {}: {}", path.display(), error),
        }
    }

    /// Current status, for active and recently finished transactions.
    pub fn status(&self, id: &TransactionId) -> Option<TransactionStatus> {
        if let Some(record) = self.active.lock_ignore_poison().get(id) {
            return Some(record.status);
        }
        self.finished.lock_ignore_poison().get(id).copied()
    }

    /// Number of transactions that have not finished.
    pub fn active_count(&self) -> usize {
        self.active.lock_ignore_poison().len()
    }

    /// Number of finished transactions still within their retention period.
    pub fn retained_count(&self) -> usize {
        let mut finished = self.finished.lock_ignore_poison();
        finished.purge_expired();
        finished.len()
    }

    /// Paths touched by an active transaction, in first-touch order.
    pub fn touched_files(&self, id: &TransactionId) -> Option<Vec<PathBuf>> {
        self.active
            .lock_ignore_poison()
            .get(id)
            .map(|record| record.files.clone())
    }

    /// When the pre-image of `path` was captured, if it was.
    pub fn backup_time(&self, id: &TransactionId, path: &Path) -> Option<SystemTime> {
        self.active
            .lock_ignore_poison()
            .get(id)
            .and_then(|record| record.backups.get(path))
            .map(|backup| backup.captured_at)
    }

    /// Open a [`TransactionScope`] that backs up, writes, and records in one step.
    ///
    /// # Errors
    /// Returns an error if the id is already in use.
    pub fn scope(&self, owner: Option<&AgentId>, id: Option<TransactionId>) -> Result<TransactionScope<'_>> {
        let id = self.start(owner.cloned(), id)?;
        Ok(TransactionScope {
            log: self,
            id,
            finished: false,
        })
    }

    fn retain(&self, id: &TransactionId, status: TransactionStatus) {
        if let Some((evicted, _)) = self.finished.lock_ignore_poison().insert(id.clone(), status) {
            debug!("Dropped retained transaction {} to make room", evicted);
        }
    }

    fn active_record<'map>(
        active: &'map mut HashMap<TransactionId, TransactionRecord>,
        id: &TransactionId,
        operation: &'static str,
    ) -> Result<&'map mut TransactionRecord> {
        let record = active
            .get_mut(id)
            .ok_or_else(|| OrchestrationError::TransactionNotFound(id.clone()))?;
        if record.status == TransactionStatus::Active {
            Ok(record)
        } else {
            Err(OrchestrationError::InvalidTransactionState {
                id: id.clone(),
                status: record.status,
                operation,
            })
        }
    }

    fn missing(&self, id: &TransactionId, operation: &'static str) -> OrchestrationError {
        match self.status(id) {
            Some(status) => OrchestrationError::InvalidTransactionState {
                id: id.clone(),
                status,
                operation,
            },
            None => OrchestrationError::TransactionNotFound(id.clone()),
        }
    }
}

fn first_operation_kinds(operations: &[FileOperation]) -> HashMap<&Path, FileOperationKind> {
    let mut kinds = HashMap::new();
    for operation in operations {
        kinds
            .entry(operation.path.as_path())
            .or_insert(operation.kind);
    }
    kinds
}

/// A transaction that performs its own file mutations.
///
/// Each mutation captures the pre-image on first touch, applies the change
/// through the log's file system, then records it. Finish with
/// [`commit`](Self::commit) or [`rollback`](Self::rollback).
pub struct TransactionScope<'log> {
    log: &'log TransactionLog,
    id: TransactionId,
    finished: bool,
}

impl TransactionScope<'_> {
    /// Transaction id.
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Write `content` to `path`, creating it if missing.
    ///
    /// # Errors
    /// Returns an error if the file system or the log rejects the operation.
    pub async fn write_file(&mut self, path: &Path, content: &[u8]) -> Result<()> {
        let kind = match self.log.fs.read(path).await? {
            Some(previous) => {
                self.log.store_backup(&self.id, path, previous)?;
                FileOperationKind::Modify
            }
            None => FileOperationKind::Create,
        };
        self.log.fs.write(path, content).await?;
        self.log
            .record_operation(&self.id, FileOperation::now(kind, path, "write"))
    }

    /// Create a new file.
    ///
    /// # Errors
    /// Returns an error if the file already exists or the write fails.
    pub async fn create_file(&mut self, path: &Path, content: &[u8]) -> Result<()> {
        if self.log.fs.read(path).await?.is_some() {
            return Err(OrchestrationError::file_system(path, "file already exists"));
        }
        self.log.fs.write(path, content).await?;
        self.log.record_operation(
            &self.id,
            FileOperation::now(FileOperationKind::Create, path, "create"),
        )
    }

    /// Delete a file. Returns whether it existed.
    ///
    /// # Errors
    /// Returns an error if the file system or the log rejects the operation.
    pub async fn delete_file(&mut self, path: &Path) -> Result<bool> {
        let Some(previous) = self.log.fs.read(path).await? else {
            return Ok(false);
        };
        self.log.store_backup(&self.id, path, previous)?;
        let removed = self.log.fs.remove(path).await?;
        self.log.record_operation(
            &self.id,
            FileOperation::now(FileOperationKind::Delete, path, "delete"),
        )?;
        Ok(removed)
    }

    /// Commit the transaction.
    ///
    /// # Errors
    /// Returns an error if the transaction is no longer active.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.log.commit(&self.id)
    }

    /// Roll the transaction back.
    ///
    /// # Errors
    /// Returns an error if the transaction is no longer known.
    pub async fn rollback(mut self) -> Result<RollbackReport> {
        self.finished = true;
        self.log.rollback(&self.id).await
    }
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Transaction {} dropped without commit or rollback; it stays active",
                self.id
            );
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use crate::workspace::LocalFs;
    use tempfile::TempDir;

    fn create_log() -> (TempDir, TransactionLog) {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let fs = Arc::new(LocalFs::new(tmp_dir.path().to_path_buf()));
        let log = TransactionLog::new(fs, &TransactionConfig::default(), EventChannel::default());
        (tmp_dir, log)
    }

    #[test]
    fn test_begin_with_duplicate_id_conflicts() {
        let (_tmp, log) = create_log();
        let id = TransactionId::from("tx-fixed");

        assert_eq!(log.begin(Some(id.clone())).ok(), Some(id.clone()));
        assert!(matches!(
            log.begin(Some(id.clone())),
            Err(OrchestrationError::TransactionConflict(conflict)) if conflict == id
        ));
        assert_eq!(log.status(&id), Some(TransactionStatus::Active));
        assert_eq!(log.active_count(), 1);
    }

    #[test]
    fn test_backup_is_first_touch_only() {
        let (_tmp, log) = create_log();
        let id = match log.begin(None) {
            Ok(id) => id,
            Err(error) => panic!("begin failed: {error}"),
        };
        let path = Path::new("a.txt");

        assert_eq!(log.store_backup(&id, path, b"old".to_vec()).ok(), Some(true));
        assert_eq!(log.store_backup(&id, path, b"newer".to_vec()).ok(), Some(false));
        assert!(log.backup_time(&id, path).is_some());

        let created = Path::new("b.txt");
        assert!(
            log.record_operation(&id, FileOperation::now(FileOperationKind::Create, created, "create"))
                .is_ok()
        );
        assert_eq!(log.store_backup(&id, created, b"x".to_vec()).ok(), Some(false));
        assert_eq!(
            log.touched_files(&id),
            Some(vec![path.to_path_buf(), created.to_path_buf()])
        );
    }

    #[test]
    fn test_commit_finishes_and_rejects_further_records() {
        let (_tmp, log) = create_log();
        let id = match log.begin(None) {
            Ok(id) => id,
            Err(error) => panic!("begin failed: {error}"),
        };

        assert!(log.commit(&id).is_ok());
        assert_eq!(log.status(&id), Some(TransactionStatus::Committed));
        assert_eq!(log.active_count(), 0);
        assert_eq!(log.retained_count(), 1);

        let record = log.record_operation(
            &id,
            FileOperation::now(FileOperationKind::Modify, "a.txt", "write"),
        );
        assert!(matches!(record, Err(OrchestrationError::TransactionNotFound(_))));
        assert!(matches!(
            log.commit(&id),
            Err(OrchestrationError::InvalidTransactionState {
                status: TransactionStatus::Committed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rollback_of_committed_transaction_rejected() {
        let (_tmp, log) = create_log();
        let id = match log.begin(None) {
            Ok(id) => id,
            Err(error) => panic!("begin failed: {error}"),
        };
        assert!(log.commit(&id).is_ok());

        assert!(matches!(
            log.rollback(&id).await,
            Err(OrchestrationError::InvalidTransactionState { .. })
        ));
        assert!(matches!(
            log.rollback(&TransactionId::from("unknown")).await,
            Err(OrchestrationError::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_rollback_succeeds() {
        let (_tmp, log) = create_log();
        let id = match log.begin(None) {
            Ok(id) => id,
            Err(error) => panic!("begin failed: {error}"),
        };

        let report = match log.rollback(&id).await {
            Ok(report) => report,
            Err(error) => panic!("rollback failed: {error}"),
        };
        assert_eq!(report.status, TransactionStatus::RolledBack);
        assert!(!report.already_finished);
        assert_eq!(report.restored + report.deleted, 0);

        let again = match log.rollback(&id).await {
            Ok(report) => report,
            Err(error) => panic!("second rollback failed: {error}"),
        };
        assert!(again.already_finished);
        assert_eq!(again.status, TransactionStatus::RolledBack);
        assert!(matches!(
            log.begin(Some(id.clone())),
            Err(OrchestrationError::TransactionConflict(conflict)) if conflict == id
        ));
    }

    #[test]
    fn test_retention_expires() {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let fs = Arc::new(LocalFs::new(tmp_dir.path().to_path_buf()));
        let config = TransactionConfig {
            gc_grace_ms: 0,
            max_retained: 4,
        };
        let log = TransactionLog::new(fs, &config, EventChannel::default());
        let id = match log.begin(None) {
            Ok(id) => id,
            Err(error) => panic!("begin failed: {error}"),
        };

        assert!(log.commit(&id).is_ok());
        assert_eq!(log.retained_count(), 0);
        assert_eq!(log.status(&id), None);
    }
}
