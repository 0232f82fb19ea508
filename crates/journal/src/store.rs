use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use calm_schema::{
    CalmError, ConfidenceTier, Domain, GhapCurrent, GhapEntry, GhapOutcome, GhapRevision,
    OutcomeStatus, Result, Strategy,
};

use crate::fsio::{append_json_line, read_json_lines, write_atomic};

const CURRENT_FILE: &str = "current_ghap.json";
const SESSION_LOG: &str = "session_entries.jsonl";
const SESSION_ID_FILE: &str = ".session_id";
const TOOL_COUNT_FILE: &str = ".tool_count";
const ARCHIVE_DIR: &str = "archive";

/// Result of `start_session`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    /// Whether an active GHAP from an earlier session was left behind.
    pub has_orphan: bool,
}

/// Fields a GHAP update may change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateGhap {
    pub hypothesis: Option<String>,
    pub action: Option<String>,
    pub prediction: Option<String>,
    pub strategy: Option<Strategy>,
    pub note: Option<String>,
}

/// Terminal resolution of the active GHAP.
#[derive(Debug, Clone)]
pub struct ResolveGhap {
    pub status: OutcomeStatus,
    pub result: String,
    pub auto_captured: bool,
    pub surprise: Option<String>,
    pub root_cause: Option<calm_schema::RootCause>,
    pub lesson: Option<calm_schema::Lesson>,
}

/// File-backed GHAP state machine and session bookkeeping.
///
/// State diagram: absent → (create) → active → (update)* → (resolve) → absent.
/// Any other transition fails with `InvalidState`. An active entry whose
/// session id no longer matches `.session_id` is an orphan: it is surfaced by
/// `get_orphaned_ghap` until adopted or abandoned, and blocks `create_ghap`.
pub struct JournalStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JournalStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join(ARCHIVE_DIR))?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    // ── Session identity ──────────────────────────────────────────────────────

    /// The current session id, minting one if the file does not exist yet.
    pub async fn current_session_id(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        self.read_or_init_session_id()
    }

    fn read_or_init_session_id(&self) -> Result<String> {
        let path = self.path(SESSION_ID_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) if !raw.trim().is_empty() => Ok(raw.trim().to_string()),
            _ => {
                let id = Uuid::new_v4().to_string();
                write_atomic(&path, id.as_bytes())?;
                Ok(id)
            }
        }
    }

    /// Rotate to a fresh session: new session id, archived session log, reset
    /// tool counter. An active GHAP is deliberately left in place so the next
    /// session can adopt or abandon it.
    pub async fn start_session(&self) -> Result<SessionInfo> {
        let _guard = self.lock.lock().await;

        let previous_id = fs::read_to_string(self.path(SESSION_ID_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // Archive the previous session's resolved entries before rotating.
        let log_path = self.path(SESSION_LOG);
        if let Some(previous) = &previous_id {
            if log_path.exists() && fs::metadata(&log_path)?.len() > 0 {
                let date = Utc::now().format("%Y-%m-%d");
                let archived = self
                    .path(ARCHIVE_DIR)
                    .join(format!("{date}_{previous}.jsonl"));
                fs::rename(&log_path, &archived)?;
            }
        }

        let session_id = Uuid::new_v4().to_string();
        write_atomic(&self.path(SESSION_ID_FILE), session_id.as_bytes())?;
        write_atomic(&self.path(TOOL_COUNT_FILE), b"0")?;

        let has_orphan = self.path(CURRENT_FILE).exists();
        info!(session_id = %session_id, has_orphan, "session started");
        Ok(SessionInfo { session_id, has_orphan })
    }

    // ── Current entry plumbing ────────────────────────────────────────────────

    fn read_current(&self) -> Result<Option<GhapEntry>> {
        let path = self.path(CURRENT_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        match serde_json::from_str(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                // A current file we cannot parse must not wedge the session.
                // Move it aside and report it exactly once.
                let quarantined = path.with_extension("json.corrupt");
                let _ = fs::rename(&path, &quarantined);
                warn!(
                    error = %err,
                    moved_to = %quarantined.display(),
                    "unreadable current_ghap.json quarantined"
                );
                Err(CalmError::CorruptState(format!(
                    "current_ghap.json was unreadable and has been moved to {}: {err}",
                    quarantined.display()
                )))
            }
        }
    }

    fn write_current(&self, entry: &GhapEntry) -> Result<()> {
        let raw = serde_json::to_vec_pretty(entry)
            .map_err(|err| CalmError::CorruptState(format!("encoding ghap entry: {err}")))?;
        write_atomic(&self.path(CURRENT_FILE), &raw)
    }

    fn clear_current(&self) -> Result<()> {
        match fs::remove_file(self.path(CURRENT_FILE)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_current_ghap(&self) -> Result<Option<GhapEntry>> {
        let _guard = self.lock.lock().await;
        self.read_current()
    }

    // ── State machine ─────────────────────────────────────────────────────────

    pub async fn create_ghap(
        &self,
        domain: Domain,
        strategy: Strategy,
        goal: String,
        hypothesis: String,
        action: String,
        prediction: String,
    ) -> Result<GhapEntry> {
        let _guard = self.lock.lock().await;

        if self.path(CURRENT_FILE).exists() {
            return Err(CalmError::InvalidState(
                "an active GHAP already exists; resolve or abandon it first".to_string(),
            ));
        }
        let session_id = self.read_or_init_session_id()?;
        let entry = GhapEntry {
            id: Uuid::new_v4().to_string(),
            session_id,
            domain,
            strategy,
            goal,
            current: GhapCurrent { hypothesis, action, prediction },
            history: Vec::new(),
            iteration_count: 0,
            notes: Vec::new(),
            outcome: None,
            surprise: None,
            root_cause: None,
            lesson: None,
            confidence_tier: None,
            created_at: Utc::now(),
        };
        self.write_current(&entry)?;
        info!(entry_id = %entry.id, domain = %entry.domain, "ghap created");
        Ok(entry)
    }

    pub async fn update_ghap(&self, update: UpdateGhap) -> Result<GhapEntry> {
        let _guard = self.lock.lock().await;

        let mut entry = self.read_current()?.ok_or_else(|| {
            CalmError::InvalidState("no active GHAP to update".to_string())
        })?;
        let session_id = self.read_or_init_session_id()?;
        if entry.session_id != session_id {
            return Err(CalmError::InvalidState(
                "active GHAP belongs to a previous session; adopt or abandon it first"
                    .to_string(),
            ));
        }

        let next = GhapCurrent {
            hypothesis: update.hypothesis.unwrap_or_else(|| entry.current.hypothesis.clone()),
            action: update.action.unwrap_or_else(|| entry.current.action.clone()),
            prediction: update.prediction.unwrap_or_else(|| entry.current.prediction.clone()),
        };
        // Iterations count revisions of the hypothesis triple, nothing else.
        if next != entry.current {
            entry.history.push(GhapRevision {
                hypothesis: entry.current.hypothesis.clone(),
                action: entry.current.action.clone(),
                prediction: entry.current.prediction.clone(),
                revised_at: Utc::now(),
            });
            entry.iteration_count += 1;
            entry.current = next;
        }
        if let Some(strategy) = update.strategy {
            entry.strategy = strategy;
        }
        if let Some(note) = update.note {
            if !note.is_empty() {
                entry.notes.push(note);
            }
        }

        self.write_current(&entry)?;
        Ok(entry)
    }

    pub async fn resolve_ghap(&self, resolve: ResolveGhap) -> Result<GhapEntry> {
        let _guard = self.lock.lock().await;

        let mut entry = self.read_current()?.ok_or_else(|| {
            CalmError::InvalidState("no active GHAP to resolve".to_string())
        })?;
        let session_id = self.read_or_init_session_id()?;
        if entry.session_id != session_id {
            return Err(CalmError::InvalidState(
                "active GHAP belongs to a previous session; adopt or abandon it first"
                    .to_string(),
            ));
        }

        entry.outcome = Some(GhapOutcome {
            status: resolve.status,
            result: resolve.result,
            auto_captured: resolve.auto_captured,
            captured_at: Utc::now(),
        });
        entry.surprise = resolve.surprise.filter(|s| !s.is_empty());
        entry.root_cause = resolve.root_cause;
        entry.lesson = resolve.lesson;
        entry.confidence_tier = Some(entry.computed_tier());

        append_json_line(&self.path(SESSION_LOG), &entry)?;
        self.clear_current()?;
        info!(
            entry_id = %entry.id,
            status = %resolve.status,
            tier = %entry.confidence_tier.unwrap_or(ConfidenceTier::Bronze),
            iterations = entry.iteration_count,
            "ghap resolved"
        );
        Ok(entry)
    }

    // ── Orphans ───────────────────────────────────────────────────────────────

    /// The active entry left behind by a previous session, if any.
    /// Idempotent: keeps reporting the same orphan until it is adopted or
    /// abandoned.
    pub async fn get_orphaned_ghap(&self) -> Result<Option<GhapEntry>> {
        let _guard = self.lock.lock().await;
        let Some(entry) = self.read_current()? else {
            return Ok(None);
        };
        let session_id = self.read_or_init_session_id()?;
        if entry.session_id == session_id {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Take ownership of the orphan in the current session. The adopted
    /// snapshot is appended to the session log so the handover is recorded.
    pub async fn adopt_orphan(&self) -> Result<GhapEntry> {
        let _guard = self.lock.lock().await;

        let mut entry = self.read_current()?.ok_or_else(|| {
            CalmError::InvalidState("no orphaned GHAP to adopt".to_string())
        })?;
        let session_id = self.read_or_init_session_id()?;
        if entry.session_id == session_id {
            return Err(CalmError::InvalidState(
                "active GHAP already belongs to this session".to_string(),
            ));
        }

        entry.session_id = session_id;
        self.write_current(&entry)?;
        append_json_line(&self.path(SESSION_LOG), &entry)?;
        info!(entry_id = %entry.id, "orphaned ghap adopted");
        Ok(entry)
    }

    /// Resolve the orphan as ABANDONED with the given reason and clear it.
    pub async fn abandon_orphan(&self, reason: String) -> Result<GhapEntry> {
        let _guard = self.lock.lock().await;

        let mut entry = self.read_current()?.ok_or_else(|| {
            CalmError::InvalidState("no orphaned GHAP to abandon".to_string())
        })?;
        let session_id = self.read_or_init_session_id()?;
        if entry.session_id == session_id {
            return Err(CalmError::InvalidState(
                "active GHAP belongs to this session; resolve it instead".to_string(),
            ));
        }

        entry.outcome = Some(GhapOutcome {
            status: OutcomeStatus::Abandoned,
            result: reason,
            auto_captured: false,
            captured_at: Utc::now(),
        });
        entry.confidence_tier = Some(ConfidenceTier::Abandoned);

        append_json_line(&self.path(SESSION_LOG), &entry)?;
        self.clear_current()?;
        info!(entry_id = %entry.id, "orphaned ghap abandoned");
        Ok(entry)
    }

    // ── Session log ───────────────────────────────────────────────────────────

    pub async fn list_session_entries(&self) -> Result<Vec<GhapEntry>> {
        let _guard = self.lock.lock().await;
        read_json_lines(&self.path(SESSION_LOG))
    }

    // ── Tool counter ──────────────────────────────────────────────────────────

    fn read_tool_count(&self) -> u64 {
        fs::read_to_string(self.path(TOOL_COUNT_FILE))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    pub async fn increment_tool_count(&self) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let count = self.read_tool_count() + 1;
        write_atomic(&self.path(TOOL_COUNT_FILE), count.to_string().as_bytes())?;
        Ok(count)
    }

    pub async fn should_check_in(&self, frequency: u64) -> Result<bool> {
        let _guard = self.lock.lock().await;
        Ok(frequency > 0 && self.read_tool_count() >= frequency)
    }

    pub async fn reset_tool_count(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        write_atomic(&self.path(TOOL_COUNT_FILE), b"0")?;
        Ok(())
    }

    pub async fn tool_count(&self) -> Result<u64> {
        let _guard = self.lock.lock().await;
        Ok(self.read_tool_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    async fn store() -> Result<(tempfile::TempDir, JournalStore)> {
        let dir = tempfile::tempdir()?;
        let store = JournalStore::open(dir.path())?;
        store.start_session().await?;
        Ok((dir, store))
    }

    async fn create(store: &JournalStore) -> Result<GhapEntry> {
        Ok(store
            .create_ghap(
                Domain::Debugging,
                Strategy::RootCauseAnalysis,
                "fix flaky test".into(),
                "the failure is caused by timing between writer and reader".into(),
                "add a sleep before the assertion".into(),
                "test passes 3/3".into(),
            )
            .await?)
    }

    fn resolution(status: OutcomeStatus) -> ResolveGhap {
        ResolveGhap {
            status,
            result: "observed outcome".into(),
            auto_captured: false,
            surprise: None,
            root_cause: None,
            lesson: None,
        }
    }

    #[tokio::test]
    async fn create_then_resolve_clears_current() -> Result<()> {
        let (dir, store) = store().await?;
        create(&store).await?;
        assert!(dir.path().join("current_ghap.json").exists());

        let resolved = store.resolve_ghap(resolution(OutcomeStatus::Confirmed)).await?;
        assert!(resolved.is_resolved());
        assert!(!dir.path().join("current_ghap.json").exists());

        let entries = store.list_session_entries().await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, resolved.id);
        Ok(())
    }

    #[tokio::test]
    async fn second_create_while_active_fails() -> Result<()> {
        let (_dir, store) = store().await?;
        create(&store).await?;
        let err = create(&store).await.unwrap_err();
        assert!(err.to_string().contains("active GHAP"));
        Ok(())
    }

    #[tokio::test]
    async fn resolve_without_active_fails() -> Result<()> {
        let (_dir, store) = store().await?;
        let err = store
            .resolve_ghap(resolution(OutcomeStatus::Confirmed))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        Ok(())
    }

    #[tokio::test]
    async fn update_increments_iterations_only_on_hap_change() -> Result<()> {
        let (_dir, store) = store().await?;
        create(&store).await?;

        let updated = store
            .update_ghap(UpdateGhap {
                hypothesis: Some("the failure is shared tempdir state, not timing".into()),
                ..Default::default()
            })
            .await?;
        assert_eq!(updated.iteration_count, 1);
        assert_eq!(updated.history.len(), 1);

        // Note-only update: no iteration, no history push.
        let noted = store
            .update_ghap(UpdateGhap {
                note: Some("ran the suite twice to confirm".into()),
                ..Default::default()
            })
            .await?;
        assert_eq!(noted.iteration_count, 1);
        assert_eq!(noted.history.len(), 1);
        assert_eq!(noted.notes.len(), 1);

        // Re-sending identical values is not an iteration either.
        let same = store
            .update_ghap(UpdateGhap {
                hypothesis: Some(noted.current.hypothesis.clone()),
                ..Default::default()
            })
            .await?;
        assert_eq!(same.iteration_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn orphan_lifecycle_abandon() -> Result<()> {
        let (dir, store) = store().await?;
        let created = create(&store).await?;

        // A new session makes the active entry an orphan.
        store.start_session().await?;
        let orphan = store.get_orphaned_ghap().await?.expect("orphan expected");
        assert_eq!(orphan.id, created.id);
        // Idempotent until acted on.
        assert!(store.get_orphaned_ghap().await?.is_some());

        let abandoned = store.abandon_orphan("session ended".into()).await?;
        assert_eq!(
            abandoned.outcome.as_ref().map(|o| o.status),
            Some(OutcomeStatus::Abandoned)
        );
        assert_eq!(abandoned.confidence_tier, Some(ConfidenceTier::Abandoned));
        assert!(store.get_orphaned_ghap().await?.is_none());
        assert!(!dir.path().join("current_ghap.json").exists());
        Ok(())
    }

    #[tokio::test]
    async fn orphan_lifecycle_adopt() -> Result<()> {
        let (_dir, store) = store().await?;
        let created = create(&store).await?;

        let info = store.start_session().await?;
        assert!(info.has_orphan);
        let adopted = store.adopt_orphan().await?;
        assert_eq!(adopted.id, created.id);
        assert_eq!(adopted.session_id, info.session_id);

        // No longer an orphan; normal updates work again.
        assert!(store.get_orphaned_ghap().await?.is_none());
        let updated = store
            .update_ghap(UpdateGhap {
                action: Some("bisect the failing commit range".into()),
                ..Default::default()
            })
            .await?;
        assert_eq!(updated.iteration_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn update_on_orphan_requires_adoption() -> Result<()> {
        let (_dir, store) = store().await?;
        create(&store).await?;
        store.start_session().await?;

        let err = store
            .update_ghap(UpdateGhap {
                action: Some("something".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_current_is_quarantined_and_reported_once() -> Result<()> {
        let (dir, store) = store().await?;
        fs::write(dir.path().join("current_ghap.json"), "{not json")?;

        let err = store.get_orphaned_ghap().await.unwrap_err();
        assert_eq!(err.kind(), "corrupt_state");
        assert!(dir.path().join("current_ghap.json.corrupt").exists());

        // Second call: nothing left to report, session is usable.
        assert!(store.get_orphaned_ghap().await?.is_none());
        create(&store).await?;
        Ok(())
    }

    #[tokio::test]
    async fn start_session_archives_previous_log_and_resets_counter() -> Result<()> {
        let (dir, store) = store().await?;
        let first_session = store.current_session_id().await?;
        create(&store).await?;
        store.resolve_ghap(resolution(OutcomeStatus::Confirmed)).await?;
        store.increment_tool_count().await?;
        store.increment_tool_count().await?;

        store.start_session().await?;
        assert!(store.list_session_entries().await?.is_empty());
        assert_eq!(store.tool_count().await?, 0);

        let archived: Vec<_> = fs::read_dir(dir.path().join("archive"))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].contains(&first_session));
        Ok(())
    }

    #[tokio::test]
    async fn tool_counter_thresholds() -> Result<()> {
        let (_dir, store) = store().await?;
        assert!(!store.should_check_in(3).await?);
        store.increment_tool_count().await?;
        store.increment_tool_count().await?;
        assert!(!store.should_check_in(3).await?);
        store.increment_tool_count().await?;
        assert!(store.should_check_in(3).await?);
        store.reset_tool_count().await?;
        assert!(!store.should_check_in(3).await?);
        Ok(())
    }

    #[tokio::test]
    async fn resolved_entry_computes_tier_from_annotations() -> Result<()> {
        let (_dir, store) = store().await?;
        create(&store).await?;
        let resolved = store
            .resolve_ghap(ResolveGhap {
                status: OutcomeStatus::Falsified,
                result: "test still flaked with sleeps in place".into(),
                auto_captured: false,
                surprise: Some("the failure was test isolation, not timing".into()),
                root_cause: Some(calm_schema::RootCause {
                    category: "wrong-assumption".into(),
                    description: "assumed intermittent meant timing".into(),
                }),
                lesson: Some(calm_schema::Lesson {
                    what_worked: "checking shared state".into(),
                    takeaway: "rule out isolation before timing".into(),
                }),
            })
            .await?;
        assert_eq!(resolved.confidence_tier, Some(ConfidenceTier::Silver));
        Ok(())
    }
}
