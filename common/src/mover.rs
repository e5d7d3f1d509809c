// Run engine for one match-and-move pass
// Fans out per source, per file and per destination; every level joins its children before reporting.

use crate::errors::MoveError;
use crate::matcher::{write_if_match, MatchOutcome};
use crate::routing::RoutingTable;
use crate::substitution::{replace_tokens, RunTimestamp};
use std::ffi::OsString;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Walked entries buffered between the blocking walker and the source task
const WALK_CHANNEL_CAPACITY: usize = 256;

/// Tuning knobs for the run engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Upper bound on files processed at the same time; `None` means unbounded
    pub max_concurrent_files: Option<usize>,
}

/// Counters for one run, merged bottom-up from every task
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Sources that resolved to an existing directory and were walked
    pub sources_scanned: u64,
    /// Sources that were missing or not a directory
    pub sources_skipped: u64,
    /// Regular files found by the walks
    pub files_scanned: u64,
    /// Files written to at least one destination and removed from the source
    pub files_moved: u64,
    /// Successful destination writes
    pub writes: u64,
    /// Errors logged by any task
    pub errors: u64,
}

impl RunReport {
    pub fn merge(&mut self, other: RunReport) {
        self.sources_scanned += other.sources_scanned;
        self.sources_skipped += other.sources_skipped;
        self.files_scanned += other.files_scanned;
        self.files_moved += other.files_moved;
        self.writes += other.writes;
        self.errors += other.errors;
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sources={} skipped={} files={} moved={} writes={} errors={}",
            self.sources_scanned,
            self.sources_skipped,
            self.files_scanned,
            self.files_moved,
            self.writes,
            self.errors
        )
    }
}

/// A regular file discovered while walking a source directory
///
/// `name` is the raw base name and is what lands in the destination.
/// `display_name` is its UTF-8 (lossy) form, used for pattern matching only.
#[derive(Debug, Clone)]
struct CandidateFile {
    path: PathBuf,
    name: OsString,
    display_name: String,
}

enum WalkItem {
    File(CandidateFile),
    Error(MoveError),
}

/// One match-and-move job bound to a routing table
///
/// `run` may be called repeatedly; callers must not start a run before the
/// previous one returned.
#[derive(Debug, Clone)]
pub struct MoveJob {
    table: Arc<RoutingTable>,
    options: EngineOptions,
}

impl MoveJob {
    pub fn new(table: RoutingTable, options: EngineOptions) -> Self {
        Self {
            table: Arc::new(table),
            options,
        }
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Execute one pass with a freshly captured timestamp
    pub async fn run(&self) -> RunReport {
        self.run_at(RunTimestamp::now()).await
    }

    /// Execute one pass resolving every template against `ts`
    ///
    /// Never fails: per-entity errors are logged and counted in the report.
    #[instrument(skip(self), fields(sources = self.table.len()))]
    pub async fn run_at(&self, ts: RunTimestamp) -> RunReport {
        info!("Job is running...");
        self.table.log_summary();

        let limiter = self
            .options
            .max_concurrent_files
            .map(|permits| Arc::new(Semaphore::new(permits)));

        let mut sources = JoinSet::new();
        for source in self.table.sources() {
            sources.spawn(process_source(
                Arc::clone(&self.table),
                Arc::from(source),
                ts,
                limiter.clone(),
            ));
        }

        let report = join_reports(sources).await;
        info!(%report, "Job is done...");
        report
    }
}

async fn join_reports(mut tasks: JoinSet<RunReport>) -> RunReport {
    let mut report = RunReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(child) => report.merge(child),
            Err(e) => {
                error!(error = %MoveError::from(e), "Task did not complete");
                report.errors += 1;
            }
        }
    }
    report
}

#[instrument(skip(table, limiter))]
async fn process_source(
    table: Arc<RoutingTable>,
    source: Arc<str>,
    ts: RunTimestamp,
    limiter: Option<Arc<Semaphore>>,
) -> RunReport {
    let mut report = RunReport::default();
    let root = PathBuf::from(replace_tokens(&source, ts));

    match tokio::fs::metadata(&root).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            warn!(path = %root.display(), "Source path is not a directory");
            report.sources_skipped += 1;
            return report;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %root.display(), "Source path does not exist");
            report.sources_skipped += 1;
            return report;
        }
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Failed to inspect source path");
            report.sources_skipped += 1;
            report.errors += 1;
            return report;
        }
    }
    report.sources_scanned += 1;

    let (tx, mut rx) = mpsc::channel(WALK_CHANNEL_CAPACITY);
    let walker = tokio::task::spawn_blocking(move || walk_files(&root, tx));

    let mut files = JoinSet::new();
    while let Some(item) = rx.recv().await {
        match item {
            WalkItem::File(file) => {
                report.files_scanned += 1;
                files.spawn(process_file(
                    Arc::clone(&table),
                    Arc::clone(&source),
                    file,
                    ts,
                    limiter.clone(),
                ));
            }
            WalkItem::Error(err) => {
                warn!(error = %err, "Walk error");
                report.errors += 1;
            }
        }
    }

    if let Err(e) = walker.await {
        error!(error = %MoveError::from(e), "Directory walk did not complete");
        report.errors += 1;
    }

    report.merge(join_reports(files).await);
    report
}

/// Walk `root` recursively, sending every regular file to `tx`
///
/// Runs on a blocking thread. Directories are descended into but never sent.
fn walk_files(root: &Path, tx: mpsc::Sender<WalkItem>) {
    for entry in WalkDir::new(root) {
        let item = match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                trace!(path = %entry.path().display(), "Path is a directory");
                continue;
            }
            Ok(entry) if !entry.file_type().is_file() => {
                debug!(path = %entry.path().display(), "Skipping non-regular file");
                continue;
            }
            Ok(entry) => {
                let name = entry.file_name().to_os_string();
                let display_name = name.to_string_lossy().into_owned();
                WalkItem::File(CandidateFile {
                    name,
                    display_name,
                    path: entry.into_path(),
                })
            }
            Err(e) => WalkItem::Error(MoveError::WalkFailed {
                path: e.path().unwrap_or(root).to_path_buf(),
                reason: e.to_string(),
            }),
        };

        if tx.blocking_send(item).is_err() {
            break;
        }
    }
}

async fn acquire(limiter: Option<Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match limiter {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    }
}

#[instrument(skip(table, source, ts, limiter), fields(path = %file.path.display()))]
async fn process_file(
    table: Arc<RoutingTable>,
    source: Arc<str>,
    file: CandidateFile,
    ts: RunTimestamp,
    limiter: Option<Arc<Semaphore>>,
) -> RunReport {
    let _permit = acquire(limiter).await;
    let mut report = RunReport::default();

    let content: Arc<[u8]> = match tokio::fs::read(&file.path).await {
        Ok(bytes) => Arc::from(bytes),
        Err(e) => {
            let err = MoveError::ReadFailed {
                path: file.path.clone(),
                source: e,
            };
            warn!(error = %err, "Skipping unreadable file");
            report.errors += 1;
            return report;
        }
    };

    let Some(destinations) = table.destinations(&source) else {
        return report;
    };

    let file = Arc::new(file);
    let mut tasks = JoinSet::new();
    for (destination, patterns) in destinations {
        tasks.spawn(process_destination(
            destination.clone(),
            patterns.clone(),
            Arc::clone(&file),
            Arc::clone(&content),
            ts,
        ));
    }

    // Read only after every destination task has joined
    let mut accepted = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                if outcome.accepted() {
                    accepted = true;
                    report.writes += 1;
                }
                if outcome.error().is_some() {
                    report.errors += 1;
                }
            }
            Ok(Err(_)) => report.errors += 1,
            Err(e) => {
                error!(error = %MoveError::from(e), "Destination task did not complete");
                report.errors += 1;
            }
        }
    }

    if !accepted {
        return report;
    }

    match tokio::fs::remove_file(&file.path).await {
        Ok(()) => {
            debug!("Source file removed");
            report.files_moved += 1;
        }
        Err(e) => {
            let err = MoveError::RemoveFailed {
                path: file.path.clone(),
                source: e,
            };
            warn!(error = %err, "Failed to remove source file");
            report.errors += 1;
        }
    }
    report
}

#[instrument(skip(patterns, file, content, ts), fields(file = %file.display_name))]
async fn process_destination(
    destination: String,
    patterns: Vec<String>,
    file: Arc<CandidateFile>,
    content: Arc<[u8]>,
    ts: RunTimestamp,
) -> Result<MatchOutcome, MoveError> {
    let dest_dir = PathBuf::from(replace_tokens(&destination, ts));
    if let Err(err) = ensure_dir(&dest_dir).await {
        warn!(error = %err, "Skipping destination");
        return Err(err);
    }

    let patterns: Vec<String> = patterns.iter().map(|p| replace_tokens(p, ts)).collect();
    let dest_file = dest_dir.join(&file.name);
    let outcome = write_if_match(&dest_file, &file.display_name, &content, &patterns).await;

    match &outcome {
        MatchOutcome::Written { pattern } => {
            info!(from = %file.path.display(), to = %dest_file.display(), pattern = %pattern, "File written");
        }
        MatchOutcome::NoMatch => trace!("No pattern matched"),
        MatchOutcome::WriteFailed { error, .. } | MatchOutcome::InvalidPattern { error } => {
            warn!(error = %error, "Destination rejected file");
        }
    }
    Ok(outcome)
}

async fn ensure_dir(dir: &Path) -> Result<(), MoveError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(MoveError::CreateDirFailed {
                path: dir.to_path_buf(),
                source: std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    "path exists and is not a directory",
                ),
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(MoveError::CreateDirFailed {
                path: dir.to_path_buf(),
                source: e,
            })
        }
    }
    info!(path = %dir.display(), "Destination directory does not exist, creating it");
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| MoveError::CreateDirFailed {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn ts() -> RunTimestamp {
        RunTimestamp::at(
            NaiveDate::from_ymd_opt(2024, 3, 5)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        )
    }

    fn job(args: &[String]) -> MoveJob {
        let table = RoutingTable::from_args_at(args, ts()).unwrap();
        MoveJob::new(table, EngineOptions::default())
    }

    fn path_arg(path: &Path) -> String {
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_matching_file_moved_and_others_untouched() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("t1.txt"), "A").unwrap();
        fs::write(src.join("note.md"), "N").unwrap();

        let report = job(&[path_arg(&src), "t[0-9]+.txt".into(), path_arg(&dst)])
            .run_at(ts())
            .await;

        assert_eq!(fs::read_to_string(dst.join("t1.txt")).unwrap(), "A");
        assert!(!src.join("t1.txt").exists());
        assert!(src.join("note.md").exists());
        assert!(!dst.join("note.md").exists());
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_moved, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_fatal() {
        let root = TempDir::new().unwrap();
        let report = job(&[
            path_arg(&root.path().join("absent")),
            "x".into(),
            path_arg(&root.path().join("dst")),
        ])
        .run_at(ts())
        .await;

        assert_eq!(report.sources_skipped, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_source_that_is_a_file_is_skipped() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("plain");
        fs::write(&src, "x").unwrap();

        let report = job(&[path_arg(&src), "x".into(), path_arg(&root.path().join("dst"))])
            .run_at(ts())
            .await;

        assert_eq!(report.sources_skipped, 1);
        assert!(src.exists());
    }

    #[tokio::test]
    async fn test_nested_files_flatten_into_destination() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir_all(src.join("a").join("b")).unwrap();
        fs::write(src.join("a").join("b").join("t7.txt"), "deep").unwrap();

        job(&[path_arg(&src), "^t".into(), path_arg(&dst)])
            .run_at(ts())
            .await;

        assert_eq!(fs::read_to_string(dst.join("t7.txt")).unwrap(), "deep");
        assert!(src.join("a").join("b").exists());
    }

    #[tokio::test]
    async fn test_file_copied_to_every_matching_destination() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let dst1 = root.path().join("dst1");
        let dst2 = root.path().join("dst2");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("t1.txt"), "A").unwrap();

        let report = job(&[
            path_arg(&src),
            "t1".into(),
            path_arg(&dst1),
            "$".into(),
            "$".into(),
            path_arg(&dst2),
        ])
        .run_at(ts())
        .await;

        assert_eq!(fs::read_to_string(dst1.join("t1.txt")).unwrap(), "A");
        assert_eq!(fs::read_to_string(dst2.join("t1.txt")).unwrap(), "A");
        assert!(!src.join("t1.txt").exists());
        assert_eq!(report.writes, 2);
        assert_eq!(report.files_moved, 1);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_source() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("t1.txt"), "A").unwrap();
        // A directory where the destination file should go makes the write fail
        fs::create_dir_all(dst.join("t1.txt")).unwrap();

        let report = job(&[path_arg(&src), "t1".into(), path_arg(&dst)])
            .run_at(ts())
            .await;

        assert!(src.join("t1.txt").exists());
        assert_eq!(report.files_moved, 0);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn test_one_successful_destination_is_enough_to_delete() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let good = root.path().join("good");
        let bad = root.path().join("bad");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("t1.txt"), "A").unwrap();
        // Destination directory path occupied by a plain file
        fs::write(&bad, "not a dir").unwrap();
        assert!(matches!(
            ensure_dir(&bad).await,
            Err(MoveError::CreateDirFailed { .. })
        ));

        let report = job(&[
            path_arg(&src),
            "t1".into(),
            path_arg(&good),
            "$".into(),
            "$".into(),
            path_arg(&bad),
        ])
        .run_at(ts())
        .await;

        assert_eq!(fs::read_to_string(good.join("t1.txt")).unwrap(), "A");
        assert!(!src.join("t1.txt").exists());
        assert_eq!(report.files_moved, 1);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn test_tokens_resolved_in_paths_and_patterns() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("in").join("20240305");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("log_20240305.txt"), "L").unwrap();

        job(&[
            format!("{}/in/{{date}}", root.path().display()),
            "log_{date}".into(),
            format!("{}/out/{{year}}", root.path().display()),
        ])
        .run_at(ts())
        .await;

        let moved = root.path().join("out").join("2024").join("log_20240305.txt");
        assert_eq!(fs::read_to_string(moved).unwrap(), "L");
    }

    #[tokio::test]
    async fn test_concurrency_bound_still_processes_all_files() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir(&src).unwrap();
        for i in 0..20 {
            fs::write(src.join(format!("t{i}.txt")), format!("{i}")).unwrap();
        }

        let table = RoutingTable::from_args_at(
            &[path_arg(&src), r"t\d+\.txt".to_string(), path_arg(&dst)],
            ts(),
        )
        .unwrap();
        let options = EngineOptions {
            max_concurrent_files: Some(2),
        };
        let report = MoveJob::new(table, options).run_at(ts()).await;

        assert_eq!(report.files_moved, 20);
        assert_eq!(fs::read_dir(&src).unwrap().count(), 0);
        assert_eq!(fs::read_to_string(dst.join("t13.txt")).unwrap(), "13");
    }

    #[tokio::test]
    async fn test_uncreatable_destination_skipped_but_sibling_written() {
        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let good = root.path().join("good");
        let blocker = root.path().join("blocker");
        let bad = blocker.join("sub");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("t1.txt"), "A").unwrap();
        fs::write(&blocker, "plain file").unwrap();

        assert!(matches!(
            ensure_dir(&bad).await,
            Err(MoveError::CreateDirFailed { .. })
        ));

        let report = job(&[
            path_arg(&src),
            "t1".into(),
            path_arg(&good),
            "$".into(),
            "$".into(),
            path_arg(&bad),
        ])
        .run_at(ts())
        .await;

        assert_eq!(fs::read_to_string(good.join("t1.txt")).unwrap(), "A");
        assert!(!src.join("t1.txt").exists());
        assert!(!bad.exists());
        assert_eq!(report.writes, 1);
        assert_eq!(report.files_moved, 1);
        assert_eq!(report.errors, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_name_kept_byte_for_byte() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let root = TempDir::new().unwrap();
        let src = root.path().join("src");
        let dst = root.path().join("dst");
        fs::create_dir(&src).unwrap();
        let name = OsStr::from_bytes(b"t1\xff.txt");
        fs::write(src.join(name), "raw").unwrap();

        let report = job(&[path_arg(&src), "t1".into(), path_arg(&dst)])
            .run_at(ts())
            .await;

        assert_eq!(report.files_moved, 1);
        assert!(!src.join(name).exists());
        assert_eq!(fs::read_to_string(dst.join(name)).unwrap(), "raw");
        let names: Vec<_> = fs::read_dir(&dst)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![name.to_os_string()]);
    }

    #[test]
    fn test_report_merge_and_display() {
        let mut report = RunReport {
            files_scanned: 2,
            files_moved: 1,
            ..Default::default()
        };
        report.merge(RunReport {
            files_scanned: 3,
            errors: 1,
            ..Default::default()
        });
        assert_eq!(report.files_scanned, 5);
        assert_eq!(
            report.to_string(),
            "sources=0 skipped=0 files=5 moved=1 writes=0 errors=1"
        );
    }
}
