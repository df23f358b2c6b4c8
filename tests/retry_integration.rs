use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use verifile::aggregator::key_for;
use verifile::transfer::engine::ProgressFn;
use verifile::transfer::{
    Backoff, ByteTransfer, CancelToken, CopyStrategy, LocalTransfer, Quarantine, QuarantineMode,
    ReplicationTask, RetryController, RetryPolicy, StrategyPlan, TaskOutcome,
};
use verifile::{BatchOptions, ErrorAggregator, ErrorKind, ReplicationError, replicate_directory};

/// Real copy followed by one extra byte, so verification never passes.
struct Corrupting {
    calls: AtomicUsize,
}

impl Corrupting {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

impl ByteTransfer for Corrupting {
    fn copy(
        &self,
        source: &Path,
        target: &Path,
        strategy: CopyStrategy,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, ReplicationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = LocalTransfer.copy(source, target, strategy, progress)?;
        let mut f = OpenOptions::new().append(true).open(target).unwrap();
        f.write_all(b"!").unwrap();
        Ok(n)
    }
}

/// Fails with a retryable write error for the first `failures` calls.
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl ByteTransfer for Flaky {
    fn copy(
        &self,
        source: &Path,
        target: &Path,
        strategy: CopyStrategy,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<u64, ReplicationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(ReplicationError::io(
                ErrorKind::Write,
                "simulated write failure",
                std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full"),
            ));
        }
        LocalTransfer.copy(source, target, strategy, progress)
    }
}

struct Scratch {
    _root: tempfile::TempDir,
    source_dir: PathBuf,
    target_dir: PathBuf,
    quarantine: PathBuf,
}

fn scratch(files: &[(&str, &[u8])]) -> Scratch {
    let root = tempfile::tempdir().unwrap();
    let source_dir = root.path().join("in");
    let target_dir = root.path().join("out");
    std::fs::create_dir_all(&source_dir).unwrap();
    std::fs::create_dir_all(&target_dir).unwrap();
    for (name, data) in files {
        std::fs::write(source_dir.join(name), data).unwrap();
    }
    let quarantine = root.path().join("quarantine");
    Scratch { source_dir, target_dir, quarantine, _root: root }
}

fn policy(max_retries: u32, base_delay_ms: u64, backoff: Backoff) -> RetryPolicy {
    RetryPolicy { max_retries, base_delay_ms, backoff }
}

fn task(s: &Scratch, name: &str, p: RetryPolicy) -> ReplicationTask {
    let src = s.source_dir.join(name);
    let size = std::fs::metadata(&src).unwrap().len();
    ReplicationTask::new(src, s.target_dir.join(name), size, &StrategyPlan::default(), p)
}

#[test]
fn forced_mismatch_quarantines_exactly_once() {
    let s = scratch(&[("doomed.bin", b"will never verify")]);
    let agg = ErrorAggregator::new();
    let q = Quarantine::new(&s.quarantine, QuarantineMode::Immediate);
    let transfer = Corrupting::new();
    let cancel = CancelToken::new();
    let t = task(&s, "doomed.bin", policy(3, 1, Backoff::Exponential));

    let outcome = RetryController::new(&transfer, &agg, &q, &cancel).run(&t, None);

    assert_eq!(outcome, TaskOutcome::Quarantined { attempts: 3 });
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);
    let recs = agg.records_for(&key_for(t.source()));
    assert_eq!(recs.len(), 1, "{:?}", recs);
    assert_eq!(recs[0].kind, ErrorKind::CopyIntegrity);
    assert!(recs[0].message.contains("after 3 attempts"));
    assert!(!t.source().exists());
    assert_eq!(std::fs::read(s.quarantine.join("doomed.bin")).unwrap(), b"will never verify");

    // a second exhausted run of the same path is neither moved nor reported by the quarantine
    assert!(!q.submit(t.source(), &agg));
}

#[test]
fn failing_quarantine_adds_one_create() {
    let s = scratch(&[("stuck.txt", b"abc")]);
    let blocker = s.source_dir.parent().unwrap().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let agg = ErrorAggregator::new();
    let q = Quarantine::new(blocker.join("q"), QuarantineMode::Immediate);
    let cancel = CancelToken::new();
    let t = task(&s, "stuck.txt", policy(1, 1, Backoff::Fixed));

    let outcome = RetryController::new(&Corrupting::new(), &agg, &q, &cancel).run(&t, None);

    assert_eq!(outcome, TaskOutcome::Quarantined { attempts: 1 });
    assert_eq!(agg.count_kind(ErrorKind::CopyIntegrity), 1);
    assert_eq!(agg.count_kind(ErrorKind::Create), 1);
    assert_eq!(agg.total_records(), 2);
    assert!(t.source().exists());
}

#[test]
fn transient_failures_recover() {
    let s = scratch(&[("ok.txt", b"eventually fine")]);
    let agg = ErrorAggregator::new();
    let q = Quarantine::new(&s.quarantine, QuarantineMode::Immediate);
    let cancel = CancelToken::new();
    let transfer = Flaky { failures: 2, calls: AtomicUsize::new(0) };
    let t = task(&s, "ok.txt", policy(3, 1, Backoff::Fixed));

    let outcome = RetryController::new(&transfer, &agg, &q, &cancel).run(&t, None);

    assert_eq!(outcome, TaskOutcome::Verified { attempts: 3, bytes: 15 });
    assert_eq!(agg.count_kind(ErrorKind::Write), 2);
    assert_eq!(agg.count_kind(ErrorKind::CopyIntegrity), 0);
    assert_eq!(std::fs::read(t.target()).unwrap(), b"eventually fine");
    assert!(!s.quarantine.exists());
}

#[test]
fn exponential_backoff_waits_between_attempts() {
    let s = scratch(&[("slow.bin", b"slow")]);
    let agg = ErrorAggregator::new();
    let q = Quarantine::new(&s.quarantine, QuarantineMode::Deferred);
    let cancel = CancelToken::new();
    let p = policy(3, 20, Backoff::Exponential);
    assert_eq!(
        (0..3).map(|n| p.delay_for(n)).collect::<Vec<_>>(),
        vec![Duration::from_millis(20), Duration::from_millis(40), Duration::from_millis(80)]
    );
    let t = task(&s, "slow.bin", p);

    let start = Instant::now();
    let outcome = RetryController::new(&Corrupting::new(), &agg, &q, &cancel).run(&t, None);
    let elapsed = start.elapsed();

    assert_eq!(outcome, TaskOutcome::Quarantined { attempts: 3 });
    assert!(elapsed >= Duration::from_millis(140), "elapsed {:?}", elapsed);
    assert_eq!(q.pending(), vec![t.source().to_path_buf()]);
}

#[test]
fn cancelled_wait_records_retry_waiting() {
    let s = scratch(&[("wait.bin", b"waiting")]);
    let agg = ErrorAggregator::new();
    let q = Quarantine::new(&s.quarantine, QuarantineMode::Immediate);
    let cancel = CancelToken::new();
    let t = task(&s, "wait.bin", policy(3, 60_000, Backoff::Fixed));

    let canceller = {
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        })
    };
    let start = Instant::now();
    let outcome = RetryController::new(&Corrupting::new(), &agg, &q, &cancel).run(&t, None);
    canceller.join().unwrap();

    assert_eq!(outcome, TaskOutcome::Interrupted { attempts: 1 });
    assert!(start.elapsed() < Duration::from_secs(30));
    let recs = agg.records_for(&key_for(t.source()));
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].kind, ErrorKind::RetryWaiting);
    assert!(t.source().exists());
    assert!(!s.quarantine.exists());
}

#[test]
fn missing_source_is_abandoned_without_retry() {
    let s = scratch(&[("gone.txt", b"soon gone")]);
    let t = task(&s, "gone.txt", policy(3, 10_000, Backoff::Fixed));
    std::fs::remove_file(t.source()).unwrap();
    let agg = ErrorAggregator::new();
    let q = Quarantine::new(&s.quarantine, QuarantineMode::Immediate);
    let cancel = CancelToken::new();

    let start = Instant::now();
    let outcome = RetryController::new(&LocalTransfer, &agg, &q, &cancel).run(&t, None);

    assert_eq!(outcome, TaskOutcome::Abandoned { kind: ErrorKind::Exist });
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(agg.total_records(), 1);
    assert!(!s.quarantine.exists());
}

#[test]
fn batch_with_corruption_quarantines_every_file_once() {
    let s = scratch(&[("a", b"1"), ("b", b"22"), ("c", b"333")]);
    let opts = BatchOptions {
        workers: Some(2),
        retry: policy(2, 1, Backoff::Fixed),
        transfer: Arc::new(Corrupting::new()),
        ..BatchOptions::default()
    };
    let agg = ErrorAggregator::new();
    let report = replicate_directory(&s.source_dir, &s.target_dir, &opts, &agg);

    assert_eq!(report.quarantined, 3);
    assert_eq!(agg.count_kind(ErrorKind::CopyIntegrity), 3);
    assert_eq!(agg.total_records(), 3);
    // default location is a sibling of the source directory
    for name in ["a", "b", "c"] {
        assert!(s.quarantine.join(name).exists(), "{} not quarantined", name);
        assert!(!s.source_dir.join(name).exists());
    }
}

#[test]
fn deferred_quarantine_moves_after_join() {
    let s = scratch(&[("late1", b"l1"), ("late2", b"l2")]);
    let custom = s.source_dir.parent().unwrap().join("held");
    let opts = BatchOptions {
        workers: Some(2),
        retry: policy(0, 1, Backoff::Fixed),
        quarantine_dir: Some(custom.clone()),
        quarantine_mode: QuarantineMode::Deferred,
        transfer: Arc::new(Corrupting::new()),
        ..BatchOptions::default()
    };
    let agg = ErrorAggregator::new();
    let report = replicate_directory(&s.source_dir, &s.target_dir, &opts, &agg);

    assert_eq!(report.quarantined, 2);
    assert!(custom.join("late1").exists());
    assert!(custom.join("late2").exists());
    assert_eq!(agg.count_kind(ErrorKind::CopyIntegrity), 2);
}

#[test]
fn deadline_interrupts_and_cancels_the_rest() {
    let s = scratch(&[("d1", b"1"), ("d2", b"2"), ("d3", b"3")]);
    let opts = BatchOptions {
        workers: Some(1),
        retry: policy(3, 60_000, Backoff::Fixed),
        deadline: Some(Duration::from_millis(200)),
        transfer: Arc::new(Corrupting::new()),
        ..BatchOptions::default()
    };
    let agg = ErrorAggregator::new();
    let start = Instant::now();
    let report = replicate_directory(&s.source_dir, &s.target_dir, &opts, &agg);

    assert!(start.elapsed() < Duration::from_secs(30));
    assert_eq!(report.files, 3);
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.cancelled, 2);
    assert_eq!(agg.count_kind(ErrorKind::RetryWaiting), 1);
    assert_eq!(agg.count_kind(ErrorKind::Cancelled), 2);
    assert!(!s.quarantine.exists());
}

#[test]
fn options_are_reusable_after_a_deadline() {
    let s = scratch(&[("r1", b"1"), ("r2", b"2")]);
    let opts = BatchOptions {
        workers: Some(1),
        retry: policy(3, 60_000, Backoff::Fixed),
        deadline: Some(Duration::from_millis(100)),
        transfer: Arc::new(Corrupting::new()),
        ..BatchOptions::default()
    };
    let agg = ErrorAggregator::new();
    let first = replicate_directory(&s.source_dir, &s.target_dir, &opts, &agg);
    assert_eq!(first.interrupted + first.cancelled, 2);
    assert!(!opts.cancel.is_cancelled());

    let again = BatchOptions { deadline: None, transfer: Arc::new(LocalTransfer), ..opts.clone() };
    let agg = ErrorAggregator::new();
    let second = replicate_directory(&s.source_dir, &s.target_dir, &again, &agg);
    assert!(agg.is_empty(), "{:?}", agg.snapshot());
    assert_eq!(second.verified, 2);
}

#[test]
fn cancelling_the_callers_token_still_stops_a_batch() {
    let s = scratch(&[("c1", b"1"), ("c2", b"2")]);
    let opts = BatchOptions { workers: Some(1), ..BatchOptions::default() };
    opts.cancel.cancel();
    let agg = ErrorAggregator::new();
    let report = replicate_directory(&s.source_dir, &s.target_dir, &opts, &agg);
    assert_eq!(report.cancelled, 2);
    assert_eq!(agg.count_kind(ErrorKind::Cancelled), 2);
}
