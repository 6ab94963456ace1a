// src/worker.rs
//
// A worker owns one key sub-range and one connection, and issues operations
// back to back until the foreman's phase cell says stop. Each result is
// bucketed by the phase current when the operation *completes*. Between the
// write and read stages the cell is paused and the worker waits.

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::connection::Connection;
use crate::error::FailureClass;
use crate::keygen::KeyGenerator;
use crate::phase::{Phase, PhaseCell, Stage};
use crate::stats::PhaseStatsSet;

/// Operations between explicit yields, so a backend that never suspends
/// cannot starve the foreman's clock.
const YIELD_EVERY: u64 = 32;

/// What one worker is told to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    pub id: usize,
    pub target: String,
    pub range: Range<u64>,
}

/// Cycles through a range, remembering how far the first pass got.
#[derive(Debug, Clone)]
pub struct IndexCursor {
    range: Range<u64>,
    next: u64,
    visited: u64,
}

impl IndexCursor {
    pub fn new(range: Range<u64>) -> Self {
        Self {
            next: range.start,
            range,
            visited: 0,
        }
    }

    pub fn next_index(&mut self) -> u64 {
        let i = self.next;
        self.next += 1;
        if self.next >= self.range.end {
            self.next = self.range.start;
        }
        let len = self.range.end - self.range.start;
        if self.visited < len {
            self.visited += 1;
        }
        i
    }

    pub fn visited(&self) -> u64 {
        self.visited
    }

    /// Indices handed out at least once, or the whole range if none were.
    pub fn visited_range(&self) -> Range<u64> {
        if self.visited == 0 {
            self.range.clone()
        } else {
            self.range.start..self.range.start + self.visited
        }
    }
}

#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    pub stats: PhaseStatsSet,
    /// Distinct indices written at least once.
    pub written: u64,
}

pub struct Worker {
    plan: WorkerPlan,
    conn: Arc<dyn Connection>,
    keygen: KeyGenerator,
    object_size: usize,
    verify_content: bool,
    phase: PhaseCell,
}

impl Worker {
    pub fn new(
        plan: WorkerPlan,
        conn: Arc<dyn Connection>,
        keygen: KeyGenerator,
        object_size: usize,
        verify_content: bool,
        phase: PhaseCell,
    ) -> Self {
        Self {
            plan,
            conn,
            keygen,
            object_size,
            verify_content,
            phase,
        }
    }

    /// Runs until the phase cell is finished. Never fails: every operation
    /// error ends up in the returned counters.
    pub async fn run(self) -> WorkerReport {
        let Worker {
            plan,
            conn,
            keygen,
            object_size,
            verify_content,
            phase,
        } = self;
        debug!(
            "worker {} on {} owns [{}, {})",
            plan.id, plan.target, plan.range.start, plan.range.end
        );

        let mut stats = PhaseStatsSet::new();
        let mut writes = IndexCursor::new(plan.range.clone());
        let mut reads: Option<IndexCursor> = None;
        let mut buf = vec![0u8; object_size];
        let mut expected = if verify_content { vec![0u8; object_size] } else { Vec::new() };
        let mut ops: u64 = 0;

        while let Some((current, op)) = phase.begin().await {
            let outcome = match current.stage() {
                Stage::Write => {
                    let index = writes.next_index();
                    keygen.fill(index, &mut buf);
                    let key = keygen.key(index);
                    let start = Instant::now();
                    let res = conn.put(&key, index, &buf).await;
                    (start.elapsed(), res.map_err(|e| (e.class(), format!("put {key}: {e}"))))
                }
                Stage::Read => {
                    let cursor = reads.get_or_insert_with(|| IndexCursor::new(writes.visited_range()));
                    let index = cursor.next_index();
                    let key = keygen.key(index);
                    let start = Instant::now();
                    let res = conn.get(&key, index, &mut buf).await;
                    let elapsed = start.elapsed();
                    let res = match res {
                        Ok(()) if verify_content => {
                            keygen.fill(index, &mut expected);
                            if buf == expected {
                                Ok(())
                            } else {
                                Err((
                                    FailureClass::ContentMismatch,
                                    format!("get {key}: content differs from what was written"),
                                ))
                            }
                        }
                        Ok(()) => Ok(()),
                        Err(e) => Err((e.class(), format!("get {key}: {e}"))),
                    };
                    (elapsed, res)
                }
            };

            // Operations finishing after the clock stopped belong to the last phase.
            let done_in = phase.current().unwrap_or(Phase::LAST);
            let bucket = stats.get_mut(done_in);
            match outcome {
                (latency, Ok(())) => bucket.record_success(latency, object_size as u64),
                (_, Err((class, msg))) => {
                    debug!("worker {}: {}", plan.id, msg);
                    bucket.record_failure(class, msg);
                }
            }
            drop(op);

            ops += 1;
            if ops % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        debug!("worker {} stopped after {} operations", plan.id, ops);
        WorkerReport {
            id: plan.id,
            written: writes.visited(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnResult;
    use crate::error::ConnectionError;
    use crate::order::GeneratorType;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    #[test]
    fn test_cursor_cycles_and_tracks_prefix() {
        let mut c = IndexCursor::new(10..13);
        assert_eq!(c.visited_range(), 10..13);
        assert_eq!(c.next_index(), 10);
        assert_eq!(c.visited_range(), 10..11);
        let rest: Vec<u64> = (0..5).map(|_| c.next_index()).collect();
        assert_eq!(rest, vec![11, 12, 10, 11, 12]);
        assert_eq!(c.visited_range(), 10..13);
    }

    /// In-memory backend; `corrupt` flips a byte of every stored object.
    #[derive(Default)]
    struct MemConn {
        objects: Mutex<HashMap<String, Vec<u8>>>,
        corrupt: bool,
    }

    #[async_trait]
    impl Connection for MemConn {
        fn target(&self) -> &str {
            "mem"
        }
        async fn create_namespace(&self) -> ConnResult<()> {
            Ok(())
        }
        async fn delete_namespace(&self) -> ConnResult<()> {
            Ok(())
        }
        async fn put(&self, key: &str, _id: u64, buf: &[u8]) -> ConnResult<()> {
            let mut data = buf.to_vec();
            if self.corrupt {
                data[0] ^= 0xff;
            }
            self.objects.lock().unwrap().insert(key.to_string(), data);
            Ok(())
        }
        async fn get(&self, key: &str, _id: u64, buf: &mut [u8]) -> ConnResult<()> {
            let objects = self.objects.lock().unwrap();
            let data = objects
                .get(key)
                .ok_or_else(|| ConnectionError::NotFound(key.to_string()))?;
            buf.copy_from_slice(data);
            Ok(())
        }
    }

    async fn drive(conn: Arc<MemConn>, verify: bool) -> WorkerReport {
        let cell = PhaseCell::new(Phase::WriteMeasure);
        let worker = Worker::new(
            WorkerPlan {
                id: 0,
                target: "mem".into(),
                range: 0..50,
            },
            conn,
            KeyGenerator::new(GeneratorType::Prng, 5),
            64,
            verify,
            cell.clone(),
        );
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cell.set(Phase::ReadMeasure);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cell.finish();
        handle.await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reads_verify_written_content() {
        let report = drive(Arc::new(MemConn::default()), true).await;
        let w = report.stats.measurement(Stage::Write);
        let r = report.stats.measurement(Stage::Read);
        assert!(w.successes > 0);
        assert!(r.successes > 0);
        assert_eq!(r.failures, 0);
        assert_eq!(r.correctness_failures(), 0);
        assert!(report.written > 0 && report.written <= 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupted_content_is_a_correctness_failure() {
        let conn = Arc::new(MemConn {
            corrupt: true,
            ..Default::default()
        });
        let report = drive(Arc::clone(&conn), true).await;
        let r = report.stats.measurement(Stage::Read);
        assert_eq!(r.successes, 0);
        assert!(r.content_mismatches > 0);

        // Size-only checking cannot see it.
        let report = drive(conn, false).await;
        assert!(report.stats.measurement(Stage::Read).successes > 0);
    }

    /// Every put announces itself on `entered`, then blocks until the test
    /// adds a permit to `release`.
    struct GatedConn {
        entered: Notify,
        release: Semaphore,
    }

    #[async_trait]
    impl Connection for GatedConn {
        fn target(&self) -> &str {
            "gated"
        }
        async fn create_namespace(&self) -> ConnResult<()> {
            Ok(())
        }
        async fn delete_namespace(&self) -> ConnResult<()> {
            Ok(())
        }
        async fn put(&self, _key: &str, _id: u64, _buf: &[u8]) -> ConnResult<()> {
            self.entered.notify_one();
            self.release.acquire().await.unwrap().forget();
            Ok(())
        }
        async fn get(&self, _key: &str, _id: u64, _buf: &mut [u8]) -> ConnResult<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_results_land_in_the_phase_they_complete_in() {
        let conn = Arc::new(GatedConn {
            entered: Notify::new(),
            release: Semaphore::new(0),
        });
        let cell = PhaseCell::new(Phase::WriteRampUp);
        let worker = Worker::new(
            WorkerPlan {
                id: 0,
                target: "gated".into(),
                range: 0..10,
            },
            Arc::clone(&conn) as Arc<dyn Connection>,
            KeyGenerator::new(GeneratorType::Prng, 1),
            32,
            false,
            cell.clone(),
        );
        let handle = tokio::spawn(worker.run());

        // Issued during ramp-up, completes in the measurement.
        conn.entered.notified().await;
        cell.set(Phase::WriteMeasure);
        conn.release.add_permits(1);

        // Issued during the measurement, completes in ramp-down.
        conn.entered.notified().await;
        cell.set(Phase::WriteRampDown);
        conn.release.add_permits(1);

        // Issued during ramp-down, completes after the clock stopped.
        conn.entered.notified().await;
        cell.finish();
        conn.release.add_permits(1);

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        let stats = &report.stats;
        assert_eq!(stats.get(Phase::WriteRampUp).total_ops(), 0);
        assert_eq!(stats.get(Phase::WriteMeasure).successes, 1);
        assert_eq!(stats.get(Phase::WriteRampDown).successes, 1);
        assert_eq!(stats.get(Phase::LAST).successes, 1);

        // The measurement view holds only the one measured completion.
        let measured = stats.measurement(Stage::Write);
        assert_eq!(measured.total_ops(), 1);
        assert_eq!(measured.histogram().len(), 1);
        let all: u64 = stats.iter().map(|(_, s)| s.total_ops()).sum();
        assert_eq!(all, 3);
    }
}
