// src/phase.rs
//
// Phase labels, the per-job phase schedule, and the shared cell workers read
// to learn which phase is current.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use crate::order::PhaseTiming;

/// Which operation a phase drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Write,
    Read,
}

/// One timed slice of the run.
///
/// Stored in an `AtomicU8` by [`PhaseCell`], hence the explicit discriminants.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum Phase {
    WriteRampUp = 0,
    WriteMeasure = 1,
    WriteRampDown = 2,
    ReadRampUp = 3,
    ReadMeasure = 4,
    ReadRampDown = 5,
}

impl Phase {
    pub const COUNT: usize = 6;

    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::WriteRampUp,
        Phase::WriteMeasure,
        Phase::WriteRampDown,
        Phase::ReadRampUp,
        Phase::ReadMeasure,
        Phase::ReadRampDown,
    ];

    /// Operations completing after the clock stops are attributed here.
    pub const LAST: Phase = Phase::ReadRampDown;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(value: u8) -> Option<Phase> {
        Phase::ALL.get(value as usize).copied()
    }

    pub fn stage(self) -> Stage {
        match self {
            Phase::WriteRampUp | Phase::WriteMeasure | Phase::WriteRampDown => Stage::Write,
            Phase::ReadRampUp | Phase::ReadMeasure | Phase::ReadRampDown => Stage::Read,
        }
    }

    /// Ramp phases run the same operations but stay out of the measurement.
    pub fn is_measurement(self) -> bool {
        matches!(self, Phase::WriteMeasure | Phase::ReadMeasure)
    }

    pub fn measurement(stage: Stage) -> Phase {
        match stage {
            Stage::Write => Phase::WriteMeasure,
            Stage::Read => Phase::ReadMeasure,
        }
    }
}

/// Ordered phases with their durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSchedule {
    steps: Vec<(Phase, Duration)>,
}

impl PhaseSchedule {
    pub fn new(timing: &PhaseTiming) -> Self {
        let steps = Phase::ALL
            .iter()
            .map(|&p| {
                let d = match p {
                    Phase::WriteRampUp | Phase::ReadRampUp => timing.ramp_up,
                    Phase::WriteMeasure | Phase::ReadMeasure => timing.run_time,
                    Phase::WriteRampDown | Phase::ReadRampDown => timing.ramp_down,
                };
                (p, d)
            })
            .collect();
        Self { steps }
    }

    pub fn steps(&self) -> &[(Phase, Duration)] {
        &self.steps
    }

    pub fn total(&self) -> Duration {
        self.steps.iter().map(|(_, d)| *d).sum()
    }

    pub fn duration_of(&self, phase: Phase) -> Duration {
        self.steps
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, d)| *d)
            .unwrap_or_default()
    }

    /// Offset from the schedule start at which `phase` begins.
    pub fn start_of(&self, phase: Phase) -> Duration {
        self.steps
            .iter()
            .take_while(|(p, _)| *p != phase)
            .map(|(_, d)| *d)
            .sum()
    }

    /// Phase active `elapsed` after the start; `None` once the schedule is over.
    /// A phase owns its half-open window `[start, start + duration)`, so
    /// zero-length phases never match.
    pub fn phase_at(&self, elapsed: Duration) -> Option<Phase> {
        let mut end = Duration::ZERO;
        for (p, d) in &self.steps {
            end += *d;
            if elapsed < end {
                return Some(*p);
            }
        }
        None
    }
}

const DONE: u8 = u8::MAX;

#[derive(Debug)]
struct CellShared {
    label: AtomicU8,
    paused: AtomicBool,
    in_flight: AtomicUsize,
    resumed: Notify,
    idle: Notify,
}

/// Phase label shared between the foreman's clock and its workers.
///
/// Workers call [`PhaseCell::begin`] before each operation (to pick put or
/// get) and read [`PhaseCell::current`] on completion (to pick the bucket).
/// They only ever wait while the cell is paused between stages.
#[derive(Debug, Clone)]
pub struct PhaseCell(Arc<CellShared>);

/// One registered operation; dropping it marks the operation finished.
#[derive(Debug)]
pub struct InFlight(Arc<CellShared>);

impl InFlight {
    fn enter(shared: &Arc<CellShared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl PhaseCell {
    pub fn new(initial: Phase) -> Self {
        Self(Arc::new(CellShared {
            label: AtomicU8::new(initial as u8),
            paused: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            resumed: Notify::new(),
            idle: Notify::new(),
        }))
    }

    /// Switch phase; also lifts a pause.
    pub fn set(&self, phase: Phase) {
        self.0.label.store(phase as u8, Ordering::SeqCst);
        self.resume();
    }

    /// Tell workers to stop issuing new operations.
    pub fn finish(&self) {
        self.0.label.store(DONE, Ordering::SeqCst);
        self.resume();
    }

    /// Hold new operations until the next [`PhaseCell::set`]. The label is
    /// kept, so operations still in flight land in the phase they started in.
    pub fn pause(&self) {
        self.0.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.0.paused.store(false, Ordering::SeqCst);
        self.0.resumed.notify_waiters();
    }

    /// `None` after [`PhaseCell::finish`].
    #[inline]
    pub fn current(&self) -> Option<Phase> {
        Phase::from_index(self.0.label.load(Ordering::SeqCst))
    }

    /// Operations registered and not yet dropped.
    pub fn in_flight(&self) -> usize {
        self.0.in_flight.load(Ordering::SeqCst)
    }

    /// Register the next operation, waiting out a pause. `None` once finished.
    pub async fn begin(&self) -> Option<(Phase, InFlight)> {
        loop {
            let resumed = self.0.resumed.notified();
            // Registered before the pause check, so `drained` cannot miss it.
            let op = InFlight::enter(&self.0);
            if !self.0.paused.load(Ordering::SeqCst) {
                return self.current().map(|phase| (phase, op));
            }
            drop(op);
            if self.current().is_none() {
                return None;
            }
            resumed.await;
        }
    }

    /// Resolves once no registered operation is left. Meant for use after
    /// [`PhaseCell::pause`]; otherwise new operations keep arriving.
    pub async fn drained(&self) {
        loop {
            let idle = self.0.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip() {
        for p in Phase::ALL {
            assert_eq!(p.to_string().parse::<Phase>().unwrap(), p);
            assert_eq!(Phase::from_index(p as u8), Some(p));
        }
        assert_eq!(Phase::WriteRampUp.to_string(), "write-ramp-up");
        assert_eq!(Phase::from_index(6), None);
    }

    #[test]
    fn test_stages_and_measurement_flags() {
        assert_eq!(Phase::WriteRampDown.stage(), Stage::Write);
        assert_eq!(Phase::ReadRampUp.stage(), Stage::Read);
        let measured: Vec<Phase> = Phase::ALL.into_iter().filter(|p| p.is_measurement()).collect();
        assert_eq!(measured, vec![Phase::WriteMeasure, Phase::ReadMeasure]);
    }

    #[test]
    fn test_schedule_boundaries() {
        // rampUp=5, runTime=30, rampDown=2: measurement covers [5s, 35s).
        let s = PhaseSchedule::new(&PhaseTiming::from_secs(30, 5, 2));
        let secs = Duration::from_secs;
        assert_eq!(s.total(), secs(74));
        assert_eq!(s.phase_at(secs(0)), Some(Phase::WriteRampUp));
        assert_eq!(s.phase_at(Duration::from_millis(4_999)), Some(Phase::WriteRampUp));
        assert_eq!(s.phase_at(secs(5)), Some(Phase::WriteMeasure));
        assert_eq!(s.phase_at(Duration::from_millis(34_999)), Some(Phase::WriteMeasure));
        assert_eq!(s.phase_at(secs(35)), Some(Phase::WriteRampDown));
        assert_eq!(s.phase_at(secs(37)), Some(Phase::ReadRampUp));
        assert_eq!(s.phase_at(secs(42)), Some(Phase::ReadMeasure));
        assert_eq!(s.phase_at(secs(72)), Some(Phase::ReadRampDown));
        assert_eq!(s.phase_at(secs(74)), None);
        assert_eq!(s.start_of(Phase::ReadMeasure), secs(42));
        assert_eq!(s.duration_of(Phase::ReadMeasure), secs(30));
    }

    #[test]
    fn test_zero_length_ramps_are_skipped() {
        let s = PhaseSchedule::new(&PhaseTiming::from_secs(10, 0, 0));
        assert_eq!(s.phase_at(Duration::ZERO), Some(Phase::WriteMeasure));
        assert_eq!(s.phase_at(Duration::from_secs(10)), Some(Phase::ReadMeasure));
    }

    #[test]
    fn test_phase_cell() {
        let cell = PhaseCell::new(Phase::WriteRampUp);
        let seen_by_worker = cell.clone();
        assert_eq!(seen_by_worker.current(), Some(Phase::WriteRampUp));
        cell.set(Phase::ReadMeasure);
        assert_eq!(seen_by_worker.current(), Some(Phase::ReadMeasure));
        cell.finish();
        assert_eq!(seen_by_worker.current(), None);
    }

    #[tokio::test]
    async fn test_begin_counts_operations_in_flight() {
        let cell = PhaseCell::new(Phase::WriteMeasure);
        let (phase, op) = cell.begin().await.unwrap();
        assert_eq!(phase, Phase::WriteMeasure);
        assert_eq!(cell.in_flight(), 1);
        drop(op);
        assert_eq!(cell.in_flight(), 0);
        cell.finish();
        assert!(cell.begin().await.is_none());
        assert_eq!(cell.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_holds_new_operations_and_drains_old_ones() {
        let cell = PhaseCell::new(Phase::WriteRampDown);
        let (_, late_write) = cell.begin().await.unwrap();
        cell.pause();

        let worker = cell.clone();
        let next = tokio::spawn(async move { worker.begin().await.map(|(p, _)| p) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!next.is_finished(), "paused cell handed out an operation");

        let drain = cell.clone();
        let drained = tokio::spawn(async move { drain.drained().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drained.is_finished(), "drained while a write was in flight");
        // Completion during the pause still reads the write phase.
        assert_eq!(cell.current(), Some(Phase::WriteRampDown));
        drop(late_write);
        drained.await.unwrap();

        cell.set(Phase::ReadRampUp);
        assert_eq!(next.await.unwrap(), Some(Phase::ReadRampUp));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finish_releases_paused_workers() {
        let cell = PhaseCell::new(Phase::WriteMeasure);
        cell.pause();
        let worker = cell.clone();
        let waiting = tokio::spawn(async move { worker.begin().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cell.finish();
        assert!(waiting.await.unwrap());
    }
}
