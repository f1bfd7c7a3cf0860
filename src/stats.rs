use std::collections::VecDeque;
use std::time::Duration;

use bevy::utils::Instant;
use serde::Serialize;

const FPS_WINDOW_TICKS: usize = 60;

/// Wall-clock milliseconds spent in each pipeline phase during one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PhaseTimings {
    pub script_ms: f32,
    pub physics_ms: f32,
    pub dispatch_ms: f32,
}

impl PhaseTimings {
    pub fn total_ms(&self) -> f32 {
        self.script_ms + self.physics_ms + self.dispatch_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Script,
    Physics,
    Dispatch,
}

impl PhaseTimings {
    pub fn add(&mut self, phase: Phase, elapsed: Duration) {
        let ms = elapsed.as_secs_f32() * 1000.0;
        match phase {
            Phase::Script => self.script_ms += ms,
            Phase::Physics => self.physics_ms += ms,
            Phase::Dispatch => self.dispatch_ms += ms,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TimingSample {
    pub seq: u64,
    pub frame: u64,
    pub fps: f32,
    pub bodies: usize,
    pub timings: PhaseTimings,
}

#[derive(Clone, Debug, Serialize)]
pub struct TimingHistory {
    pub samples: Vec<TimingSample>,
    pub capacity: usize,
    pub dropped_samples: u64,
    #[serde(skip)]
    next_seq: u64,
}

impl TimingHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity: capacity.max(1),
            dropped_samples: 0,
            next_seq: 1,
        }
    }

    fn push(&mut self, frame: u64, fps: f32, bodies: usize, timings: PhaseTimings) {
        self.samples.push(TimingSample {
            seq: self.next_seq,
            frame,
            fps,
            bodies,
            timings,
        });
        self.next_seq = self.next_seq.saturating_add(1);
        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(0..excess);
            self.dropped_samples = self.dropped_samples.saturating_add(excess as u64);
        }
    }
}

/// Rolling FPS over the last ticks plus per-phase timings.
#[derive(Clone, Debug, Serialize)]
pub struct TimingStats {
    pub fps: f32,
    pub ticks: u64,
    pub current: PhaseTimings,
    pub last: PhaseTimings,
    pub history: TimingHistory,
    #[serde(skip)]
    window: VecDeque<Instant>,
}

impl TimingStats {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            fps: 0.0,
            ticks: 0,
            current: PhaseTimings::default(),
            last: PhaseTimings::default(),
            history: TimingHistory::new(history_capacity),
            window: VecDeque::with_capacity(FPS_WINDOW_TICKS + 1),
        }
    }

    /// Times `f` and charges it to `phase` for the current tick.
    pub fn measure<R>(&mut self, phase: Phase, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.current.add(phase, started.elapsed());
        result
    }

    /// Drops the rolling window so the pause gap never counts toward FPS.
    pub fn pause(&mut self) {
        self.window.clear();
        self.fps = 0.0;
    }

    pub fn resume(&mut self) {
        self.window.clear();
        self.current = PhaseTimings::default();
    }

    pub fn record_tick(&mut self, now: Instant, frame: u64, bodies: usize) {
        self.ticks += 1;
        self.window.push_back(now);
        while self.window.len() > FPS_WINDOW_TICKS {
            self.window.pop_front();
        }
        if let (Some(first), Some(last)) = (self.window.front(), self.window.back()) {
            let span = last.duration_since(*first).as_secs_f32();
            if self.window.len() > 1 && span > 0.0 {
                self.fps = (self.window.len() - 1) as f32 / span;
            }
        }
        self.last = std::mem::take(&mut self.current);
        self.history.push(frame, self.fps, bodies, self.last);
    }
}
