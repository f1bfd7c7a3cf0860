use bevy::prelude::*;
use bevy::utils::Instant;

use crate::dispatch::DispatchGuard;
use crate::drag::DragUpdate;
use crate::error::SimError;
use crate::host::{HostHooks, StatusLine};
use crate::replay::{FrameSnapshot, Recorder};
use crate::script::{EventArgs, ScriptBackend, ScriptEventKind};
use crate::session::Session;
use crate::simulator::Simulator;
use crate::stats::Phase;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// No session.
    Idle,
    WarmingUp,
    Paused,
    Advanced { frame: u64 },
    /// A script stopped the session during this tick.
    Stopped,
}

/// Returns early from the frame once a script asked the session to stop.
macro_rules! bail_unless_live {
    ($session:expr) => {
        if !$session.is_live() {
            return Ok($session.frame);
        }
    };
}

impl Simulator {
    /// Runs one timer firing. An error has already torn the session down when returned.
    pub fn tick(&mut self) -> Result<TickOutcome, SimError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(TickOutcome::Idle);
        };

        if session.warmup_remaining > 0 {
            session.warmup_remaining -= 1;
            return Ok(TickOutcome::WarmingUp);
        }

        if session.paused != session.was_paused {
            session.was_paused = session.paused;
            if session.paused {
                session.stats.pause();
                self.host.pause_audio();
            } else {
                session.stats.resume();
                self.host.resume_audio();
            }
        }
        if session.paused {
            publish_status(session, self.host.as_mut());
            return Ok(TickOutcome::Paused);
        }

        let result = run_frame(
            session,
            self.host.as_mut(),
            self.scripts.as_mut(),
            &mut self.recorder,
            self.config.record,
        );
        let frame = self.settle(result)?;
        if self.session.is_none() {
            return Ok(TickOutcome::Stopped);
        }
        Ok(TickOutcome::Advanced { frame })
    }

    /// Ticks `count` times, stopping early when the session ends.
    pub fn run_ticks(&mut self, count: u64) -> Result<u64, SimError> {
        let mut advanced = 0;
        for _ in 0..count {
            match self.tick()? {
                TickOutcome::Advanced { .. } => advanced += 1,
                TickOutcome::Idle | TickOutcome::Stopped => break,
                TickOutcome::WarmingUp | TickOutcome::Paused => {}
            }
        }
        Ok(advanced)
    }
}

/// One frame of the pipeline; returns the frame number it ran.
fn run_frame(
    session: &mut Session,
    host: &mut dyn HostHooks,
    scripts: &mut dyn ScriptBackend,
    recorder: &mut Option<Box<dyn Recorder>>,
    record: bool,
) -> Result<u64, SimError> {
    session.overlay.clear();
    session.frame += 1;
    let frame = session.frame;

    let started = Instant::now();
    session.dispatch_all(
        ScriptEventKind::PreUpdate,
        &EventArgs::None,
        host,
        DispatchGuard::WhileLive,
    )?;
    session.stats.current.add(Phase::Dispatch, started.elapsed());
    bail_unless_live!(session);

    let started = Instant::now();
    session.actuators.prune_invalid(session.world.as_ref());
    let tick = session.tick_context();
    session
        .actuators
        .evaluate_thrusters(session.world.as_mut(), scripts, &tick)?;
    let spawned = session.actuators.evaluate_emitters(
        session.world.as_mut(),
        scripts,
        &tick,
        &mut session.emissions,
    )?;
    for (body, source) in spawned {
        host.spawn_visual(body, source);
    }
    session.buoyancy.apply(session.world.as_mut());
    session
        .actuators
        .evaluate_joints(session.world.as_mut(), scripts, &tick)?;
    session.stats.current.add(Phase::Script, started.elapsed());

    session.stats.measure(Phase::Physics, || {
        session
            .world
            .step(session.update_timestep, session.update_rate);
        for body in session.world.drain_moved() {
            if let Ok(pose) = session.world.pose(body) {
                host.sync_visual(body, &pose);
            }
        }
    });

    let started = Instant::now();
    let contacts = session.world.drain_contacts();
    session.dispatch_contacts(&contacts, host)?;
    bail_unless_live!(session);
    for kind in [ScriptEventKind::Update, ScriptEventKind::PostUpdate] {
        session.dispatch_all(kind, &EventArgs::None, host, DispatchGuard::WhileLive)?;
        bail_unless_live!(session);
    }
    session.stats.current.add(Phase::Dispatch, started.elapsed());

    let tick_seconds = session.tick_seconds();
    host.advance_audio(tick_seconds);

    session
        .emissions
        .reap(session.world.as_mut(), frame, |body| host.despawn_visual(body));

    if let Some(binding) = session.camera {
        match binding.view(session.world.as_ref()) {
            Some((eye, target)) => {
                session.view = (eye, target);
                host.set_camera(eye, target);
            }
            None => {
                debug!("[Simdrive camera] Followed body {} is gone", binding.body);
                session.camera = None;
            }
        }
    }

    let strength = session.drag_stiffness * session.update_rate as f32;
    if session.drag.update(session.world.as_mut(), host, strength) == DragUpdate::Invalidated {
        info!("[Simdrive drag] Drag cancelled at frame {}", frame);
    }

    let bodies = session.world.bodies().len();
    session.stats.record_tick(Instant::now(), frame, bodies);
    publish_status(session, host);

    if let Some(transition) = session.transition.as_mut() {
        let (eye, target) = transition.advance(tick_seconds);
        let finished = transition.is_finished();
        session.view = (eye, target);
        host.set_camera(eye, target);
        if finished {
            session.transition = None;
        }
    }

    if record {
        if let Some(recorder) = recorder.as_mut() {
            let snapshot = FrameSnapshot::capture(session.world.as_ref(), frame);
            recorder.record_frame(frame, &snapshot);
        }
    }

    host.request_redraw(session.overlay.shapes());
    Ok(frame)
}

fn publish_status(session: &Session, host: &mut dyn HostHooks) {
    host.show_status(&StatusLine {
        frame: session.frame,
        fps: session.stats.fps,
        bodies: session.world.bodies().len(),
        paused: session.paused,
    });
}
