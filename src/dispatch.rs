use bevy::prelude::*;

use crate::error::SimError;
use crate::host::HostHooks;
use crate::overlay::DebugShape;
use crate::physics::{BodyHandle, ContactEvent, ContactPhase};
use crate::script::{EventArgs, HandlerContext, ScriptEventKind, SimCommand};
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchGuard {
    /// Stop at the first failure or as soon as the session stops being live.
    WhileLive,
    /// Reach every body even after failures; the first error is returned at the end.
    Always,
}

fn contact_event_kind(phase: ContactPhase) -> ScriptEventKind {
    match phase {
        ContactPhase::Began => ScriptEventKind::Touch,
        ContactPhase::Persisting => ScriptEventKind::Touching,
        ContactPhase::Ended => ScriptEventKind::Untouch,
    }
}

impl Session {
    /// Sends `kind` to every scripted body in world iteration order.
    pub fn dispatch_all(
        &mut self,
        kind: ScriptEventKind,
        args: &EventArgs,
        host: &mut dyn HostHooks,
        guard: DispatchGuard,
    ) -> Result<(), SimError> {
        let mut first_error = None;
        for body in self.world.bodies() {
            if guard == DispatchGuard::WhileLive && !self.is_live() {
                break;
            }
            if !self.world.is_valid(body) {
                continue;
            }
            if let Err(err) = self.dispatch_to(body, kind, args, host) {
                match guard {
                    DispatchGuard::WhileLive => return Err(err),
                    DispatchGuard::Always => {
                        warn!("[Simdrive dispatch] {}", err);
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Invokes one body's handler; `Ok(false)` when it has none or scripting is disabled.
    pub fn dispatch_to(
        &mut self,
        body: BodyHandle,
        kind: ScriptEventKind,
        args: &EventArgs,
        host: &mut dyn HostHooks,
    ) -> Result<bool, SimError> {
        let Some(script) = self.scripts.get(&body) else {
            return Ok(false);
        };
        if !script.is_enabled() || !script.has_handler(kind) {
            return Ok(false);
        }
        let script = script.clone();
        let mut commands = Vec::new();
        let mut ctx = HandlerContext {
            body,
            frame: self.frame,
            event: kind,
            args,
            commands: &mut commands,
        };
        let invoked = script
            .invoke(&mut ctx)
            .map_err(|error| SimError::EventCallback {
                event: kind,
                body,
                error,
            })?;
        self.apply_commands(commands, host);
        Ok(invoked)
    }

    /// Delivers each contact to both bodies, the other body as argument.
    pub fn dispatch_contacts(
        &mut self,
        contacts: &[ContactEvent],
        host: &mut dyn HostHooks,
    ) -> Result<(), SimError> {
        for contact in contacts {
            let kind = contact_event_kind(contact.phase);
            let sides = [
                (contact.a, contact.b, contact.normal),
                (contact.b, contact.a, -contact.normal),
            ];
            for (body, other, normal) in sides {
                if !self.is_live() {
                    return Ok(());
                }
                if !self.world.is_valid(body) {
                    continue;
                }
                let args = EventArgs::Contact {
                    other,
                    point: contact.point,
                    normal,
                    impulse: contact.impulse,
                };
                self.dispatch_to(body, kind, &args, host)?;
            }
        }
        Ok(())
    }

    pub fn apply_commands(&mut self, commands: Vec<SimCommand>, host: &mut dyn HostHooks) {
        for command in commands {
            match command {
                SimCommand::DestroyBody(body) => {
                    if let Err(err) = self.destroy_body(body, host) {
                        debug!("[Simdrive dispatch] destroy ignored: {}", err);
                    }
                }
                SimCommand::StopSession => {
                    info!("[Simdrive session] Stop requested by script at frame {}", self.frame);
                    self.stop_requested = true;
                }
                SimCommand::ApplyForce { body, force } => {
                    if let Err(err) = self.world.add_force(body, force) {
                        debug!("[Simdrive dispatch] push ignored: {}", err);
                    }
                }
                SimCommand::SetScriptEnabled { body, enabled } => {
                    if let Some(script) = self.scripts.get_mut(&body) {
                        script.set_enabled(enabled);
                    }
                }
                SimCommand::DebugLine { from, to } => {
                    self.overlay.push(DebugShape::Line { from, to }, self.frame);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::error::ScriptError;
    use crate::host::{NullHost, ViewSnapshot};
    use crate::physics::{BasicWorld, BodyDesc, Pose, Shape, WorldSettings};
    use crate::script::{BodyScript, EventHandler};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn session_with_bodies(count: usize) -> (Session, Vec<BodyHandle>) {
        let mut session = Session::new(
            &SimulationConfig::default(),
            Box::new(BasicWorld::new(WorldSettings::default())),
            ViewSnapshot::default(),
        );
        let bodies = (0..count)
            .map(|i| {
                session.world.create_body(&BodyDesc::new(
                    Shape::Sphere { radius: 0.5 },
                    Pose::from_translation(Vec3::X * (i as f32 * 5.0)),
                ))
            })
            .collect();
        (session, bodies)
    }

    fn logging_script(log: &Rc<RefCell<Vec<(BodyHandle, ScriptEventKind)>>>) -> BodyScript {
        let mut script = BodyScript::new("logger");
        for kind in ScriptEventKind::ALL {
            let log = log.clone();
            script.set_handler(
                kind,
                EventHandler::native(move |ctx| {
                    log.borrow_mut().push((ctx.body, ctx.event));
                    Ok(())
                }),
            );
        }
        script
    }

    #[test]
    fn dispatch_follows_world_order_and_skips_unscripted_bodies() {
        let (mut session, bodies) = session_with_bodies(3);
        let log = Rc::new(RefCell::new(Vec::new()));
        session.scripts.insert(bodies[2], logging_script(&log));
        session.scripts.insert(bodies[0], logging_script(&log));

        session
            .dispatch_all(
                ScriptEventKind::Update,
                &EventArgs::None,
                &mut NullHost,
                DispatchGuard::WhileLive,
            )
            .expect("dispatch");
        assert_eq!(
            *log.borrow(),
            vec![
                (bodies[0], ScriptEventKind::Update),
                (bodies[2], ScriptEventKind::Update)
            ]
        );
    }

    #[test]
    fn stop_short_circuits_remaining_bodies() {
        let (mut session, bodies) = session_with_bodies(2);
        let log = Rc::new(RefCell::new(Vec::new()));
        session.scripts.insert(
            bodies[0],
            BodyScript::new("stopper").with_handler(
                ScriptEventKind::Update,
                EventHandler::native(|ctx| {
                    ctx.stop();
                    Ok(())
                }),
            ),
        );
        session.scripts.insert(bodies[1], logging_script(&log));
        session
            .dispatch_all(
                ScriptEventKind::Update,
                &EventArgs::None,
                &mut NullHost,
                DispatchGuard::WhileLive,
            )
            .expect("dispatch");
        assert!(!session.is_live());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn always_guard_reaches_everyone_and_reports_first_error() {
        let (mut session, bodies) = session_with_bodies(2);
        let log = Rc::new(RefCell::new(Vec::new()));
        session.scripts.insert(
            bodies[0],
            BodyScript::new("broken").with_handler(
                ScriptEventKind::End,
                EventHandler::native(|_| Err(ScriptError::new("broken", "bad end"))),
            ),
        );
        session.scripts.insert(bodies[1], logging_script(&log));
        let err = session
            .dispatch_all(
                ScriptEventKind::End,
                &EventArgs::None,
                &mut NullHost,
                DispatchGuard::Always,
            )
            .expect_err("first error surfaces");
        assert!(matches!(err, SimError::EventCallback { event: ScriptEventKind::End, .. }));
        assert_eq!(*log.borrow(), vec![(bodies[1], ScriptEventKind::End)]);
    }

    #[test]
    fn contacts_reach_both_sides_with_the_other_body() {
        let (mut session, bodies) = session_with_bodies(2);
        let seen = Rc::new(RefCell::new(Vec::new()));
        for body in &bodies {
            let seen = seen.clone();
            session.scripts.insert(
                *body,
                BodyScript::new("toucher").with_handler(
                    ScriptEventKind::Touch,
                    EventHandler::native(move |ctx| {
                        if let EventArgs::Contact { other, .. } = ctx.args {
                            seen.borrow_mut().push((ctx.body, *other));
                        }
                        Ok(())
                    }),
                ),
            );
        }
        let contact = ContactEvent {
            a: bodies[0],
            b: bodies[1],
            phase: ContactPhase::Began,
            point: Vec3::ZERO,
            normal: Vec3::X,
            impulse: 0.0,
        };
        session
            .dispatch_contacts(&[contact], &mut NullHost)
            .expect("dispatch");
        assert_eq!(
            *seen.borrow(),
            vec![(bodies[0], bodies[1]), (bodies[1], bodies[0])]
        );
    }

    #[test]
    fn commands_apply_after_the_callback() {
        let (mut session, bodies) = session_with_bodies(2);
        let victim = bodies[1];
        session.scripts.insert(
            bodies[0],
            BodyScript::new("boss").with_handler(
                ScriptEventKind::Update,
                EventHandler::native(move |ctx| {
                    ctx.destroy(victim);
                    ctx.set_script_enabled(ctx.body, false);
                    ctx.debug_line(Vec3::ZERO, Vec3::Y);
                    Ok(())
                }),
            ),
        );
        assert!(matches!(
            session.dispatch_to(bodies[0], ScriptEventKind::Update, &EventArgs::None, &mut NullHost),
            Ok(true)
        ));
        assert!(!session.world.is_valid(victim));
        assert_eq!(session.overlay.shapes().len(), 1);
        assert!(matches!(
            session.dispatch_to(bodies[0], ScriptEventKind::Update, &EventArgs::None, &mut NullHost),
            Ok(false)
        ));
    }
}
