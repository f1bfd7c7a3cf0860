pub mod engine;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bevy::prelude::*;

use crate::error::ScriptError;
use crate::physics::BodyHandle;

pub use engine::RhaiRuntime;

/// Result of one controller-expression evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerValue {
    Nil,
    Scalar(f64),
    Vector(Vec3),
    /// Anything else; carries the type name for logging.
    Other(String),
}

impl ControllerValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ControllerValue::Scalar(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<Vec3> {
        match self {
            ControllerValue::Vector(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            ControllerValue::Nil => "nil",
            ControllerValue::Scalar(_) => "scalar",
            ControllerValue::Vector(_) => "vector",
            ControllerValue::Other(name) => name,
        }
    }
}

/// Body state visible to a controller expression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SubjectState {
    pub body: BodyHandle,
    pub position: Vec3,
    pub velocity: Vec3,
    pub spin: Vec3,
    pub mass: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Bindings {
    pub frame: u64,
    pub time: f64,
    pub dt: f32,
    pub subject: Option<SubjectState>,
}

pub trait Evaluator {
    /// Runs `source` once against `bindings`. `name` identifies the controller in errors.
    fn evaluate(
        &mut self,
        name: &str,
        source: &str,
        bindings: &Bindings,
    ) -> Result<ControllerValue, ScriptError>;
}

/// Full scripting surface used by a session: controller expressions plus body scripts.
pub trait ScriptBackend: Evaluator {
    /// Compiles a body script and runs its top level once.
    fn load_body_script(
        &mut self,
        name: &str,
        source: &str,
        body: BodyHandle,
        frame: u64,
    ) -> Result<BodyScript, ScriptError>;

    fn begin_session(&mut self, _seed: u64) {}

    fn end_session(&mut self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScriptEventKind {
    Start,
    End,
    Play,
    Pause,
    PreUpdate,
    Update,
    PostUpdate,
    Touch,
    Touching,
    Untouch,
    KeyDown,
    KeyUp,
    PickDown,
    PickUp,
}

impl ScriptEventKind {
    pub const COUNT: usize = 14;

    pub const ALL: [ScriptEventKind; Self::COUNT] = [
        ScriptEventKind::Start,
        ScriptEventKind::End,
        ScriptEventKind::Play,
        ScriptEventKind::Pause,
        ScriptEventKind::PreUpdate,
        ScriptEventKind::Update,
        ScriptEventKind::PostUpdate,
        ScriptEventKind::Touch,
        ScriptEventKind::Touching,
        ScriptEventKind::Untouch,
        ScriptEventKind::KeyDown,
        ScriptEventKind::KeyUp,
        ScriptEventKind::PickDown,
        ScriptEventKind::PickUp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn handler_name(self) -> &'static str {
        match self {
            ScriptEventKind::Start => "onStart",
            ScriptEventKind::End => "onEnd",
            ScriptEventKind::Play => "onPlay",
            ScriptEventKind::Pause => "onPause",
            ScriptEventKind::PreUpdate => "onPreUpdate",
            ScriptEventKind::Update => "onUpdate",
            ScriptEventKind::PostUpdate => "onPostUpdate",
            ScriptEventKind::Touch => "onTouch",
            ScriptEventKind::Touching => "onTouching",
            ScriptEventKind::Untouch => "onUntouch",
            ScriptEventKind::KeyDown => "onKeyDown",
            ScriptEventKind::KeyUp => "onKeyUp",
            ScriptEventKind::PickDown => "onPickDown",
            ScriptEventKind::PickUp => "onPickUp",
        }
    }

    pub fn from_handler_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.handler_name() == name)
    }
}

impl fmt::Display for ScriptEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handler_name())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum EventArgs {
    #[default]
    None,
    Contact {
        other: BodyHandle,
        point: Vec3,
        normal: Vec3,
        impulse: f32,
    },
    Key(String),
    Pick {
        point: Vec3,
    },
}

/// Side effects requested by a script, applied after the callback returns.
#[derive(Clone, Debug, PartialEq)]
pub enum SimCommand {
    DestroyBody(BodyHandle),
    StopSession,
    ApplyForce { body: BodyHandle, force: Vec3 },
    SetScriptEnabled { body: BodyHandle, enabled: bool },
    DebugLine { from: Vec3, to: Vec3 },
}

pub struct HandlerContext<'a> {
    pub body: BodyHandle,
    pub frame: u64,
    pub event: ScriptEventKind,
    pub args: &'a EventArgs,
    pub commands: &'a mut Vec<SimCommand>,
}

impl HandlerContext<'_> {
    pub fn destroy(&mut self, body: BodyHandle) {
        self.commands.push(SimCommand::DestroyBody(body));
    }

    pub fn stop(&mut self) {
        self.commands.push(SimCommand::StopSession);
    }

    pub fn push(&mut self, body: BodyHandle, force: Vec3) {
        self.commands.push(SimCommand::ApplyForce { body, force });
    }

    pub fn set_script_enabled(&mut self, body: BodyHandle, enabled: bool) {
        self.commands
            .push(SimCommand::SetScriptEnabled { body, enabled });
    }

    pub fn debug_line(&mut self, from: Vec3, to: Vec3) {
        self.commands.push(SimCommand::DebugLine { from, to });
    }
}

/// A compiled script function bound to one event slot.
pub trait ScriptCallable {
    fn call(&self, ctx: &mut HandlerContext) -> Result<(), ScriptError>;
}

type NativeFn = dyn FnMut(&mut HandlerContext) -> Result<(), ScriptError>;

#[derive(Clone)]
pub enum EventHandler {
    Native(Rc<RefCell<NativeFn>>),
    Script(Rc<dyn ScriptCallable>),
}

impl EventHandler {
    pub fn native<F>(f: F) -> Self
    where
        F: FnMut(&mut HandlerContext) -> Result<(), ScriptError> + 'static,
    {
        EventHandler::Native(Rc::new(RefCell::new(f)))
    }

    pub fn call(&self, ctx: &mut HandlerContext) -> Result<(), ScriptError> {
        match self {
            EventHandler::Native(f) => {
                let mut f = f.try_borrow_mut().map_err(|_| {
                    ScriptError::new("native", format!("{} re-entered", ctx.event))
                })?;
                (&mut *f)(ctx)
            }
            EventHandler::Script(callable) => callable.call(ctx),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventHandler::Native(_) => f.write_str("EventHandler::Native"),
            EventHandler::Script(_) => f.write_str("EventHandler::Script"),
        }
    }
}

/// Per-body script object: one optional handler per event kind.
#[derive(Clone, Debug)]
pub struct BodyScript {
    pub name: String,
    slots: [Option<EventHandler>; ScriptEventKind::COUNT],
    enabled: bool,
}

impl BodyScript {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: std::array::from_fn(|_| None),
            enabled: true,
        }
    }

    pub fn with_handler(mut self, kind: ScriptEventKind, handler: EventHandler) -> Self {
        self.set_handler(kind, handler);
        self
    }

    pub fn set_handler(&mut self, kind: ScriptEventKind, handler: EventHandler) {
        self.slots[kind.index()] = Some(handler);
    }

    pub fn clear_handler(&mut self, kind: ScriptEventKind) {
        self.slots[kind.index()] = None;
    }

    pub fn handler(&self, kind: ScriptEventKind) -> Option<&EventHandler> {
        self.slots[kind.index()].as_ref()
    }

    pub fn has_handler(&self, kind: ScriptEventKind) -> bool {
        self.slots[kind.index()].is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Runs the handler for `ctx.event`; `Ok(false)` when disabled or the slot is empty.
    pub fn invoke(&self, ctx: &mut HandlerContext) -> Result<bool, ScriptError> {
        if !self.enabled {
            return Ok(false);
        }
        let Some(handler) = self.handler(ctx.event) else {
            return Ok(false);
        };
        handler.call(ctx)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_names_round_trip() {
        for kind in ScriptEventKind::ALL {
            assert_eq!(ScriptEventKind::from_handler_name(kind.handler_name()), Some(kind));
        }
        assert_eq!(ScriptEventKind::ALL[ScriptEventKind::Touch.index()], ScriptEventKind::Touch);
        assert_eq!(ScriptEventKind::from_handler_name("update"), None);
        assert_eq!(ScriptEventKind::Untouch.to_string(), "onUntouch");
    }

    #[test]
    fn invoke_skips_empty_slots_and_disabled_scripts() {
        let calls = Rc::new(RefCell::new(0));
        let seen = calls.clone();
        let mut script = BodyScript::new("crate").with_handler(
            ScriptEventKind::Update,
            EventHandler::native(move |ctx| {
                *seen.borrow_mut() += 1;
                ctx.push(ctx.body, Vec3::Y);
                Ok(())
            }),
        );

        let mut commands = Vec::new();
        let args = EventArgs::None;
        let mut ctx = HandlerContext {
            body: BodyHandle(3),
            frame: 1,
            event: ScriptEventKind::Update,
            args: &args,
            commands: &mut commands,
        };
        assert_eq!(script.invoke(&mut ctx), Ok(true));
        ctx.event = ScriptEventKind::Touch;
        assert_eq!(script.invoke(&mut ctx), Ok(false));

        script.set_enabled(false);
        ctx.event = ScriptEventKind::Update;
        assert_eq!(script.invoke(&mut ctx), Ok(false));

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(
            commands,
            vec![SimCommand::ApplyForce {
                body: BodyHandle(3),
                force: Vec3::Y
            }]
        );
    }

    #[test]
    fn controller_values_reject_non_finite_numbers() {
        assert_eq!(ControllerValue::Scalar(2.0).as_scalar(), Some(2.0));
        assert_eq!(ControllerValue::Scalar(f64::NAN).as_scalar(), None);
        assert_eq!(ControllerValue::Nil.as_vector(), None);
        assert_eq!(ControllerValue::Other("string".into()).type_name(), "string");
    }
}
