use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use bevy::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rhai::{
    CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position, Scope, AST,
    FLOAT, INT,
};

use super::{
    BodyScript, Bindings, ControllerValue, EventArgs, EventHandler, Evaluator, HandlerContext,
    ScriptBackend, ScriptCallable, ScriptEventKind, SimCommand,
};
use crate::config::{DEFAULT_MAX_SCRIPT_CALL_LEVELS, DEFAULT_MAX_SCRIPT_OPERATIONS};
use crate::error::ScriptError;
use crate::physics::BodyHandle;

/// State shared by every script of one runtime: globals and the seeded rng.
struct ScriptShared {
    vars: RefCell<Map>,
    rng: RefCell<SmallRng>,
}

impl ScriptShared {
    fn new(seed: u64) -> Self {
        Self {
            vars: RefCell::new(Map::new()),
            rng: RefCell::new(SmallRng::seed_from_u64(seed)),
        }
    }
}

#[derive(Default)]
struct ScriptCallContext {
    frame: u64,
    body: Option<BodyHandle>,
    commands: Vec<SimCommand>,
    shared: Option<Rc<ScriptShared>>,
}

thread_local! {
    static SCRIPT_CALL_CONTEXT: RefCell<ScriptCallContext> = RefCell::new(ScriptCallContext::default());
}

/// Runs `f` with the call context installed; returns its result and any buffered commands.
fn with_call_context<R>(
    shared: &Rc<ScriptShared>,
    frame: u64,
    body: Option<BodyHandle>,
    f: impl FnOnce() -> R,
) -> (R, Vec<SimCommand>) {
    let previous = SCRIPT_CALL_CONTEXT.with(|ctx| {
        std::mem::replace(
            &mut *ctx.borrow_mut(),
            ScriptCallContext {
                frame,
                body,
                commands: Vec::new(),
                shared: Some(shared.clone()),
            },
        )
    });
    let result = f();
    let finished = SCRIPT_CALL_CONTEXT.with(|ctx| std::mem::replace(&mut *ctx.borrow_mut(), previous));
    (result, finished.commands)
}

fn push_command(command: SimCommand) {
    SCRIPT_CALL_CONTEXT.with(|ctx| ctx.borrow_mut().commands.push(command));
}

fn dynamic_to_f64(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .map(|v| v as f64)
        .or_else(|| value.as_int().ok().map(|v| v as f64))
}

fn number_arg(value: &Dynamic, what: &str) -> Result<f32, Box<EvalAltResult>> {
    dynamic_to_f64(value)
        .map(|v| v as f32)
        .ok_or_else(|| format!("{what} expects a number, got {}", value.type_name()).into())
}

fn body_arg(id: INT) -> Result<BodyHandle, Box<EvalAltResult>> {
    u64::try_from(id)
        .map(BodyHandle)
        .map_err(|_| format!("invalid body id {id}").into())
}

fn script_vec3(x: Dynamic, y: Dynamic, z: Dynamic) -> Result<Vec3, Box<EvalAltResult>> {
    Ok(Vec3::new(
        number_arg(&x, "vec3")?,
        number_arg(&y, "vec3")?,
        number_arg(&z, "vec3")?,
    ))
}

fn script_rand() -> FLOAT {
    SCRIPT_CALL_CONTEXT.with(|ctx| {
        ctx.borrow()
            .shared
            .as_ref()
            .map(|shared| shared.rng.borrow_mut().gen::<f64>() as FLOAT)
            .unwrap_or(0.0)
    })
}

fn script_get_var(name: ImmutableString) -> Dynamic {
    SCRIPT_CALL_CONTEXT.with(|ctx| {
        ctx.borrow()
            .shared
            .as_ref()
            .and_then(|shared| shared.vars.borrow().get(name.as_str()).cloned())
            .unwrap_or(Dynamic::UNIT)
    })
}

fn script_set_var(name: ImmutableString, value: Dynamic) {
    SCRIPT_CALL_CONTEXT.with(|ctx| {
        if let Some(shared) = ctx.borrow().shared.as_ref() {
            shared.vars.borrow_mut().insert(name.as_str().into(), value);
        }
    });
}

fn script_frame() -> INT {
    SCRIPT_CALL_CONTEXT.with(|ctx| ctx.borrow().frame as INT)
}

fn script_self_id() -> INT {
    SCRIPT_CALL_CONTEXT.with(|ctx| ctx.borrow().body.map(|b| b.0 as INT).unwrap_or(-1))
}

fn script_destroy(id: INT) -> Result<(), Box<EvalAltResult>> {
    push_command(SimCommand::DestroyBody(body_arg(id)?));
    Ok(())
}

fn script_stop() {
    push_command(SimCommand::StopSession);
}

fn script_push(id: INT, x: Dynamic, y: Dynamic, z: Dynamic) -> Result<(), Box<EvalAltResult>> {
    let force = script_vec3(x, y, z)?;
    push_command(SimCommand::ApplyForce {
        body: body_arg(id)?,
        force,
    });
    Ok(())
}

fn script_push_vec(id: INT, force: Vec3) -> Result<(), Box<EvalAltResult>> {
    push_command(SimCommand::ApplyForce {
        body: body_arg(id)?,
        force,
    });
    Ok(())
}

fn script_set_script_enabled(id: INT, enabled: bool) -> Result<(), Box<EvalAltResult>> {
    push_command(SimCommand::SetScriptEnabled {
        body: body_arg(id)?,
        enabled,
    });
    Ok(())
}

fn script_debug_line(
    x1: Dynamic,
    y1: Dynamic,
    z1: Dynamic,
    x2: Dynamic,
    y2: Dynamic,
    z2: Dynamic,
) -> Result<(), Box<EvalAltResult>> {
    push_command(SimCommand::DebugLine {
        from: script_vec3(x1, y1, z1)?,
        to: script_vec3(x2, y2, z2)?,
    });
    Ok(())
}

fn make_rhai_engine(max_operations: u64, max_call_levels: usize) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(max_operations);
    engine.set_max_call_levels(max_call_levels);
    engine.on_print(|text| info!("[Simdrive scripts] {}", text));
    engine.on_debug(|text, source, pos| {
        debug!(
            "[Simdrive scripts] {}{}: {}",
            source.unwrap_or("script"),
            pos.line().map(|l| format!(":{l}")).unwrap_or_default(),
            text
        )
    });

    engine.register_type_with_name::<Vec3>("Vec3");
    engine.register_fn("vec3", script_vec3);
    engine.register_get("x", |v: &mut Vec3| v.x as FLOAT);
    engine.register_get("y", |v: &mut Vec3| v.y as FLOAT);
    engine.register_get("z", |v: &mut Vec3| v.z as FLOAT);
    engine.register_fn("+", |a: Vec3, b: Vec3| a + b);
    engine.register_fn("-", |a: Vec3, b: Vec3| a - b);
    engine.register_fn("-", |a: Vec3| -a);
    engine.register_fn("*", |a: Vec3, s: FLOAT| a * s as f32);
    engine.register_fn("*", |s: FLOAT, a: Vec3| a * s as f32);
    engine.register_fn("*", |a: Vec3, s: INT| a * s as f32);
    engine.register_fn("*", |s: INT, a: Vec3| a * s as f32);
    engine.register_fn("length", |a: Vec3| a.length() as FLOAT);
    engine.register_fn("dot", |a: Vec3, b: Vec3| a.dot(b) as FLOAT);
    engine.register_fn("to_string", |a: &mut Vec3| format!("({}, {}, {})", a.x, a.y, a.z));

    engine.register_fn("rand", script_rand);
    engine.register_fn("get_var", script_get_var);
    engine.register_fn("set_var", script_set_var);
    engine.register_fn("frame", script_frame);
    engine.register_fn("self_id", script_self_id);
    engine.register_fn("destroy", script_destroy);
    engine.register_fn("stop", script_stop);
    engine.register_fn("push", script_push);
    engine.register_fn("push", script_push_vec);
    engine.register_fn("set_script_enabled", script_set_script_enabled);
    engine.register_fn("debug_line", script_debug_line);
    engine
}

fn script_hash(source: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

fn innermost_error(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost_error(inner),
        _ => err,
    }
}

fn position_line(pos: Position) -> Option<usize> {
    pos.line()
}

fn eval_error(script: &str, source: &str, err: &EvalAltResult) -> ScriptError {
    let line = position_line(innermost_error(err).position()).or_else(|| position_line(err.position()));
    ScriptError::new(script, err.to_string())
        .with_line(line)
        .enrich_line(source)
}

fn to_controller_value(value: Dynamic) -> ControllerValue {
    if value.is_unit() {
        return ControllerValue::Nil;
    }
    if let Some(number) = dynamic_to_f64(&value) {
        return ControllerValue::Scalar(number);
    }
    if value.is::<Vec3>() {
        return ControllerValue::Vector(value.cast::<Vec3>());
    }
    if value.is_array() {
        let type_name = value.type_name().to_string();
        if let Ok(items) = value.into_array() {
            let parts: Vec<f64> = items.iter().filter_map(dynamic_to_f64).collect();
            if items.len() == 3 && parts.len() == 3 {
                return ControllerValue::Vector(Vec3::new(
                    parts[0] as f32,
                    parts[1] as f32,
                    parts[2] as f32,
                ));
            }
        }
        return ControllerValue::Other(type_name);
    }
    ControllerValue::Other(value.type_name().to_string())
}

fn event_args(args: &EventArgs) -> Vec<Dynamic> {
    match args {
        EventArgs::None => Vec::new(),
        EventArgs::Contact {
            other,
            point,
            normal,
            impulse,
        } => vec![
            Dynamic::from(other.0 as INT),
            Dynamic::from(*point),
            Dynamic::from(*normal),
            Dynamic::from(*impulse as FLOAT),
        ],
        EventArgs::Key(key) => vec![Dynamic::from(ImmutableString::from(key.as_str()))],
        EventArgs::Pick { point } => vec![Dynamic::from(*point)],
    }
}

/// One event-slot function of a compiled body script.
struct RhaiHandler {
    engine: Rc<Engine>,
    ast: Rc<AST>,
    shared: Rc<ScriptShared>,
    state: Rc<RefCell<Dynamic>>,
    script: String,
    source: Rc<str>,
    function: String,
    params: usize,
}

impl ScriptCallable for RhaiHandler {
    fn call(&self, ctx: &mut HandlerContext) -> Result<(), ScriptError> {
        let mut args = event_args(ctx.args);
        args.truncate(self.params);
        let mut state = self.state.try_borrow_mut().map_err(|_| {
            ScriptError::new(&self.script, format!("{} re-entered", self.function))
        })?;
        let mut scope = Scope::new();
        let (result, commands) = with_call_context(&self.shared, ctx.frame, Some(ctx.body), || {
            let options = CallFnOptions::new()
                .eval_ast(false)
                .rewind_scope(true)
                .bind_this_ptr(&mut *state);
            self.engine.call_fn_with_options::<Dynamic>(
                options,
                &mut scope,
                &self.ast,
                &self.function,
                args,
            )
        });
        ctx.commands.extend(commands);
        result
            .map(|_| ())
            .map_err(|err| eval_error(&self.script, &self.source, &err))
    }
}

/// rhai-backed evaluator and body-script compiler.
pub struct RhaiRuntime {
    engine: Rc<Engine>,
    cache: HashMap<String, (u64, Rc<AST>)>,
    shared: Rc<ScriptShared>,
}

impl Default for RhaiRuntime {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCRIPT_OPERATIONS, DEFAULT_MAX_SCRIPT_CALL_LEVELS)
    }
}

impl RhaiRuntime {
    pub fn new(max_operations: u64, max_call_levels: usize) -> Self {
        Self {
            engine: Rc::new(make_rhai_engine(max_operations, max_call_levels)),
            cache: HashMap::new(),
            shared: Rc::new(ScriptShared::new(0)),
        }
    }

    pub fn from_config(config: &crate::config::SimulationConfig) -> Self {
        let mut runtime = Self::new(config.max_script_operations, config.max_script_call_levels);
        runtime.begin_session(config.rng_seed);
        runtime
    }

    pub fn cached_scripts(&self) -> usize {
        self.cache.len()
    }

    pub fn var(&self, name: &str) -> Option<Dynamic> {
        self.shared.vars.borrow().get(name).cloned()
    }

    fn get_or_compile_ast(&mut self, name: &str, source: &str) -> Result<Rc<AST>, ScriptError> {
        let hash = script_hash(source);
        if let Some((old_hash, ast)) = self.cache.get(name) {
            if *old_hash == hash {
                return Ok(ast.clone());
            }
        }
        let compiled = self.engine.compile(source).map_err(|err| {
            ScriptError::new(name, err.to_string())
                .with_line(err.1.line())
                .enrich_line(source)
        })?;
        let compiled = Rc::new(compiled);
        self.cache.insert(name.to_string(), (hash, compiled.clone()));
        Ok(compiled)
    }
}

impl Evaluator for RhaiRuntime {
    fn evaluate(
        &mut self,
        name: &str,
        source: &str,
        bindings: &Bindings,
    ) -> Result<ControllerValue, ScriptError> {
        let ast = self.get_or_compile_ast(name, source)?;
        let mut scope = Scope::new();
        scope.push("frame", bindings.frame as INT);
        scope.push("time", bindings.time as FLOAT);
        scope.push("dt", bindings.dt as FLOAT);
        let subject = bindings.subject;
        scope.push("pos", subject.map(|s| s.position).unwrap_or(Vec3::ZERO));
        scope.push("vel", subject.map(|s| s.velocity).unwrap_or(Vec3::ZERO));
        scope.push("spin", subject.map(|s| s.spin).unwrap_or(Vec3::ZERO));
        scope.push("mass", subject.map(|s| s.mass as FLOAT).unwrap_or(0.0));

        let body = subject.map(|s| s.body);
        let (result, commands) = with_call_context(&self.shared, bindings.frame, body, || {
            self.engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        });
        if !commands.is_empty() {
            debug!(
                "[Simdrive scripts] {} side effects from controller '{}' ignored",
                commands.len(),
                name
            );
        }
        result
            .map(to_controller_value)
            .map_err(|err| eval_error(name, source, &err))
    }
}

impl ScriptBackend for RhaiRuntime {
    fn load_body_script(
        &mut self,
        name: &str,
        source: &str,
        body: BodyHandle,
        frame: u64,
    ) -> Result<BodyScript, ScriptError> {
        let ast = self.get_or_compile_ast(name, source)?;
        let mut scope = Scope::new();
        let (result, commands) = with_call_context(&self.shared, frame, Some(body), || {
            self.engine.run_ast_with_scope(&mut scope, &ast)
        });
        result.map_err(|err| eval_error(name, source, &err))?;
        if !commands.is_empty() {
            debug!(
                "[Simdrive scripts] {} setup commands from '{}' ignored",
                commands.len(),
                name
            );
        }

        let state = Rc::new(RefCell::new(Dynamic::from_map(Map::new())));
        let source: Rc<str> = Rc::from(source);
        let mut script = BodyScript::new(name);
        for function in ast.iter_functions() {
            let Some(kind) = ScriptEventKind::from_handler_name(function.name) else {
                continue;
            };
            script.set_handler(
                kind,
                EventHandler::Script(Rc::new(RhaiHandler {
                    engine: self.engine.clone(),
                    ast: ast.clone(),
                    shared: self.shared.clone(),
                    state: state.clone(),
                    script: name.to_string(),
                    source: source.clone(),
                    function: function.name.to_string(),
                    params: function.params.len(),
                })),
            );
        }
        Ok(script)
    }

    fn begin_session(&mut self, seed: u64) {
        self.shared = Rc::new(ScriptShared::new(seed));
    }

    fn end_session(&mut self) {
        self.shared.vars.borrow_mut().clear();
        self.cache.clear();
    }
}
