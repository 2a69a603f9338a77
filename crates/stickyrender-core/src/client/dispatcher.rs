//! Command dispatcher
//!
//! Routes each request to the active renderer's handler table. Handler errors
//! and panics become error responses; the hosted application keeps running.

use crate::error::DispatchError;
use crate::render::{HandlerRegistry, HandlerTable, RenderState, Renderer, SceneHost};
use crate::types::ActionArgs;
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Selects the active handler table. Always available.
pub const SET_RENDERER: &str = "set_renderer";
/// Uninitialises the host; the stub stops serving after replying.
pub const CLOSE: &str = "close";
pub const PING: &str = "ping";

struct ActiveTable {
    table: Arc<HandlerTable>,
    state: RenderState,
}

pub struct CommandDispatcher {
    registry: HandlerRegistry,
    host: Box<dyn SceneHost>,
    active: Option<ActiveTable>,
    closed: bool,
}

impl CommandDispatcher {
    pub fn new(host: Box<dyn SceneHost>) -> Self {
        Self::with_registry(HandlerRegistry::builtin(), host)
    }

    pub fn with_registry(registry: HandlerRegistry, host: Box<dyn SceneHost>) -> Self {
        Self {
            registry,
            host,
            active: None,
            closed: false,
        }
    }

    pub fn active_renderer(&self) -> Option<Renderer> {
        self.active.as_ref().map(|a| a.table.renderer())
    }

    /// Whether `close` has been handled
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn host_version(&self) -> String {
        self.host.version()
    }

    /// Write a line to the host's console
    pub fn host_print(&mut self, line: &str) {
        self.host.print(line);
    }

    /// Uninitialise the host if `close` never arrived
    pub fn shutdown(&mut self) {
        if !self.closed {
            self.closed = true;
            self.host.shutdown();
        }
    }

    pub fn dispatch(&mut self, method: &str, params: Option<&Value>) -> Result<Value, DispatchError> {
        let args = match params {
            None => ActionArgs::new(),
            Some(value) => ActionArgs::from_json(value).map_err(|e| DispatchError::InvalidParams {
                command: method.to_string(),
                message: e.to_string(),
            })?,
        };

        match method {
            SET_RENDERER => self.set_renderer(&args),
            CLOSE => {
                info!("Closing the hosted application");
                self.shutdown();
                Ok(Value::Null)
            }
            PING => Ok(json!("pong")),
            _ => self.run_handler(method, &args),
        }
    }

    fn set_renderer(&mut self, args: &ActionArgs) -> Result<Value, DispatchError> {
        let invalid = |message: String| DispatchError::InvalidParams {
            command: SET_RENDERER.to_string(),
            message,
        };

        if let Some(extra) = args.keys().find(|k| *k != "renderer") {
            return Err(invalid(format!("unknown parameter '{}'", extra)));
        }
        let name = args
            .get_str("renderer")
            .ok_or_else(|| invalid("missing required parameter 'renderer'".to_string()))?;
        let renderer: Renderer = name.parse().map_err(|e: crate::error::ValidationError| invalid(e.to_string()))?;

        if self.active_renderer() == Some(renderer) {
            debug!("Renderer already set to {}", renderer);
            return Ok(json!({ "renderer": renderer }));
        }

        let table = self
            .registry
            .get(renderer)
            .ok_or_else(|| invalid(format!("no handlers registered for '{}'", renderer)))?;
        self.active = Some(ActiveTable {
            table,
            state: RenderState::for_renderer(renderer),
        });
        info!("Active renderer set to {}", renderer);
        Ok(json!({ "renderer": renderer }))
    }

    fn run_handler(&mut self, method: &str, args: &ActionArgs) -> Result<Value, DispatchError> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| DispatchError::UnknownCommand(method.to_string()))?;
        let spec = *active
            .table
            .get(method)
            .ok_or_else(|| DispatchError::UnknownCommand(method.to_string()))?;

        spec.params.validate(args).map_err(|message| DispatchError::InvalidParams {
            command: method.to_string(),
            message,
        })?;

        debug!("Running '{}' for {}", method, active.table.renderer());
        let host = self.host.as_mut();
        let state = &mut active.state;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (spec.handler)(state, host, args)));

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!("'{}' failed: {}", method, e);
                Err(DispatchError::HandlerFailed {
                    command: method.to_string(),
                    message: e.to_string(),
                })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("'{}' panicked: {}", method, message);
                Err(DispatchError::HandlerFailed {
                    command: method.to_string(),
                    message: format!("handler panicked: {}", message),
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{CommandSpec, HandlerError, MockSceneHost, ParamSet, SimulatedHost};
    use pretty_assertions::assert_eq;

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(Box::new(SimulatedHost::new(Box::new(std::io::sink()))))
    }

    fn boom(_: &mut RenderState, _: &mut dyn SceneHost, _: &ActionArgs) -> Result<Value, HandlerError> {
        panic!("boom")
    }

    fn refuse(_: &mut RenderState, _: &mut dyn SceneHost, _: &ActionArgs) -> Result<Value, HandlerError> {
        Err(HandlerError::failed("refused"))
    }

    #[test]
    fn test_renderer_commands_need_set_renderer() {
        let mut d = dispatcher();
        let params = json!({"error_on_arnold_license_fail": true});

        let err = d.dispatch("error_on_arnold_license_fail", Some(&params)).unwrap_err();
        assert_eq!(err, DispatchError::UnknownCommand("error_on_arnold_license_fail".to_string()));

        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "arnold"}))).unwrap();
        assert_eq!(d.active_renderer(), Some(Renderer::Arnold));
        d.dispatch("error_on_arnold_license_fail", Some(&params)).unwrap();
    }

    #[test]
    fn test_unknown_command_keeps_active_table() {
        let mut d = dispatcher();
        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "vray"}))).unwrap();
        let err = d.dispatch("make_coffee", None).unwrap_err();
        assert_eq!(err.code(), crate::types::error_codes::UNKNOWN_COMMAND);
        assert_eq!(d.active_renderer(), Some(Renderer::Vray));
    }

    #[test]
    fn test_set_renderer_is_idempotent() {
        let mut d = dispatcher();
        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "mayaSoftware"}))).unwrap();
        d.dispatch("camera", Some(&json!({"camera": "persp"}))).unwrap();
        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "mayaSoftware"}))).unwrap();
        assert_eq!(
            d.active.as_ref().and_then(|a| a.state.camera.clone()),
            Some("persp".to_string())
        );

        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "arnold"}))).unwrap();
        assert_eq!(d.active.as_ref().and_then(|a| a.state.camera.clone()), None);
    }

    #[test]
    fn test_set_renderer_rejects_unknown_renderer() {
        let mut d = dispatcher();
        let err = d.dispatch(SET_RENDERER, Some(&json!({"renderer": "cycles"}))).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParams { .. }));
        assert_eq!(d.active_renderer(), None);
    }

    #[test]
    fn test_invalid_params_are_reported() {
        let mut d = dispatcher();
        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "mayaSoftware"}))).unwrap();
        let err = d.dispatch("start_render", Some(&json!({}))).unwrap_err();
        assert_eq!(
            err,
            DispatchError::InvalidParams {
                command: "start_render".to_string(),
                message: "missing required parameter 'frame'".to_string(),
            }
        );
        let err = d.dispatch("camera", Some(&json!({"camera": ["a"]}))).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParams { .. }));
    }

    #[test]
    fn test_handler_failure_and_panic_do_not_poison_dispatcher() {
        let mut registry = HandlerRegistry::builtin();
        let table = Renderer::MayaSoftware
            .table()
            .with(CommandSpec {
                name: "explode",
                params: ParamSet::Declared(&[]),
                handler: boom,
            })
            .with(CommandSpec {
                name: "refuse",
                params: ParamSet::Declared(&[]),
                handler: refuse,
            });
        registry.register(table);

        let mut d = CommandDispatcher::with_registry(registry, Box::new(SimulatedHost::new(Box::new(std::io::sink()))));
        d.dispatch(SET_RENDERER, Some(&json!({"renderer": "mayaSoftware"}))).unwrap();

        let err = d.dispatch("refuse", None).unwrap_err();
        assert_eq!(err.wire_message(), "refused");

        let err = d.dispatch("explode", None).unwrap_err();
        assert_eq!(err.wire_message(), "handler panicked: boom");

        assert_eq!(d.dispatch(PING, None).unwrap(), json!("pong"));
        d.dispatch("camera", Some(&json!({"camera": "persp"}))).unwrap();
    }

    #[test]
    fn test_close_shuts_host_down_once() {
        let mut host = MockSceneHost::new();
        host.expect_shutdown().times(1).return_const(());
        let mut d = CommandDispatcher::new(Box::new(host));
        d.dispatch(CLOSE, None).unwrap();
        assert!(d.is_closed());
        d.shutdown();
    }
}
