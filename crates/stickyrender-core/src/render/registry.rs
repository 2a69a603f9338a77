//! Render-handler registry
//!
//! One [`Renderer`] variant per supported renderer, each owning a fixed,
//! ordered command table. The dispatcher only ever sees [`HandlerTable`]s, so
//! adding a renderer means a new variant and a new table.

use super::host::SceneHost;
use super::state::RenderState;
use super::{arnold, default, renderman, vray};
use crate::error::{HostError, ValidationError};
use crate::types::{ActionArgs, ArgKind, ArgValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Supported renderers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Renderer {
    #[serde(rename = "mayaSoftware")]
    MayaSoftware,
    #[serde(rename = "arnold")]
    Arnold,
    #[serde(rename = "vray")]
    Vray,
    #[serde(rename = "renderman")]
    Renderman,
}

impl Renderer {
    pub const ALL: [Renderer; 4] = [Renderer::MayaSoftware, Renderer::Arnold, Renderer::Vray, Renderer::Renderman];

    pub fn as_str(&self) -> &'static str {
        match self {
            Renderer::MayaSoftware => "mayaSoftware",
            Renderer::Arnold => "arnold",
            Renderer::Vray => "vray",
            Renderer::Renderman => "renderman",
        }
    }

    /// Build this renderer's command table
    pub fn table(&self) -> HandlerTable {
        match self {
            Renderer::MayaSoftware => default::table(),
            Renderer::Arnold => arnold::table(),
            Renderer::Vray => vray::table(),
            Renderer::Renderman => renderman::table(),
        }
    }
}

impl fmt::Display for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Renderer {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Renderer::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownRenderer(s.to_string()))
    }
}

/// Error returned by a command handler
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Uniform handler contract
pub type HandlerFn = fn(&mut RenderState, &mut dyn SceneHost, &ActionArgs) -> Result<serde_json::Value, HandlerError>;

/// Declared type of a command parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Integer,
    Number,
    String,
    /// A string holding a filesystem path; subject to path mapping
    Path,
}

impl ParamKind {
    fn accepts(&self, value: &ArgValue) -> bool {
        match self {
            ParamKind::Bool => value.kind() == ArgKind::Bool,
            ParamKind::Integer => value.as_i64().is_some(),
            ParamKind::Number => value.as_f64().is_some(),
            ParamKind::String | ParamKind::Path => value.kind() == ArgKind::String,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::Bool => "bool",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::String => "string",
            ParamKind::Path => "path",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Parameters a command accepts
#[derive(Debug, Clone, Copy)]
pub enum ParamSet {
    /// Exactly these parameters
    Declared(&'static [ParamSpec]),
    /// Any parameter name, all values of one kind
    Open(ParamKind),
}

impl ParamSet {
    /// Check arguments against the declared parameters
    pub fn validate(&self, args: &ActionArgs) -> Result<(), String> {
        match self {
            ParamSet::Declared(specs) => {
                for (name, value) in args.iter() {
                    let spec = specs
                        .iter()
                        .find(|s| s.name == name)
                        .ok_or_else(|| format!("unknown parameter '{}'", name))?;
                    if !spec.kind.accepts(value) {
                        return Err(format!("parameter '{}' must be a {}, got {}", name, spec.kind, value.kind()));
                    }
                }
                if let Some(missing) = specs.iter().find(|s| s.required && !args.contains(s.name)) {
                    return Err(format!("missing required parameter '{}'", missing.name));
                }
                Ok(())
            }
            ParamSet::Open(kind) => {
                for (name, value) in args.iter() {
                    if !kind.accepts(value) {
                        return Err(format!("parameter '{}' must be a {}, got {}", name, kind, value.kind()));
                    }
                }
                Ok(())
            }
        }
    }

    /// Names of path-valued parameters
    pub fn path_params(&self) -> Vec<&'static str> {
        match self {
            ParamSet::Declared(specs) => specs.iter().filter(|s| s.kind == ParamKind::Path).map(|s| s.name).collect(),
            ParamSet::Open(_) => Vec::new(),
        }
    }
}

/// A registered command
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub params: ParamSet,
    pub handler: HandlerFn,
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Ordered command table for one renderer
#[derive(Debug, Clone)]
pub struct HandlerTable {
    renderer: Renderer,
    commands: Vec<CommandSpec>,
}

impl HandlerTable {
    pub fn new(renderer: Renderer) -> Self {
        Self {
            renderer,
            commands: Vec::new(),
        }
    }

    /// Re-label a base table for a variant
    pub fn for_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Add a command, replacing an existing one of the same name in place
    pub fn register(&mut self, spec: CommandSpec) {
        match self.commands.iter_mut().find(|c| c.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.commands.push(spec),
        }
    }

    pub fn with(mut self, spec: CommandSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn renderer(&self) -> Renderer {
        self.renderer
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.commands.iter().map(|c| c.name).collect()
    }
}

/// All renderer tables, built once
pub struct HandlerRegistry {
    tables: Vec<Arc<HandlerTable>>,
}

impl HandlerRegistry {
    pub fn builtin() -> Self {
        Self {
            tables: Renderer::ALL.iter().map(|r| Arc::new(r.table())).collect(),
        }
    }

    pub fn get(&self, renderer: Renderer) -> Option<Arc<HandlerTable>> {
        self.tables.iter().find(|t| t.renderer() == renderer).cloned()
    }

    /// Install or replace a renderer's table
    pub fn register(&mut self, table: HandlerTable) {
        let table = Arc::new(table);
        match self.tables.iter_mut().find(|t| t.renderer() == table.renderer()) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }

    /// Path-valued parameters of `command` under `renderer`
    pub fn path_params(&self, renderer: Renderer, command: &str) -> Vec<&'static str> {
        self.get(renderer)
            .and_then(|t| t.get(command).map(|c| c.params.path_params()))
            .unwrap_or_default()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
