//! Interface to the hosted application's scene

use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Attribute value in the hosted application's scene graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            AttrValue::Bool(b) => Some(*b as i64),
            AttrValue::Float(f) => Some(*f as i64),
            AttrValue::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(x) => write!(f, "{}", x),
            AttrValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

/// A camera in the open scene
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub name: String,
    #[serde(default = "default_true")]
    pub renderable: bool,
}

/// A local render layer. Referenced and disconnected layers are never reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderLayerInfo {
    /// Node name
    pub name: String,
    /// Name shown to users and used in init data
    pub display_name: String,
}

fn default_true() -> bool {
    true
}

/// Which render command the hosted application should run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderEngine {
    MayaSoftware,
    Arnold,
    Vray,
    Renderman,
}

/// A single-frame render request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderInvocation {
    pub engine: RenderEngine,
    pub frame: i64,
    pub camera: Option<String>,
    pub layer: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub batch: bool,
}

impl RenderInvocation {
    pub fn new(engine: RenderEngine, frame: i64) -> Self {
        Self {
            engine,
            frame,
            camera: None,
            layer: None,
            width: None,
            height: None,
            batch: false,
        }
    }
}

/// The seam between render handlers and the hosted application.
///
/// Handlers never talk to the application directly; everything they need goes
/// through this trait so the same tables run against the real application, the
/// simulated host, or a mock.
#[cfg_attr(test, mockall::automock)]
pub trait SceneHost: Send {
    /// Version string of the hosted application
    fn version(&self) -> String;

    fn open_scene(&mut self, path: &Path) -> Result<(), HostError>;

    fn set_project(&mut self, path: &Path) -> Result<(), HostError>;

    /// Point a workspace file rule (e.g. `images`) at a directory
    fn set_file_rule(&mut self, rule: &str, path: &str) -> Result<(), HostError>;

    fn get_attr(&self, attr: &str) -> Result<AttrValue, HostError>;

    fn set_attr(&mut self, attr: &str, value: AttrValue) -> Result<(), HostError>;

    fn object_exists(&self, name: &str) -> bool;

    /// Evaluate a script in the application's scripting language
    fn eval_script(&mut self, script: &str) -> Result<String, HostError>;

    fn cameras(&self) -> Vec<CameraInfo>;

    fn render_layers(&self) -> Vec<RenderLayerInfo>;

    fn set_current_render_layer(&mut self, layer: &str) -> Result<(), HostError>;

    fn plugin_loaded(&self, plugin: &str) -> bool;

    fn set_directory_mapping_enabled(&mut self, enabled: bool);

    fn map_directory(&mut self, source: &str, destination: &str) -> Result<(), HostError>;

    fn set_option_var(&mut self, name: &str, value: i64);

    fn render(&mut self, invocation: &RenderInvocation) -> Result<(), HostError>;

    /// Write a line to the application's console (stdout)
    fn print(&mut self, line: &str);

    /// Uninitialise the application
    fn shutdown(&mut self);
}
