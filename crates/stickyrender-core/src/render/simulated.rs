//! In-process stand-in for the hosted application
//!
//! Keeps a small scene model in memory and prints the same console output a
//! real renderer would, so the whole adaptor can run without the application
//! installed. Scene files that contain JSON are read as a [`SceneDescription`];
//! anything else opens the default scene.

use super::host::{AttrValue, CameraInfo, RenderEngine, RenderInvocation, RenderLayerInfo, SceneHost};
use crate::error::HostError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const PROGRESS_STEPS: [u8; 5] = [0, 25, 50, 75, 100];

/// Scene contents understood by the simulated host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneDescription {
    pub cameras: Vec<CameraInfo>,
    pub render_layers: Vec<RenderLayerInfo>,
    pub attributes: HashMap<String, AttrValue>,
    /// Replaces the loaded plugin set when present
    pub plugins: Option<Vec<String>>,
    /// Lines printed when the scene is opened
    pub open_output: Vec<String>,
    /// Lines printed during every render
    pub render_output: Vec<String>,
    /// Make every render fail with this message
    pub fail_render: Option<String>,
}

pub struct SimulatedHost {
    out: Box<dyn Write + Send>,
    version: String,
    step_delay: Duration,
    attrs: HashMap<String, AttrValue>,
    objects: HashSet<String>,
    cameras: Vec<CameraInfo>,
    layers: Vec<RenderLayerInfo>,
    current_layer: String,
    plugins: HashSet<String>,
    scene: Option<PathBuf>,
    project: Option<PathBuf>,
    file_rules: HashMap<String, String>,
    dirmap_enabled: bool,
    dirmap: Vec<(String, String)>,
    option_vars: HashMap<String, i64>,
    render_output: Vec<String>,
    fail_render: Option<String>,
    renders: Vec<RenderInvocation>,
    shut_down: bool,
}

impl SimulatedHost {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        let mut host = Self {
            out,
            version: "2024".to_string(),
            step_delay: Duration::ZERO,
            attrs: HashMap::new(),
            objects: HashSet::new(),
            cameras: Vec::new(),
            layers: Vec::new(),
            current_layer: "defaultRenderLayer".to_string(),
            plugins: ["mtoa", "vrayformaya", "RenderManForMaya.py"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            scene: None,
            project: None,
            file_rules: HashMap::new(),
            dirmap_enabled: false,
            dirmap: Vec::new(),
            option_vars: HashMap::new(),
            render_output: Vec::new(),
            fail_render: None,
            renders: Vec::new(),
            shut_down: false,
        };
        host.load_default_scene();
        host
    }

    /// Host writing to the process's stdout
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Pause between progress lines
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = plugins.into_iter().map(Into::into).collect();
        self
    }

    pub fn renders(&self) -> &[RenderInvocation] {
        &self.renders
    }

    pub fn mappings(&self) -> &[(String, String)] {
        &self.dirmap
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn load_default_scene(&mut self) {
        self.attrs = [
            ("defaultResolution.width", AttrValue::Int(960)),
            ("defaultResolution.height", AttrValue::Int(540)),
            ("defaultRenderGlobals.preMel", AttrValue::Str(String::new())),
            ("defaultRenderGlobals.imageFilePrefix", AttrValue::Str(String::new())),
            ("defaultArnoldRenderOptions.log_verbosity", AttrValue::Int(1)),
            ("defaultArnoldRenderOptions.abortOnLicenseFail", AttrValue::Bool(false)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        self.objects = ["defaultRenderGlobals", "defaultResolution", "defaultArnoldRenderOptions"]
            .into_iter()
            .map(str::to_string)
            .collect();
        self.cameras = ["persp", "top", "front", "side"]
            .into_iter()
            .map(|name| CameraInfo {
                name: name.to_string(),
                renderable: name == "persp",
            })
            .collect();
        self.layers = vec![RenderLayerInfo {
            name: "defaultRenderLayer".to_string(),
            display_name: "masterLayer".to_string(),
        }];
        self.current_layer = "defaultRenderLayer".to_string();
        self.render_output.clear();
        self.fail_render = None;
    }

    fn apply_description(&mut self, scene: SceneDescription) {
        if !scene.cameras.is_empty() {
            self.cameras = scene.cameras;
        }
        if !scene.render_layers.is_empty() {
            self.layers = scene.render_layers;
        }
        for (attr, value) in scene.attributes {
            if let Some((node, _)) = attr.split_once('.') {
                self.objects.insert(node.to_string());
            }
            self.attrs.insert(attr, value);
        }
        if let Some(plugins) = scene.plugins {
            self.plugins = plugins.into_iter().collect();
        }
        self.render_output = scene.render_output;
        self.fail_render = scene.fail_render;
        for line in scene.open_output {
            self.print(&line);
        }
    }

    fn create_vray_settings(&mut self) {
        self.objects.insert("vraySettings".to_string());
        for (attr, value) in [
            ("vraySettings.productionEngine", AttrValue::Int(0)),
            ("vraySettings.sys_message_level", AttrValue::Int(2)),
        ] {
            self.attrs.entry(attr.to_string()).or_insert(value);
        }
    }

    fn progress_line(engine: RenderEngine, step: usize, percent: u8) -> String {
        match engine {
            RenderEngine::Arnold => format!("00:00:{:02} 1024MB | {:>3}% done - 12 rays/pixel", step, percent),
            RenderEngine::Renderman => format!("R90000  {:>3}%", percent),
            RenderEngine::MayaSoftware | RenderEngine::Vray => format!("[PROGRESS] {} percent", percent),
        }
    }

    /// Drop a placeholder image into the images directory, if one is set
    fn write_image(&self, invocation: &RenderInvocation) -> Result<(), HostError> {
        let Some(dir) = self.file_rules.get("images") else {
            return Ok(());
        };
        let prefix = match self.attrs.get("defaultRenderGlobals.imageFilePrefix") {
            Some(AttrValue::Str(p)) if !p.is_empty() => p.replace(['<', '>', '/', '\\'], "_"),
            _ => self
                .scene
                .as_ref()
                .and_then(|s| s.file_stem())
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".to_string()),
        };

        let dir = match &self.project {
            Some(project) if Path::new(dir).is_relative() => project.join(dir),
            _ => PathBuf::from(dir),
        };
        std::fs::create_dir_all(&dir).map_err(|e| HostError::Failed(format!("{}: {}", dir.display(), e)))?;
        let path = dir.join(format!("{}.{:04}.exr", prefix, invocation.frame));
        let content = serde_json::to_vec_pretty(invocation).map_err(|e| HostError::Failed(e.to_string()))?;
        std::fs::write(&path, content).map_err(|e| HostError::Failed(format!("{}: {}", path.display(), e)))?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

impl SceneHost for SimulatedHost {
    fn version(&self) -> String {
        self.version.clone()
    }

    fn open_scene(&mut self, path: &Path) -> Result<(), HostError> {
        let content = std::fs::read(path).map_err(|_| HostError::FileNotFound(path.display().to_string()))?;
        self.load_default_scene();
        if let Ok(scene) = serde_json::from_slice::<SceneDescription>(&content) {
            self.apply_description(scene);
        }
        self.scene = Some(path.to_path_buf());
        Ok(())
    }

    fn set_project(&mut self, path: &Path) -> Result<(), HostError> {
        if !path.is_dir() {
            return Err(HostError::NotFound(format!("project directory {}", path.display())));
        }
        self.project = Some(path.to_path_buf());
        Ok(())
    }

    fn set_file_rule(&mut self, rule: &str, path: &str) -> Result<(), HostError> {
        self.file_rules.insert(rule.to_string(), path.to_string());
        Ok(())
    }

    fn get_attr(&self, attr: &str) -> Result<AttrValue, HostError> {
        self.attrs
            .get(attr)
            .cloned()
            .ok_or_else(|| HostError::NotFound(format!("attribute '{}'", attr)))
    }

    fn set_attr(&mut self, attr: &str, value: AttrValue) -> Result<(), HostError> {
        let node = attr.split_once('.').map(|(n, _)| n).unwrap_or(attr);
        if !self.objects.contains(node) {
            return Err(HostError::NotFound(format!("node '{}'", node)));
        }
        self.attrs.insert(attr.to_string(), value);
        Ok(())
    }

    fn object_exists(&self, name: &str) -> bool {
        self.objects.contains(name)
    }

    fn eval_script(&mut self, script: &str) -> Result<String, HostError> {
        match script.trim() {
            "exists vrayCreateVRaySettingsNode" => Ok(if self.plugins.contains("vrayformaya") { "1" } else { "0" }.to_string()),
            "vrayCreateVRaySettingsNode" if self.plugins.contains("vrayformaya") => {
                self.create_vray_settings();
                Ok(String::new())
            }
            other => Err(HostError::Failed(format!("Cannot evaluate '{}'", other))),
        }
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        self.cameras.clone()
    }

    fn render_layers(&self) -> Vec<RenderLayerInfo> {
        self.layers.clone()
    }

    fn set_current_render_layer(&mut self, layer: &str) -> Result<(), HostError> {
        if !self.layers.iter().any(|l| l.name == layer) {
            return Err(HostError::NotFound(format!("render layer '{}'", layer)));
        }
        self.current_layer = layer.to_string();
        Ok(())
    }

    fn plugin_loaded(&self, plugin: &str) -> bool {
        self.plugins.contains(plugin)
    }

    fn set_directory_mapping_enabled(&mut self, enabled: bool) {
        self.dirmap_enabled = enabled;
    }

    fn map_directory(&mut self, source: &str, destination: &str) -> Result<(), HostError> {
        self.dirmap.retain(|(s, _)| s != source);
        self.dirmap.push((source.to_string(), destination.to_string()));
        Ok(())
    }

    fn set_option_var(&mut self, name: &str, value: i64) {
        self.option_vars.insert(name.to_string(), value);
    }

    fn render(&mut self, invocation: &RenderInvocation) -> Result<(), HostError> {
        if self.shut_down {
            return Err(HostError::Failed("the application has been shut down".to_string()));
        }

        for (step, percent) in PROGRESS_STEPS.iter().enumerate() {
            if *percent == 100 {
                let extra = self.render_output.clone();
                for line in extra {
                    self.print(&line);
                }
                if let Some(message) = self.fail_render.clone() {
                    return Err(HostError::Failed(message));
                }
            }
            let line = Self::progress_line(invocation.engine, step, *percent);
            self.print(&line);
            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
        }

        self.write_image(invocation)?;
        self.renders.push(invocation.clone());
        Ok(())
    }

    fn print(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("Failed to write host output: {}", e);
        }
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}
