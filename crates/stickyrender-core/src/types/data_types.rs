//! Init and run data accepted by the adaptor

use crate::error::ValidationError;
use crate::render::Renderer;
use crate::types::ActionArgs;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Session-wide configuration, provided once per sticky session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitData {
    pub scene_file: String,
    pub project_path: String,
    pub render_layer: String,
    pub renderer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_setup_include_lights: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_on_arnold_license_fail: Option<bool>,
    #[serde(default)]
    pub strict_error_checking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl InitData {
    /// Parse and validate init data from a JSON value
    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        let data: InitData = serde_json::from_value(value).map_err(|e| classify_serde_error("init data", e))?;
        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("scene_file", &self.scene_file),
            ("project_path", &self.project_path),
            ("render_layer", &self.render_layer),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        self.renderer()?;
        if self.image_width == Some(0) || self.image_height == Some(0) {
            return Err(ValidationError::InvalidValue {
                field: if self.image_width == Some(0) { "image_width" } else { "image_height" }.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn renderer(&self) -> Result<Renderer, ValidationError> {
        Renderer::from_str(&self.renderer)
    }

    /// Actions that configure the scene, in the order they must run.
    ///
    /// `scene_file` and `project_path` come first, then every optional scene
    /// setting that was provided. Renderer selection and path mapping are
    /// queued separately by the adaptor.
    pub fn scene_actions(&self) -> Vec<(&'static str, ActionArgs)> {
        let mut actions = vec![
            ("scene_file", ActionArgs::new().with("scene_file", self.scene_file.as_str())),
            ("project_path", ActionArgs::new().with("project_path", self.project_path.as_str())),
        ];

        if let Some(camera) = &self.camera {
            actions.push(("camera", ActionArgs::new().with("camera", camera.as_str())));
        }
        if let Some(height) = self.image_height {
            actions.push(("image_height", ActionArgs::new().with("image_height", height)));
        }
        if let Some(width) = self.image_width {
            actions.push(("image_width", ActionArgs::new().with("image_width", width)));
        }
        if let Some(path) = &self.output_file_path {
            actions.push(("output_file_path", ActionArgs::new().with("output_file_path", path.as_str())));
        }
        if let Some(prefix) = &self.output_file_prefix {
            actions.push((
                "output_file_prefix",
                ActionArgs::new().with("output_file_prefix", prefix.as_str()),
            ));
        }
        actions.push((
            "render_layer",
            ActionArgs::new().with("render_layer", self.render_layer.as_str()),
        ));
        if let Some(include) = self.render_setup_include_lights {
            actions.push((
                "render_setup_include_lights",
                ActionArgs::new().with("render_setup_include_lights", include),
            ));
        }
        // Only the arnold table knows this command.
        if let (Some(abort), Ok(Renderer::Arnold)) = (self.error_on_arnold_license_fail, self.renderer()) {
            actions.push((
                "error_on_arnold_license_fail",
                ActionArgs::new().with("error_on_arnold_license_fail", abort),
            ));
        }
        actions
    }
}

/// Per-task data, provided once per `on_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunData {
    pub frame: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_min_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_max_x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_min_y: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_max_y: Option<i64>,
}

impl RunData {
    pub fn new(frame: i64) -> Self {
        Self {
            frame,
            camera: None,
            output_file_prefix: None,
            region_min_x: None,
            region_max_x: None,
            region_min_y: None,
            region_max_y: None,
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| classify_serde_error("run data", e))
    }

    /// Arguments of the `start_render` action for this task
    pub fn to_args(&self) -> ActionArgs {
        let mut args = ActionArgs::new().with("frame", self.frame);
        if let Some(camera) = &self.camera {
            args.insert("camera", camera.as_str());
        }
        if let Some(prefix) = &self.output_file_prefix {
            args.insert("output_file_prefix", prefix.as_str());
        }
        for (key, value) in [
            ("region_min_x", self.region_min_x),
            ("region_max_x", self.region_max_x),
            ("region_min_y", self.region_min_y),
            ("region_max_y", self.region_max_y),
        ] {
            if let Some(v) = value {
                args.insert(key, v);
            }
        }
        args
    }
}

/// Map serde's messages onto the validation taxonomy
fn classify_serde_error(what: &str, err: serde_json::Error) -> ValidationError {
    let message = err.to_string();
    if let Some(field) = backticked_after(&message, "missing field ") {
        return ValidationError::MissingField(field);
    }
    if let Some(field) = backticked_after(&message, "unknown field ") {
        return ValidationError::UnknownField(field);
    }
    ValidationError::Malformed {
        what: what.to_string(),
        reason: message,
    }
}

fn backticked_after(message: &str, marker: &str) -> Option<String> {
    let rest = &message[message.find(marker)? + marker.len()..];
    let rest = rest.strip_prefix('`')?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn init_json() -> serde_json::Value {
        json!({
            "animation": true,
            "render_setup_include_lights": true,
            "renderer": "mayaSoftware",
            "render_layer": "masterLayer",
            "strict_error_checking": true,
            "version": 2024,
            "output_file_path": "/renders/out",
            "project_path": "/proj",
            "scene_file": "/proj/scenes/shot.mb",
            "camera": "persp",
            "image_width": 1920,
            "image_height": 1080,
            "output_file_prefix": "shot_<RenderLayer>"
        })
    }

    #[test]
    fn test_init_data_parses_full_record() {
        let data = InitData::from_value(init_json()).unwrap();
        assert_eq!(data.renderer().unwrap(), Renderer::MayaSoftware);
        assert!(data.strict_error_checking);
        assert_eq!(data.image_width, Some(1920));
    }

    #[test]
    fn test_init_data_reports_missing_field() {
        let mut value = init_json();
        value.as_object_mut().unwrap().remove("scene_file");
        let err = InitData::from_value(value).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("scene_file".to_string()));
    }

    #[test]
    fn test_init_data_rejects_unknown_field() {
        let mut value = init_json();
        value["resolution_scale"] = json!(2);
        let err = InitData::from_value(value).unwrap_err();
        assert_eq!(err, ValidationError::UnknownField("resolution_scale".to_string()));
    }

    #[test]
    fn test_init_data_rejects_unknown_renderer() {
        let mut value = init_json();
        value["renderer"] = json!("redshift");
        let err = InitData::from_value(value).unwrap_err();
        assert_eq!(err, ValidationError::UnknownRenderer("redshift".to_string()));
    }

    #[test]
    fn test_scene_actions_start_with_scene_and_project() {
        let data = InitData::from_value(init_json()).unwrap();
        let names: Vec<_> = data.scene_actions().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "scene_file",
                "project_path",
                "camera",
                "image_height",
                "image_width",
                "output_file_path",
                "output_file_prefix",
                "render_layer",
                "render_setup_include_lights",
            ]
        );
    }

    #[test]
    fn test_run_data_args_skip_absent_fields() {
        let run = RunData::from_value(json!({"frame": 42})).unwrap();
        let args = run.to_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args.get_i64("frame"), Some(42));
    }

    #[test]
    fn test_run_data_requires_frame() {
        let err = RunData::from_value(json!({"camera": "persp"})).unwrap_err();
        assert_eq!(err, ValidationError::MissingField("frame".to_string()));
    }
}
