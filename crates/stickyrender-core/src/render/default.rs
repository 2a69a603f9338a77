//! Base command table (`mayaSoftware`), shared by every renderer

use super::host::{AttrValue, RenderEngine, RenderInvocation, SceneHost};
use super::registry::{CommandSpec, HandlerError, HandlerTable, ParamKind, ParamSet, ParamSpec, Renderer};
use super::state::RenderState;
use super::FRAME_COMPLETE_MARKER;
use crate::error::HostError;
use crate::types::ActionArgs;
use serde_json::{json, Value};
use std::path::Path;

type HandlerResult = Result<Value, HandlerError>;

pub(crate) const REGION_FIELDS: [&str; 4] = ["region_min_x", "region_max_x", "region_min_y", "region_max_y"];

pub(crate) const START_RENDER_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("frame", ParamKind::Integer),
    ParamSpec::optional("camera", ParamKind::String),
    ParamSpec::optional("output_file_prefix", ParamKind::String),
    ParamSpec::optional("region_min_x", ParamKind::Integer),
    ParamSpec::optional("region_max_x", ParamKind::Integer),
    ParamSpec::optional("region_min_y", ParamKind::Integer),
    ParamSpec::optional("region_max_y", ParamKind::Integer),
];
const CAMERA_PARAMS: &[ParamSpec] = &[ParamSpec::required("camera", ParamKind::String)];
pub(crate) const IMAGE_HEIGHT_PARAMS: &[ParamSpec] = &[ParamSpec::required("image_height", ParamKind::Integer)];
pub(crate) const IMAGE_WIDTH_PARAMS: &[ParamSpec] = &[ParamSpec::required("image_width", ParamKind::Integer)];
const OUTPUT_FILE_PATH_PARAMS: &[ParamSpec] = &[ParamSpec::required("output_file_path", ParamKind::Path)];
pub(crate) const OUTPUT_FILE_PREFIX_PARAMS: &[ParamSpec] = &[ParamSpec::required("output_file_prefix", ParamKind::String)];
const PROJECT_PATH_PARAMS: &[ParamSpec] = &[ParamSpec::required("project_path", ParamKind::Path)];
pub(crate) const RENDER_LAYER_PARAMS: &[ParamSpec] = &[ParamSpec::required("render_layer", ParamKind::String)];
const INCLUDE_LIGHTS_PARAMS: &[ParamSpec] = &[ParamSpec::required("render_setup_include_lights", ParamKind::Bool)];
const SCENE_FILE_PARAMS: &[ParamSpec] = &[ParamSpec::required("scene_file", ParamKind::Path)];

pub fn table() -> HandlerTable {
    HandlerTable::new(Renderer::MayaSoftware)
        .with(CommandSpec {
            name: "start_render",
            params: ParamSet::Declared(START_RENDER_PARAMS),
            handler: start_render,
        })
        .with(CommandSpec {
            name: "camera",
            params: ParamSet::Declared(CAMERA_PARAMS),
            handler: set_camera,
        })
        .with(CommandSpec {
            name: "image_height",
            params: ParamSet::Declared(IMAGE_HEIGHT_PARAMS),
            handler: set_image_height,
        })
        .with(CommandSpec {
            name: "image_width",
            params: ParamSet::Declared(IMAGE_WIDTH_PARAMS),
            handler: set_image_width,
        })
        .with(CommandSpec {
            name: "output_file_path",
            params: ParamSet::Declared(OUTPUT_FILE_PATH_PARAMS),
            handler: set_output_file_path,
        })
        .with(CommandSpec {
            name: "output_file_prefix",
            params: ParamSet::Declared(OUTPUT_FILE_PREFIX_PARAMS),
            handler: set_output_file_prefix,
        })
        .with(CommandSpec {
            name: "path_mapping",
            params: ParamSet::Open(ParamKind::String),
            handler: set_path_mapping,
        })
        .with(CommandSpec {
            name: "project_path",
            params: ParamSet::Declared(PROJECT_PATH_PARAMS),
            handler: set_project_path,
        })
        .with(CommandSpec {
            name: "render_layer",
            params: ParamSet::Declared(RENDER_LAYER_PARAMS),
            handler: set_render_layer,
        })
        .with(CommandSpec {
            name: "render_setup_include_lights",
            params: ParamSet::Declared(INCLUDE_LIGHTS_PARAMS),
            handler: set_render_setup_include_lights,
        })
        .with(CommandSpec {
            name: "scene_file",
            params: ParamSet::Declared(SCENE_FILE_PARAMS),
            handler: set_scene_file,
        })
}

pub(crate) fn require_frame(args: &ActionArgs) -> Result<i64, HandlerError> {
    args.get_i64("frame")
        .ok_or_else(|| HandlerError::failed("start_render called without a frame number."))
}

pub(crate) fn reject_region(args: &ActionArgs) -> Result<(), HandlerError> {
    if REGION_FIELDS.iter().any(|f| args.contains(f)) {
        return Err(HandlerError::failed(
            "A region render was specified, but region rendering support is not implemented for the selected renderer.",
        ));
    }
    Ok(())
}

/// Resolve the camera to render: the task's camera, else the session camera.
pub(crate) fn camera_to_render(state: &RenderState, host: &dyn SceneHost, args: &ActionArgs) -> Result<String, HandlerError> {
    let name = args
        .get_str("camera")
        .map(str::to_string)
        .or_else(|| state.camera.clone())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| HandlerError::failed("No camera was specified to render."))?;

    let camera = host
        .cameras()
        .into_iter()
        .find(|c| c.name == name)
        .ok_or_else(|| HandlerError::failed(format!("The specified camera, '{}', does not exist.", name)))?;
    if !camera.renderable {
        return Err(HandlerError::failed(format!("The specified camera, '{}', is not renderable.", name)));
    }
    Ok(name)
}

/// Look up a render layer node by display name
pub(crate) fn render_layer_to_render(host: &dyn SceneHost, args: &ActionArgs) -> Result<Option<String>, HandlerError> {
    let display_name = match args.get_str("render_layer") {
        Some(name) if !name.is_empty() => name,
        _ => return Ok(None),
    };

    let layers = host.render_layers();
    if let Some(layer) = layers.iter().find(|l| l.display_name == display_name) {
        return Ok(Some(layer.name.clone()));
    }

    let mut available: Vec<&str> = layers.iter().map(|l| l.display_name.as_str()).collect();
    available.sort_unstable();
    Err(HandlerError::failed(format!(
        "Render layer '{}' not found. Available render layers are: {:?}",
        display_name, available
    )))
}

/// Output prefix in order of preference: task, session, scene setting
pub(crate) fn apply_output_prefix(state: &RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<(), HandlerError> {
    let prefix = args
        .get_str("output_file_prefix")
        .map(str::to_string)
        .or_else(|| state.output_file_prefix.clone());
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        host.set_attr("defaultRenderGlobals.imageFilePrefix", AttrValue::Str(prefix))?;
    }
    Ok(())
}

/// Apply the session image size to the given width/height attributes
pub(crate) fn apply_resolution(
    state: &RenderState,
    host: &mut dyn SceneHost,
    width_attr: &str,
    height_attr: &str,
) -> Result<(), HandlerError> {
    if let Some(width) = state.image_width {
        host.set_attr(width_attr, AttrValue::Int(width))?;
        host.print(&format!("Set image width to {}", width));
    }
    if let Some(height) = state.image_height {
        host.set_attr(height_attr, AttrValue::Int(height))?;
        host.print(&format!("Set image height to {}", height));
    }
    Ok(())
}

pub(crate) fn finish_frame(host: &mut dyn SceneHost, frame: i64) -> HandlerResult {
    host.print(&format!("{} {}", FRAME_COMPLETE_MARKER, frame));
    Ok(json!({ "frame": frame }))
}

fn start_render(state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    let frame = require_frame(args)?;
    reject_region(args)?;

    host.set_attr("defaultRenderGlobals.startFrame", AttrValue::Int(frame))?;
    host.set_attr("defaultRenderGlobals.endFrame", AttrValue::Int(frame))?;

    let camera = camera_to_render(state, host, args)?;
    host.print(&format!("Rendering camera: {}", camera));

    apply_output_prefix(state, host, args)?;
    apply_resolution(state, host, "defaultResolution.width", "defaultResolution.height")?;

    let invocation = RenderInvocation {
        camera: Some(camera),
        layer: state.render_layer.clone(),
        ..RenderInvocation::new(RenderEngine::MayaSoftware, frame)
    };
    host.render(&invocation)?;

    finish_frame(host, frame)
}

fn set_camera(state: &mut RenderState, _host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    state.camera = args.get_str("camera").map(str::to_string);
    Ok(Value::Null)
}

fn set_image_height(state: &mut RenderState, _host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    state.image_height = args.get_i64("image_height");
    Ok(Value::Null)
}

fn set_image_width(state: &mut RenderState, _host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    state.image_width = args.get_i64("image_width");
    Ok(Value::Null)
}

fn set_output_file_path(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    if let Some(dir) = args.get_str("output_file_path").filter(|d| !d.is_empty()) {
        host.set_file_rule("images", dir)?;
    }
    Ok(Value::Null)
}

fn set_output_file_prefix(state: &mut RenderState, _host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    state.output_file_prefix = args.get_str("output_file_prefix").map(str::to_string);
    Ok(Value::Null)
}

/// Arguments are `source -> destination` pairs
fn set_path_mapping(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    if args.is_empty() {
        return Ok(Value::Null);
    }

    host.set_directory_mapping_enabled(true);
    for (source, destination) in args.iter() {
        if let Some(destination) = destination.as_str() {
            host.map_directory(source, destination)?;
        }
    }
    Ok(json!({ "mapped": args.len() }))
}

fn set_project_path(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    if let Some(path) = args.get_str("project_path").filter(|p| !p.is_empty()) {
        std::fs::create_dir_all(path)?;
        host.set_project(Path::new(path))?;
    }
    Ok(Value::Null)
}

fn set_render_layer(state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    if let Some(layer) = render_layer_to_render(host, args)? {
        state.render_layer = Some(layer);
    }
    Ok(Value::Null)
}

fn set_render_setup_include_lights(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    let include = args.get_bool("render_setup_include_lights").unwrap_or(true);
    host.set_option_var("renderSetup_includeAllLights", include as i64);
    Ok(Value::Null)
}

fn set_scene_file(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> HandlerResult {
    let file_path = args.get_str("scene_file").unwrap_or_default();
    if !Path::new(file_path).is_file() {
        return Err(HostError::FileNotFound(format!("The scene file '{}' does not exist", file_path)).into());
    }
    host.open_scene(Path::new(file_path))?;

    if let Ok(AttrValue::Str(script)) = host.get_attr("defaultRenderGlobals.preMel") {
        if !script.is_empty() {
            if let Err(e) = host.eval_script(&script) {
                host.print(&format!("Warning: preMel Failed: {}", e));
            }
        }
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::host::{CameraInfo, MockSceneHost, RenderLayerInfo};
    use mockall::predicate::*;
    use pretty_assertions::assert_eq;

    fn cameras() -> Vec<CameraInfo> {
        vec![
            CameraInfo {
                name: "persp".to_string(),
                renderable: true,
            },
            CameraInfo {
                name: "top".to_string(),
                renderable: false,
            },
        ]
    }

    #[test]
    fn test_start_render_renders_and_prints_marker() {
        let mut host = MockSceneHost::new();
        host.expect_set_attr().returning(|_, _| Ok(()));
        host.expect_cameras().returning(cameras);
        host.expect_render()
            .withf(|inv| inv.frame == 42 && inv.camera.as_deref() == Some("persp") && inv.engine == RenderEngine::MayaSoftware)
            .times(1)
            .returning(|_| Ok(()));
        host.expect_print().with(eq("Rendering camera: persp")).times(1).return_const(());
        host.expect_print()
            .with(eq("StickyClient: Finished Rendering Frame 42"))
            .times(1)
            .return_const(());

        let mut state = RenderState {
            camera: Some("persp".to_string()),
            ..Default::default()
        };
        let args = ActionArgs::new().with("frame", 42);
        let result = start_render(&mut state, &mut host, &args).unwrap();
        assert_eq!(result, json!({"frame": 42}));
    }

    #[test]
    fn test_task_prefix_wins_over_session_prefix() {
        let mut host = MockSceneHost::new();
        host.expect_set_attr()
            .with(eq("defaultRenderGlobals.imageFilePrefix"), eq(AttrValue::Str("task".to_string())))
            .times(1)
            .returning(|_, _| Ok(()));
        let state = RenderState {
            output_file_prefix: Some("session".to_string()),
            ..Default::default()
        };
        apply_output_prefix(&state, &mut host, &ActionArgs::new().with("output_file_prefix", "task")).unwrap();
    }

    #[test]
    fn test_camera_must_exist_and_be_renderable() {
        let mut host = MockSceneHost::new();
        host.expect_cameras().returning(cameras);
        let state = RenderState::default();

        let err = camera_to_render(&state, &host, &ActionArgs::new().with("camera", "shotCam")).unwrap_err();
        assert_eq!(err.to_string(), "The specified camera, 'shotCam', does not exist.");

        let err = camera_to_render(&state, &host, &ActionArgs::new().with("camera", "top")).unwrap_err();
        assert_eq!(err.to_string(), "The specified camera, 'top', is not renderable.");

        let err = camera_to_render(&state, &host, &ActionArgs::new()).unwrap_err();
        assert_eq!(err.to_string(), "No camera was specified to render.");
    }

    #[test]
    fn test_region_render_is_rejected_before_side_effects() {
        let mut host = MockSceneHost::new();
        host.expect_set_attr().never();
        host.expect_render().never();
        let args = ActionArgs::new().with("frame", 1).with("region_min_x", 0);
        let err = start_render(&mut RenderState::default(), &mut host, &args).unwrap_err();
        assert!(err.to_string().contains("region rendering support is not implemented"));
    }

    #[test]
    fn test_render_layer_lookup_by_display_name() {
        let mut host = MockSceneHost::new();
        host.expect_render_layers().returning(|| {
            vec![
                RenderLayerInfo {
                    name: "defaultRenderLayer".to_string(),
                    display_name: "masterLayer".to_string(),
                },
                RenderLayerInfo {
                    name: "rs_beauty".to_string(),
                    display_name: "beauty".to_string(),
                },
            ]
        });

        let mut state = RenderState::default();
        set_render_layer(&mut state, &mut host, &ActionArgs::new().with("render_layer", "beauty")).unwrap();
        assert_eq!(state.render_layer.as_deref(), Some("rs_beauty"));

        let err = set_render_layer(&mut state, &mut host, &ActionArgs::new().with("render_layer", "fx")).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Render layer 'fx' not found. Available render layers are: ["beauty", "masterLayer"]"#
        );
    }

    #[test]
    fn test_missing_scene_file() {
        let mut host = MockSceneHost::new();
        host.expect_open_scene().never();
        let err = set_scene_file(
            &mut RenderState::default(),
            &mut host,
            &ActionArgs::new().with("scene_file", "/definitely/not/here.mb"),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "File not found: The scene file '/definitely/not/here.mb' does not exist");
    }

    #[test]
    fn test_scene_file_runs_pre_render_script() {
        let dir = tempfile::tempdir().unwrap();
        let scene = dir.path().join("shot.mb");
        std::fs::write(&scene, b"scene").unwrap();

        let mut host = MockSceneHost::new();
        host.expect_open_scene().times(1).returning(|_| Ok(()));
        host.expect_get_attr()
            .with(eq("defaultRenderGlobals.preMel"))
            .returning(|_| Ok(AttrValue::Str("setupLights()".to_string())));
        host.expect_eval_script()
            .with(eq("setupLights()"))
            .returning(|_| Err(HostError::Failed("no such procedure".to_string())));
        host.expect_print()
            .with(eq("Warning: preMel Failed: no such procedure"))
            .times(1)
            .return_const(());

        let args = ActionArgs::new().with("scene_file", scene.to_string_lossy().as_ref());
        set_scene_file(&mut RenderState::default(), &mut host, &args).unwrap();
    }

    #[test]
    fn test_project_path_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("proj");

        let mut host = MockSceneHost::new();
        host.expect_set_project().times(1).returning(|_| Ok(()));
        let args = ActionArgs::new().with("project_path", project.to_string_lossy().as_ref());
        set_project_path(&mut RenderState::default(), &mut host, &args).unwrap();
        assert!(project.is_dir());
    }

    #[test]
    fn test_path_mapping_enables_dirmap() {
        let mut host = MockSceneHost::new();
        host.expect_set_directory_mapping_enabled().with(eq(true)).times(1).return_const(());
        host.expect_map_directory()
            .with(eq("/mnt/src"), eq("/data/dst"))
            .times(1)
            .returning(|_, _| Ok(()));
        let args = ActionArgs::new().with("/mnt/src", "/data/dst");
        let result = set_path_mapping(&mut RenderState::default(), &mut host, &args).unwrap();
        assert_eq!(result, json!({"mapped": 1}));

        let mut idle = MockSceneHost::new();
        idle.expect_set_directory_mapping_enabled().never();
        set_path_mapping(&mut RenderState::default(), &mut idle, &ActionArgs::new()).unwrap();
    }
}
