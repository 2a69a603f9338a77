//! V-Ray command table

use super::default::{
    self, apply_output_prefix, apply_resolution, camera_to_render, finish_frame, reject_region, render_layer_to_render,
    require_frame, OUTPUT_FILE_PREFIX_PARAMS, RENDER_LAYER_PARAMS, START_RENDER_PARAMS,
};
use super::host::{AttrValue, RenderEngine, RenderInvocation, SceneHost};
use super::registry::{CommandSpec, HandlerError, HandlerTable, ParamSet, Renderer};
use super::state::RenderState;
use crate::types::ActionArgs;
use serde_json::Value;

const PLUGIN: &str = "vrayformaya";
const SETTINGS_NODE: &str = "vraySettings";

pub fn table() -> HandlerTable {
    default::table()
        .for_renderer(Renderer::Vray)
        .with(CommandSpec {
            name: "start_render",
            params: ParamSet::Declared(START_RENDER_PARAMS),
            handler: start_render,
        })
        .with(CommandSpec {
            name: "output_file_prefix",
            params: ParamSet::Declared(OUTPUT_FILE_PREFIX_PARAMS),
            handler: set_output_file_prefix,
        })
        .with(CommandSpec {
            name: "render_layer",
            params: ParamSet::Declared(RENDER_LAYER_PARAMS),
            handler: set_render_layer,
        })
}

/// Find the settings node, creating it if V-Ray offers a way to
fn settings_node_exists(host: &mut dyn SceneHost) -> bool {
    if host.object_exists(SETTINGS_NODE) {
        return true;
    }
    host.print("StickyClient: vraySettings node not found in the scene!");

    let can_create = host
        .eval_script("exists vrayCreateVRaySettingsNode")
        .map(|r| r.trim() == "1")
        .unwrap_or(false);
    if !can_create {
        return false;
    }

    if host.eval_script("vrayCreateVRaySettingsNode").is_err() || !host.object_exists(SETTINGS_NODE) {
        host.print("StickyClient: Unable to create vraySettings node.");
        return false;
    }
    host.print("StickyClient: Created default vraySettings node.");
    true
}

fn set_settings_attr(host: &mut dyn SceneHost, attr: &str, value: AttrValue) -> Result<(), HandlerError> {
    host.set_attr(&format!("{}.{}", SETTINGS_NODE, attr), value)?;
    Ok(())
}

fn start_render(state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if !host.plugin_loaded(PLUGIN) {
        return Err(HandlerError::failed(
            "The VRay for Maya plugin was not loaded. Please verify that VRay is installed.",
        ));
    }

    let frame = require_frame(args)?;
    reject_region(args)?;

    let camera = camera_to_render(state, host, args)?;
    state.camera = Some(camera.clone());

    apply_output_prefix(state, host, args)?;
    apply_resolution(state, host, "vraySettings.width", "vraySettings.height")?;

    if !settings_node_exists(host) {
        return Err(HandlerError::failed(
            "start_render called with missing vraySettings node in the scene.",
        ));
    }

    // Render exactly this frame.
    set_settings_attr(host, "animType", AttrValue::Int(2))?;
    set_settings_attr(host, "animFrames", AttrValue::Str(frame.to_string()))?;

    // Write images rather than exporting a .vrscene.
    set_settings_attr(host, "vrscene_render_on", AttrValue::Int(1))?;
    set_settings_attr(host, "vrscene_on", AttrValue::Int(0))?;

    // RTX (3) is not available on render nodes; use CUDA (2).
    if host.get_attr("vraySettings.productionEngine")?.as_i64() == Some(3) {
        set_settings_attr(host, "productionEngine", AttrValue::Int(2))?;
        host.print("StickyClient: Changing V-Ray GPU engine from RTX to CUDA mode.");
    }

    set_settings_attr(host, "sys_distributed_rendering_on", AttrValue::Int(0))?;
    set_settings_attr(host, "dontSaveImage", AttrValue::Int(0))?;
    set_settings_attr(host, "noAlpha", AttrValue::Int(0))?;
    set_settings_attr(host, "dontSaveRgbChannel", AttrValue::Int(0))?;

    // Level 3 reports errors, warnings and progress.
    if host.get_attr("vraySettings.sys_message_level")?.as_i64().unwrap_or_default() < 3 {
        set_settings_attr(host, "sys_message_level", AttrValue::Int(3))?;
    }

    let invocation = RenderInvocation {
        camera: Some(camera),
        ..RenderInvocation::new(RenderEngine::Vray, frame)
    };
    host.render(&invocation)?;

    finish_frame(host, frame)
}

fn set_output_file_prefix(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if let Some(prefix) = args.get_str("output_file_prefix").filter(|p| !p.is_empty()) {
        if settings_node_exists(host) {
            set_settings_attr(host, "fileNamePrefix", AttrValue::Str(prefix.to_string()))?;
        }
    }
    Ok(Value::Null)
}

fn set_render_layer(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if let Some(layer) = render_layer_to_render(host, args)? {
        host.set_current_render_layer(&layer)?;
    }
    Ok(Value::Null)
}
