//! Arnold command table

use super::default::{
    self, apply_output_prefix, camera_to_render, finish_frame, reject_region, render_layer_to_render, require_frame,
    IMAGE_HEIGHT_PARAMS, IMAGE_WIDTH_PARAMS, RENDER_LAYER_PARAMS, START_RENDER_PARAMS,
};
use super::host::{AttrValue, RenderEngine, RenderInvocation, SceneHost};
use super::registry::{CommandSpec, HandlerError, HandlerTable, ParamKind, ParamSet, ParamSpec, Renderer};
use super::state::RenderState;
use crate::types::ActionArgs;
use serde_json::Value;

const ABORT_ON_LICENSE_FAIL_PARAMS: &[ParamSpec] = &[ParamSpec::required("error_on_arnold_license_fail", ParamKind::Bool)];

/// Log verbosity at which Arnold reports `% done` progress
const PROGRESS_LOG_VERBOSITY: i64 = 2;

pub fn table() -> HandlerTable {
    default::table()
        .for_renderer(Renderer::Arnold)
        .with(CommandSpec {
            name: "start_render",
            params: ParamSet::Declared(START_RENDER_PARAMS),
            handler: start_render,
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
            name: "render_layer",
            params: ParamSet::Declared(RENDER_LAYER_PARAMS),
            handler: set_render_layer,
        })
        .with(CommandSpec {
            name: "error_on_arnold_license_fail",
            params: ParamSet::Declared(ABORT_ON_LICENSE_FAIL_PARAMS),
            handler: set_error_on_arnold_license_fail,
        })
}

fn start_render(state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    let frame = require_frame(args)?;
    reject_region(args)?;

    let camera = camera_to_render(state, host, args)?;
    apply_output_prefix(state, host, args)?;

    let width = match state.image_width {
        Some(width) => width,
        None => {
            let width = host.get_attr("defaultResolution.width")?.as_i64().unwrap_or_default();
            host.print(&format!("No width was specified, defaulting to {}", width));
            width
        }
    };
    let height = match state.image_height {
        Some(height) => height,
        None => {
            let height = host.get_attr("defaultResolution.height")?.as_i64().unwrap_or_default();
            host.print(&format!("No height was specified, defaulting to {}", height));
            height
        }
    };

    // Render images, not scene description files.
    host.set_attr("defaultArnoldRenderOptions.renderType", AttrValue::Int(0))?;

    let verbosity = host
        .get_attr("defaultArnoldRenderOptions.log_verbosity")?
        .as_i64()
        .unwrap_or_default();
    if verbosity < PROGRESS_LOG_VERBOSITY {
        host.set_attr("defaultArnoldRenderOptions.log_verbosity", AttrValue::Int(PROGRESS_LOG_VERBOSITY))?;
    }

    let invocation = RenderInvocation {
        camera: Some(camera),
        width: Some(width),
        height: Some(height),
        batch: state.batch,
        ..RenderInvocation::new(RenderEngine::Arnold, frame)
    };
    host.render(&invocation)?;

    finish_frame(host, frame)
}

/// Zero means "use the scene resolution"
fn set_image_height(state: &mut RenderState, _host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if let Some(height) = args.get_i64("image_height").filter(|h| *h != 0) {
        state.image_height = Some(height);
    }
    Ok(Value::Null)
}

fn set_image_width(state: &mut RenderState, _host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if let Some(width) = args.get_i64("image_width").filter(|w| *w != 0) {
        state.image_width = Some(width);
    }
    Ok(Value::Null)
}

fn set_render_layer(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if let Some(layer) = render_layer_to_render(host, args)? {
        host.set_current_render_layer(&layer)?;
    }
    Ok(Value::Null)
}

/// When false, an unlicensed render completes with a watermark instead of failing
fn set_error_on_arnold_license_fail(
    _state: &mut RenderState,
    host: &mut dyn SceneHost,
    args: &ActionArgs,
) -> Result<Value, HandlerError> {
    let abort = args.get_bool("error_on_arnold_license_fail").unwrap_or(true);
    host.set_attr("defaultArnoldRenderOptions.abortOnLicenseFail", AttrValue::Bool(abort))?;
    Ok(Value::Null)
}
