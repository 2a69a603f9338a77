//! RenderMan command table

use super::default::{
    self, apply_output_prefix, apply_resolution, finish_frame, reject_region, render_layer_to_render, require_frame,
    IMAGE_HEIGHT_PARAMS, IMAGE_WIDTH_PARAMS, RENDER_LAYER_PARAMS, START_RENDER_PARAMS,
};
use super::host::{AttrValue, RenderEngine, RenderInvocation, SceneHost};
use super::registry::{CommandSpec, HandlerError, HandlerTable, ParamSet, Renderer};
use super::state::RenderState;
use crate::types::ActionArgs;
use serde_json::Value;

const PLUGIN: &str = "RenderManForMaya.py";

pub fn table() -> HandlerTable {
    default::table()
        .for_renderer(Renderer::Renderman)
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
}

// Camera overrides are not applied: RenderMan renders the layer's cameras.
fn start_render(state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if !host.plugin_loaded(PLUGIN) {
        return Err(HandlerError::failed(
            "The RenderMan for Maya plugin was not loaded. Please verify that it is installed.",
        ));
    }

    let frame = require_frame(args)?;
    reject_region(args)?;

    apply_output_prefix(state, host, args)?;
    apply_resolution(state, host, "defaultResolution.width", "defaultResolution.height")?;

    let invocation = RenderInvocation {
        layer: state.render_layer.clone(),
        batch: true,
        ..RenderInvocation::new(RenderEngine::Renderman, frame)
    };
    host.render(&invocation)?;

    finish_frame(host, frame)
}

fn set_image_height(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    let height = args.get_i64("image_height").unwrap_or_default();
    host.set_attr("defaultResolution.height", AttrValue::Int(height))?;
    Ok(Value::Null)
}

fn set_image_width(_state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    let width = args.get_i64("image_width").unwrap_or_default();
    host.set_attr("defaultResolution.width", AttrValue::Int(width))?;
    Ok(Value::Null)
}

fn set_render_layer(state: &mut RenderState, host: &mut dyn SceneHost, args: &ActionArgs) -> Result<Value, HandlerError> {
    if let Some(layer) = render_layer_to_render(host, args)? {
        state.render_layer = Some(layer);
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::host::MockSceneHost;
    use mockall::predicate::*;

    #[test]
    fn test_renders_default_layer_without_override() {
        let mut host = MockSceneHost::new();
        host.expect_plugin_loaded().with(eq(PLUGIN)).return_const(true);
        host.expect_print().return_const(());
        host.expect_render()
            .withf(|inv| inv.engine == RenderEngine::Renderman && inv.layer.as_deref() == Some("defaultRenderLayer"))
            .times(1)
            .returning(|_| Ok(()));

        let mut state = RenderState::for_renderer(Renderer::Renderman);
        start_render(&mut state, &mut host, &ActionArgs::new().with("frame", 3)).unwrap();
    }

    #[test]
    fn test_resolution_goes_straight_to_scene() {
        let mut host = MockSceneHost::new();
        host.expect_set_attr()
            .with(eq("defaultResolution.height"), eq(AttrValue::Int(1080)))
            .times(1)
            .returning(|_, _| Ok(()));
        let mut state = RenderState::default();
        set_image_height(&mut state, &mut host, &ActionArgs::new().with("image_height", 1080)).unwrap();
        assert_eq!(state.image_height, None);
    }
}
