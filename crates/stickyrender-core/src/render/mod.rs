//! Render handlers
//!
//! The [`SceneHost`] seam, the per-renderer command tables, and the
//! [`SimulatedHost`] used when the hosted application is not installed.

mod arnold;
mod default;
mod host;
mod registry;
mod renderman;
mod simulated;
mod state;
mod vray;

pub use host::{AttrValue, CameraInfo, RenderEngine, RenderInvocation, RenderLayerInfo, SceneHost};
pub use registry::{
    CommandSpec, HandlerError, HandlerFn, HandlerRegistry, HandlerTable, ParamKind, ParamSet, ParamSpec, Renderer,
};
pub use simulated::{SceneDescription, SimulatedHost};
pub use state::RenderState;

#[cfg(test)]
pub use host::MockSceneHost;

/// Printed by the hosted application after each frame completes
pub const FRAME_COMPLETE_MARKER: &str = "StickyClient: Finished Rendering Frame";

/// Printed by the client stub once it is serving, followed by the host version
pub const HOST_VERSION_MARKER: &str = "StickyClient: Host Version";
