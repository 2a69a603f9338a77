use super::registry::Renderer;

/// Scene settings collected by the active handler table between renders.
///
/// Replaced wholesale when the active renderer changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderState {
    pub camera: Option<String>,
    pub image_width: Option<i64>,
    pub image_height: Option<i64>,
    pub output_file_prefix: Option<String>,
    /// Render layer node (not display name) to render
    pub render_layer: Option<String>,
    pub batch: bool,
}

impl RenderState {
    pub fn for_renderer(renderer: Renderer) -> Self {
        match renderer {
            Renderer::Arnold => Self {
                batch: true,
                ..Default::default()
            },
            Renderer::Renderman => Self {
                render_layer: Some("defaultRenderLayer".to_string()),
                ..Default::default()
            },
            Renderer::MayaSoftware | Renderer::Vray => Self::default(),
        }
    }
}
