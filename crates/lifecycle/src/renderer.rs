use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ctxpool::{Frame, RenderBackend};
use scheduler::{Position, StaticRenderJob};

/// Draw callback for one card. The pool never looks at what is drawn.
pub trait CardRenderer<B: RenderBackend> {
    /// Page position, used to order static renders.
    fn position(&self) -> Position;

    /// Prepares per-slot state (cache entries, uniforms) after a borrow.
    fn init(&mut self, frame: &mut Frame<'_, B>) -> anyhow::Result<()>;

    /// Draws one frame into a cleared surface.
    fn draw(&mut self, frame: &mut Frame<'_, B>, elapsed: Duration) -> anyhow::Result<()>;
}

pub(crate) type SharedRenderer<B> = Rc<RefCell<dyn CardRenderer<B>>>;

/// Static render of a card: init, then a single frame at t = 0.
pub(crate) struct StillJob<B: RenderBackend> {
    pub(crate) renderer: SharedRenderer<B>,
}

impl<B: RenderBackend> StaticRenderJob<B> for StillJob<B> {
    fn position(&self) -> Position {
        self.renderer
            .try_borrow()
            .map(|renderer| renderer.position())
            .unwrap_or_default()
    }

    fn render(&mut self, frame: &mut Frame<'_, B>) -> anyhow::Result<()> {
        let mut renderer = self
            .renderer
            .try_borrow_mut()
            .map_err(|_| anyhow::anyhow!("card renderer is already in use"))?;
        renderer.init(frame)?;
        renderer.draw(frame, Duration::ZERO)
    }
}
