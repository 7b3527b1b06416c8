//! Where finished frames end up on the remote.
//!
//! The engine keeps its own frame-sized back image up to date; once per
//! frame it is copied onto a screen image owned by the display target,
//! followed by any decoration the target wants drawn around it.

use tracing::info;

use crate::draw::channel::DrawChannel;
use crate::draw::command::{self, Draw, ImageIds, Point};
use crate::draw::types::Rect;
use crate::error::DrawError;
use crate::flags::ErrorFlags;

/// The remote image the back buffer is presented on.
pub trait DisplayTarget: Send {
    /// Screen image id and where the frame's top-left corner goes on it.
    fn screen(&self) -> (u32, Point);

    /// Append commands drawn after the frame copy (borders and the like).
    fn decorate(&self, _ids: &ImageIds, _frame: Rect, _out: &mut Vec<u8>) {}

    /// Re-bind the screen image after a geometry change.
    ///
    /// Called with the pipeline paused, so the target may exchange commands
    /// on `channel` synchronously.
    fn relookup(&mut self, channel: &dyn DrawChannel) -> Result<(), DrawError>;
}

/// A solid frame drawn around the window from a replicated colour image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Border {
    /// Remote image holding the border colour.
    pub image: u32,
    pub width: u32,
}

/// A window published on the remote under a name.
#[derive(Debug, Clone)]
pub struct NamedWindow {
    name: String,
    id: u32,
    origin: Point,
    border: Option<Border>,
    bound: bool,
}

impl NamedWindow {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
            origin: Point::ZERO,
            border: None,
            bound: false,
        }
    }

    pub fn with_border(mut self, border: Border) -> Self {
        self.border = Some(border);
        self
    }

    pub fn set_origin(&mut self, origin: Point) {
        self.origin = origin;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }
}

impl DisplayTarget for NamedWindow {
    fn screen(&self) -> (u32, Point) {
        (self.id, self.origin)
    }

    fn decorate(&self, ids: &ImageIds, frame: Rect, out: &mut Vec<u8>) {
        let Some(border) = self.border else {
            return;
        };
        let bw = border.width;
        if bw == 0 {
            return;
        }
        // Border coordinates start at the outer corner.
        let origin = Point::new(self.origin.x - bw as i32, self.origin.y - bw as i32);
        let outer_w = frame.width + 2 * bw;
        let sides = [
            Rect::new(0, 0, outer_w, bw),
            Rect::new(0, frame.height + bw, outer_w, bw),
            Rect::new(0, bw, bw, frame.height),
            Rect::new(frame.width + bw, bw, bw, frame.height),
        ];
        for rect in sides {
            Draw {
                dst: self.id,
                src: border.image,
                mask: ids.opaque,
                rect,
                origin,
                sp: Point::ZERO,
                mp: Point::ZERO,
            }
            .write(out);
        }
    }

    fn relookup(&mut self, channel: &dyn DrawChannel) -> Result<(), DrawError> {
        let mut cmd = Vec::new();
        if self.bound {
            command::free(&mut cmd, self.id);
        }
        command::name_lookup(&mut cmd, self.id, &self.name)?;
        self.bound = false;

        let written = channel.write_pipelined(&cmd)?;
        let applied = channel.receive_one_response()?;
        if written != cmd.len() || applied != cmd.len() {
            return Err(DrawError::ShortWrite {
                expected: cmd.len(),
                actual: applied.min(written),
            });
        }
        let flags = channel.take_error_flags();
        if flags.contains(ErrorFlags::UNKNOWN_ID) {
            return Err(DrawError::UnknownImage);
        }
        if flags.contains(ErrorFlags::CONNECTION_RESET) {
            return Err(DrawError::ConnectionReset);
        }
        self.bound = true;
        info!("bound window '{}' to image {}", self.name, self.id);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
