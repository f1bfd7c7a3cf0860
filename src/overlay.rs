use bevy::prelude::*;

const MAX_OVERLAY_SHAPES: usize = 512;

#[derive(Clone, Debug, PartialEq)]
pub enum DebugShape {
    Line { from: Vec3, to: Vec3 },
}

/// Debug geometry queued during one tick and handed to the host with the redraw.
#[derive(Default, Debug)]
pub struct DebugOverlay {
    shapes: Vec<DebugShape>,
    pub dropped: u64,
    last_overflow_log_frame: u64,
}

impl DebugOverlay {
    pub fn clear(&mut self) {
        self.shapes.clear();
    }

    pub fn push(&mut self, shape: DebugShape, frame: u64) {
        if self.shapes.len() >= MAX_OVERLAY_SHAPES {
            self.dropped += 1;
            if frame >= self.last_overflow_log_frame + 60 {
                self.last_overflow_log_frame = frame;
                warn!(
                    "[Simdrive overlay] Queue full ({} shapes); dropped {} so far",
                    MAX_OVERLAY_SHAPES, self.dropped
                );
            }
            return;
        }
        self.shapes.push(shape);
    }

    pub fn shapes(&self) -> &[DebugShape] {
        &self.shapes
    }
}
