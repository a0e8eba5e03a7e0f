use egui::{Key, Pos2};

/// Minimum swipe distance in pixels to trigger navigation
pub const MIN_SWIPE_DISTANCE: f32 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Classify a completed swipe by its displacement (end minus start).
///
/// The dominant axis decides; ties count as vertical. Left and up go
/// forward, right and down go backward.
pub fn classify_swipe(dx: f32, dy: f32) -> Option<Direction> {
    if dx.abs() > dy.abs() {
        if dx < -MIN_SWIPE_DISTANCE {
            Some(Direction::Forward)
        } else if dx > MIN_SWIPE_DISTANCE {
            Some(Direction::Backward)
        } else {
            None
        }
    } else if dy < -MIN_SWIPE_DISTANCE {
        Some(Direction::Forward)
    } else if dy > MIN_SWIPE_DISTANCE {
        Some(Direction::Backward)
    } else {
        None
    }
}

/// Arrow-key navigation. Left is ignored on the first item.
pub fn direction_for_key(key: Key, current_index: usize) -> Option<Direction> {
    match key {
        Key::ArrowRight => Some(Direction::Forward),
        Key::ArrowLeft if current_index > 0 => Some(Direction::Backward),
        _ => None,
    }
}

/// Start and end points of the drag in progress
#[derive(Debug, Default, Clone)]
pub struct GestureState {
    start: Option<Pos2>,
    end: Option<Pos2>,
}

impl GestureState {
    pub fn begin(&mut self, pos: Pos2) {
        self.start = Some(pos);
        self.end = None;
    }

    pub fn update(&mut self, pos: Pos2) {
        if self.start.is_some() {
            self.end = Some(pos);
        }
    }

    #[cfg(test)]
    pub fn is_tracking(&self) -> bool {
        self.start.is_some()
    }

    /// Resolve the gesture and forget it. A press without movement is not a swipe.
    pub fn finish(&mut self) -> Option<Direction> {
        let start = self.start.take();
        let end = self.end.take();
        match (start, end) {
            (Some(start), Some(end)) => classify_swipe(end.x - start.x, end.y - start.y),
            _ => None,
        }
    }
}
