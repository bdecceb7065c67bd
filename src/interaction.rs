use log::trace;

use crate::{
    geometry::{Pos, Rect},
    rate::{RateController, ScanRate},
};

pub const DEFAULT_MIN_SIZE: u32 = 200;
pub const HANDLE_THICKNESS: i32 = 16;
/// Hit-target reach of a handle on both sides of its edge while it's held.
pub const HANDLE_EXPANDED: i32 = 48;

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

/// Which edges of the selection a handle drags.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edges {
    pub north: bool,
    pub east: bool,
    pub south: bool,
    pub west: bool,
}
impl Edges {
    const fn new(north: bool, east: bool, south: bool, west: bool) -> Self {
        Self { north, east, south, west }
    }
}

// indexed by `Direction as usize`
const EDGE_TABLE: [Edges; 8] = [
    Edges::new(true, false, false, false),
    Edges::new(true, true, false, false),
    Edges::new(false, true, false, false),
    Edges::new(false, true, true, false),
    Edges::new(false, false, true, false),
    Edges::new(false, false, true, true),
    Edges::new(false, false, false, true),
    Edges::new(true, false, false, true),
];

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::N,
        Direction::NE,
        Direction::E,
        Direction::SE,
        Direction::S,
        Direction::SW,
        Direction::W,
        Direction::NW,
    ];

    #[inline]
    pub fn edges(self) -> Edges {
        EDGE_TABLE[self as usize]
    }

    /// Hit region of this handle around `rect`.
    ///
    /// At rest a handle is a strip of [`HANDLE_THICKNESS`] just outside the
    /// edge. Held, it reaches [`HANDLE_EXPANDED`] to both sides so a fast drag
    /// doesn't slip off it.
    pub fn region(self, rect: Rect, expanded: bool) -> Rect {
        let edges = self.edges();
        let (outer, inner) = if expanded {
            (HANDLE_EXPANDED, HANDLE_EXPANDED)
        } else {
            (HANDLE_THICKNESS, 0)
        };
        let (left, right) = if edges.east {
            (rect.right() - inner, rect.right() + outer)
        } else if edges.west {
            (rect.left() - outer, rect.left() + inner)
        } else {
            (rect.left(), rect.right())
        };
        let (top, bottom) = if edges.north {
            (rect.top() - outer, rect.top() + inner)
        } else if edges.south {
            (rect.bottom() - inner, rect.bottom() + outer)
        } else {
            (rect.top(), rect.bottom())
        };
        Rect::from_edges(left, top, right, bottom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Body,
    Handle(Direction),
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    #[default]
    Idle,
    Moving {
        last: Pos,
    },
    Resizing(Direction),
}

/// What the scan loop has to do after a pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanCommand {
    /// Restart scanning at this rate.
    Reset(ScanRate),
    /// Stop periodic scanning and scan the final selection once.
    StopAndScan,
}

/// Drag-to-move and drag-to-resize over the selection rectangle.
///
/// Both gestures share the same `(start, end)` corner pair. `start`/`end` are
/// not kept normalized by a move, a resize rewrites them as top-left and
/// bottom-right.
#[derive(Debug)]
pub struct InteractionController {
    start: Pos,
    end: Pos,
    min_size: u32,
    gesture: Gesture,
    rate: ScanRate,
    rate_controller: RateController,
}

impl InteractionController {
    pub fn new(start: Pos, end: Pos, min_size: u32) -> Self {
        Self {
            start,
            end,
            min_size,
            gesture: Gesture::Idle,
            rate: ScanRate::Moderate,
            rate_controller: RateController::new(),
        }
    }

    #[inline]
    pub fn rect(&self) -> Rect {
        Rect::from_corners(self.start, self.end)
    }
    #[cfg(test)]
    pub fn corners(&self) -> (Pos, Pos) {
        (self.start, self.end)
    }
    #[cfg(test)]
    pub fn gesture(&self) -> Gesture {
        self.gesture
    }
    #[cfg(test)]
    pub fn rate(&self) -> ScanRate {
        self.rate
    }

    pub fn hit_test(&self, pos: Pos) -> Option<Target> {
        let rect = self.rect();
        Direction::ALL
            .iter()
            .find(|dir| dir.region(rect, false).contains(pos))
            .map(|dir| Target::Handle(*dir))
            .or_else(|| rect.contains(pos).then_some(Target::Body))
    }

    pub fn pointer_down(&mut self, pos: Pos) -> Option<ScanCommand> {
        if self.gesture != Gesture::Idle {
            return None;
        }
        self.gesture = match self.hit_test(pos)? {
            Target::Body => {
                // the first sample of a drag only sets the reference point
                self.rate_controller.reset();
                Gesture::Moving { last: pos }
            }
            Target::Handle(dir) => Gesture::Resizing(dir),
        };
        trace!("gesture start: {:?}", self.gesture);
        self.rate = ScanRate::Moderate;
        Some(ScanCommand::Reset(ScanRate::Moderate))
    }

    pub fn pointer_move(&mut self, pos: Pos, now_ms: u64) -> Option<ScanCommand> {
        match self.gesture {
            Gesture::Idle => None,
            Gesture::Moving { last } => {
                // handles sit inside the movable element, so they count too
                let rect = self.rect();
                let inside = rect.contains(pos)
                    || Direction::ALL.iter().any(|dir| dir.region(rect, false).contains(pos));
                if !inside {
                    return self.pointer_leave();
                }
                let (dx, dy) = (pos.x - last.x, pos.y - last.y);
                self.start = self.start.offset(dx, dy);
                self.end = self.end.offset(dx, dy);
                self.gesture = Gesture::Moving { last: pos };

                let rate = self.rate_controller.decide(pos.x, pos.y, now_ms);
                if rate != self.rate {
                    self.rate = rate;
                    return Some(ScanCommand::Reset(rate));
                }
                None
            }
            Gesture::Resizing(dir) => {
                if !dir.region(self.rect(), true).contains(pos) {
                    return self.pointer_leave();
                }
                if !self.resize(dir, pos) {
                    trace!("resize {dir:?} to {pos:?} rejected, below {}px", self.min_size);
                }
                None
            }
        }
    }

    pub fn pointer_up(&mut self) -> Option<ScanCommand> {
        self.end_gesture()
    }

    pub fn pointer_leave(&mut self) -> Option<ScanCommand> {
        self.end_gesture()
    }

    fn end_gesture(&mut self) -> Option<ScanCommand> {
        if self.gesture == Gesture::Idle {
            return None;
        }
        trace!("gesture end: {:?}", self.gesture);
        self.gesture = Gesture::Idle;
        self.rate = ScanRate::Moderate;
        Some(ScanCommand::StopAndScan)
    }

    /// Drags the edges `dir` controls to `pos`. Leaves the selection untouched
    /// and returns false when that would go below the minimum size.
    fn resize(&mut self, dir: Direction, pos: Pos) -> bool {
        let edges = dir.edges();
        let min = self.min_size as i32;
        let rect = self.rect();
        let (mut left, mut top, mut right, mut bottom) =
            (rect.left(), rect.top(), rect.right(), rect.bottom());

        if edges.north {
            if bottom - pos.y < min {
                return false;
            }
            top = pos.y;
        }
        if edges.east {
            if pos.x - left < min {
                return false;
            }
            right = pos.x;
        }
        if edges.south {
            if pos.y - top < min {
                return false;
            }
            bottom = pos.y;
        }
        if edges.west {
            if right - pos.x < min {
                return false;
            }
            left = pos.x;
        }
        self.start = Pos::new(left, top);
        self.end = Pos::new(right, bottom);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> InteractionController {
        InteractionController::new(Pos::new(300, 300), Pos::new(550, 550), DEFAULT_MIN_SIZE)
    }

    #[test]
    fn test_edge_table() {
        assert_eq!(Direction::NE.edges(), Edges::new(true, true, false, false));
        assert_eq!(Direction::SW.edges(), Edges::new(false, false, true, true));
        assert_eq!(Direction::W.edges(), Edges::new(false, false, false, true));
        for dir in Direction::ALL {
            let edges = dir.edges();
            assert!(!(edges.north && edges.south));
            assert!(!(edges.east && edges.west));
        }
    }

    #[test]
    fn test_hit_test() {
        let c = controller();
        assert_eq!(c.hit_test(Pos::new(400, 400)), Some(Target::Body));
        assert_eq!(c.hit_test(Pos::new(400, 290)), Some(Target::Handle(Direction::N)));
        assert_eq!(c.hit_test(Pos::new(555, 295)), Some(Target::Handle(Direction::NE)));
        assert_eq!(c.hit_test(Pos::new(560, 400)), Some(Target::Handle(Direction::E)));
        assert_eq!(c.hit_test(Pos::new(290, 560)), Some(Target::Handle(Direction::SW)));
        assert_eq!(c.hit_test(Pos::new(100, 100)), None);
    }

    #[test]
    fn test_move_translates_both_corners() {
        let mut c = controller();
        assert_eq!(c.pointer_down(Pos::new(400, 400)), Some(ScanCommand::Reset(ScanRate::Moderate)));
        c.pointer_move(Pos::new(410, 395), 0);
        c.pointer_move(Pos::new(430, 400), 100);
        assert_eq!(c.corners(), (Pos::new(330, 300), Pos::new(580, 550)));
        assert_eq!(c.pointer_up(), Some(ScanCommand::StopAndScan));
        assert_eq!(c.gesture(), Gesture::Idle);
        assert_eq!(c.pointer_up(), None);
    }

    #[test]
    fn test_move_leaving_selection_ends_gesture() {
        let mut c = controller();
        c.pointer_down(Pos::new(400, 400));
        assert_eq!(c.pointer_move(Pos::new(900, 900), 0), Some(ScanCommand::StopAndScan));
        assert_eq!(c.rect(), Rect::new(300, 300, 250, 250));
        assert_eq!(c.pointer_move(Pos::new(400, 400), 50), None);
    }

    #[test]
    fn test_slow_move_switches_to_frequent() {
        let mut c = controller();
        c.pointer_down(Pos::new(400, 400));
        let mut commands = Vec::new();
        for i in 0..=12 {
            if let Some(cmd) = c.pointer_move(Pos::new(400 + i, 400), i as u64 * 100) {
                commands.push(cmd);
            }
        }
        assert_eq!(commands, vec![ScanCommand::Reset(ScanRate::Frequent)]);
        assert_eq!(c.rate(), ScanRate::Frequent);
        c.pointer_up();
        assert_eq!(c.rate(), ScanRate::Moderate);
    }

    #[test]
    fn test_resize_ne_moves_top_and_right() {
        let mut c = controller();
        assert_eq!(c.pointer_down(Pos::new(555, 295)), Some(ScanCommand::Reset(ScanRate::Moderate)));
        assert_eq!(c.gesture(), Gesture::Resizing(Direction::NE));
        c.pointer_move(Pos::new(580, 280), 0);
        assert_eq!(c.rect(), Rect::new(300, 280, 280, 270));
        assert_eq!(c.pointer_up(), Some(ScanCommand::StopAndScan));
    }

    #[test]
    fn test_resize_below_minimum_is_rejected() {
        let mut c = controller();
        c.pointer_down(Pos::new(560, 400));
        // 540 - 300 = 240, fine
        c.pointer_move(Pos::new(540, 400), 0);
        assert_eq!(c.rect().width, 240);
        // 499 - 300 = 199, the held handle still covers it
        c.pointer_move(Pos::new(499, 400), 10);
        assert_eq!(c.rect().width, 240);
        c.pointer_up();

        let mut c = controller();
        c.pointer_down(Pos::new(290, 560));
        c.pointer_move(Pos::new(320, 540), 0);
        assert_eq!(c.rect(), Rect::new(320, 300, 230, 240));
        // south alone would pass, west leaves 190: whole adjustment dropped
        c.pointer_move(Pos::new(360, 530), 10);
        assert_eq!(c.rect(), Rect::new(320, 300, 230, 240));
    }

    #[test]
    fn test_resize_never_below_minimum() {
        let mut c = controller();
        for (i, dir) in Direction::ALL.iter().enumerate() {
            let region = dir.region(c.rect(), false);
            let grab = Pos::new(region.x + region.width as i32 / 2, region.y + region.height as i32 / 2);
            assert_eq!(c.pointer_down(grab), Some(ScanCommand::Reset(ScanRate::Moderate)));
            for step in 0..40 {
                let rect = c.rect();
                let center = Pos::new(rect.x + rect.width as i32 / 2, rect.y + rect.height as i32 / 2);
                let toward = Pos::new(
                    grab.x + (center.x - grab.x).signum() * step * 5,
                    grab.y + (center.y - grab.y).signum() * step * 5,
                );
                c.pointer_move(toward, (i * 100 + step as usize) as u64);
                assert!(c.rect().width >= DEFAULT_MIN_SIZE);
                assert!(c.rect().height >= DEFAULT_MIN_SIZE);
            }
            c.pointer_up();
        }
    }

    #[test]
    fn test_leave_ends_resize() {
        let mut c = controller();
        c.pointer_down(Pos::new(400, 290));
        assert_eq!(c.pointer_move(Pos::new(400, 100), 0), Some(ScanCommand::StopAndScan));
        assert_eq!(c.rect(), Rect::new(300, 300, 250, 250));
        assert_eq!(c.pointer_leave(), None);
    }
}
