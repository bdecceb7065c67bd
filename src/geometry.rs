#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub x: i32,
    pub y: i32,
}
impl Pos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
    #[inline]
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
    pub fn distance(self, other: Pos) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}
impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Axis aligned rectangle in viewport space. Width and height can't go negative.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}
impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Builds the rectangle spanned by two arbitrary corners.
    pub fn from_corners(start: Pos, end: Pos) -> Self {
        let mut x = start.x;
        let mut y = start.y;
        let mut width = end.x - start.x;
        let mut height = end.y - start.y;
        if width < 0 {
            x = end.x;
            width = -width;
        }
        if height < 0 {
            y = end.y;
            height = -height;
        }
        Self::new(x, y, width as u32, height as u32)
    }

    #[inline]
    pub fn left(&self) -> i32 {
        self.x
    }
    #[inline]
    pub fn top(&self) -> i32 {
        self.y
    }
    #[inline]
    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }
    #[inline]
    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Half-open containment, `right()` and `bottom()` are outside.
    pub fn contains(&self, pos: Pos) -> bool {
        pos.x >= self.left() && pos.x < self.right() && pos.y >= self.top() && pos.y < self.bottom()
    }

    /// Rectangle covering `[left, right) x [top, bottom)`, empty when inverted.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, (right - left).max(0) as u32, (bottom - top).max(0) as u32)
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::from_edges(
            self.left().max(other.left()),
            self.top().max(other.top()),
            self.right().min(other.right()),
            self.bottom().min(other.bottom()),
        );
        (!r.is_empty()).then_some(r)
    }

    pub fn to_skia(&self) -> Option<tiny_skia::Rect> {
        tiny_skia::Rect::from_xywh(self.x as f32, self.y as f32, self.width as f32, self.height as f32)
    }
}

/// The four panels dimming everything outside the selection.
///
/// They tile the container like a pinwheel: north runs from the left edge to
/// the selection's right edge, east from the top to the selection's bottom,
/// south from the selection's left to the right edge, west from the
/// selection's top to the bottom.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perimeters {
    pub north: Rect,
    pub east: Rect,
    pub south: Rect,
    pub west: Rect,
}
impl Perimeters {
    pub fn iter(&self) -> impl Iterator<Item = &Rect> {
        [&self.north, &self.east, &self.south, &self.west].into_iter()
    }
}

pub fn perimeters(rect: Rect, container: Size) -> Perimeters {
    let cw = container.width as i32;
    let ch = container.height as i32;
    let span = |v: i32| v.max(0) as u32;

    let north = Size::new(span(rect.right()), span(rect.top()));
    let east = Size::new(span(cw - rect.right()), span(rect.bottom()));
    let south = Size::new(span(cw - rect.left()), span(ch - rect.bottom()));
    let west = Size::new(span(rect.left()), span(ch - rect.top()));

    Perimeters {
        north: Rect::new(0, 0, north.width, north.height),
        east: Rect::new(cw - east.width as i32, 0, east.width, east.height),
        south: Rect::new(
            cw - south.width as i32,
            ch - south.height as i32,
            south.width,
            south.height,
        ),
        west: Rect::new(0, ch - west.height as i32, west.width, west.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_forward_corners() {
        let rect = Rect::from_corners(Pos::new(300, 300), Pos::new(550, 550));
        assert_eq!(rect, Rect::new(300, 300, 250, 250));
    }

    #[test]
    fn test_normalize_flipped_x() {
        let rect = Rect::from_corners(Pos::new(550, 300), Pos::new(300, 550));
        assert_eq!(rect, Rect::new(300, 300, 250, 250));
    }

    #[test]
    fn test_normalize_all_quadrants_match_bounding_box() {
        let corners = [
            (Pos::new(10, 20), Pos::new(40, 90)),
            (Pos::new(40, 20), Pos::new(10, 90)),
            (Pos::new(10, 90), Pos::new(40, 20)),
            (Pos::new(40, 90), Pos::new(10, 20)),
            (Pos::new(-5, 7), Pos::new(-5, 7)),
        ];
        for (a, b) in corners {
            let rect = Rect::from_corners(a, b);
            assert_eq!(rect.left(), a.x.min(b.x));
            assert_eq!(rect.top(), a.y.min(b.y));
            assert_eq!(rect.right(), a.x.max(b.x));
            assert_eq!(rect.bottom(), a.y.max(b.y));
        }
    }

    #[test]
    fn test_perimeters_cover_outside() {
        let container = Size::new(1000, 800);
        let rect = Rect::new(300, 200, 250, 100);
        let p = perimeters(rect, container);
        assert_eq!(p.north, Rect::new(0, 0, 550, 200));
        assert_eq!(p.east, Rect::new(550, 0, 450, 300));
        assert_eq!(p.south, Rect::new(300, 300, 700, 500));
        assert_eq!(p.west, Rect::new(0, 200, 300, 600));

        let area: u32 = p.iter().map(|r| r.width * r.height).sum();
        assert_eq!(area + rect.width * rect.height, 1000 * 800);
        for panel in p.iter() {
            assert!(panel.intersect(&rect).is_none());
        }
    }

    #[test]
    fn test_perimeters_selection_past_container() {
        let p = perimeters(Rect::new(900, 700, 300, 300), Size::new(1000, 800));
        assert_eq!(p.east.width, 0);
        assert_eq!(p.south.height, 0);
    }
}
