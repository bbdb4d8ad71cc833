//! Fixed four-slot marker detections and the derived outer quadrilateral

use nalgebra::Point2;

/// Number of fiducials framing the surface
pub const MARKER_COUNT: usize = 4;

/// Corner of each marker that lies on the outer boundary of the surface.
/// Marker `i` sits at surface corner `i` (TL, TR, BR, BL) and its corners are
/// reported in the same clockwise order, so the outer one shares the index.
pub const OUTER_CORNER_INDEX: [usize; MARKER_COUNT] = [0, 1, 2, 3];

/// Four points ordered top-left, top-right, bottom-right, bottom-left
pub type Quad = [Point2<f64>; 4];

/// Detections of one cycle. Slot `i` always belongs to marker id `i`,
/// whatever order the detector found them in.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MarkerSet {
    slots: [Option<Quad>; MARKER_COUNT],
}

impl MarkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the corners of marker `id`. Ids outside `0..4` are not part of
    /// the surface and are ignored; returns whether the id was accepted.
    pub fn insert(&mut self, id: usize, corners: Quad) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) => {
                *slot = Some(corners);
                true
            }
            None => false,
        }
    }

    pub fn with(mut self, id: usize, corners: Quad) -> Self {
        self.insert(id, corners);
        self
    }

    pub fn get(&self, id: usize) -> Option<&Quad> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn detected_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.detected_count() == MARKER_COUNT
    }

    pub fn is_empty(&self) -> bool {
        self.detected_count() == 0
    }

    /// The surface corners, one per marker, if every marker was seen.
    pub fn outer_corners(&self) -> Option<Quad> {
        let mut quad = [Point2::origin(); 4];
        for (id, point) in quad.iter_mut().enumerate() {
            *point = self.get(id)?[OUTER_CORNER_INDEX[id]];
        }
        Some(quad)
    }

    /// Mean per-corner distance between this cycle and `previous`, over the
    /// markers present in both. Infinite when no marker is shared.
    pub fn mean_displacement(&self, previous: &MarkerSet) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;

        for (current, prior) in self.slots.iter().zip(previous.slots.iter()) {
            if let (Some(current), Some(prior)) = (current, prior) {
                for (a, b) in current.iter().zip(prior.iter()) {
                    total += nalgebra::distance(a, b);
                    count += 1;
                }
            }
        }

        if count == 0 {
            f64::INFINITY
        } else {
            total / count as f64
        }
    }
}

/// Axis-aligned square marker of side `size` with top-left corner at `(x, y)`
#[cfg(test)]
pub(crate) fn square(x: f64, y: f64, size: f64) -> Quad {
    [
        Point2::new(x, y),
        Point2::new(x + size, y),
        Point2::new(x + size, y + size),
        Point2::new(x, y + size),
    ]
}
