use crate::geom::LocalPoint;

/// Restartable, finite view over a node's retained points.
///
/// Borrowing the arena slice keeps the points in place; the exporter walks it
/// as many times as it needs without copying.
#[derive(Debug, Clone)]
pub struct PointStream<'a> {
    points: &'a [LocalPoint],
    cursor: usize,
}

impl<'a> PointStream<'a> {
    pub fn new(points: &'a [LocalPoint]) -> Self {
        Self { points, cursor: 0 }
    }

    /// Total points in the stream, regardless of the cursor.
    pub fn total(&self) -> usize {
        self.points.len()
    }

    /// Rewind to the first point.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn as_slice(&self) -> &'a [LocalPoint] {
        self.points
    }
}

impl<'a> Iterator for PointStream<'a> {
    type Item = &'a LocalPoint;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.points.get(self.cursor)?;
        self.cursor += 1;
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.points.len() - self.cursor;
        (left, Some(left))
    }
}

impl ExactSizeIterator for PointStream<'_> {}
