use nalgebra::Vector3;

/// Ordered set of physical landmark positions used for point-based registration.
///
/// Fixed and moving point sets are matched by index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointSet {
    pub points: Vec<Vector3<f64>>,
}

impl PointSet {
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        PointSet { points }
    }

    /// Builds a planar point set from `(x, y)` pairs.
    pub fn from_xy(points: &[(f64, f64)]) -> Self {
        PointSet {
            points: points.iter().map(|&(x, y)| Vector3::new(x, y, 0.0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
