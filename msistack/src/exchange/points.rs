use std::fs;
use std::path::Path;

use nalgebra::Vector3;

use msicore::data::points::PointSet;
use msicore::error::{MsiError, Result};

use crate::exchange::parameters::format_invariant;

/// Write a point set in the alignment engine's landmark format.
///
/// The file starts with `point` (physical coordinates), the number of points, then one
/// line per point with `dimension` coordinates.
pub fn write_point_set(path: &Path, points: &PointSet, dimension: usize) -> Result<()> {
    if !(2..=3).contains(&dimension) {
        return Err(MsiError::InvalidInput(format!("point dimension {} not supported", dimension)));
    }
    let mut text = format!("point\n{}\n", points.len());
    for p in &points.points {
        let coords: Vec<String> = p.iter().take(dimension).map(|v| format_invariant(*v)).collect();
        text.push_str(&coords.join(" "));
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

/// Read a landmark file written by [`write_point_set`] or by hand.
///
/// Both `point` and `index` headers are accepted, index coordinates are taken as given.
pub fn read_point_set(path: &Path) -> Result<PointSet> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    match lines.next() {
        Some("point") | Some("index") => {}
        other => {
            return Err(MsiError::format(format!(
                "{}: expected 'point' or 'index' header, found {:?}",
                path.display(),
                other
            )))
        }
    }
    let count: usize = lines
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| MsiError::format(format!("{}: missing point count", path.display())))?;

    let mut points = Vec::with_capacity(count);
    for line in lines.take(count) {
        let coords = line
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()
            .map_err(|e| MsiError::format(format!("{}: bad point '{}': {}", path.display(), line, e)))?;
        if coords.len() < 2 {
            return Err(MsiError::format(format!("{}: point '{}' needs two coordinates", path.display(), line)));
        }
        points.push(Vector3::new(coords[0], coords[1], coords.get(2).copied().unwrap_or(0.0)));
    }
    if points.len() != count {
        return Err(MsiError::format(format!(
            "{}: header announces {} points, found {}",
            path.display(),
            count,
            points.len()
        )));
    }
    Ok(PointSet::new(points))
}
