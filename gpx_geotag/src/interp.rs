//! Threshold gate and linear interpolation between track points.

use serde::{Deserialize, Serialize};

use crate::track::{TrackPoint, TrackPointStore};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
}

impl From<&TrackPoint> for Position {
    fn from(point: &TrackPoint) -> Self {
        Self {
            latitude: point.latitude,
            longitude: point.longitude,
            elevation: point.elevation,
        }
    }
}

pub fn time_gap(point: &TrackPoint, target: i64) -> f64 {
    (point.timestamp - target).abs() as f64
}

/// A gap exactly equal to the threshold passes.
pub fn within_threshold(point: &TrackPoint, target: i64, threshold_s: f64) -> bool {
    time_gap(point, target) <= threshold_s
}

/// Estimate the position at `target` around the point at `closest`.
///
/// The closest point is returned as is when it sits at either end of the store
/// or matches `target` exactly. Otherwise the position is interpolated between
/// the closest point and its neighbour on the side of `target`. Elevation is
/// kept only when both points carry one.
pub fn interpolate(store: &TrackPointStore, closest: usize, target: i64) -> Position {
    let points = store.points();
    let last = points.len() - 1;
    let closest = closest.min(last);
    let here = &points[closest];

    if closest == 0 || closest == last || here.timestamp == target {
        return Position::from(here);
    }

    let (from, to) = if target > here.timestamp {
        (here, &points[closest + 1])
    } else {
        (&points[closest - 1], here)
    };
    let span = to.timestamp - from.timestamp;
    if span == 0 {
        // Two samples at one instant straddling the target; nothing to
        // interpolate between.
        return Position::from(here);
    }

    let progress = (target - from.timestamp) as f64 / span as f64;
    let lerp = |a: f64, b: f64| a + progress * (b - a);
    Position {
        latitude: lerp(from.latitude, to.latitude),
        longitude: lerp(from.longitude, to.longitude),
        elevation: match (from.elevation, to.elevation) {
            (Some(a), Some(b)) => Some(lerp(a, b)),
            _ => None,
        },
    }
}
