//! Per-photo correlation and the batch driver.

use std::path::PathBuf;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::gps::encode;
use crate::interp::{interpolate, time_gap, within_threshold, Position};
use crate::photo::{MetadataStore, PhotoRecord};
use crate::track::TrackPointStore;
use crate::Params;

/// Outcome of matching one photo against the track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub photo: PhotoRecord,
    pub succeeded: bool,
    /// Seconds between the photo and its nearest track point.
    pub time_gap_s: f64,
    pub position: Option<Position>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStage {
    Load,
    Write,
}

/// A photo that could not be read or updated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoFailure {
    pub path: PathBuf,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub geotagged: Vec<CorrelationResult>,
    pub not_geotagged: Vec<CorrelationResult>,
    pub failures: Vec<PhotoFailure>,
}

/// Match one photo against the track.
pub fn correlate(
    store: &TrackPointStore,
    photo: &PhotoRecord,
    threshold_s: f64,
) -> CorrelationResult {
    let target = photo.capture_timestamp;
    let closest = store.locate(target);
    let point = &store.points()[closest];
    let time_gap_s = time_gap(point, target);

    if !within_threshold(point, target, threshold_s) {
        return CorrelationResult {
            photo: photo.clone(),
            succeeded: false,
            time_gap_s,
            position: None,
        };
    }
    CorrelationResult {
        photo: photo.clone(),
        succeeded: true,
        time_gap_s,
        position: Some(interpolate(store, closest, target)),
    }
}

/// Correlate every photo and write GPS tags for those within the threshold.
///
/// Photos are independent: a rejected match or a failed write is recorded and
/// the rest of the batch carries on. Results keep the order of `photos`.
pub fn run_batch<M>(
    store: &TrackPointStore,
    photos: &[PhotoRecord],
    params: &Params,
    metadata: &M,
) -> BatchReport
where
    M: MetadataStore + Sync,
{
    let outcomes: Vec<(CorrelationResult, Option<PhotoFailure>)> = photos
        .par_iter()
        .map(|photo| {
            let result = correlate(store, photo, params.threshold_s);
            let failure = match result.position.as_ref() {
                Some(position) if !params.dry_run => {
                    let fields = encode(position);
                    metadata
                        .write_gps_fields(&photo.path, &fields)
                        .err()
                        .map(|err| PhotoFailure {
                            path: photo.path.clone(),
                            stage: FailureStage::Write,
                            message: err.to_string(),
                        })
                }
                _ => None,
            };
            debug!(
                "{}: gap {} s, matched {}",
                photo.path.display(),
                result.time_gap_s,
                result.succeeded
            );
            (result, failure)
        })
        .collect();

    let mut report = BatchReport::default();
    for (result, failure) in outcomes {
        match failure {
            Some(failure) => report.failures.push(failure),
            None if result.succeeded => report.geotagged.push(result),
            None => report.not_geotagged.push(result),
        }
    }
    info!(
        "Geotagged {} of {} photos ({} outside threshold, {} write failures)",
        report.geotagged.len(),
        photos.len(),
        report.not_geotagged.len(),
        report.failures.len()
    );
    report
}
