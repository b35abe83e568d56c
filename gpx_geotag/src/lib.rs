//! Geotag JPEG photographs from GPX tracks.
//!
//! Track points from any number of GPX files are merged into one time-ordered
//! [`TrackPointStore`]. Each photo's capture time is matched against the
//! nearest sample, gated by a maximum time gap, linearly interpolated and
//! written back as an EXIF GPS tag group.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod batch;
pub mod gps;
pub mod interp;
pub mod photo;
pub mod track;

pub use batch::{correlate, run_batch, BatchReport, CorrelationResult, FailureStage, PhotoFailure};
pub use gps::{
    encode, to_dms, Altitude, AltitudeRef, GpsFields, LatitudeRef, LongitudeRef, Rational,
};
pub use interp::{interpolate, time_gap, within_threshold, Position};
pub use photo::{
    capture_timestamp, load_photos, parse_utc_offset, ExifJpeg, MetadataStore, PhotoRecord,
};
pub use track::{
    naive_to_epoch, parse_gpx, parse_gpx_in, read_gpx_file, TrackPoint, TrackPointStore,
};

#[derive(Error, Debug)]
pub enum GeotagError {
    #[error("no track points with a timestamp were loaded")]
    EmptyTrack,
    #[error("failed to parse GPX data: {0}")]
    GpxParse(String),
    #[error("metadata field {field} is missing")]
    MetadataFieldMissing { field: &'static str },
    #[error("invalid capture time: {0}")]
    InvalidCaptureTime(String),
    #[error("invalid UTC offset '{0}', expected +HH:MM, -HH:MM or Z")]
    InvalidUtcOffset(String),
    #[error("not a valid JPEG: {0}")]
    InvalidJpeg(String),
    #[error("EXIF segment of {0} bytes does not fit in a JPEG APP1 segment")]
    ExifTooLarge(usize),
    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tuning for a geotagging run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Params {
    /// Largest accepted gap, in seconds, between a photo and its nearest
    /// track point.
    pub threshold_s: f64,
    /// Correlate and report without touching any photo.
    pub dry_run: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            threshold_s: 120.0,
            dry_run: false,
        }
    }
}
