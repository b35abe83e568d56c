//! Track points, the merged time-ordered store and GPX decoding.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use chrono::{DateTime, Duration, Local, NaiveDateTime, Offset, TimeZone, Timelike};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::GeotagError;

/// One timestamped sample of a recorded track.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
}

/// All points of all input tracks, sorted ascending by timestamp.
///
/// Points sharing a timestamp keep the order in which their tracks were
/// supplied. The store is never empty.
#[derive(Clone, Debug)]
pub struct TrackPointStore {
    points: Vec<TrackPoint>,
}

impl TrackPointStore {
    pub fn build(tracks: Vec<Vec<TrackPoint>>) -> Result<Self, GeotagError> {
        let mut points: Vec<TrackPoint> = tracks.into_iter().flatten().collect();
        if points.is_empty() {
            return Err(GeotagError::EmptyTrack);
        }
        // `sort_by_key` is stable.
        points.sort_by_key(|p| p.timestamp);
        Ok(Self { points })
    }

    /// Index of the point closest in time to `target`.
    ///
    /// Targets outside the recorded span resolve to the first or last point.
    /// When two neighbours are equally close the earlier one wins.
    pub fn locate(&self, target: i64) -> usize {
        let pos = self.points.partition_point(|p| p.timestamp < target);
        if pos == 0 {
            return 0;
        }
        if pos == self.points.len() {
            return self.points.len() - 1;
        }
        let before = self.points[pos - 1].timestamp;
        let after = self.points[pos].timestamp;
        if after - target < target - before {
            pos
        } else {
            pos - 1
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Always false; an empty store cannot be built.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TrackPoint> {
        self.points.get(index)
    }

    pub fn points(&self) -> &[TrackPoint] {
        &self.points
    }

    /// First and last timestamp covered by the store.
    pub fn span(&self) -> (i64, i64) {
        let first = self.points.first().map_or(0, |p| p.timestamp);
        let last = self.points.last().map_or(0, |p| p.timestamp);
        (first, last)
    }
}

/// Read and decode a GPX file from disk.
pub fn read_gpx_file(path: &Path) -> Result<Vec<TrackPoint>, GeotagError> {
    let data = fs::read(path)?;
    parse_gpx(&data)
}

/// Decode every timed track point of a GPX document.
///
/// Timestamps keep the calendar fields written in the file and are
/// reinterpreted in the local system time zone, whatever offset the file
/// states. Points without a time are dropped.
pub fn parse_gpx(input: &[u8]) -> Result<Vec<TrackPoint>, GeotagError> {
    parse_gpx_in(input, &Local)
}

/// [`parse_gpx`] with the written times read in `tz` instead of local time.
pub fn parse_gpx_in<Tz: TimeZone>(
    input: &[u8],
    tz: &Tz,
) -> Result<Vec<TrackPoint>, GeotagError> {
    let mut cursor = Cursor::new(input);
    let gpx = gpx::read(&mut cursor).map_err(|e| GeotagError::GpxParse(e.to_string()))?;
    // `gpx` normalises every time to UTC, so the written fields come from the
    // raw text.
    let written = written_track_times(input)?;
    let points: Vec<&gpx::Waypoint> = gpx
        .tracks
        .iter()
        .flat_map(|track| track.segments.iter())
        .flat_map(|segment| segment.points.iter())
        .collect();
    if points.len() != written.len() {
        return Err(GeotagError::GpxParse(format!(
            "decoded {} track points from {} <trkpt> elements",
            points.len(),
            written.len()
        )));
    }

    let mut out = Vec::with_capacity(points.len());
    let mut untimed = 0usize;
    for (point, raw) in points.into_iter().zip(written) {
        let Some(raw) = raw.filter(|_| point.time.is_some()) else {
            untimed += 1;
            continue;
        };
        let geo = point.point();
        out.push(TrackPoint {
            latitude: geo.y(),
            longitude: geo.x(),
            elevation: point.elevation,
            timestamp: naive_to_epoch(wall_clock(&raw)?, tz),
        });
    }

    if untimed > 0 {
        debug!("Skipped {} track points without a timestamp", untimed);
    }
    Ok(out)
}

/// Text of the `<time>` child of every track `<trkpt>`, in document order.
fn written_track_times(input: &[u8]) -> Result<Vec<Option<String>>, GeotagError> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut times = Vec::new();

    let in_track = |path: &[Vec<u8>]| path.iter().any(|name| name.as_slice() == b"trk");
    let in_point_time = |path: &[Vec<u8>]| {
        path.len() >= 2
            && path[path.len() - 1].as_slice() == b"time"
            && path[path.len() - 2].as_slice() == b"trkpt"
    };

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            GeotagError::GpxParse(format!(
                "XML error at position {}: {e}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name.as_slice() == b"trkpt" && in_track(&path[..]) {
                    times.push(None);
                }
                path.push(name);
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"trkpt" && in_track(&path[..]) {
                    times.push(None);
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(e) if in_point_time(&path[..]) && in_track(&path[..]) => {
                let text = e
                    .unescape()
                    .map_err(|err| GeotagError::GpxParse(err.to_string()))?;
                if let Some(slot) = times.last_mut() {
                    slot.get_or_insert_with(String::new).push_str(&text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(times)
}

/// The calendar fields of an ISO 8601 time as written, with any offset
/// ignored. Fractional seconds are truncated.
fn wall_clock(raw: &str) -> Result<NaiveDateTime, GeotagError> {
    let raw = raw.trim();
    let naive = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(|e| GeotagError::GpxParse(format!("invalid time '{raw}': {e}")))?;
    Ok(naive.with_nanosecond(0).unwrap_or(naive))
}

/// Epoch seconds of a wall-clock reading taken in `tz`.
///
/// Ambiguous readings (clocks turned back) take the earlier instant. Readings
/// that fall in a gap (clocks turned forward) use the offset in effect at the
/// UTC instant with the same fields.
pub fn naive_to_epoch<Tz: TimeZone>(naive: NaiveDateTime, tz: &Tz) -> i64 {
    match tz.from_local_datetime(&naive).earliest() {
        Some(dt) => dt.timestamp(),
        None => {
            let offset = tz.offset_from_utc_datetime(&naive).fix();
            (naive - Duration::seconds(i64::from(offset.local_minus_utc())))
                .and_utc()
                .timestamp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDate, Utc};

    fn pt(timestamp: i64, latitude: f64) -> TrackPoint {
        TrackPoint {
            latitude,
            longitude: 0.0,
            elevation: None,
            timestamp,
        }
    }

    fn store(times: &[i64]) -> TrackPointStore {
        TrackPointStore::build(vec![times.iter().map(|&t| pt(t, 0.0)).collect()]).unwrap()
    }

    #[test]
    fn build_sorts_across_tracks() {
        let store = TrackPointStore::build(vec![
            vec![pt(30, 3.0), pt(10, 1.0)],
            vec![pt(20, 2.0), pt(5, 0.5)],
        ])
        .unwrap();
        let times: Vec<i64> = store.points().iter().map(|p| p.timestamp).collect();
        assert_eq!(times, vec![5, 10, 20, 30]);
        assert_eq!(store.span(), (5, 30));
    }

    #[test]
    fn build_is_stable_for_equal_timestamps() {
        let store = TrackPointStore::build(vec![
            vec![pt(10, 1.0), pt(20, 2.0)],
            vec![pt(10, 11.0), pt(20, 12.0)],
            vec![pt(10, 21.0)],
        ])
        .unwrap();
        let lats: Vec<f64> = store.points().iter().map(|p| p.latitude).collect();
        assert_eq!(lats, vec![1.0, 11.0, 21.0, 2.0, 12.0]);
    }

    #[test]
    fn build_rejects_empty_input() {
        assert!(matches!(
            TrackPointStore::build(vec![]),
            Err(GeotagError::EmptyTrack)
        ));
        assert!(matches!(
            TrackPointStore::build(vec![vec![], vec![]]),
            Err(GeotagError::EmptyTrack)
        ));
    }

    #[test]
    fn locate_tie_favours_earlier_point() {
        let store = store(&[10, 20, 30]);
        assert_eq!(store.locate(15), 0);
        assert_eq!(store.locate(25), 1);
    }

    #[test]
    fn locate_picks_strictly_closer_point() {
        let store = store(&[10, 20, 30]);
        assert_eq!(store.locate(14), 0);
        assert_eq!(store.locate(16), 1);
        assert_eq!(store.locate(20), 1);
        assert_eq!(store.locate(29), 2);
    }

    #[test]
    fn locate_clamps_outside_span() {
        let store = store(&[10, 20, 30]);
        assert_eq!(store.locate(-100), 0);
        assert_eq!(store.locate(10), 0);
        assert_eq!(store.locate(30), 2);
        assert_eq!(store.locate(1_000), 2);

        let single = store_single();
        assert_eq!(single.locate(0), 0);
        assert_eq!(single.locate(99), 0);
    }

    fn store_single() -> TrackPointStore {
        store(&[50])
    }

    #[test]
    fn locate_exact_hit_on_duplicates_returns_first() {
        let store = store(&[10, 20, 20, 20, 30]);
        assert_eq!(store.locate(20), 1);
    }

    #[test]
    fn locate_minimises_gap() {
        let times = [-7, 0, 3, 3, 8, 20, 21, 40, 100];
        let store = store(&times);
        for target in -20..120 {
            let idx = store.locate(target);
            let best = times.iter().map(|t| (t - target).abs()).min().unwrap();
            assert_eq!((times[idx] - target).abs(), best, "target {target}");
            let first_best = times
                .iter()
                .position(|t| (t - target).abs() == best)
                .unwrap();
            assert!(idx <= first_best || times[idx] == times[first_best]);
        }
    }

    #[test]
    fn naive_to_epoch_in_fixed_zones() {
        let naive = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(naive_to_epoch(naive, &Utc), 1_685_613_600);
        let helsinki = FixedOffset::east_opt(3 * 3600).unwrap();
        assert_eq!(naive_to_epoch(naive, &helsinki), 1_685_613_600 - 3 * 3600);
    }

    const SAMPLE_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="tests" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <trkseg>
      <trkpt lat="60.1" lon="24.9"><ele>12.5</ele><time>2023-06-01T10:00:00Z</time></trkpt>
      <trkpt lat="60.2" lon="25.0"><time>2023-06-01T10:01:00Z</time></trkpt>
      <trkpt lat="60.3" lon="25.1"><ele>3.0</ele></trkpt>
    </trkseg>
  </trk>
  <trk>
    <trkseg>
      <trkpt lat="-33.5" lon="-70.25"><ele>-4.0</ele><time>2023-06-01T09:00:00Z</time></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn parse_gpx_reads_timed_points() {
        let points = parse_gpx(SAMPLE_GPX.as_bytes()).unwrap();
        assert_eq!(points.len(), 3);

        assert_eq!(points[0].latitude, 60.1);
        assert_eq!(points[0].longitude, 24.9);
        assert_eq!(points[0].elevation, Some(12.5));
        assert_eq!(points[1].elevation, None);
        assert_eq!(points[1].timestamp - points[0].timestamp, 60);

        assert_eq!(points[2].latitude, -33.5);
        assert_eq!(points[2].longitude, -70.25);
        assert_eq!(points[2].elevation, Some(-4.0));
    }

    #[test]
    fn parse_gpx_uses_local_wall_clock() {
        let points = parse_gpx(SAMPLE_GPX.as_bytes()).unwrap();
        let written = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(points[0].timestamp, naive_to_epoch(written, &Local));
    }

    const OFFSET_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="tests" xmlns="http://www.topografix.com/GPX/1/1">
  <wpt lat="1.0" lon="1.0"><time>2001-01-01T00:00:00Z</time></wpt>
  <trk>
    <trkseg>
      <trkpt lat="60.1" lon="24.9"><time>2023-06-01T10:00:00+03:00</time></trkpt>
      <trkpt lat="60.2" lon="25.0"/>
      <trkpt lat="60.3" lon="25.1"><time>2023-06-01T10:00:30.900Z</time></trkpt>
      <trkpt lat="60.4" lon="25.2"><time>2023-06-01T05:01:00.999-05:00</time></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    #[test]
    fn parse_gpx_ignores_written_offset() {
        let points = parse_gpx_in(OFFSET_GPX.as_bytes(), &Utc).unwrap();
        let times: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
        // 10:00:00, 10:00:30 and 05:01:00 read as UTC wall-clock fields.
        assert_eq!(times, vec![1_685_613_600, 1_685_613_630, 1_685_595_660]);
        assert_eq!(points[1].latitude, 60.3);

        let helsinki = FixedOffset::east_opt(3 * 3600).unwrap();
        let points = parse_gpx_in(OFFSET_GPX.as_bytes(), &helsinki).unwrap();
        assert_eq!(points[0].timestamp, 1_685_613_600 - 3 * 3600);
    }

    #[test]
    fn parse_gpx_offset_times_in_local_zone() {
        let points = parse_gpx(OFFSET_GPX.as_bytes()).unwrap();
        let written = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(points[0].timestamp, naive_to_epoch(written, &Local));
    }

    #[test]
    fn wall_clock_truncates_fractional_seconds() {
        let expected = NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(wall_clock("2023-06-01T10:00:00.999+03:00").unwrap(), expected);
        assert_eq!(wall_clock("2023-06-01T10:00:00.5Z").unwrap(), expected);
        assert_eq!(wall_clock("2023-06-01T10:00:00").unwrap(), expected);
        assert!(matches!(
            wall_clock("yesterday"),
            Err(GeotagError::GpxParse(_))
        ));
    }

    #[test]
    fn parse_gpx_rejects_garbage() {
        assert!(matches!(
            parse_gpx(b"<not-gpx/>"),
            Err(GeotagError::GpxParse(_))
        ));
    }
}
