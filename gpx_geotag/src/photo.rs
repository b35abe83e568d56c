//! Photo capture times and EXIF GPS writing for JPEG files.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::{FixedOffset, NaiveDateTime};
use exif::experimental::Writer;
use exif::{Context, Field, In, Reader, Tag, Value};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{FailureStage, PhotoFailure};
use crate::gps::{Altitude, AltitudeRef, GpsFields, LatitudeRef, LongitudeRef, Rational};
use crate::track::naive_to_epoch;
use crate::GeotagError;

const CAPTURE_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// A photo to geotag with its capture time in epoch seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub path: PathBuf,
    pub capture_timestamp: i64,
}

/// Access to a photo's embedded metadata.
pub trait MetadataStore {
    /// The raw original capture time, `YYYY:MM:DD HH:MM:SS`.
    fn original_capture_time(&self, path: &Path) -> Result<String, GeotagError>;

    /// Replace the photo's GPS tag group with `fields`.
    fn write_gps_fields(&self, path: &Path, fields: &GpsFields) -> Result<(), GeotagError>;
}

/// Load every photo's capture time.
///
/// A photo that cannot be read does not stop the others; it is returned as a
/// load failure instead.
pub fn load_photos<M>(
    paths: &[PathBuf],
    offset: FixedOffset,
    metadata: &M,
) -> (Vec<PhotoRecord>, Vec<PhotoFailure>)
where
    M: MetadataStore + Sync,
{
    let loaded: Vec<Result<PhotoRecord, PhotoFailure>> = paths
        .par_iter()
        .map(|path| {
            metadata
                .original_capture_time(path)
                .and_then(|raw| capture_timestamp(&raw, offset))
                .map(|capture_timestamp| PhotoRecord {
                    path: path.clone(),
                    capture_timestamp,
                })
                .map_err(|err| PhotoFailure {
                    path: path.clone(),
                    stage: FailureStage::Load,
                    message: err.to_string(),
                })
        })
        .collect();

    let mut photos = Vec::with_capacity(loaded.len());
    let mut failures = Vec::new();
    for item in loaded {
        match item {
            Ok(photo) => photos.push(photo),
            Err(failure) => failures.push(failure),
        }
    }
    (photos, failures)
}

/// Epoch seconds of an EXIF capture time taken at a fixed UTC offset.
pub fn capture_timestamp(raw: &str, offset: FixedOffset) -> Result<i64, GeotagError> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), CAPTURE_TIME_FORMAT)
        .map_err(|e| GeotagError::InvalidCaptureTime(format!("{raw:?}: {e}")))?;
    Ok(naive_to_epoch(naive, &offset))
}

/// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
pub fn parse_utc_offset(input: &str) -> Result<FixedOffset, GeotagError> {
    let invalid = || GeotagError::InvalidUtcOffset(input.to_string());
    let trimmed = input.trim();
    if trimmed == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }
    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 && rest.is_char_boundary(2) => rest.split_at(2),
        None => return Err(invalid()),
    };
    if hours.len() != 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// JPEG files with EXIF metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExifJpeg;

impl ExifJpeg {
    /// The GPS tag group currently stored in a photo, if complete.
    pub fn read_gps_fields(&self, path: &Path) -> Result<Option<GpsFields>, GeotagError> {
        let data = fs::read(path)?;
        let exif = match read_exif(&data)? {
            Some(exif) => exif,
            None => return Ok(None),
        };
        let rationals = |tag: Tag| match exif.get_field(tag, In::PRIMARY).map(|f| &f.value) {
            Some(Value::Rational(values)) => Some(
                values
                    .iter()
                    .map(|v| Rational {
                        num: v.num,
                        denom: v.denom,
                    })
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };
        let ascii = |tag: Tag| match exif.get_field(tag, In::PRIMARY).map(|f| &f.value) {
            Some(Value::Ascii(values)) => values.first().cloned(),
            _ => None,
        };
        let triple = |values: Vec<Rational>| -> Option<[Rational; 3]> { values.try_into().ok() };

        let (Some(lat_ref), Some(lat), Some(lon_ref), Some(lon)) = (
            ascii(Tag::GPSLatitudeRef),
            rationals(Tag::GPSLatitude).and_then(triple),
            ascii(Tag::GPSLongitudeRef),
            rationals(Tag::GPSLongitude).and_then(triple),
        ) else {
            return Ok(None);
        };
        let version = match exif.get_field(Tag::GPSVersionID, In::PRIMARY).map(|f| &f.value) {
            Some(Value::Byte(bytes)) if bytes.len() == 4 => {
                [bytes[0], bytes[1], bytes[2], bytes[3]]
            }
            _ => [0; 4],
        };
        let altitude_ref = exif
            .get_field(Tag::GPSAltitudeRef, In::PRIMARY)
            .and_then(|f| f.value.get_uint(0));
        let altitude = rationals(Tag::GPSAltitude)
            .and_then(|values| values.first().copied())
            .map(|value| Altitude {
                reference: if altitude_ref == Some(1) {
                    AltitudeRef::BelowSeaLevel
                } else {
                    AltitudeRef::AboveSeaLevel
                },
                value,
            });

        Ok(Some(GpsFields {
            version,
            latitude_ref: if lat_ref.starts_with(b"S") {
                LatitudeRef::South
            } else {
                LatitudeRef::North
            },
            latitude: lat,
            longitude_ref: if lon_ref.starts_with(b"W") {
                LongitudeRef::West
            } else {
                LongitudeRef::East
            },
            longitude: lon,
            altitude,
        }))
    }
}

impl MetadataStore for ExifJpeg {
    fn original_capture_time(&self, path: &Path) -> Result<String, GeotagError> {
        let data = fs::read(path)?;
        let missing = GeotagError::MetadataFieldMissing {
            field: "DateTimeOriginal",
        };
        let exif = read_exif(&data)?.ok_or(missing)?;
        match exif
            .get_field(Tag::DateTimeOriginal, In::PRIMARY)
            .map(|f| &f.value)
        {
            Some(Value::Ascii(values)) if !values.is_empty() => {
                let raw = String::from_utf8_lossy(&values[0]);
                Ok(raw.trim_end_matches('\0').trim().to_string())
            }
            _ => Err(GeotagError::MetadataFieldMissing {
                field: "DateTimeOriginal",
            }),
        }
    }

    fn write_gps_fields(&self, path: &Path, fields: &GpsFields) -> Result<(), GeotagError> {
        let data = fs::read(path)?;
        let existing = read_exif(&data)?;
        let gps = gps_exif_fields(fields);

        let mut writer = Writer::new();
        let mut little_endian = false;
        let mut thumbnail: Option<&[u8]> = None;
        if let Some(exif) = existing.as_ref() {
            little_endian = exif.little_endian();
            for field in exif.fields() {
                if field.tag.context() != Context::Gps {
                    writer.push_field(field);
                }
            }
            thumbnail = thumbnail_bytes(exif);
            if let Some(jpeg) = thumbnail {
                writer.set_jpeg(jpeg, In::THUMBNAIL);
            }
        }
        for field in &gps {
            writer.push_field(field);
        }

        let mut tiff = Cursor::new(Vec::new());
        writer.write(&mut tiff, little_endian)?;
        let updated = splice_exif_segment(&data, tiff.get_ref())?;
        debug!(
            "Writing {} byte EXIF segment to {} (thumbnail kept: {})",
            tiff.get_ref().len(),
            path.display(),
            thumbnail.is_some()
        );
        replace_file(path, &updated)
    }
}

fn read_exif(data: &[u8]) -> Result<Option<exif::Exif>, GeotagError> {
    match Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif) => Ok(Some(exif)),
        Err(exif::Error::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn thumbnail_bytes(exif: &exif::Exif) -> Option<&[u8]> {
    let offset = exif
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let len = exif
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    exif.buf().get(offset..offset.checked_add(len)?)
}

fn gps_exif_fields(gps: &GpsFields) -> Vec<Field> {
    let rationals = |values: &[Rational]| {
        Value::Rational(
            values
                .iter()
                .map(|r| exif::Rational {
                    num: r.num,
                    denom: r.denom,
                })
                .collect(),
        )
    };
    let field = |tag: Tag, value: Value| Field {
        tag,
        ifd_num: In::PRIMARY,
        value,
    };

    // Ascending tag order within the GPS IFD.
    let mut fields = vec![
        field(Tag::GPSVersionID, Value::Byte(gps.version.to_vec())),
        field(
            Tag::GPSLatitudeRef,
            Value::Ascii(vec![gps.latitude_ref.as_str().as_bytes().to_vec()]),
        ),
        field(Tag::GPSLatitude, rationals(&gps.latitude)),
        field(
            Tag::GPSLongitudeRef,
            Value::Ascii(vec![gps.longitude_ref.as_str().as_bytes().to_vec()]),
        ),
        field(Tag::GPSLongitude, rationals(&gps.longitude)),
    ];
    if let Some(altitude) = gps.altitude {
        fields.push(field(
            Tag::GPSAltitudeRef,
            Value::Byte(vec![altitude.reference.as_byte()]),
        ));
        fields.push(field(Tag::GPSAltitude, rationals(&[altitude.value])));
    }
    fields
}

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const APP0: u8 = 0xE0;
const APP1: u8 = 0xE1;
const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// Put `tiff` into `jpeg` as its EXIF APP1 segment.
///
/// An existing EXIF segment is dropped; the new one goes right after SOI and
/// any APP0 (JFIF) segment. Everything from the start of scan on is copied
/// unchanged.
fn splice_exif_segment(jpeg: &[u8], tiff: &[u8]) -> Result<Vec<u8>, GeotagError> {
    if jpeg.len() < 2 || jpeg[0] != MARKER || jpeg[1] != SOI {
        return Err(GeotagError::InvalidJpeg("missing start-of-image marker".into()));
    }
    let seg_len = 2 + EXIF_HEADER.len() + tiff.len();
    let seg_len_u16 = u16::try_from(seg_len).map_err(|_| GeotagError::ExifTooLarge(seg_len))?;
    let mut app1 = Vec::with_capacity(seg_len + 2);
    app1.extend_from_slice(&[MARKER, APP1]);
    app1.extend_from_slice(&seg_len_u16.to_be_bytes());
    app1.extend_from_slice(EXIF_HEADER);
    app1.extend_from_slice(tiff);

    let mut out = Vec::with_capacity(jpeg.len() + app1.len());
    out.extend_from_slice(&jpeg[..2]);
    let mut inserted = false;
    let mut pos = 2;
    while pos < jpeg.len() {
        if jpeg[pos] != MARKER {
            return Err(GeotagError::InvalidJpeg(format!(
                "expected marker at byte {pos}"
            )));
        }
        // Fill bytes before a marker code.
        if jpeg.get(pos + 1) == Some(&MARKER) {
            pos += 1;
            continue;
        }
        let Some(&code) = jpeg.get(pos + 1) else {
            return Err(GeotagError::InvalidJpeg("truncated marker".into()));
        };
        if code == SOS || code == EOI {
            break;
        }
        if code == 0x01 || (0xD0..=0xD7).contains(&code) {
            out.extend_from_slice(&jpeg[pos..pos + 2]);
            pos += 2;
            continue;
        }
        let len_bytes = jpeg
            .get(pos + 2..pos + 4)
            .ok_or_else(|| GeotagError::InvalidJpeg("truncated segment length".into()))?;
        let end = pos + 2 + usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        let segment = jpeg
            .get(pos..end)
            .ok_or_else(|| {
                GeotagError::InvalidJpeg(format!("segment at byte {pos} overruns file"))
            })?;

        let is_exif = code == APP1 && segment.get(4..).is_some_and(|p| p.starts_with(EXIF_HEADER));
        if !inserted && code != APP0 {
            out.extend_from_slice(&app1);
            inserted = true;
        }
        if !is_exif {
            out.extend_from_slice(segment);
        }
        pos = end;
    }
    if !inserted {
        out.extend_from_slice(&app1);
    }
    out.extend_from_slice(&jpeg[pos.min(jpeg.len())..]);
    Ok(out)
}

fn replace_file(path: &Path, contents: &[u8]) -> Result<(), GeotagError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".gpx_geotag.tmp");
    let tmp = path.with_file_name(tmp_name);
    let permissions = fs::metadata(path).map(|m| m.permissions()).ok();
    fs::write(&tmp, contents)?;
    let replaced = match permissions {
        Some(permissions) => fs::set_permissions(&tmp, permissions),
        None => Ok(()),
    }
    .and_then(|()| fs::rename(&tmp, path));
    if let Err(err) = replaced {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}
