//! EXIF GPS tag group and the decimal degree to D/M/S rational encoding.

use serde::{Deserialize, Serialize};

use crate::interp::Position;

/// Value of the GPSVersionID tag written with every tag group.
pub const GPS_VERSION: [u8; 4] = [2, 3, 0, 0];

const COORD_DENOM: u32 = 1000;
const ALTITUDE_DENOM: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub denom: u32,
}

impl Rational {
    fn scaled(value: f64, denom: u32) -> Self {
        Self {
            num: (value.abs() * f64::from(denom)).round() as u32,
            denom,
        }
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.num) / f64::from(self.denom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatitudeRef {
    North,
    South,
}

impl LatitudeRef {
    pub fn as_str(self) -> &'static str {
        match self {
            LatitudeRef::North => "N",
            LatitudeRef::South => "S",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LongitudeRef {
    East,
    West,
}

impl LongitudeRef {
    pub fn as_str(self) -> &'static str {
        match self {
            LongitudeRef::East => "E",
            LongitudeRef::West => "W",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AltitudeRef {
    AboveSeaLevel,
    BelowSeaLevel,
}

impl AltitudeRef {
    pub fn as_byte(self) -> u8 {
        match self {
            AltitudeRef::AboveSeaLevel => 0,
            AltitudeRef::BelowSeaLevel => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Altitude {
    pub reference: AltitudeRef,
    pub value: Rational,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsFields {
    pub version: [u8; 4],
    pub latitude_ref: LatitudeRef,
    pub latitude: [Rational; 3],
    pub longitude_ref: LongitudeRef,
    pub longitude: [Rational; 3],
    pub altitude: Option<Altitude>,
}

impl GpsFields {
    pub fn decode_latitude(&self) -> f64 {
        let value = from_dms(&self.latitude);
        match self.latitude_ref {
            LatitudeRef::North => value,
            LatitudeRef::South => -value,
        }
    }

    pub fn decode_longitude(&self) -> f64 {
        let value = from_dms(&self.longitude);
        match self.longitude_ref {
            LongitudeRef::East => value,
            LongitudeRef::West => -value,
        }
    }

    pub fn decode_altitude(&self) -> Option<f64> {
        self.altitude.map(|alt| match alt.reference {
            AltitudeRef::AboveSeaLevel => alt.value.to_f64(),
            AltitudeRef::BelowSeaLevel => -alt.value.to_f64(),
        })
    }
}

/// Coordinates carry three decimal digits on each of degrees, minutes and
/// seconds, altitude two. The hemisphere lives in the reference tags, so the
/// rationals themselves are unsigned.
pub fn encode(position: &Position) -> GpsFields {
    GpsFields {
        version: GPS_VERSION,
        latitude_ref: if position.latitude >= 0.0 {
            LatitudeRef::North
        } else {
            LatitudeRef::South
        },
        latitude: dms_rationals(position.latitude),
        longitude_ref: if position.longitude >= 0.0 {
            LongitudeRef::East
        } else {
            LongitudeRef::West
        },
        longitude: dms_rationals(position.longitude),
        altitude: position.elevation.map(|elevation| Altitude {
            reference: if elevation >= 0.0 {
                AltitudeRef::AboveSeaLevel
            } else {
                AltitudeRef::BelowSeaLevel
            },
            value: Rational::scaled(elevation, ALTITUDE_DENOM),
        }),
    }
}

/// All three components carry the sign of `value`.
pub fn to_dms(value: f64) -> (f64, f64, f64) {
    let sign = if value < 0.0 { -1.0 } else { 1.0 };
    let (minutes_total, seconds) = divmod(value.abs() * 3600.0, 60.0);
    let (degrees, minutes) = divmod(minutes_total, 60.0);
    (sign * degrees, sign * minutes, sign * seconds)
}

fn dms_rationals(value: f64) -> [Rational; 3] {
    let (d, m, s) = to_dms(value);
    [
        Rational::scaled(d, COORD_DENOM),
        Rational::scaled(m, COORD_DENOM),
        Rational::scaled(s, COORD_DENOM),
    ]
}

fn from_dms(dms: &[Rational; 3]) -> f64 {
    dms[0].to_f64() + dms[1].to_f64() / 60.0 + dms[2].to_f64() / 3600.0
}

// Floored division for non-negative operands; the quotient is rounded so it
// stays integral despite float error in the remainder.
fn divmod(a: f64, b: f64) -> (f64, f64) {
    let rem = a % b;
    (((a - rem) / b).round(), rem)
}
