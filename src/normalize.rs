//! Track normalization.
//!
//! Turns one [`RawTrack`] into a [`Track`]: usable segments become lines,
//! the first timestamp becomes the track date. Tracks without usable
//! geometry or without any timestamp are not recorded activities and are
//! reported as skipped rather than failed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use geo::{Coord, LineString};
use log::debug;

use crate::batch::SkipReason;
use crate::error::{NetMatchError, Result};
use crate::{RawPoint, RawTrack, Track, TrackGeometry};

/// Outcome of normalizing one raw track.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Usable(Track),
    Unusable(SkipReason),
}

/// Normalize a raw track.
///
/// Returns an error only for corrupt coordinates (non-finite or out of
/// range); every other defect yields [`Normalized::Unusable`].
pub fn normalize_track(raw: &RawTrack) -> Result<Normalized> {
    if let Some(bad) = raw.segments.iter().flatten().find(|p| !p.is_valid()) {
        return Err(NetMatchError::InvalidCoordinates {
            track: raw.name.clone(),
            message: format!("point ({}, {}) is not a WGS84 position", bad.lon, bad.lat),
        });
    }

    let lines: Vec<LineString<f64>> = raw
        .segments
        .iter()
        .filter(|segment| segment.len() >= 2)
        .map(|segment| {
            LineString::from(
                segment
                    .iter()
                    .map(|p| Coord { x: p.lon, y: p.lat })
                    .collect::<Vec<_>>(),
            )
        })
        .collect();

    let Some(geometry) = TrackGeometry::from_lines(lines) else {
        debug!("[Normalize] {}: no segment with 2+ points", raw.name);
        return Ok(Normalized::Unusable(SkipReason::NoGeometry));
    };

    let first_time = first_timed_point(raw).and_then(|p| p.time.as_deref());
    let Some(first_time) = first_time else {
        debug!("[Normalize] {}: no timestamps, not a recorded activity", raw.name);
        return Ok(Normalized::Unusable(SkipReason::NoTimestamp));
    };

    let Some(date) = parse_track_date(first_time) else {
        debug!("[Normalize] {}: unparsable timestamp '{}'", raw.name, first_time);
        return Ok(Normalized::Unusable(SkipReason::UnparsableTimestamp));
    };

    Ok(Normalized::Usable(Track {
        name: raw.name.clone(),
        date,
        activity_type: raw.activity_type.clone(),
        geometry,
    }))
}

/// UTC calendar date of a track timestamp.
///
/// Accepts RFC 3339 and offset-less ISO 8601 (read as UTC), with or
/// without fractional seconds.
pub fn parse_track_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.date())
}

/// First timestamped point in document order.
pub fn first_timed_point(raw: &RawTrack) -> Option<&RawPoint> {
    raw.segments.iter().flatten().find(|p| p.time.is_some())
}
