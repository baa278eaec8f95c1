//! Geographic to metric projection.
//!
//! Buffer distances are only meaningful in metres when tracks and network
//! share one planar CRS. The CRS is therefore an explicit value: every
//! [`Projection`] reports its EPSG code, and the batch refuses a network
//! whose code differs from the projection used for the tracks.
//!
//! The transforms themselves are done by `proj4rs` from PROJ strings.

use std::fmt;

use geo::Coord;
use once_cell::sync::OnceCell;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use crate::error::{NetMatchError, Result};

/// A forward/inverse transform between WGS84 lon/lat and a planar CRS in metres.
pub trait Projection: Send + Sync {
    /// EPSG code of the target CRS.
    fn epsg(&self) -> u32;

    /// Project a WGS84 position. Returns `None` for positions the
    /// projection cannot represent (non-finite or outside lon/lat range).
    fn forward(&self, longitude: f64, latitude: f64) -> Option<Coord<f64>>;

    /// Convert a projected coordinate back to `(longitude, latitude)`.
    fn inverse(&self, coord: Coord<f64>) -> Option<(f64, f64)>;
}

/// ETRS89 geographic coordinates on GRS80.
pub const ETRS89_GEOGRAPHIC: &str = "+proj=longlat +ellps=GRS80";

/// ETRS89 / Belgian Lambert 2008 (EPSG:3812), the CRS of the reference
/// cycling network.
pub const BELGIAN_LAMBERT_2008_DEFINITION: &str = concat!(
    "+proj=lcc +lat_0=50.797815 +lon_0=4.35921583333333",
    " +lat_1=49.8333333333333 +lat_2=51.1666666666667",
    " +x_0=649328 +y_0=665262 +ellps=GRS80"
);

/// A CRS given by PROJ strings for its geographic base and its projection.
pub struct ProjCrs {
    epsg: u32,
    definition: String,
    geographic: Proj,
    projected: Proj,
}

impl ProjCrs {
    /// Build from a geographic base definition and a projected definition.
    ///
    /// ETRS89 and WGS84 differ by well under the buffer distance, so no
    /// datum shift is configured between track positions and the base.
    pub fn from_proj_strings(epsg: u32, geographic: &str, projected: &str) -> Result<Self> {
        let parse = |definition: &str| {
            Proj::from_proj_string(definition).map_err(|e| NetMatchError::Projection {
                epsg,
                message: format!("'{}': {}", definition, e),
            })
        };

        Ok(Self {
            epsg,
            definition: projected.to_string(),
            geographic: parse(geographic)?,
            projected: parse(projected)?,
        })
    }

    /// PROJ string of the projected CRS.
    pub fn definition(&self) -> &str {
        &self.definition
    }
}

impl fmt::Debug for ProjCrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjCrs")
            .field("epsg", &self.epsg)
            .field("definition", &self.definition)
            .finish()
    }
}

impl Projection for ProjCrs {
    fn epsg(&self) -> u32 {
        self.epsg
    }

    fn forward(&self, longitude: f64, latitude: f64) -> Option<Coord<f64>> {
        if !longitude.is_finite()
            || !latitude.is_finite()
            || latitude.abs() >= 90.0
            || longitude.abs() > 180.0
        {
            return None;
        }

        let mut point = (longitude.to_radians(), latitude.to_radians(), 0.0);
        transform(&self.geographic, &self.projected, &mut point).ok()?;
        (point.0.is_finite() && point.1.is_finite()).then_some(Coord {
            x: point.0,
            y: point.1,
        })
    }

    fn inverse(&self, coord: Coord<f64>) -> Option<(f64, f64)> {
        if !coord.x.is_finite() || !coord.y.is_finite() {
            return None;
        }

        let mut point = (coord.x, coord.y, 0.0);
        transform(&self.projected, &self.geographic, &mut point).ok()?;
        let (longitude, latitude) = (point.0.to_degrees(), point.1.to_degrees());
        (longitude.is_finite() && latitude.is_finite()).then_some((longitude, latitude))
    }
}

static BELGIAN_LAMBERT_2008: OnceCell<ProjCrs> = OnceCell::new();

/// Shared EPSG:3812 projection, parsed on first use.
pub fn belgian_lambert_2008() -> Result<&'static ProjCrs> {
    BELGIAN_LAMBERT_2008.get_or_try_init(|| {
        ProjCrs::from_proj_strings(3812, ETRS89_GEOGRAPHIC, BELGIAN_LAMBERT_2008_DEFINITION)
    })
}
