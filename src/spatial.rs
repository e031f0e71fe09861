//! Spatial primitives shared by the loader and the synthesizer.
//!
//! Coordinate reference ids are always explicit. Nothing in this module picks
//! a default SRID.

use crate::error::{GeoSqlError, Result};
use crate::execution::quote_ident;
use serde::{Deserialize, Serialize};
use std::fmt;

/// EPSG coordinate reference id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Srid(pub u32);

impl Srid {
    pub const WGS84: Srid = Srid(4326);

    pub fn is_geographic_wgs84(&self) -> bool {
        self.0 == 4326
    }
}

impl fmt::Display for Srid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Axis-aligned envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    pub fn of_point(x: f64, y: f64) -> Self {
        Self { min_x: x, min_y: y, max_x: x, max_y: y }
    }

    pub fn expand(&mut self, x: f64, y: f64) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

/// Shape of an optional spatial restriction on a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterShape {
    Bbox {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
    Point {
        lon: f64,
        lat: f64,
        radius_m: f64,
    },
    Polygon {
        /// Exterior ring as `[lon, lat]` pairs; closed automatically.
        ring: Vec<[f64; 2]>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialFilter {
    #[serde(flatten)]
    pub shape: FilterShape,
    pub srid: Srid,
}

impl SpatialFilter {
    pub fn validate(&self) -> Result<()> {
        let finite = |v: f64| v.is_finite();
        match &self.shape {
            FilterShape::Bbox { min_lon, min_lat, max_lon, max_lat } => {
                if ![*min_lon, *min_lat, *max_lon, *max_lat].into_iter().all(finite) {
                    return Err(invalid("bbox coordinates must be finite"));
                }
                if min_lon > max_lon || min_lat > max_lat {
                    return Err(invalid("bbox minimum exceeds maximum"));
                }
            }
            FilterShape::Point { lon, lat, radius_m } => {
                if !finite(*lon) || !finite(*lat) || !finite(*radius_m) {
                    return Err(invalid("point coordinates must be finite"));
                }
                if *radius_m <= 0.0 {
                    return Err(invalid("radius must be positive"));
                }
            }
            FilterShape::Polygon { ring } => {
                if ring.len() < 3 {
                    return Err(invalid("polygon needs at least three vertices"));
                }
                if !ring.iter().flatten().copied().all(finite) {
                    return Err(invalid("polygon coordinates must be finite"));
                }
            }
        }
        if self.srid.is_geographic_wgs84() {
            for (lon, lat) in self.vertices() {
                if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
                    return Err(invalid("coordinates out of range for EPSG:4326"));
                }
            }
        }
        Ok(())
    }

    fn vertices(&self) -> Vec<(f64, f64)> {
        match &self.shape {
            FilterShape::Bbox { min_lon, min_lat, max_lon, max_lat } => {
                vec![(*min_lon, *min_lat), (*max_lon, *max_lat)]
            }
            FilterShape::Point { lon, lat, .. } => vec![(*lon, *lat)],
            FilterShape::Polygon { ring } => ring.iter().map(|p| (p[0], p[1])).collect(),
        }
    }

    /// Coarse envelope of the filter, used against bbox columns.
    ///
    /// Point radii are converted to degrees only for EPSG:4326; other
    /// reference systems are assumed to be metric.
    pub fn envelope(&self) -> Envelope {
        match &self.shape {
            FilterShape::Bbox { min_lon, min_lat, max_lon, max_lat } => Envelope {
                min_x: *min_lon,
                min_y: *min_lat,
                max_x: *max_lon,
                max_y: *max_lat,
            },
            FilterShape::Point { lon, lat, radius_m } => {
                let (dx, dy) = if self.srid.is_geographic_wgs84() {
                    let dy = radius_m / 111_320.0;
                    let dx = radius_m / (111_320.0 * lat.to_radians().cos().max(1e-6));
                    (dx, dy)
                } else {
                    (*radius_m, *radius_m)
                };
                Envelope { min_x: lon - dx, min_y: lat - dy, max_x: lon + dx, max_y: lat + dy }
            }
            FilterShape::Polygon { ring } => {
                let mut env = Envelope::of_point(ring[0][0], ring[0][1]);
                for p in ring.iter().skip(1) {
                    env.expand(p[0], p[1]);
                }
                env
            }
        }
    }

    /// PostGIS predicate over `geometry_column`, transformed into the filter's SRID.
    pub fn postgis_predicate(&self, geometry_column: &str) -> String {
        let geom = format!("ST_Transform({}, {})", quote_ident(geometry_column), self.srid.0);
        match &self.shape {
            FilterShape::Bbox { min_lon, min_lat, max_lon, max_lat } => format!(
                "ST_Intersects({}, ST_MakeEnvelope({}, {}, {}, {}, {}))",
                geom, min_lon, min_lat, max_lon, max_lat, self.srid.0
            ),
            FilterShape::Point { lon, lat, radius_m } => format!(
                "ST_DWithin({}::geography, ST_SetSRID(ST_MakePoint({}, {}), {})::geography, {})",
                geom, lon, lat, self.srid.0, radius_m
            ),
            FilterShape::Polygon { ring } => {
                let mut coords: Vec<String> = ring.iter().map(|p| format!("{} {}", p[0], p[1])).collect();
                if ring.first() != ring.last() {
                    coords.push(format!("{} {}", ring[0][0], ring[0][1]));
                }
                format!(
                    "ST_Intersects({}, ST_GeomFromText('POLYGON(({}))', {}))",
                    geom,
                    coords.join(", "),
                    self.srid.0
                )
            }
        }
    }

    /// Refuse to compare against bbox columns built in another reference system.
    pub fn check_reference(&self, stored: Option<Srid>) -> Result<()> {
        match stored {
            Some(srid) if srid == self.srid => Ok(()),
            Some(srid) => Err(invalid(&format!(
                "filter is in {} but the bbox columns are in {}",
                self.srid, srid
            ))),
            None => Err(invalid("the bbox columns have no recorded SRID")),
        }
    }

    /// Predicate over the derived bbox columns of a loaded relation.
    pub fn bbox_column_predicate(&self) -> String {
        let env = self.envelope();
        format!(
            "max_lon >= {} AND min_lon <= {} AND max_lat >= {} AND min_lat <= {}",
            env.min_x, env.max_x, env.min_y, env.max_y
        )
    }
}

fn invalid(message: &str) -> GeoSqlError {
    GeoSqlError::InvalidRequest(format!("spatial_filter: {}", message))
}
