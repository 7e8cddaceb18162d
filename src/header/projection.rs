//! Projection metadata in its two historical encodings.
//!
//! Older readers only understand the numeric parameter block; newer files
//! carry Well-Known Text. Both are written, and WKT wins whenever present.

use itertools::Itertools;

use super::tags::{TagWriter, Tags};
use crate::error::Result;
use crate::Error;

pub const LEGACY_PARAM_COUNT: usize = 15;

/// Projection codes used by the numeric parameter block.
pub const PROJ_UNKNOWN: i32 = -1;
pub const PROJ_GEOGRAPHIC: i32 = 0;
pub const PROJ_UTM: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegacyProjection {
    pub projection: i32,
    pub zone: i32,
    /// 0 = north, 1 = south.
    pub hemisphere: u8,
    pub params: [f64; LEGACY_PARAM_COUNT],
}

impl Default for LegacyProjection {
    fn default() -> Self {
        Self {
            projection: PROJ_GEOGRAPHIC,
            zone: 0,
            hemisphere: 0,
            params: [0.0; LEGACY_PARAM_COUNT],
        }
    }
}

impl LegacyProjection {
    pub fn utm(zone: i32, north: bool) -> Self {
        let mut params = [0.0; LEGACY_PARAM_COUNT];
        params[0] = (zone * 6 - 183) as f64; // central meridian
        params[1] = 0.9996;
        params[2] = 500_000.0;
        params[3] = if north { 0.0 } else { 10_000_000.0 };
        Self {
            projection: PROJ_UTM,
            zone,
            hemisphere: if north { 0 } else { 1 },
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub wkt: Option<String>,
    pub legacy: LegacyProjection,
}

pub enum Preferred<'a> {
    Wkt(&'a str),
    Legacy(&'a LegacyProjection),
}

const WGS84_GEOGCS: &str = "GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563]],PRIMEM[\"Greenwich\",0],UNIT[\"degree\",0.0174532925199433]]";

impl Default for Projection {
    fn default() -> Self {
        Self::geographic()
    }
}

impl Projection {
    pub fn geographic() -> Self {
        Self {
            wkt: Some(WGS84_GEOGCS.to_string()),
            legacy: LegacyProjection::default(),
        }
    }

    pub fn utm(zone: i32, north: bool) -> Self {
        let wkt = format!(
            "PROJCS[\"WGS 84 / UTM zone {}{}\",{},PROJECTION[\"Transverse_Mercator\"],\
             PARAMETER[\"central_meridian\",{}],PARAMETER[\"scale_factor\",0.9996],\
             PARAMETER[\"false_easting\",500000],PARAMETER[\"false_northing\",{}],UNIT[\"metre\",1]]",
            zone,
            if north { "N" } else { "S" },
            WGS84_GEOGCS,
            zone * 6 - 183,
            if north { 0 } else { 10_000_000 }
        );
        Self {
            wkt: Some(wkt),
            legacy: LegacyProjection::utm(zone, north),
        }
    }

    /// Builds from WKT, deriving the legacy block so old readers still see something useful.
    pub fn from_wkt(wkt: &str) -> Self {
        let legacy = if let Some((zone, north)) = parse_utm_zone(wkt) {
            LegacyProjection::utm(zone, north)
        } else if wkt.trim_start().starts_with("GEOGCS") {
            LegacyProjection::default()
        } else {
            LegacyProjection {
                projection: PROJ_UNKNOWN,
                ..Default::default()
            }
        };
        Self {
            wkt: Some(wkt.to_string()),
            legacy,
        }
    }

    pub fn legacy_only(legacy: LegacyProjection) -> Self {
        Self { wkt: None, legacy }
    }

    pub fn preferred(&self) -> Preferred<'_> {
        match &self.wkt {
            Some(wkt) if !wkt.trim().is_empty() => Preferred::Wkt(wkt),
            _ => Preferred::Legacy(&self.legacy),
        }
    }

    pub fn write_tags(&self, writer: &mut TagWriter) {
        writer
            .put_opt("WELL-KNOWN TEXT", self.wkt.as_deref())
            .put("PROJECTION", self.legacy.projection)
            .put("PROJECTION ZONE", self.legacy.zone)
            .put("HEMISPHERE", self.legacy.hemisphere)
            .put("PROJECTION PARAMETERS", self.legacy.params.iter().join(","));
    }

    pub fn from_tags(tags: &Tags) -> Result<Self> {
        let mut params = [0.0; LEGACY_PARAM_COUNT];
        if let Some(raw) = tags.get("PROJECTION PARAMETERS") {
            for (slot, value) in params.iter_mut().zip(raw.split(',')) {
                *slot = value.trim().parse().map_err(|_| {
                    Error::InvalidHeader(format!("bad projection parameter: {:?}", value))
                })?;
            }
        }
        Ok(Self {
            wkt: tags.get("WELL-KNOWN TEXT").map(str::to_string),
            legacy: LegacyProjection {
                projection: tags.parsed_or("PROJECTION", PROJ_GEOGRAPHIC)?,
                zone: tags.parsed_or("PROJECTION ZONE", 0)?,
                hemisphere: tags.parsed_or("HEMISPHERE", 0)?,
                params,
            },
        })
    }
}

fn parse_utm_zone(wkt: &str) -> Option<(i32, bool)> {
    let rest = &wkt[wkt.find("UTM zone ")? + "UTM zone ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let zone = digits.parse().ok()?;
    let north = !rest[digits.len()..].starts_with('S');
    Some((zone, north))
}
