//! Mapping between coordinates and bin indices.
//!
//! Rows grow with Y and columns grow with X, both starting at the minimum
//! corner of the MBR. Geographic grids convert a linear bin size to degrees
//! using the meters-per-degree ratio at the MBR's mid latitude; curvature is
//! treated as negligible across a single bin.

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinIndex {
    pub row: u32,
    pub col: u32,
}

impl BinIndex {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mbr {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Mbr {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Meters spanned by one degree of longitude and one degree of latitude at `lat` (WGS-84).
pub fn meters_per_degree(lat: f64) -> (f64, f64) {
    let phi = lat.to_radians();
    let lon = 111_412.84 * phi.cos() - 93.5 * (3.0 * phi).cos() + 0.118 * (5.0 * phi).cos();
    let lat = 111_132.92 - 559.82 * (2.0 * phi).cos() + 1.175 * (4.0 * phi).cos()
        - 0.0023 * (6.0 * phi).cos();
    (lon, lat)
}

/// Bin size in degrees of longitude and latitude for a linear `bin_size` in meters at `lat`.
pub fn degrees_per_bin(lat: f64, bin_size: f64) -> (f64, f64) {
    let (lon_m, lat_m) = meters_per_degree(lat);
    (bin_size / lon_m, bin_size / lat_m)
}

/// Cell count covering `span`, tolerating floating point noise on exact multiples.
fn cells(span: f64, size: f64) -> u32 {
    let n = span / size;
    if (n - n.round()).abs() < 1e-6 {
        n.round() as u32
    } else {
        n.ceil() as u32
    }
}

/// A regular grid of bins over an MBR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub mbr: Mbr,
    pub x_bin_size: f64,
    pub y_bin_size: f64,
    pub width: u32,
    pub height: u32,
}

impl Grid {
    /// Builds a grid and snaps the MBR's maximum corner to a whole number of bins.
    pub fn new(mbr: Mbr, x_bin_size: f64, y_bin_size: f64) -> Result<Self> {
        if !(x_bin_size > 0.0 && y_bin_size > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "bin size must be positive, got {} x {}",
                x_bin_size, y_bin_size
            )));
        }
        if !(mbr.width() > 0.0 && mbr.height() > 0.0) {
            return Err(Error::InvalidConfig(format!("empty MBR: {:?}", mbr)));
        }

        let width = cells(mbr.width(), x_bin_size);
        let height = cells(mbr.height(), y_bin_size);
        let snapped = Mbr::new(
            mbr.min_x,
            mbr.min_y,
            mbr.min_x + width as f64 * x_bin_size,
            mbr.min_y + height as f64 * y_bin_size,
        );
        Ok(Self::from_parts(snapped, x_bin_size, y_bin_size, width, height))
    }

    /// Grid over projected coordinates with square `bin_size` cells.
    pub fn projected(mbr: Mbr, bin_size: f64) -> Result<Self> {
        Self::new(mbr, bin_size, bin_size)
    }

    /// Grid over geographic coordinates with `bin_size` meter cells, converted at the mid latitude.
    pub fn geographic(mbr: Mbr, bin_size: f64) -> Result<Self> {
        let mid_lat = (mbr.min_y + mbr.max_y) / 2.0;
        let (x_deg, y_deg) = degrees_per_bin(mid_lat, bin_size);
        Self::new(mbr, x_deg, y_deg)
    }

    /// Reassembles a grid from stored values without recomputing anything.
    pub fn from_parts(mbr: Mbr, x_bin_size: f64, y_bin_size: f64, width: u32, height: u32) -> Self {
        Self {
            mbr,
            x_bin_size,
            y_bin_size,
            width,
            height,
        }
    }

    pub fn bin_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Row-major position of `index` in a file of per-bin records.
    pub fn linear(&self, index: BinIndex) -> u64 {
        index.row as u64 * self.width as u64 + index.col as u64
    }

    pub fn check(&self, index: BinIndex) -> Result<()> {
        if index.row >= self.height || index.col >= self.width {
            return Err(Error::OutOfBounds {
                row: index.row,
                col: index.col,
            });
        }
        Ok(())
    }

    pub fn contains(&self, coord: Coord) -> bool {
        coord.x >= self.mbr.min_x
            && coord.x <= self.mbr.max_x
            && coord.y >= self.mbr.min_y
            && coord.y <= self.mbr.max_y
    }

    pub fn index(&self, coord: Coord) -> Result<BinIndex> {
        if !self.contains(coord) {
            return Err(Error::OutsideMbr {
                x: coord.x,
                y: coord.y,
            });
        }
        let col = ((coord.x - self.mbr.min_x) / self.x_bin_size).floor() as u32;
        let row = ((coord.y - self.mbr.min_y) / self.y_bin_size).floor() as u32;
        // Points on the maximum edge belong to the last bin.
        Ok(BinIndex::new(
            row.min(self.height - 1),
            col.min(self.width - 1),
        ))
    }

    pub fn center(&self, index: BinIndex) -> Result<Coord> {
        self.check(index)?;
        Ok(Coord::new(
            self.mbr.min_x + (index.col as f64 + 0.5) * self.x_bin_size,
            self.mbr.min_y + (index.row as f64 + 0.5) * self.y_bin_size,
        ))
    }

    /// Minimum corner of a bin.
    pub fn origin(&self, index: BinIndex) -> Result<Coord> {
        self.check(index)?;
        Ok(Coord::new(
            self.mbr.min_x + index.col as f64 * self.x_bin_size,
            self.mbr.min_y + index.row as f64 * self.y_bin_size,
        ))
    }

    /// Linear width of a bin row in meters, evaluated at that row's own latitude.
    pub fn local_bin_width_meters(&self, row: u32) -> Result<f64> {
        self.check(BinIndex::new(row, 0))?;
        let lat = self.mbr.min_y + (row as f64 + 0.5) * self.y_bin_size;
        Ok(self.x_bin_size * meters_per_degree(lat).0)
    }
}
