//! The bin header: a fixed-size block at the start of the bin file.
//!
//! The block holds tagged ASCII text describing the grid, value ranges and
//! per-field bit widths, terminated by `[END OF HEADER]`. The last
//! [`BINARY_TAIL_SIZE`] bytes of the block hold a binary trailer (magic, endian
//! tag, text length and CRC-64 of the text). Legacy files have no trailer and
//! are accepted without the integrity check.

pub mod layout;
pub mod projection;
pub mod tags;

use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, WriteBytesExt};
use itertools::Itertools;

use crate::bitpack::bits_for;
use crate::checksum::Checksum;
use crate::error::Result;
use crate::geometry::{BinIndex, Grid, Mbr};
use crate::io::{Backend, Endian};
use crate::validity::VALIDITY_BITS;
use crate::Error;

pub use layout::{BinLayout, DepthLayout};
pub use projection::Projection;
use tags::{version_hundredths, TagWriter, Tags};

pub const HEADER_SIZE: usize = 16384;
pub const BINARY_TAIL_SIZE: usize = 64;
const BINARY_MAGIC: &[u8; 8] = b"PFMBIN\0\0";

/// Library version in hundredths (6.00).
pub const LIBRARY_VERSION: u32 = 600;
pub const VERSION_STRING: &str = "PFM Software - pfmdb I/O library V6.00";
/// Headers older than this store geographic bin sizes in minutes and have no error fields.
const MINUTES_VERSION_LIMIT: u32 = 500;

pub const MAX_ATTRIBUTES: usize = 10;
pub const USER_FLAGS: usize = 5;

/// Average-surface names that mean "this library recomputes the surface".
pub const DEFAULT_AVERAGE_FILT_NAME: &str = "Average Filtered Depth";
pub const DEFAULT_AVERAGE_NAME: &str = "Average Depth";

/// Attribute meanings shared across applications, identified by number rather than name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedAttribute {
    HypothesisCount = 1,
    HypothesisStdDev = 2,
    AverageTpe = 3,
    SoundingsUsed = 4,
}

impl ReservedAttribute {
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Self::HypothesisCount),
            2 => Some(Self::HypothesisStdDev),
            3 => Some(Self::AverageTpe),
            4 => Some(Self::SoundingsUsed),
            _ => None,
        }
    }

    pub fn tag(self) -> u16 {
        self as u16
    }
}

/// Width and scaling of an optional floating point field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledSpec {
    pub bits: u8,
    pub scale: f64,
    pub min: f64,
    pub max: f64,
}

impl ScaledSpec {
    pub fn new(min: f64, max: f64, scale: f64) -> Self {
        let span = ((max - min) * scale).round().max(0.0) as u64;
        Self {
            bits: bits_for(span),
            scale,
            min,
            max,
        }
    }

    pub fn disabled() -> Self {
        Self {
            bits: 0,
            scale: 1.0,
            min: 0.0,
            max: 0.0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.bits > 0
    }

    fn write_tags(&self, writer: &mut TagWriter, prefix: &str) {
        writer
            .put(&format!("{} BITS", prefix), self.bits)
            .put(&format!("{} SCALE", prefix), self.scale)
            .put(&format!("{} MIN", prefix), self.min)
            .put(&format!("{} MAX", prefix), self.max);
    }

    fn from_tags(tags: &Tags, prefix: &str) -> Result<Self> {
        Ok(Self {
            bits: tags.parsed_or(&format!("{} BITS", prefix), 0)?,
            scale: tags.parsed_or(&format!("{} SCALE", prefix), 1.0)?,
            min: tags.parsed_or(&format!("{} MIN", prefix), 0.0)?,
            max: tags.parsed_or(&format!("{} MAX", prefix), 0.0)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub reserved: Option<ReservedAttribute>,
    pub spec: ScaledSpec,
}

impl Attribute {
    pub fn new(name: impl Into<String>, min: f64, max: f64, scale: f64) -> Self {
        Self {
            name: name.into(),
            reserved: None,
            spec: ScaledSpec::new(min, max, scale),
        }
    }

    pub fn reserved(mut self, reserved: ReservedAttribute) -> Self {
        self.reserved = Some(reserved);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extreme<T> {
    pub value: T,
    pub at: BinIndex,
}

/// Running value ranges over every bin written so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeStats {
    pub min_filtered_depth: Option<Extreme<f64>>,
    pub max_filtered_depth: Option<Extreme<f64>>,
    pub min_depth: Option<Extreme<f64>>,
    pub max_depth: Option<Extreme<f64>>,
    pub min_bin_count: Option<Extreme<u32>>,
    pub max_bin_count: Option<Extreme<u32>>,
    pub min_standard_dev: Option<f64>,
    pub max_standard_dev: Option<f64>,
}

fn lower<T: PartialOrd + Copy>(slot: &mut Option<Extreme<T>>, value: T, at: BinIndex) {
    if slot.map_or(true, |e| value < e.value) {
        *slot = Some(Extreme { value, at });
    }
}

fn raise<T: PartialOrd + Copy>(slot: &mut Option<Extreme<T>>, value: T, at: BinIndex) {
    if slot.map_or(true, |e| value > e.value) {
        *slot = Some(Extreme { value, at });
    }
}

impl RangeStats {
    pub fn observe_filtered(&mut self, min: f64, max: f64, at: BinIndex) {
        lower(&mut self.min_filtered_depth, min, at);
        raise(&mut self.max_filtered_depth, max, at);
    }

    pub fn observe_unfiltered(&mut self, min: f64, max: f64, at: BinIndex) {
        lower(&mut self.min_depth, min, at);
        raise(&mut self.max_depth, max, at);
    }

    pub fn observe_count(&mut self, count: u32, at: BinIndex) {
        lower(&mut self.min_bin_count, count, at);
        raise(&mut self.max_bin_count, count, at);
    }

    pub fn observe_standard_dev(&mut self, std: f64) {
        if self.min_standard_dev.map_or(true, |m| std < m) {
            self.min_standard_dev = Some(std);
        }
        if self.max_standard_dev.map_or(true, |m| std > m) {
            self.max_standard_dev = Some(std);
        }
    }

    fn write_tags(&self, writer: &mut TagWriter) {
        fn put_extreme<T: std::fmt::Display + Copy>(
            writer: &mut TagWriter,
            tag: &str,
            coord_tag: &str,
            extreme: Option<Extreme<T>>,
        ) {
            if let Some(e) = extreme {
                writer
                    .put(tag, e.value)
                    .put(coord_tag, format!("{},{}", e.at.row, e.at.col));
            }
        }
        put_extreme(writer, "MIN FILTERED DEPTH", "MIN FILTERED COORD", self.min_filtered_depth);
        put_extreme(writer, "MAX FILTERED DEPTH", "MAX FILTERED COORD", self.max_filtered_depth);
        put_extreme(writer, "MIN DEPTH", "MIN COORD", self.min_depth);
        put_extreme(writer, "MAX DEPTH", "MAX COORD", self.max_depth);
        put_extreme(writer, "MIN BIN COUNT", "MIN COUNT COORD", self.min_bin_count);
        put_extreme(writer, "MAX BIN COUNT", "MAX COUNT COORD", self.max_bin_count);
        writer
            .put_opt("MIN STANDARD DEVIATION", self.min_standard_dev)
            .put_opt("MAX STANDARD DEVIATION", self.max_standard_dev);
    }

    fn from_tags(tags: &Tags) -> Result<Self> {
        fn get_extreme<T: std::str::FromStr>(
            tags: &Tags,
            tag: &str,
            coord_tag: &str,
        ) -> Result<Option<Extreme<T>>> {
            let Some(value) = tags.parsed::<T>(tag)? else {
                return Ok(None);
            };
            let raw = tags.get(coord_tag).unwrap_or("0,0");
            let at = raw
                .split(',')
                .map(|part| part.trim().parse::<u32>())
                .collect_tuple()
                .and_then(|(row, col)| Some(BinIndex::new(row.ok()?, col.ok()?)))
                .ok_or_else(|| Error::InvalidHeader(format!("bad [{}]: {:?}", coord_tag, raw)))?;
            Ok(Some(Extreme { value, at }))
        }
        Ok(Self {
            min_filtered_depth: get_extreme(tags, "MIN FILTERED DEPTH", "MIN FILTERED COORD")?,
            max_filtered_depth: get_extreme(tags, "MAX FILTERED DEPTH", "MAX FILTERED COORD")?,
            min_depth: get_extreme(tags, "MIN DEPTH", "MIN COORD")?,
            max_depth: get_extreme(tags, "MAX DEPTH", "MAX COORD")?,
            min_bin_count: get_extreme(tags, "MIN BIN COUNT", "MIN COUNT COORD")?,
            max_bin_count: get_extreme(tags, "MAX BIN COUNT", "MAX COUNT COORD")?,
            min_standard_dev: tags.parsed("MIN STANDARD DEVIATION")?,
            max_standard_dev: tags.parsed("MAX STANDARD DEVIATION")?,
        })
    }
}

/// Creation-time parameters for a new structure.
#[derive(Debug, Clone)]
pub struct HeaderConfig {
    pub mbr: Mbr,
    /// Linear bin size: meters for geographic grids, projected units otherwise.
    pub bin_size: f64,
    pub projected: bool,
    pub projection: Projection,
    pub min_depth: f64,
    pub max_depth: f64,
    pub depth_scale: f64,
    pub std_scale: f64,
    pub max_bin_count: u64,
    pub max_file_number: u64,
    pub max_line_number: u64,
    pub max_ping_number: u64,
    pub max_beam_number: u64,
    pub offset_bits: u8,
    pub max_soundings: u64,
    pub horizontal_error: Option<(f64, f64)>,
    pub vertical_error: Option<(f64, f64)>,
    pub bin_attributes: Vec<Attribute>,
    pub ndx_attributes: Vec<Attribute>,
    pub user_flag_names: [String; USER_FLAGS],
    pub average_filt_name: String,
    pub average_name: String,
    pub class_type: u8,
    pub chart_scale: f64,
    pub coverage_map: bool,
    pub classification: String,
    pub description: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            mbr: Mbr::new(0.0, 0.0, 1.0, 1.0),
            bin_size: 1.0,
            projected: true,
            projection: Projection::default(),
            min_depth: -1000.0,
            max_depth: 12000.0,
            depth_scale: 100.0,
            std_scale: 1000.0,
            max_bin_count: 65_535,
            max_file_number: 16_383,
            max_line_number: 65_535,
            max_ping_number: (1 << 24) - 1,
            max_beam_number: 1023,
            offset_bits: 16,
            max_soundings: u32::MAX as u64,
            horizontal_error: None,
            vertical_error: None,
            bin_attributes: Vec::new(),
            ndx_attributes: Vec::new(),
            user_flag_names: [
                "User flag 01".to_string(),
                "User flag 02".to_string(),
                "User flag 03".to_string(),
                "User flag 04".to_string(),
                "User flag 05".to_string(),
            ],
            average_filt_name: DEFAULT_AVERAGE_FILT_NAME.to_string(),
            average_name: DEFAULT_AVERAGE_NAME.to_string(),
            class_type: 0,
            chart_scale: 0.0,
            coverage_map: false,
            classification: "UNCLASSIFIED".to_string(),
            description: String::new(),
        }
    }
}

impl HeaderConfig {
    pub fn new(mbr: Mbr, bin_size: f64) -> Self {
        Self {
            mbr,
            bin_size,
            ..Default::default()
        }
    }

    /// Geographic grid: `bin_size` is in meters and the MBR is in degrees.
    pub fn geographic(mut self) -> Self {
        self.projected = false;
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn depth_range(mut self, min: f64, max: f64, scale: f64) -> Self {
        self.min_depth = min;
        self.max_depth = max;
        self.depth_scale = scale;
        self
    }

    pub fn max_bin_count(mut self, max: u64) -> Self {
        self.max_bin_count = max;
        self
    }

    pub fn identifier_limits(mut self, file: u64, line: u64, ping: u64, beam: u64) -> Self {
        self.max_file_number = file;
        self.max_line_number = line;
        self.max_ping_number = ping;
        self.max_beam_number = beam;
        self
    }

    pub fn horizontal_error(mut self, max: f64, scale: f64) -> Self {
        self.horizontal_error = Some((max, scale));
        self
    }

    pub fn vertical_error(mut self, max: f64, scale: f64) -> Self {
        self.vertical_error = Some((max, scale));
        self
    }

    pub fn bin_attribute(mut self, attribute: Attribute) -> Self {
        self.bin_attributes.push(attribute);
        self
    }

    pub fn ndx_attribute(mut self, attribute: Attribute) -> Self {
        self.ndx_attributes.push(attribute);
        self
    }

    pub fn user_flag_name(mut self, flag: usize, name: impl Into<String>) -> Self {
        if let Some(slot) = self.user_flag_names.get_mut(flag) {
            *slot = name.into();
        }
        self
    }

    pub fn average_names(mut self, filtered: impl Into<String>, unfiltered: impl Into<String>) -> Self {
        self.average_filt_name = filtered.into();
        self.average_name = unfiltered.into();
        self
    }

    pub fn class_type(mut self, class_type: u8) -> Self {
        self.class_type = class_type;
        self
    }

    pub fn coverage_map(mut self, enabled: bool) -> Self {
        self.coverage_map = enabled;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinHeader {
    pub version: String,
    pub classification: String,
    pub creation_date: u64,
    pub description: String,
    pub grid: Grid,
    pub bin_size: f64,
    pub projected: bool,
    pub projection: Projection,
    pub chart_scale: f64,
    pub class_type: u8,
    pub average_filt_name: String,
    pub average_name: String,
    pub user_flag_names: [String; USER_FLAGS],
    pub coverage_map: bool,

    pub min_depth: f64,
    pub max_depth: f64,
    pub null_depth: f64,
    pub depth_scale: f64,
    pub depth_bits: u8,
    pub std_scale: f64,
    pub std_bits: u8,
    pub count_bits: u8,
    pub file_number_bits: u8,
    pub line_number_bits: u8,
    pub ping_number_bits: u8,
    pub beam_number_bits: u8,
    pub offset_bits: u8,
    pub validity_bits: u8,
    pub pointer_bits: u8,
    pub horizontal_error: ScaledSpec,
    pub vertical_error: ScaledSpec,
    pub bin_attributes: Vec<Attribute>,
    pub ndx_attributes: Vec<Attribute>,

    pub stats: RangeStats,
}

impl BinHeader {
    pub fn new(config: &HeaderConfig) -> Result<Self> {
        if config.max_depth <= config.min_depth {
            return Err(Error::InvalidConfig(format!(
                "depth range {}..{} is empty",
                config.min_depth, config.max_depth
            )));
        }
        if config.depth_scale <= 0.0 || config.std_scale <= 0.0 {
            return Err(Error::InvalidConfig("scales must be positive".into()));
        }
        if config.bin_attributes.len() > MAX_ATTRIBUTES
            || config.ndx_attributes.len() > MAX_ATTRIBUTES
        {
            return Err(Error::InvalidConfig(format!(
                "at most {} bin and {} index attributes",
                MAX_ATTRIBUTES, MAX_ATTRIBUTES
            )));
        }
        if config.class_type as usize > USER_FLAGS {
            return Err(Error::InvalidConfig(format!(
                "class type {} names no user flag",
                config.class_type
            )));
        }

        let grid = if config.projected {
            Grid::projected(config.mbr, config.bin_size)?
        } else {
            Grid::geographic(config.mbr, config.bin_size)?
        };

        let null_depth = config.max_depth + 1.0;
        let depth_span = ((null_depth - config.min_depth) * config.depth_scale).round() as u64;
        let std_span = ((config.max_depth - config.min_depth) * config.std_scale).round() as u64;
        let error_spec = |range: Option<(f64, f64)>| match range {
            Some((max, scale)) => ScaledSpec::new(0.0, max, scale),
            None => ScaledSpec::disabled(),
        };

        let header = Self {
            version: VERSION_STRING.to_string(),
            classification: config.classification.clone(),
            creation_date: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            description: config.description.clone(),
            grid,
            bin_size: config.bin_size,
            projected: config.projected,
            projection: config.projection.clone(),
            chart_scale: config.chart_scale,
            class_type: config.class_type,
            average_filt_name: config.average_filt_name.clone(),
            average_name: config.average_name.clone(),
            user_flag_names: config.user_flag_names.clone(),
            coverage_map: config.coverage_map,
            min_depth: config.min_depth,
            max_depth: config.max_depth,
            null_depth,
            depth_scale: config.depth_scale,
            depth_bits: bits_for(depth_span),
            std_scale: config.std_scale,
            std_bits: bits_for(std_span),
            count_bits: bits_for(config.max_bin_count),
            file_number_bits: bits_for(config.max_file_number),
            line_number_bits: bits_for(config.max_line_number),
            ping_number_bits: bits_for(config.max_ping_number),
            beam_number_bits: bits_for(config.max_beam_number),
            offset_bits: config.offset_bits,
            validity_bits: VALIDITY_BITS,
            pointer_bits: bits_for(config.max_soundings),
            horizontal_error: error_spec(config.horizontal_error),
            vertical_error: error_spec(config.vertical_error),
            bin_attributes: config.bin_attributes.clone(),
            ndx_attributes: config.ndx_attributes.clone(),
            stats: RangeStats::default(),
        };
        header.validate()?;
        Ok(header)
    }

    /// Checks internal consistency of widths and geometry.
    pub fn validate(&self) -> Result<()> {
        if self.grid.width == 0 || self.grid.height == 0 {
            return Err(Error::InvalidHeader(format!(
                "empty grid {}x{}",
                self.grid.width, self.grid.height
            )));
        }
        let widths = [
            ("depth", self.depth_bits, 32),
            ("standard deviation", self.std_bits, 32),
            ("count", self.count_bits, 32),
            ("file number", self.file_number_bits, 32),
            ("line number", self.line_number_bits, 32),
            ("ping number", self.ping_number_bits, 32),
            ("beam number", self.beam_number_bits, 32),
            ("offset", self.offset_bits, 32),
            ("validity", self.validity_bits, 32),
            ("pointer", self.pointer_bits, 63),
            ("horizontal error", self.horizontal_error.bits, 32),
            ("vertical error", self.vertical_error.bits, 32),
        ];
        for (name, bits, limit) in widths {
            if bits > limit {
                return Err(Error::InvalidHeader(format!(
                    "{} width {} exceeds {} bits",
                    name, bits, limit
                )));
            }
        }
        if self.depth_bits == 0 || self.count_bits == 0 || self.pointer_bits == 0 {
            return Err(Error::InvalidHeader("depth, count and pointer fields need bits".into()));
        }
        if self.validity_bits < VALIDITY_BITS {
            return Err(Error::InvalidHeader(format!(
                "validity width {} below {}",
                self.validity_bits, VALIDITY_BITS
            )));
        }
        for attribute in self.bin_attributes.iter().chain(&self.ndx_attributes) {
            if attribute.spec.bits > 32 {
                return Err(Error::InvalidHeader(format!(
                    "attribute {:?} width {} exceeds 32 bits",
                    attribute.name, attribute.spec.bits
                )));
            }
        }
        if self.bin_attributes.len() > MAX_ATTRIBUTES || self.ndx_attributes.len() > MAX_ATTRIBUTES {
            return Err(Error::InvalidHeader("too many attributes".into()));
        }
        Ok(())
    }

    pub fn bin_layout(&self) -> BinLayout {
        BinLayout::new(self)
    }

    pub fn depth_layout(&self) -> DepthLayout {
        DepthLayout::new(self)
    }

    /// Byte offset of the coverage map, directly after the last bin record.
    pub fn coverage_offset(&self) -> u64 {
        HEADER_SIZE as u64 + self.grid.bin_count() * self.bin_layout().record_size as u64
    }

    /// Expected bin file length for this geometry.
    pub fn bin_file_len(&self) -> u64 {
        let coverage = if self.coverage_map {
            self.grid.bin_count()
        } else {
            0
        };
        self.coverage_offset() + coverage
    }

    /// True when an external tool owns the average surfaces and recompute must leave them alone.
    pub fn averages_managed_externally(&self) -> bool {
        self.average_filt_name != DEFAULT_AVERAGE_FILT_NAME
            || self.average_name != DEFAULT_AVERAGE_NAME
    }

    pub fn find_reserved(&self, reserved: ReservedAttribute) -> Option<usize> {
        self.bin_attributes
            .iter()
            .position(|a| a.reserved == Some(reserved))
    }

    pub fn version_number(&self) -> Option<u32> {
        version_hundredths(&self.version)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let text = self.to_text();
        let text_len = text.len();
        if text_len > HEADER_SIZE - BINARY_TAIL_SIZE {
            return Err(Error::InvalidHeader(format!(
                "header text of {} bytes does not fit the header block",
                text_len
            )));
        }

        let mut block = vec![0u8; HEADER_SIZE];
        block[..text_len].copy_from_slice(text.as_bytes());

        let mut tail = Vec::with_capacity(BINARY_TAIL_SIZE);
        tail.extend_from_slice(BINARY_MAGIC);
        tail.extend_from_slice(&Endian::Big.tag_bytes());
        tail.write_u32::<BigEndian>(text_len as u32)?;
        tail.write_u64::<BigEndian>(Checksum::of(text.as_bytes()))?;
        block[HEADER_SIZE - BINARY_TAIL_SIZE..][..tail.len()].copy_from_slice(&tail);
        Ok(block)
    }

    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader(format!(
                "header block is {} bytes, expected {}",
                block.len(),
                HEADER_SIZE
            )));
        }

        let tail = &block[HEADER_SIZE - BINARY_TAIL_SIZE..HEADER_SIZE];
        let text_region = &block[..HEADER_SIZE - BINARY_TAIL_SIZE];
        let text = if &tail[..8] == BINARY_MAGIC {
            let endian = Endian::from_tag([tail[8], tail[9]])
                .ok_or_else(|| Error::InvalidHeader("unknown endian tag".into()))?;
            let text_len = endian.read_u32(&tail[10..14]);
            let checksum = endian.read_u64(&tail[14..22]);
            let text_len = text_len as usize;
            if text_len > text_region.len() {
                return Err(Error::InvalidHeader("header text length out of range".into()));
            }
            if Checksum::of(&text_region[..text_len]) != checksum {
                return Err(Error::ChecksumMismatch);
            }
            &text_region[..text_len]
        } else {
            let end = text_region
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(text_region.len());
            &text_region[..end]
        };

        let text = std::str::from_utf8(text)
            .map_err(|_| Error::InvalidHeader("header text is not valid UTF-8".into()))?;
        Self::from_text(text)
    }

    pub fn read(file: &mut dyn Backend) -> Result<Self> {
        let mut block = vec![0u8; HEADER_SIZE];
        file.read_at(0, &mut block).map_err(|e| {
            Error::InvalidHeader(format!("unable to read header block: {}", e))
        })?;
        Self::decode(&block)
    }

    pub fn write(&self, file: &mut dyn Backend) -> Result<()> {
        let block = self.encode()?;
        file.write_at(0, &block)?;
        Ok(())
    }

    fn to_text(&self) -> String {
        let mut w = TagWriter::new();
        w.put("VERSION", &self.version)
            .put("CLASSIFICATION", &self.classification)
            .put("CREATION DATE", self.creation_date)
            .put("DESCRIPTION", &self.description)
            .put("PROJECTED", self.projected as u8)
            .put("MIN X", self.grid.mbr.min_x)
            .put("MIN Y", self.grid.mbr.min_y)
            .put("MAX X", self.grid.mbr.max_x)
            .put("MAX Y", self.grid.mbr.max_y)
            .put("BIN SIZE XY", self.bin_size)
            .put("X BIN SIZE", self.grid.x_bin_size)
            .put("Y BIN SIZE", self.grid.y_bin_size)
            .put("BIN WIDTH", self.grid.width)
            .put("BIN HEIGHT", self.grid.height);
        self.projection.write_tags(&mut w);
        w.put("CHART SCALE", self.chart_scale)
            .put("CLASS TYPE", self.class_type)
            .put("AVERAGE FILTERED NAME", &self.average_filt_name)
            .put("AVERAGE NAME", &self.average_name)
            .put("COVERAGE MAP", self.coverage_map as u8);
        for (i, name) in self.user_flag_names.iter().enumerate() {
            w.put(&format!("USER FLAG {} NAME", i + 1), name);
        }
        w.put("MIN DEPTH RANGE", self.min_depth)
            .put("MAX DEPTH RANGE", self.max_depth)
            .put("NULL DEPTH", self.null_depth)
            .put("DEPTH SCALE", self.depth_scale)
            .put("DEPTH BITS", self.depth_bits)
            .put("STD SCALE", self.std_scale)
            .put("STD BITS", self.std_bits)
            .put("COUNT BITS", self.count_bits)
            .put("FILE NUMBER BITS", self.file_number_bits)
            .put("LINE NUMBER BITS", self.line_number_bits)
            .put("PING NUMBER BITS", self.ping_number_bits)
            .put("BEAM NUMBER BITS", self.beam_number_bits)
            .put("OFFSET BITS", self.offset_bits)
            .put("VALIDITY BITS", self.validity_bits)
            .put("RECORD POINTER BITS", self.pointer_bits);
        self.horizontal_error.write_tags(&mut w, "HORIZONTAL ERROR");
        self.vertical_error.write_tags(&mut w, "VERTICAL ERROR");
        write_attributes(&mut w, "BIN", &self.bin_attributes);
        write_attributes(&mut w, "NDX", &self.ndx_attributes);
        self.stats.write_tags(&mut w);
        w.finish()
    }

    fn from_text(text: &str) -> Result<Self> {
        let tags = Tags::parse(text);

        let version: String = tags
            .get("VERSION")
            .ok_or_else(|| Error::InvalidHeader("missing [VERSION]".into()))?
            .to_string();
        let number = version_hundredths(&version)
            .ok_or_else(|| Error::InvalidHeader(format!("unreadable version {:?}", version)))?;
        if number > LIBRARY_VERSION {
            return Err(Error::VersionMismatch {
                found: format!("{:.2}", number as f64 / 100.0),
                supported: format!("{:.2}", LIBRARY_VERSION as f64 / 100.0),
            });
        }
        let legacy = number < MINUTES_VERSION_LIMIT;

        let projected = tags.parsed_or::<u8>("PROJECTED", 0)? != 0;
        let (x_bin_size, y_bin_size) = if legacy && !projected {
            tracing::warn!(version = %version, "Translating legacy header bin sizes from minutes");
            (
                tags.require::<f64>("X BIN SIZE MINUTES")? / 60.0,
                tags.require::<f64>("Y BIN SIZE MINUTES")? / 60.0,
            )
        } else {
            (tags.require("X BIN SIZE")?, tags.require("Y BIN SIZE")?)
        };
        let mbr = Mbr::new(
            tags.require("MIN X")?,
            tags.require("MIN Y")?,
            tags.require("MAX X")?,
            tags.require("MAX Y")?,
        );
        let grid = Grid::from_parts(
            mbr,
            x_bin_size,
            y_bin_size,
            tags.require("BIN WIDTH")?,
            tags.require("BIN HEIGHT")?,
        );

        let mut user_flag_names: [String; USER_FLAGS] = Default::default();
        for (i, name) in user_flag_names.iter_mut().enumerate() {
            *name = tags.string_or(&format!("USER FLAG {} NAME", i + 1), "");
        }

        let (horizontal_error, vertical_error) = if legacy {
            (ScaledSpec::disabled(), ScaledSpec::disabled())
        } else {
            (
                ScaledSpec::from_tags(&tags, "HORIZONTAL ERROR")?,
                ScaledSpec::from_tags(&tags, "VERTICAL ERROR")?,
            )
        };

        let max_depth: f64 = tags.require("MAX DEPTH RANGE")?;
        let header = Self {
            classification: tags.string_or("CLASSIFICATION", ""),
            creation_date: tags.parsed_or("CREATION DATE", 0)?,
            description: tags.string_or("DESCRIPTION", ""),
            grid,
            bin_size: tags.parsed_or("BIN SIZE XY", 0.0)?,
            projected,
            projection: Projection::from_tags(&tags)?,
            chart_scale: tags.parsed_or("CHART SCALE", 0.0)?,
            class_type: tags.parsed_or("CLASS TYPE", 0)?,
            average_filt_name: tags.string_or("AVERAGE FILTERED NAME", DEFAULT_AVERAGE_FILT_NAME),
            average_name: tags.string_or("AVERAGE NAME", DEFAULT_AVERAGE_NAME),
            user_flag_names,
            coverage_map: tags.parsed_or::<u8>("COVERAGE MAP", 0)? != 0,
            min_depth: tags.require("MIN DEPTH RANGE")?,
            max_depth,
            null_depth: tags.parsed_or("NULL DEPTH", max_depth + 1.0)?,
            depth_scale: tags.require("DEPTH SCALE")?,
            depth_bits: tags.require("DEPTH BITS")?,
            std_scale: tags.parsed_or("STD SCALE", 1000.0)?,
            std_bits: tags.parsed_or("STD BITS", 0)?,
            count_bits: tags.require("COUNT BITS")?,
            file_number_bits: tags.require("FILE NUMBER BITS")?,
            line_number_bits: tags.require("LINE NUMBER BITS")?,
            ping_number_bits: tags.require("PING NUMBER BITS")?,
            beam_number_bits: tags.require("BEAM NUMBER BITS")?,
            offset_bits: tags.parsed_or("OFFSET BITS", 16)?,
            validity_bits: tags.parsed_or("VALIDITY BITS", VALIDITY_BITS)?,
            pointer_bits: tags.parsed_or("RECORD POINTER BITS", 32)?,
            horizontal_error,
            vertical_error,
            bin_attributes: read_attributes(&tags, "BIN")?,
            ndx_attributes: read_attributes(&tags, "NDX")?,
            stats: RangeStats::from_tags(&tags)?,
            version,
        };
        header.validate()?;
        Ok(header)
    }
}

fn write_attributes(writer: &mut TagWriter, kind: &str, attributes: &[Attribute]) {
    writer.put(&format!("NUM {} ATTRIBUTES", kind), attributes.len());
    for (i, attribute) in attributes.iter().enumerate() {
        let prefix = format!("{} ATTRIBUTE {}", kind, i);
        writer.put(&format!("{} NAME", prefix), &attribute.name);
        writer.put_opt(
            &format!("{} RESERVED", prefix),
            attribute.reserved.map(ReservedAttribute::tag),
        );
        attribute.spec.write_tags(writer, &prefix);
    }
}

fn read_attributes(tags: &Tags, kind: &str) -> Result<Vec<Attribute>> {
    let count: usize = tags.parsed_or(&format!("NUM {} ATTRIBUTES", kind), 0)?;
    if count > MAX_ATTRIBUTES {
        return Err(Error::InvalidHeader(format!(
            "{} {} attributes exceeds {}",
            count, kind, MAX_ATTRIBUTES
        )));
    }
    (0..count)
        .map(|i| {
            let prefix = format!("{} ATTRIBUTE {}", kind, i);
            let reserved = tags
                .parsed::<u16>(&format!("{} RESERVED", prefix))?
                .and_then(ReservedAttribute::from_tag);
            Ok(Attribute {
                name: tags.string_or(&format!("{} NAME", prefix), ""),
                reserved,
                spec: ScaledSpec::from_tags(tags, &prefix)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IoKind, OpenMode, DEFAULT_SEGMENT_SIZE};
    use tempfile::tempdir;

    fn sample_config() -> HeaderConfig {
        HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0)
            .projection(Projection::utm(18, true))
            .depth_range(-10.0, 500.0, 100.0)
            .horizontal_error(50.0, 100.0)
            .vertical_error(10.0, 1000.0)
            .bin_attribute(
                Attribute::new("Hypothesis count", 0.0, 100.0, 1.0)
                    .reserved(ReservedAttribute::HypothesisCount),
            )
            .ndx_attribute(Attribute::new("Intensity", 0.0, 255.0, 1.0))
            .user_flag_name(0, "Shoal")
            .description("survey H12345")
    }

    #[test]
    fn test_new_computes_widths() {
        let header = BinHeader::new(&sample_config()).unwrap();
        assert_eq!((header.grid.width, header.grid.height), (10, 10));
        assert_eq!(header.null_depth, 501.0);
        // (501 + 10) * 100 = 51100 needs 16 bits.
        assert_eq!(header.depth_bits, 16);
        assert_eq!(header.count_bits, 16);
        assert_eq!(header.beam_number_bits, 10);
        assert_eq!(header.horizontal_error.bits, bits_for(5000));
        assert_eq!(header.bin_attributes[0].spec.bits, 7);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut header = BinHeader::new(&sample_config()).unwrap();
        header.stats.observe_filtered(1.25, 99.5, BinIndex::new(2, 3));
        header.stats.observe_count(7, BinIndex::new(4, 4));
        header.stats.observe_standard_dev(0.125);

        let block = header.encode().unwrap();
        assert_eq!(block.len(), HEADER_SIZE);
        let decoded = BinHeader::decode(&block).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_roundtrip_through_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.bin");
        let mut config = sample_config().geographic();
        config.mbr = Mbr::new(-76.01, 36.99, -76.0, 37.0);
        let header = BinHeader::new(&config)?;
        {
            let mut file = IoKind::Large.open(&path, OpenMode::Create, DEFAULT_SEGMENT_SIZE)?;
            header.write(file.as_mut())?;
        }
        let mut file = IoKind::Large.open(&path, OpenMode::Read, DEFAULT_SEGMENT_SIZE)?;
        assert_eq!(BinHeader::read(file.as_mut())?, header);
        Ok(())
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut header = BinHeader::new(&sample_config()).unwrap();
        header.version = "PFM Software - pfmdb I/O library V7.10".to_string();
        let block = header.encode().unwrap();
        match BinHeader::decode(&block) {
            Err(Error::VersionMismatch { found, supported }) => {
                assert_eq!(found, "7.10");
                assert_eq!(supported, "6.00");
            }
            other => panic!("expected version mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_text_detected() {
        let header = BinHeader::new(&sample_config()).unwrap();
        let mut block = header.encode().unwrap();
        block[20] ^= 0x20;
        assert!(matches!(
            BinHeader::decode(&block),
            Err(Error::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_little_endian_trailer_accepted() {
        use byteorder::{ByteOrder, LittleEndian};

        let header = BinHeader::new(&sample_config()).unwrap();
        let mut block = header.encode().unwrap();
        let tail = HEADER_SIZE - BINARY_TAIL_SIZE;
        let text_len = BigEndian::read_u32(&block[tail + 10..tail + 14]);
        let checksum = BigEndian::read_u64(&block[tail + 14..tail + 22]);
        block[tail + 8..tail + 10].copy_from_slice(&[0x02, 0x01]);
        LittleEndian::write_u32(&mut block[tail + 10..tail + 14], text_len);
        LittleEndian::write_u64(&mut block[tail + 14..tail + 22], checksum);

        assert_eq!(BinHeader::decode(&block).unwrap(), header);
    }

    #[test]
    fn test_legacy_minutes_header() {
        let text = "[VERSION] = PFM Software - PFM I/O library V4.70\n\
                    [PROJECTED] = 0\n\
                    [MIN X] = -76.5\n[MIN Y] = 36.5\n[MAX X] = -76.0\n[MAX Y] = 37.0\n\
                    [X BIN SIZE MINUTES] = 0.3\n[Y BIN SIZE MINUTES] = 0.3\n\
                    [BIN WIDTH] = 100\n[BIN HEIGHT] = 100\n\
                    [MIN DEPTH RANGE] = -10\n[MAX DEPTH RANGE] = 1000\n[DEPTH SCALE] = 100\n\
                    [DEPTH BITS] = 17\n[COUNT BITS] = 16\n[FILE NUMBER BITS] = 12\n\
                    [LINE NUMBER BITS] = 12\n[PING NUMBER BITS] = 24\n[BEAM NUMBER BITS] = 10\n\
                    [HORIZONTAL ERROR BITS] = 12\n\
                    [END OF HEADER]\n";
        let mut block = vec![0u8; HEADER_SIZE];
        block[..text.len()].copy_from_slice(text.as_bytes());

        let header = BinHeader::decode(&block).unwrap();
        assert!((header.grid.x_bin_size - 0.005).abs() < 1e-12);
        assert!(header.projection.wkt.is_none());
        assert!(!header.horizontal_error.enabled());
        assert_eq!(header.null_depth, 1001.0);
    }

    #[test]
    fn test_reserved_lookup_and_average_ownership() {
        let mut header = BinHeader::new(&sample_config()).unwrap();
        assert_eq!(header.find_reserved(ReservedAttribute::HypothesisCount), Some(0));
        assert_eq!(header.find_reserved(ReservedAttribute::AverageTpe), None);

        assert!(!header.averages_managed_externally());
        header.average_filt_name = "CUBE Surface".to_string();
        assert!(header.averages_managed_externally());
    }

    #[test]
    fn test_invalid_configs() {
        let config = sample_config().depth_range(10.0, 10.0, 100.0);
        assert!(matches!(BinHeader::new(&config), Err(Error::InvalidConfig(_))));

        let mut config = sample_config();
        for i in 0..=MAX_ATTRIBUTES {
            config = config.ndx_attribute(Attribute::new(format!("a{}", i), 0.0, 1.0, 1.0));
        }
        assert!(matches!(BinHeader::new(&config), Err(Error::InvalidConfig(_))));

        assert!(BinHeader::new(&sample_config().class_type(6)).is_err());
    }

    #[test]
    fn test_file_lengths() {
        let header = BinHeader::new(&sample_config().coverage_map(true)).unwrap();
        let records = 100 * header.bin_layout().record_size as u64;
        assert_eq!(header.coverage_offset(), HEADER_SIZE as u64 + records);
        assert_eq!(header.bin_file_len(), HEADER_SIZE as u64 + records + 100);
    }
}
