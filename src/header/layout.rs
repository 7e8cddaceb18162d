//! Bit positions of every field in bin and depth records, derived from the header widths.

use crate::bitpack::{bits_for, Field, ScaledField};

use super::{Attribute, BinHeader};

/// Bit layout of a bin record.
#[derive(Debug, Clone, PartialEq)]
pub struct BinLayout {
    pub record_size: usize,
    /// Physical records in the chain, deleted ones included.
    pub num_soundings: Field,
    /// Soundings contributing to the unfiltered aggregates.
    pub count: Field,
    /// Soundings contributing to the filtered aggregates.
    pub valid_count: Field,
    pub std: ScaledField,
    pub avg_filtered: ScaledField,
    pub min_filtered: ScaledField,
    pub max_filtered: ScaledField,
    pub avg: ScaledField,
    pub min: ScaledField,
    pub max: ScaledField,
    pub attributes: Vec<ScaledField>,
    pub validity: Field,
    pub head: Field,
    pub tail: Field,
}

/// Bit layout of one physical record in the index file.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthLayout {
    pub record_size: usize,
    pub row: Field,
    pub col: Field,
    pub file_number: Field,
    pub line_number: Field,
    pub ping_number: Field,
    pub beam_number: Field,
    pub x_offset: Field,
    pub y_offset: Field,
    pub depth: ScaledField,
    pub validity: Field,
    pub horizontal_error: ScaledField,
    pub vertical_error: ScaledField,
    pub attributes: Vec<ScaledField>,
    pub next: Field,
}

/// Hands out consecutive bit ranges.
struct Cursor {
    pos: usize,
}

impl Cursor {
    fn field(&mut self, name: &'static str, bits: u8) -> Field {
        let field = Field::new(name, self.pos, bits);
        self.pos = field.end();
        field
    }

    fn scaled(&mut self, name: &'static str, bits: u8, scale: f64, offset: f64, absent: f64) -> ScaledField {
        ScaledField::new(self.field(name, bits), scale, offset, absent)
    }

    fn attributes(&mut self, name: &'static str, attributes: &[Attribute]) -> Vec<ScaledField> {
        attributes
            .iter()
            .map(|a| self.scaled(name, a.spec.bits, a.spec.scale, a.spec.min, a.spec.min))
            .collect()
    }

    fn bytes(&self) -> usize {
        self.pos.div_ceil(8)
    }
}

impl BinLayout {
    pub fn new(header: &BinHeader) -> Self {
        let mut c = Cursor { pos: 0 };
        let depth = |c: &mut Cursor, name| {
            c.scaled(name, header.depth_bits, header.depth_scale, header.min_depth, header.null_depth)
        };

        let num_soundings = c.field("number of soundings", header.pointer_bits);
        let count = c.field("bin count", header.count_bits);
        let valid_count = c.field("valid count", header.count_bits);
        let std = c.scaled("standard deviation", header.std_bits, header.std_scale, 0.0, 0.0);
        let avg_filtered = depth(&mut c, "average filtered depth");
        let min_filtered = depth(&mut c, "minimum filtered depth");
        let max_filtered = depth(&mut c, "maximum filtered depth");
        let avg = depth(&mut c, "average depth");
        let min = depth(&mut c, "minimum depth");
        let max = depth(&mut c, "maximum depth");
        let attributes = c.attributes("bin attribute", &header.bin_attributes);
        let validity = c.field("bin validity", header.validity_bits);
        let head = c.field("head pointer", header.pointer_bits);
        let tail = c.field("tail pointer", header.pointer_bits);

        Self {
            record_size: c.bytes(),
            num_soundings,
            count,
            valid_count,
            std,
            avg_filtered,
            min_filtered,
            max_filtered,
            avg,
            min,
            max,
            attributes,
            validity,
            head,
            tail,
        }
    }
}

impl DepthLayout {
    pub fn new(header: &BinHeader) -> Self {
        let grid = &header.grid;
        let mut c = Cursor { pos: 0 };

        let row = c.field("row", bits_for(grid.height.saturating_sub(1) as u64));
        let col = c.field("column", bits_for(grid.width.saturating_sub(1) as u64));
        let file_number = c.field("file number", header.file_number_bits);
        let line_number = c.field("line number", header.line_number_bits);
        let ping_number = c.field("ping number", header.ping_number_bits);
        let beam_number = c.field("beam number", header.beam_number_bits);
        let x_offset = c.field("x offset", header.offset_bits);
        let y_offset = c.field("y offset", header.offset_bits);
        let depth = c.scaled(
            "depth",
            header.depth_bits,
            header.depth_scale,
            header.min_depth,
            header.null_depth,
        );
        let validity = c.field("validity", header.validity_bits);
        let he = &header.horizontal_error;
        let horizontal_error = c.scaled("horizontal error", he.bits, he.scale, he.min, 0.0);
        let ve = &header.vertical_error;
        let vertical_error = c.scaled("vertical error", ve.bits, ve.scale, ve.min, 0.0);
        let attributes = c.attributes("index attribute", &header.ndx_attributes);
        let next = c.field("continuation pointer", header.pointer_bits);

        Self {
            record_size: c.bytes(),
            row,
            col,
            file_number,
            line_number,
            ping_number,
            beam_number,
            x_offset,
            y_offset,
            depth,
            validity,
            horizontal_error,
            vertical_error,
            attributes,
            next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mbr;
    use crate::header::HeaderConfig;

    #[test]
    fn test_fields_are_contiguous() {
        let config = HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0)
            .bin_attribute(Attribute::new("a", 0.0, 10.0, 10.0));
        let header = BinHeader::new(&config).unwrap();
        let layout = BinLayout::new(&header);

        assert_eq!(layout.num_soundings.start, 0);
        assert_eq!(layout.count.start, layout.num_soundings.end());
        assert_eq!(layout.attributes[0].field.bits, 7);
        assert_eq!(layout.validity.start, layout.attributes[0].field.end());
        assert_eq!(layout.record_size, layout.tail.end().div_ceil(8));
    }

    #[test]
    fn test_disabled_errors_cost_nothing() {
        let header =
            BinHeader::new(&HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0)).unwrap();
        let plain = DepthLayout::new(&header);
        assert_eq!(plain.horizontal_error.field.bits, 0);
        assert_eq!(plain.vertical_error.field.start, plain.validity.end());

        let config = HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0)
            .horizontal_error(10.0, 100.0)
            .vertical_error(10.0, 100.0);
        let with_errors = DepthLayout::new(&BinHeader::new(&config).unwrap());
        assert_eq!(
            with_errors.next.start,
            plain.next.start + 2 * bits_for(1000) as usize
        );
    }

    #[test]
    fn test_row_col_widths_follow_grid() {
        let header =
            BinHeader::new(&HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 3.0), 1.0)).unwrap();
        let layout = DepthLayout::new(&header);
        assert_eq!(layout.row.bits, 2);
        assert_eq!(layout.col.bits, 4);
    }
}
