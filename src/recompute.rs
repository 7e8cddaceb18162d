//! Recalculation of a bin's aggregates from its soundings.

use crate::bin::BinRecord;
use crate::depth::DepthRecord;
use crate::header::{BinHeader, ReservedAttribute};
use crate::validity::Validity;

/// Which aggregate set a recompute refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeMask {
    Filtered,
    Unfiltered,
    Both,
}

impl RecomputeMask {
    fn filtered(self) -> bool {
        matches!(self, RecomputeMask::Filtered | RecomputeMask::Both)
    }

    fn unfiltered(self) -> bool {
        matches!(self, RecomputeMask::Unfiltered | RecomputeMask::Both)
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    count: u32,
    sum: f64,
    sum_sq: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl Accumulator {
    fn add(&mut self, depth: f64) {
        self.count += 1;
        self.sum += depth;
        self.sum_sq += depth * depth;
        self.min = Some(self.min.map_or(depth, |m| m.min(depth)));
        self.max = Some(self.max.map_or(depth, |m| m.max(depth)));
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Sample standard deviation; 0 for fewer than two soundings.
    fn standard_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        variance.max(0.0).sqrt()
    }
}

/// Rebuilds `bin`'s aggregates and summary flags from `records`.
///
/// Deleted and reference soundings never contribute. The filtered set also
/// drops invalid soundings and, when the header names a class type, soundings
/// without that user flag. Average surfaces owned by another tool are left as
/// they are.
pub fn recompute(
    header: &BinHeader,
    bin: &mut BinRecord,
    records: &[DepthRecord],
    mask: RecomputeMask,
) {
    let class_flag = Validity::user_flag(header.class_type);
    let mut unfiltered = Accumulator::default();
    let mut filtered = Accumulator::default();
    let mut summary = Validity::NONE;
    let mut has_data = false;
    let mut has_invalid = false;

    for record in records {
        summary |= record.validity & Validity::SUMMARY;
        if record.validity.is_deleted() {
            continue;
        }
        has_data = true;
        if record.validity.is_invalid() {
            has_invalid = true;
        }
        if !record.is_counted() {
            continue;
        }
        unfiltered.add(record.depth);

        if record.validity.is_invalid() {
            continue;
        }
        if class_flag.is_some_and(|flag| !record.validity.contains(flag)) {
            continue;
        }
        filtered.add(record.depth);
    }

    let null = header.null_depth;
    let keep_averages = header.averages_managed_externally();

    if mask.unfiltered() {
        bin.count = unfiltered.count;
        bin.min_depth = unfiltered.min.unwrap_or(null);
        bin.max_depth = unfiltered.max.unwrap_or(null);
        if !keep_averages {
            bin.avg_depth = unfiltered.mean().unwrap_or(null);
        }
    }
    if mask.filtered() {
        bin.valid_count = filtered.count;
        bin.min_filtered_depth = filtered.min.unwrap_or(null);
        bin.max_filtered_depth = filtered.max.unwrap_or(null);
        bin.standard_dev = filtered.standard_dev();
        if !keep_averages {
            bin.avg_filtered_depth = filtered.mean().unwrap_or(null);
        }
        if let Some(i) = header.find_reserved(ReservedAttribute::SoundingsUsed) {
            let spec = header.bin_attributes[i].spec;
            bin.attributes[i] = (filtered.count as f64).min(spec.max);
        }
    }

    let mut validity = (bin.validity & Validity::BIN_ONLY) | summary;
    if has_data {
        validity.insert(Validity::DATA);
    }
    if has_invalid {
        validity.insert(Validity::HAS_INVALID);
    }
    bin.validity = validity;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BinIndex, Coord, Mbr};
    use crate::header::{Attribute, HeaderConfig};

    fn header(config: HeaderConfig) -> BinHeader {
        BinHeader::new(&config).unwrap()
    }

    fn base() -> HeaderConfig {
        HeaderConfig::new(Mbr::new(0.0, 0.0, 10.0, 10.0), 1.0)
    }

    fn empty_bin(header: &BinHeader) -> BinRecord {
        let null = header.null_depth;
        BinRecord {
            index: BinIndex::new(0, 0),
            center: Coord::new(0.5, 0.5),
            num_soundings: 0,
            count: 0,
            valid_count: 0,
            standard_dev: 0.0,
            avg_filtered_depth: null,
            min_filtered_depth: null,
            max_filtered_depth: null,
            avg_depth: null,
            min_depth: null,
            max_depth: null,
            attributes: vec![0.0; header.bin_attributes.len()],
            validity: Validity::NONE,
            head: 0,
            tail: 0,
        }
    }

    fn sounding(depth: f64, validity: Validity) -> DepthRecord {
        DepthRecord::new(Coord::new(0.5, 0.5), depth).validity(validity)
    }

    #[test]
    fn test_filtered_and_unfiltered_sets() {
        let header = header(base());
        let mut bin = empty_bin(&header);
        let records = vec![
            sounding(10.0, Validity::NONE),
            sounding(12.0, Validity::NONE),
            sounding(30.0, Validity::MANUALLY_INVAL),
            sounding(99.0, Validity::DELETED),
        ];
        recompute(&header, &mut bin, &records, RecomputeMask::Both);

        assert_eq!(bin.count, 3);
        assert_eq!(bin.valid_count, 2);
        assert_eq!((bin.min_depth, bin.max_depth), (10.0, 30.0));
        assert!((bin.avg_depth - 52.0 / 3.0).abs() < 1e-12);
        assert_eq!(bin.avg_filtered_depth, 11.0);
        assert!((bin.standard_dev - 2f64.sqrt()).abs() < 1e-12);
        assert!(bin.validity.contains(Validity::DATA | Validity::HAS_INVALID | Validity::DELETED));
    }

    #[test]
    fn test_mask_limits_updates() {
        let header = header(base());
        let mut bin = empty_bin(&header);
        let records = vec![sounding(5.0, Validity::NONE)];

        recompute(&header, &mut bin, &records, RecomputeMask::Filtered);
        assert_eq!(bin.valid_count, 1);
        assert_eq!(bin.count, 0);
        assert_eq!(bin.avg_depth, header.null_depth);

        recompute(&header, &mut bin, &records, RecomputeMask::Unfiltered);
        assert_eq!(bin.count, 1);
        assert_eq!(bin.avg_depth, 5.0);
    }

    #[test]
    fn test_no_survivors_gives_null_depth() {
        let header = header(base());
        let mut bin = empty_bin(&header);
        bin.min_depth = 1.0;
        bin.avg_filtered_depth = 2.0;
        let records = vec![sounding(5.0, Validity::DELETED)];
        recompute(&header, &mut bin, &records, RecomputeMask::Both);

        assert_eq!(bin.count, 0);
        assert_eq!(bin.min_depth, header.null_depth);
        assert_eq!(bin.avg_filtered_depth, header.null_depth);
        assert!(!bin.validity.contains(Validity::DATA));
    }

    #[test]
    fn test_class_type_restricts_filtered_set() {
        let header = header(base().class_type(2));
        let mut bin = empty_bin(&header);
        let records = vec![
            sounding(4.0, Validity::USER_02),
            sounding(8.0, Validity::NONE),
            sounding(6.0, Validity::USER_01),
        ];
        recompute(&header, &mut bin, &records, RecomputeMask::Both);
        assert_eq!(bin.valid_count, 1);
        assert_eq!(bin.avg_filtered_depth, 4.0);
        assert_eq!(bin.count, 3);
    }

    #[test]
    fn test_external_averages_untouched() {
        let header = header(base().average_names("CUBE Surface", "CUBE Surface"));
        let mut bin = empty_bin(&header);
        bin.avg_filtered_depth = 42.0;
        bin.avg_depth = 43.0;
        recompute(&header, &mut bin, &[sounding(7.0, Validity::NONE)], RecomputeMask::Both);
        assert_eq!((bin.avg_filtered_depth, bin.avg_depth), (42.0, 43.0));
        assert_eq!(bin.min_filtered_depth, 7.0);
    }

    #[test]
    fn test_bin_only_flags_survive() {
        let header = header(
            base().bin_attribute(
                Attribute::new("Soundings used", 0.0, 1000.0, 1.0)
                    .reserved(ReservedAttribute::SoundingsUsed),
            ),
        );
        let mut bin = empty_bin(&header);
        bin.validity = Validity::CHECKED | Validity::SUSPECT;
        recompute(&header, &mut bin, &[sounding(1.0, Validity::NONE)], RecomputeMask::Both);
        assert!(bin.validity.contains(Validity::CHECKED));
        assert!(!bin.validity.contains(Validity::SUSPECT));
        assert_eq!(bin.attributes[0], 1.0);
    }

    #[test]
    fn test_deterministic() {
        let header = header(base());
        let records: Vec<_> = (0..50)
            .map(|i| sounding(10.0 + (i as f64 * 0.37).sin(), Validity::NONE))
            .collect();
        let mut first = empty_bin(&header);
        recompute(&header, &mut first, &records, RecomputeMask::Both);
        let mut second = first.clone();
        recompute(&header, &mut second, &records, RecomputeMask::Both);
        assert_eq!(first, second);
    }
}
