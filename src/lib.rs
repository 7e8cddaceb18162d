pub mod bin;
pub mod bitpack;
pub mod cache;
pub mod chain;
pub mod checksum;
pub mod config;
pub mod depth;
pub mod error;
pub mod flock;
pub mod geometry;
pub mod header;
pub mod hyp;
pub mod io;
pub mod list;
pub mod pfm;
pub mod recompute;
pub mod registry;
pub mod validity;

pub use bin::BinRecord;
pub use config::{CacheConfig, PfmConfig};
pub use depth::DepthRecord;
pub use error::{describe, Error, Result};
pub use geometry::{BinIndex, Coord, Mbr};
pub use header::{Attribute, BinHeader, HeaderConfig, ReservedAttribute};
pub use hyp::HypFile;
pub use io::IoKind;
pub use pfm::Pfm;
pub use recompute::RecomputeMask;
pub use registry::{PfmHandle, PfmRegistry};
pub use validity::Validity;
