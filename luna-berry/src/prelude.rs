//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Irc, Xyz};

pub use crate::data::{CtScan, RawChunk};
pub use crate::error::{LunaError, Result};
pub use crate::geom::{irc_to_xyz, xyz_to_irc, VoxelGeometry};

pub use crate::consts::hu::{HU_MAX, HU_MIN};
pub use crate::consts::{CandidateClass, DEFAULT_VAL_STRIDE, WIDTH_IRC};

pub use crate::augment::{augment_chunk, Augmentation};
pub use crate::cache::{ChunkKey, ChunkSource, ChunkStore, DiskChunkCache, MemoryChunkCache, ScanCache};
pub use crate::candidate::{Candidate, CandidateRegistry};
pub use crate::loader::{MhdLoader, NiftiLoader, RawScan, ScanLoader};

pub use crate::dataset::{self, home_dataset_dir_with, LunaDataset, LunaPaths, LunaSample};
