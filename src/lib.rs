//! warpcache - cached approximations of expensive 2D coordinate transforms
//!
//! Non-linear models are replaced by grids or meshes of local projective
//! models built on demand, located through a quadtree spatial index. Large
//! buffers can be kept in compressible vectors sharing a memory budget.

pub mod config;
pub mod distortion;
pub mod error;
pub mod extent;
pub mod grid;
pub mod mesh;
pub mod mesh_adapter;
pub mod pool;
pub mod precision;
pub mod resample;
pub mod spatial_index;
pub mod transform;

pub use error::{IndexError, PoolError, PoolResult, TransfoError, TransfoResult};
pub use extent::{Extent, Position};
pub use transform::{compose, ProjectiveModel, TransfoModel};
