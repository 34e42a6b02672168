//! Core data structures for the splat map

pub mod splat;
pub mod voxel_index;
pub mod store;
pub mod camera;

pub use splat::{SplatRecord, VoxelKey, IDENTITY_ROTATION};
pub use voxel_index::VoxelIndex;
pub use store::{ObserveParams, Observation, SplatMap, SplatStore};
pub use camera::{camera_forward, camera_position, eye_depth, is_valid_view, pixel_to_ndc, Projection};
