//! Render hand-off
//!
//! The renderer gets a borrowed [`RenderFrame`] for the duration of one call.
//! Instances are plain `#[repr(C)]` data so the slice can be uploaded to a GPU
//! buffer as bytes.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::core::camera::Projection;
use crate::core::splat::SplatRecord;
use crate::pipeline::sorter::SortOrder;

/// GPU-ready splat
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SplatInstance {
    pub position: [f32; 3],
    pub scale: f32,
    pub color: [f32; 3],
    pub opacity: f32,
    /// Quaternion `[w, x, y, z]`
    pub rotation: [f32; 4],
}

impl From<&SplatRecord> for SplatInstance {
    fn from(record: &SplatRecord) -> Self {
        Self {
            position: record.position,
            scale: record.scale,
            color: record.color,
            opacity: record.opacity,
            rotation: record.rotation,
        }
    }
}

/// Ambient light estimate forwarded from the AR session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightEstimate {
    pub intensity: f32,
    /// RGB scale plus pixel intensity, as reported by the AR session
    pub color_correction: [f32; 4],
}

impl Default for LightEstimate {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            color_correction: [1.0; 4],
        }
    }
}

/// Everything the renderer needs for one frame
#[derive(Debug)]
pub struct RenderFrame<'a> {
    /// Splats ordered back to front, followed by splats newer than the sort
    pub instances: &'a [SplatInstance],
    /// Leading instances covered by the sort order
    pub sorted_count: usize,
    /// Effective view (camera view times anchor)
    pub view: Mat4,
    pub projection: Projection,
    pub camera_position: Vec3,
    pub light: LightEstimate,
    /// Map version the instances were built from
    pub map_version: u64,
    /// Map version the sort order was computed for
    pub sort_version: Option<u64>,
}

impl RenderFrame<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.instances)
    }

    /// Instances appended after the sorted prefix
    pub fn unsorted_count(&self) -> usize {
        self.instances.len() - self.sorted_count
    }

    pub fn is_fully_sorted(&self) -> bool {
        self.sorted_count == self.instances.len()
    }
}

/// Back-to-front instance buffer handed to the renderer.
///
/// Holds the slot-ordered instances of one map state and their reordering by
/// the latest sort. Instances are rebuilt from a record snapshot, so the
/// conversion never runs under the data lock.
#[derive(Debug, Default)]
pub struct RenderCache {
    /// `(epoch, version)` the source instances were built from
    stamp: Option<(u64, u64)>,
    source: Vec<SplatInstance>,
    source_changed: bool,
    order: Option<Arc<SortOrder>>,
    min_opacity: f32,
    ordered: Vec<SplatInstance>,
    sorted_count: usize,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_current(&self, epoch: u64, version: u64) -> bool {
        self.stamp == Some((epoch, version))
    }

    /// Replace the source instances with `records` taken at `(epoch, version)`
    pub fn rebuild_instances(&mut self, records: &[SplatRecord], epoch: u64, version: u64) {
        self.source = records.iter().map(SplatInstance::from).collect();
        self.stamp = Some((epoch, version));
        self.source_changed = true;
    }

    /// Reorder the source instances by `order` unless nothing changed since
    /// the last call.
    ///
    /// An order from another epoch is ignored. Slots past the order's splat
    /// count are appended in insertion order.
    pub fn prepare(&mut self, order: Option<&Arc<SortOrder>>, min_opacity: f32) {
        let epoch = self.stamp.map(|(epoch, _)| epoch);
        let order = order.filter(|o| Some(o.epoch()) == epoch);
        let same_order = match (&self.order, order) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !self.source_changed && same_order && self.min_opacity == min_opacity {
            return;
        }

        let (ordered, sorted_count) = order_instances(&self.source, order.map(|o| &**o), min_opacity);
        self.ordered = ordered;
        self.sorted_count = sorted_count;
        self.source_changed = false;
        self.order = order.cloned();
        self.min_opacity = min_opacity;
    }

    pub fn instances(&self) -> &[SplatInstance] {
        &self.ordered
    }

    pub fn sorted_count(&self) -> usize {
        self.sorted_count
    }

    pub fn sort_version(&self) -> Option<u64> {
        self.order.as_ref().map(|o| o.version())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Apply a sort permutation, filter by opacity, append unsorted tail.
///
/// Returns the ordered instances and how many of them came from the permutation.
pub fn order_instances(
    instances: &[SplatInstance],
    order: Option<&SortOrder>,
    min_opacity: f32,
) -> (Vec<SplatInstance>, usize) {
    let visible = |inst: &&SplatInstance| inst.opacity >= min_opacity;
    let mut ordered = Vec::with_capacity(instances.len());

    let covered = match order {
        Some(order) => {
            ordered.extend(
                order
                    .indices
                    .iter()
                    .filter_map(|&slot| instances.get(slot as usize))
                    .filter(visible)
                    .copied(),
            );
            order.splat_count().min(instances.len())
        }
        None => 0,
    };
    let sorted_count = ordered.len();

    ordered.extend(instances[covered..].iter().filter(visible).copied());
    (ordered, sorted_count)
}
