//! Capacity-bounded splat storage
//!
//! `SplatStore` owns the records, `SplatMap` pairs it with the voxel index and
//! is the only way records are created or mutated.

use glam::Vec3;

use crate::core::splat::{SplatRecord, VoxelKey};
use crate::core::voxel_index::VoxelIndex;

/// Growing record collection with a hard size cap
#[derive(Debug, Clone)]
pub struct SplatStore {
    records: Vec<SplatRecord>,
    max_splats: usize,
}

impl SplatStore {
    /// Create an empty store that never grows beyond `max_splats`
    pub fn with_capacity_limit(max_splats: usize) -> Self {
        Self {
            records: Vec::new(),
            max_splats,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_splats(&self) -> usize {
        self.max_splats
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_splats
    }

    pub fn get(&self, slot: usize) -> Option<&SplatRecord> {
        self.records.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut SplatRecord> {
        self.records.get_mut(slot)
    }

    /// Append a record. Returns its slot, or `None` when the store is full.
    pub fn push(&mut self, record: SplatRecord) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        self.records.push(record);
        Some(self.records.len() - 1)
    }

    pub fn records(&self) -> &[SplatRecord] {
        &self.records
    }

    /// Positions of all live splats, in slot order
    pub fn positions(&self) -> Vec<Vec3> {
        self.records.iter().map(SplatRecord::position).collect()
    }

    fn clear(&mut self) {
        self.records.clear();
    }
}

/// Parameters applied when a fused observation lands in a voxel
#[derive(Debug, Clone, Copy)]
pub struct ObserveParams {
    /// Confidence added per observation
    pub confidence_increment: f32,
    /// EMA weight toward the new observation
    pub position_blend: f32,
    /// Scale assigned to new splats (meters)
    pub splat_scale: f32,
}

/// What happened to a single voxel observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// An existing splat was reinforced
    Updated(usize),
    /// A new splat was created
    Inserted(usize),
    /// The voxel was empty and the store is at capacity
    Dropped,
}

/// Store and voxel index, kept in lock-step
#[derive(Debug, Clone)]
pub struct SplatMap {
    store: SplatStore,
    index: VoxelIndex,
    voxel_size: f32,
}

impl SplatMap {
    pub fn new(voxel_size: f32, max_splats: usize) -> Self {
        Self {
            store: SplatStore::with_capacity_limit(max_splats),
            index: VoxelIndex::new(),
            voxel_size,
        }
    }

    /// Rebuild a map from loaded records, re-deriving every key from its position.
    ///
    /// Records beyond `max_splats` are discarded. When two records quantize to the
    /// same voxel the first one keeps the key and the later one stays un-indexed.
    pub fn from_records(records: Vec<SplatRecord>, voxel_size: f32, max_splats: usize) -> Self {
        let mut records = records;
        records.truncate(max_splats);

        let mut index = VoxelIndex::with_capacity(records.len());
        for (slot, record) in records.iter().enumerate() {
            let key = VoxelKey::from_position(record.position(), voxel_size);
            index.insert(key, slot);
        }

        Self {
            store: SplatStore { records, max_splats },
            index,
            voxel_size,
        }
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn store(&self) -> &SplatStore {
        &self.store
    }

    pub fn index(&self) -> &VoxelIndex {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn records(&self) -> &[SplatRecord] {
        self.store.records()
    }

    pub fn key_for(&self, position: Vec3) -> VoxelKey {
        VoxelKey::from_position(position, self.voxel_size)
    }

    /// Record owning `key`, if any
    pub fn lookup(&self, key: &VoxelKey) -> Option<&SplatRecord> {
        self.index.get(key).and_then(|slot| self.store.get(slot))
    }

    /// Apply one observation to voxel `key`: reinforce the owner or insert a new splat.
    pub fn observe(
        &mut self,
        key: VoxelKey,
        position: Vec3,
        color: [f32; 3],
        params: &ObserveParams,
    ) -> Observation {
        if let Some(slot) = self.index.get(&key) {
            if let Some(record) = self.store.get_mut(slot) {
                record.blend_position(position, params.position_blend);
                record.reinforce(params.confidence_increment);
                return Observation::Updated(slot);
            }
        }

        let record = SplatRecord::new(position, params.splat_scale, color, params.confidence_increment);
        match self.store.push(record) {
            Some(slot) => {
                self.index.insert(key, slot);
                Observation::Inserted(slot)
            }
            None => Observation::Dropped,
        }
    }

    /// Drop every splat and index entry
    pub fn clear(&mut self) {
        self.store.clear();
        self.index.clear();
    }

    /// Axis-aligned bounds of all splat positions
    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let mut positions = self.store.records().iter().map(SplatRecord::position);
        let first = positions.next()?;
        Some(positions.fold((first, first), |(min, max), p| (min.min(p), max.max(p))))
    }
}
