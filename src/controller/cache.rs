//! Volume listing cache
//!
//! Holds the last full listing of the array so that paged list calls do not
//! re-query the array for every page. Volumes and snapshots live in separate
//! slots, each behind its own lock. Contents may be stale: every controller
//! mutation clears both slots.

use crate::domain::ports::Volume;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Two-slot listing cache shared by concurrent list calls
#[derive(Debug, Default)]
pub struct VolumeCache {
    volumes: RwLock<Vec<Volume>>,
    snapshots: RwLock<Vec<Volume>>,
    /// Bumped on every populate or clear
    generation: AtomicU64,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both slots from one array listing
    pub fn populate(&self, all: &[Volume]) {
        let (snaps, vols): (Vec<Volume>, Vec<Volume>) =
            all.iter().cloned().partition(Volume::is_snapshot);
        self.populate_volumes(vols);
        self.populate_snapshots(snaps);
    }

    pub fn populate_volumes(&self, volumes: Vec<Volume>) {
        *self.volumes.write() = volumes;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn populate_snapshots(&self, snapshots: Vec<Volume>) {
        *self.snapshots.write() = snapshots;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop both slots
    pub fn clear(&self) {
        self.volumes.write().clear();
        self.snapshots.write().clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Copy of the volume slot
    pub fn volumes(&self) -> Vec<Volume> {
        self.volumes.read().clone()
    }

    /// Copy of the snapshot slot
    pub fn snapshots(&self) -> Vec<Volume> {
        self.snapshots.read().clone()
    }

    pub fn volumes_warm(&self) -> bool {
        !self.volumes.read().is_empty()
    }

    pub fn snapshots_warm(&self) -> bool {
        !self.snapshots.read().is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
