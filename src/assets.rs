//! Asset catalog: the narrow query interface the simulation consumes.
//!
//! Mesh and material records live behind a mutex; `snapshot` hands the
//! renderer an owned, sorted copy stamped with the simulation frame index.
//! Backends that feed the catalog are external collaborators.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRecord {
    pub id: u32,
    pub vertex_count: u32,
    pub first_vertex: u32,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialRecord {
    pub id: u32,
    pub generation: u64,
}

/// Owned copy of the catalog at one simulation frame.
#[derive(Debug, Clone, Default)]
pub struct AssetCatalogSnapshot {
    pub simulation_frame_index: u64,
    /// Sorted ascending by id.
    pub meshes: Vec<MeshRecord>,
    /// Sorted ascending by id.
    pub materials: Vec<MaterialRecord>,
}

#[derive(Default)]
struct CatalogInner {
    meshes: FxHashMap<u32, MeshRecord>,
    materials: FxHashMap<u32, MaterialRecord>,
}

/// Pull-based mesh/material registry.
#[derive(Default)]
pub struct AssetCatalog {
    inner: Mutex<CatalogInner>,
}

impl AssetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a mesh record; updates bump the generation.
    pub fn upsert_mesh(&self, id: u32, vertex_count: u32, first_vertex: u32) {
        let mut inner = self.inner.lock();
        let generation = inner.meshes.get(&id).map_or(1, |m| m.generation + 1);
        inner.meshes.insert(
            id,
            MeshRecord {
                id,
                vertex_count,
                first_vertex,
                generation,
            },
        );
    }

    /// Insert or update a material record; updates bump the generation.
    pub fn upsert_material(&self, id: u32) {
        let mut inner = self.inner.lock();
        let generation = inner.materials.get(&id).map_or(1, |m| m.generation + 1);
        inner.materials.insert(id, MaterialRecord { id, generation });
    }

    pub fn remove_mesh(&self, id: u32) -> bool {
        self.inner.lock().meshes.remove(&id).is_some()
    }

    pub fn remove_material(&self, id: u32) -> bool {
        self.inner.lock().materials.remove(&id).is_some()
    }

    pub fn resolve_mesh(&self, id: u32) -> Option<MeshRecord> {
        self.inner.lock().meshes.get(&id).copied()
    }

    pub fn resolve_material(&self, id: u32) -> Option<MaterialRecord> {
        self.inner.lock().materials.get(&id).copied()
    }

    /// Owned, sorted copy of the catalog for the renderer.
    pub fn snapshot(&self, simulation_frame_index: u64) -> AssetCatalogSnapshot {
        let inner = self.inner.lock();
        let mut meshes: Vec<MeshRecord> = inner.meshes.values().copied().collect();
        let mut materials: Vec<MaterialRecord> = inner.materials.values().copied().collect();
        meshes.sort_by_key(|m| m.id);
        materials.sort_by_key(|m| m.id);
        AssetCatalogSnapshot {
            simulation_frame_index,
            meshes,
            materials,
        }
    }
}
