//! The in-memory registry for the current render: slot tables for every
//! asset class plus the worker handles, with the side indexes the engine
//! routes and lights by.

use ahash::AHashMap;
use anyhow::{Context, Result};

use crate::engine::node::WorkerNode;
use crate::image::Image;
use crate::scene::{Camera, Material, Mesh, Shader, Texture};
use crate::spatial::{space_encode, SpatialIndex};

/// Dense 1-based slot storage. Slot 0 is always the nil sentinel; ids are
/// never handed out for it. Storing over an occupied slot releases the
/// prior occupant.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self { slots: vec![None] }
    }

    /// The id the next fresh entry would get.
    pub fn next_id(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn store(&mut self, id: u32, value: Option<T>) {
        let id = id as usize;
        if id >= self.slots.len() {
            self.slots.resize_with(id + 1, || None);
        }
        self.slots[id] = value;
    }

    pub fn lookup(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    /// Occupied ids in id order.
    pub fn ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id as u32))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|value| (id as u32, value)))
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Library {
    pub shaders: SlotTable<Shader>,
    pub textures: SlotTable<Texture>,
    pub materials: SlotTable<Material>,
    pub meshes: SlotTable<Mesh>,
    pub workers: SlotTable<WorkerNode>,
    pub camera: Option<Camera>,
    pub image: Option<Image>,
    material_names: AHashMap<String, u32>,
    /// Mesh ids whose material is emissive. Append-only: releasing a mesh
    /// slot does not retract membership (ids are never reused, so a dead
    /// entry can never alias a live mesh).
    emissive: Vec<u32>,
    spatial: Option<SpatialIndex>,
}

impl Library {
    pub fn new() -> Self {
        Self {
            shaders: SlotTable::new(),
            textures: SlotTable::new(),
            materials: SlotTable::new(),
            meshes: SlotTable::new(),
            workers: SlotTable::new(),
            camera: None,
            image: None,
            material_names: AHashMap::new(),
            emissive: Vec::new(),
            spatial: None,
        }
    }

    pub fn store_material(&mut self, id: u32, material: Material) {
        self.material_names.insert(material.name.clone(), id);
        self.materials.store(id, Some(material));
    }

    pub fn material_id(&self, name: &str) -> Option<u32> {
        self.material_names.get(name).copied()
    }

    /// Store a live mesh, promoting it into the emissive index when its
    /// material is emissive.
    pub fn store_mesh(&mut self, id: u32, mesh: Mesh) {
        if self
            .materials
            .lookup(mesh.material)
            .map(|m| m.emissive)
            .unwrap_or(false)
        {
            self.emissive.push(id);
        }
        self.meshes.store(id, Some(mesh));
    }

    /// Release a mesh slot once its worker has acknowledged it. The
    /// emissive index deliberately keeps the id.
    pub fn release_mesh(&mut self, id: u32) {
        self.meshes.store(id, None);
    }

    pub fn emissive_meshes(&self) -> &[u32] {
        &self.emissive
    }

    /// Record the Morton-curve partition over the registered workers.
    /// Must run after every worker is stored and before any mesh routes.
    pub fn build_spatial_index(&mut self) {
        self.spatial = Some(SpatialIndex::new(self.workers.ids()));
    }

    /// Target worker for a mesh centroid.
    pub fn route(&self, centroid: [f32; 3], scene_min: [f32; 3], scene_max: [f32; 3]) -> Result<u32> {
        let index = self
            .spatial
            .as_ref()
            .context("spatial index queried before build_spatial_index")?;
        Ok(index.locate(space_encode(centroid, scene_min, scene_max)))
    }
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(name: &str, emissive: bool) -> Material {
        Material {
            id: 0,
            name: name.to_string(),
            emissive,
            shader: None,
            textures: AHashMap::new(),
        }
    }

    fn mesh(material: u32) -> Mesh {
        Mesh {
            id: 0,
            material,
            vertices: vec![[0.0; 3]],
            faces: vec![],
            centroid: [0.0; 3],
        }
    }

    #[test]
    fn slot_zero_is_reserved() {
        let table: SlotTable<u8> = SlotTable::new();
        assert_eq!(table.next_id(), 1);
        assert!(table.lookup(0).is_none());
        assert!(table.ids().is_empty());
    }

    #[test]
    fn store_replaces_without_shifting_neighbors() {
        let mut table = SlotTable::new();
        table.store(1, Some("a"));
        table.store(2, Some("b"));
        table.store(1, Some("c"));
        assert_eq!(table.lookup(1), Some(&"c"));
        assert_eq!(table.lookup(2), Some(&"b"));
        assert_eq!(table.ids(), vec![1, 2]);
    }

    #[test]
    fn material_names_resolve_to_ids() {
        let mut lib = Library::new();
        lib.store_material(1, material("steel", false));
        lib.store_material(2, material("lamp", true));
        assert_eq!(lib.material_id("lamp"), Some(2));
        assert_eq!(lib.material_id("wood"), None);
    }

    #[test]
    fn emissive_index_is_append_only() {
        let mut lib = Library::new();
        lib.store_material(1, material("lamp", true));
        lib.store_material(2, material("steel", false));

        lib.store_mesh(1, mesh(1));
        lib.store_mesh(2, mesh(2));
        assert_eq!(lib.emissive_meshes(), &[1]);

        lib.release_mesh(1);
        assert!(lib.meshes.lookup(1).is_none());
        assert_eq!(lib.emissive_meshes(), &[1]);
    }
}
