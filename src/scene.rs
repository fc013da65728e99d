//! In-memory scene the loaders populate.
//!
//! The renderer consumes this through the shared lock; the upload pipeline
//! only adds and unloads models.

use std::sync::{Arc, RwLock};

use serde::Serialize;

pub type SharedScene = Arc<RwLock<Scene>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sphere {
    pub center: Vec3,
    pub radius: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriangleMesh {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<[u32; 3]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Spheres(Vec<Sphere>),
    Mesh(TriangleMesh),
}

impl Geometry {
    pub fn primitive_count(&self) -> usize {
        match self {
            Geometry::Spheres(spheres) => spheres.len(),
            Geometry::Mesh(mesh) => mesh.indices.len(),
        }
    }
}

/// Result of a loader, not yet part of any scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub name: String,
    pub type_tag: String,
    pub geometry: Geometry,
}

/// Summary of a model that was added to the scene, returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedModel {
    pub id: u64,
    pub name: String,
    pub type_tag: String,
    pub primitives: usize,
}

#[derive(Debug, Default)]
pub struct Scene {
    models: Vec<(u64, Model)>,
    next_id: u64,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedScene {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Remove every model.
    pub fn unload(&mut self) {
        log::debug!("scene: unloading {} models", self.models.len());
        self.models.clear();
    }

    pub fn add_model(&mut self, model: Model) -> LoadedModel {
        let id = self.next_id;
        self.next_id += 1;
        let loaded = LoadedModel {
            id,
            name: model.name.clone(),
            type_tag: model.type_tag.clone(),
            primitives: model.geometry.primitive_count(),
        };
        self.models.push((id, model));
        loaded
    }

    pub fn model(&self, id: u64) -> Option<&Model> {
        self.models
            .iter()
            .find(|(model_id, _)| *model_id == id)
            .map(|(_, model)| model)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.iter().map(|(_, model)| model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
