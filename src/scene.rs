//! Scene description and the asset-streaming producer.
//!
//! The scene is the output table of the original scene evaluator: camera,
//! shaders, textures, materials, and meshes as plain serde data. Cameras
//! and the asset declarations are registered at init (configuration ships
//! them before any mesh moves); meshes are built and streamed one at a
//! time from a dedicated producer thread.

use std::path::Path;
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use anyhow::{bail, Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::utils::CancelToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub eye: [f32; 3],
    pub look: [f32; 3],
    #[serde(default = "default_up")]
    pub up: [f32; 3],
    #[serde(default = "default_fov")]
    pub fov: f32,
    #[serde(default)]
    pub aperture: f32,
}

fn default_up() -> [f32; 3] {
    [0.0, 1.0, 0.0]
}

fn default_fov() -> f32 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shader {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Texture {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub texels: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Material {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub emissive: bool,
    #[serde(default)]
    pub shader: Option<String>,
    #[serde(default)]
    pub textures: AHashMap<String, String>,
}

/// A mesh as streamed to exactly one worker. The id is assigned by the
/// reactor when the mesh is stored; the centroid drives spatial routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    #[serde(default)]
    pub id: u32,
    pub material: u32,
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
    #[serde(skip)]
    pub centroid: [f32; 3],
}

impl Mesh {
    pub fn compute_centroid(vertices: &[[f32; 3]]) -> [f32; 3] {
        if vertices.is_empty() {
            return [0.0; 3];
        }
        let mut sum = [0.0f64; 3];
        for v in vertices {
            for axis in 0..3 {
                sum[axis] += v[axis] as f64;
            }
        }
        let n = vertices.len() as f64;
        [
            (sum[0] / n) as f32,
            (sum[1] / n) as f32,
            (sum[2] / n) as f32,
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshDecl {
    pub material: String,
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
}

/// The parsed scene document.
#[derive(Debug, Clone, Deserialize)]
pub struct SceneFile {
    pub camera: Camera,
    #[serde(default)]
    pub shaders: Vec<Shader>,
    #[serde(default)]
    pub textures: Vec<Texture>,
    pub materials: Vec<Material>,
    pub meshes: Vec<MeshDecl>,
}

impl SceneFile {
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open scene file {}", path.display()))?;
        let scene: SceneFile = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("cannot parse scene file {}", path.display()))?;
        if scene.meshes.is_empty() {
            bail!("scene {} declares no meshes", path.display());
        }
        Ok(scene)
    }
}

/// A mesh declaration with its material already resolved, ready for the
/// producer thread.
#[derive(Debug)]
pub struct ResolvedMesh {
    pub material: u32,
    pub vertices: Vec<[f32; 3]>,
    pub faces: Vec<[u32; 3]>,
}

/// The producer half of the asset-streaming rendezvous.
///
/// The channel has zero capacity: `send` blocks the producer until the
/// reactor takes the mesh, and the reactor only takes a mesh once the
/// previous one has been acknowledged by its target worker. Dropping the
/// sender is the end-of-assets signal.
pub struct SceneStreamer {
    join: Option<JoinHandle<()>>,
}

impl SceneStreamer {
    pub fn spawn(meshes: Vec<ResolvedMesh>, cancel: CancelToken) -> (Self, Receiver<Mesh>) {
        let (tx, rx) = bounded::<Mesh>(0);
        let join = thread::spawn(move || stream_meshes(meshes, tx, cancel));
        (Self { join: Some(join) }, rx)
    }

    pub fn join(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SceneStreamer {
    fn drop(&mut self) {
        self.join();
    }
}

fn stream_meshes(meshes: Vec<ResolvedMesh>, tx: Sender<Mesh>, cancel: CancelToken) {
    for decl in meshes {
        if cancel.is_cancelled() {
            return;
        }
        let centroid = Mesh::compute_centroid(&decl.vertices);
        let mesh = Mesh {
            id: 0,
            material: decl.material,
            vertices: decl.vertices,
            faces: decl.faces,
            centroid,
        };
        if tx.send(mesh).is_err() {
            // Reactor went away; nothing left to stream to.
            return;
        }
    }
    tracing::info!("Scene distributed.");
}
