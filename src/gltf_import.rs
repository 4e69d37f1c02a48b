//! GLTF import into [`ImportedNode`] trees.
//!
//! Natively, [`FileGltfLoader`] runs imports on a worker thread per request.
//! Results travel back over a channel and only reach the registry when the
//! owner polls. The browser loader fetches the bytes and goes through
//! [`import_slice`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
#[cfg(not(target_arch = "wasm32"))]
use std::path::{Path, PathBuf};
#[cfg(not(target_arch = "wasm32"))]
use std::sync::mpsc::{channel, Receiver, Sender};

use anyhow::{Context, Result};
use glam::{Quat, Vec3};

use crate::geometry::{compute_vertex_normals, Geometry, MeshData};
#[cfg(not(target_arch = "wasm32"))]
use crate::loader::GltfLoader;
use crate::loader::{ImportedMesh, ImportedNode, LoadEvent, LoadId};
use crate::material::{Color, Material};

#[cfg(not(target_arch = "wasm32"))]
pub struct FileGltfLoader {
    asset_root: Option<PathBuf>,
    tx: Sender<LoadEvent>,
    rx: Receiver<LoadEvent>,
}

#[cfg(not(target_arch = "wasm32"))]
impl FileGltfLoader {
    /// Relative request paths are resolved against `asset_root` when given.
    pub fn new(asset_root: Option<PathBuf>) -> Self {
        let (tx, rx) = channel();
        Self { asset_root, tx, rx }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        match &self.asset_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl GltfLoader for FileGltfLoader {
    fn load(&mut self, id: LoadId, path: &str) {
        let full_path = self.resolve(path);
        let tx = self.tx.clone();
        log::info!("Loading GLTF {:?} from {}", id, full_path.display());

        let spawned = std::thread::Builder::new()
            .name(format!("gltf-load-{}", id.0))
            .spawn(move || {
                let total = std::fs::metadata(&full_path).ok().map(|m| m.len());
                let _ = tx.send(LoadEvent::Progress { id, loaded: 0, total });
                let event = import_event(id, || import_file(&full_path));
                // The receiver is gone only if the loader was dropped
                let _ = tx.send(event);
            });

        if let Err(e) = spawned {
            let _ = self.tx.send(LoadEvent::Failed {
                id,
                reason: format!("failed to spawn loader thread: {}", e),
            });
        }
    }

    fn poll(&mut self) -> Vec<LoadEvent> {
        self.rx.try_iter().collect()
    }
}

/// Run an import and turn its outcome into the final event for `id`. An
/// importer panic becomes `Failed` like any other error.
pub fn import_event(id: LoadId, import: impl FnOnce() -> Result<ImportedNode>) -> LoadEvent {
    match panic::catch_unwind(AssertUnwindSafe(import)) {
        Ok(Ok(scene)) => LoadEvent::Loaded { id, scene },
        Ok(Err(e)) => LoadEvent::Failed {
            id,
            reason: format!("{:#}", e),
        },
        Err(payload) => LoadEvent::Failed {
            id,
            reason: format!("importer panicked: {}", panic_message(payload.as_ref())),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Import a `.gltf`/`.glb` file into a node tree rooted at a group named
/// after the file.
#[cfg(not(target_arch = "wasm32"))]
pub fn import_file(path: &Path) -> Result<ImportedNode> {
    let (document, buffers, _images) =
        gltf::import(path).with_context(|| format!("Failed to import {}", path.display()))?;
    let root_name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "gltf".to_string());
    import_document(&document, &buffers, root_name)
}

/// Resolve a request path against a base URL. Absolute URLs and
/// root-relative paths are used as given.
pub fn asset_url(base_url: Option<&str>, path: &str) -> String {
    match base_url {
        Some(base) if !path.contains("://") && !path.starts_with('/') => {
            format!("{}/{}", base.trim_end_matches('/'), path)
        }
        _ => path.to_string(),
    }
}

/// File name of a URL without extension or query, used as the import root name.
pub fn url_file_stem(url: &str) -> &str {
    let path = url.split(&['?', '#'][..]).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split('.').next().filter(|s| !s.is_empty()).unwrap_or("gltf")
}

/// Import an in-memory `.glb` (or `.gltf` with embedded buffers).
pub fn import_slice(bytes: &[u8], root_name: impl Into<String>) -> Result<ImportedNode> {
    let (document, buffers, _images) = gltf::import_slice(bytes).context("Failed to parse GLTF data")?;
    import_document(&document, &buffers, root_name.into())
}

fn import_document(document: &gltf::Document, buffers: &[gltf::buffer::Data], root_name: String) -> Result<ImportedNode> {
    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .context("No scenes in gltf")?;

    let mut root = ImportedNode::group(root_name);
    for node in scene.nodes() {
        root.children.push(import_node(&node, buffers)?);
    }
    Ok(root)
}

fn import_node(node: &gltf::Node, buffers: &[gltf::buffer::Data]) -> Result<ImportedNode> {
    let name = node
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("node_{}", node.index()));
    let (translation, rotation, scale) = node.transform().decomposed();

    let mut imported = ImportedNode::group(name.clone());
    imported.translation = Vec3::from_array(translation);
    imported.rotation = Quat::from_array(rotation);
    imported.scale = Vec3::from_array(scale);

    if let Some(mesh) = node.mesh() {
        let mut primitives = mesh
            .primitives()
            .map(|p| import_primitive(&name, &p, buffers))
            .collect::<Result<Vec<_>>>()?;

        // A single primitive becomes the node's own mesh; more become children
        if primitives.len() == 1 {
            imported.mesh = primitives.pop();
        } else {
            for (i, primitive) in primitives.into_iter().enumerate() {
                let mut child = ImportedNode::group(format!("{}_{}", name, i));
                child.mesh = Some(primitive);
                imported.children.push(child);
            }
        }
    }

    for child in node.children() {
        imported.children.push(import_node(&child, buffers)?);
    }
    Ok(imported)
}

fn import_primitive(
    node_name: &str,
    primitive: &gltf::Primitive,
    buffers: &[gltf::buffer::Data],
) -> Result<ImportedMesh> {
    if primitive.mode() != gltf::mesh::Mode::Triangles {
        anyhow::bail!("Unsupported primitive mode: {:?}", primitive.mode());
    }

    let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .context("Primitive has no positions")?
        .collect();
    let indices: Vec<u32> = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => (0..positions.len() as u32).collect(),
    };
    let normals: Vec<[f32; 3]> = match reader.read_normals() {
        Some(normals) => normals.collect(),
        None => compute_vertex_normals(&positions, &indices),
    };
    let uvs: Vec<[f32; 2]> = reader
        .read_tex_coords(0)
        .map(|t| t.into_f32().collect())
        .unwrap_or_default();

    let data = MeshData {
        positions,
        normals,
        uvs,
        indices,
    };
    let geometry = Geometry::new(format!("{}_geometry", node_name), "BufferGeometry", data);

    let gltf_material = primitive.material();
    let [r, g, b, a] = gltf_material.pbr_metallic_roughness().base_color_factor();
    let material_name = gltf_material
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_material", node_name));
    let mut material = Material::new(material_name, "MeshStandardMaterial");
    material.color = Color::new(r, g, b);
    material.opacity = a;
    material.transparent = matches!(gltf_material.alpha_mode(), gltf::material::AlphaMode::Blend);

    Ok(ImportedMesh { geometry, material })
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    // One triangle, positions in an embedded base64 buffer
    const TRIANGLE_GLTF: &str = r#"{
        "asset": {"version": "2.0"},
        "scene": 0,
        "scenes": [{"nodes": [0]}],
        "nodes": [{"name": "tri", "mesh": 0, "translation": [1, 2, 3]}],
        "meshes": [{"primitives": [{"attributes": {"POSITION": 0}}]}],
        "buffers": [{"byteLength": 36, "uri": "data:application/octet-stream;base64,AAAAAAAAAAAAAAAAAACAPwAAAAAAAAAAAAAAAAAAgD8AAAAA"}],
        "bufferViews": [{"buffer": 0, "byteLength": 36}],
        "accessors": [{"bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3", "min": [0, 0, 0], "max": [1, 1, 0]}]
    }"#;

    fn write_fixture(file_name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vizlink-gltf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(file_name);
        std::fs::write(&path, TRIANGLE_GLTF).unwrap();
        path
    }

    #[test]
    fn test_import_triangle() {
        let path = write_fixture("triangle.gltf");
        let root = import_file(&path).unwrap();

        assert_eq!(root.name, "triangle");
        assert_eq!(root.children.len(), 1);
        let tri = &root.children[0];
        assert_eq!(tri.name, "tri");
        assert_eq!(tri.translation, Vec3::new(1.0, 2.0, 3.0));

        let mesh = tri.mesh.as_ref().unwrap();
        assert_eq!(mesh.geometry.vertex_count(), 3);
        assert_eq!(mesh.geometry.triangle_count(), 1);
        // Computed normal for a CCW triangle in the XY plane
        assert!((mesh.geometry.normals[0][2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_import_slice_uses_given_root_name() {
        let root = import_slice(TRIANGLE_GLTF.as_bytes(), "station").unwrap();
        assert_eq!(root.name, "station");
        assert_eq!(root.node_count(), 2);

        assert!(import_slice(b"not gltf", "junk").is_err());
    }

    #[test]
    fn test_asset_urls() {
        assert_eq!(asset_url(Some("https://cdn.test/models/"), "ship.glb"), "https://cdn.test/models/ship.glb");
        assert_eq!(asset_url(Some("/assets"), "/abs/ship.glb"), "/abs/ship.glb");
        assert_eq!(asset_url(Some("/assets"), "http://other/ship.glb"), "http://other/ship.glb");
        assert_eq!(asset_url(None, "ship.glb"), "ship.glb");

        assert_eq!(url_file_stem("https://cdn.test/models/ship.glb?v=2"), "ship");
        assert_eq!(url_file_stem("station.gltf"), "station");
        assert_eq!(url_file_stem("https://cdn.test/"), "gltf");
    }

    #[test]
    fn test_import_panic_becomes_failure() {
        let event = import_event(LoadId(3), || panic!("accessor out of range"));
        let LoadEvent::Failed { id, reason } = event else {
            panic!("expected a failure event");
        };
        assert_eq!(id, LoadId(3));
        assert!(reason.contains("accessor out of range"), "{}", reason);

        let event = import_event(LoadId(4), || anyhow::bail!("no scenes"));
        assert!(matches!(event, LoadEvent::Failed { id: LoadId(4), ref reason } if reason == "no scenes"));
    }

    #[test]
    fn test_missing_file_fails_through_channel() {
        let mut loader = FileGltfLoader::new(Some(std::env::temp_dir()));
        loader.load(LoadId(1), "definitely-not-here.glb");

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut failed = false;
        while Instant::now() < deadline && !failed {
            failed = loader
                .poll()
                .iter()
                .any(|e| matches!(e, LoadEvent::Failed { id: LoadId(1), .. }));
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(failed);
    }

    #[test]
    fn test_loader_delivers_scene() {
        let path = write_fixture("loaded.gltf");
        let mut loader = FileGltfLoader::new(None);
        loader.load(LoadId(7), path.to_str().unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut scene = None;
        while Instant::now() < deadline && scene.is_none() {
            for event in loader.poll() {
                if let LoadEvent::Loaded { id, scene: s } = event {
                    assert_eq!(id, LoadId(7));
                    scene = Some(s);
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(scene.unwrap().node_count(), 2);
    }
}
