//! Asynchronous GLTF loading.
//!
//! The dispatcher starts a load with [`GltfLoader::load`] and remembers what to
//! do with the result in [`PendingLoads`]. Loaders never touch the registry:
//! they report [`LoadEvent`]s which are applied on the owning thread when the
//! dispatcher polls them.

use std::collections::HashMap;
use std::collections::VecDeque;

use glam::{Quat, Vec3};

use crate::geometry::Geometry;
use crate::material::Material;
use crate::protocol::NodeInit;
use crate::scene_graph::{ObjectId, SceneRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadId(pub u64);

/// A mesh in an imported node tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedMesh {
    pub geometry: Geometry,
    pub material: Material,
}

/// A node of an imported scene, not yet in any registry.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedNode {
    pub name: String,
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub mesh: Option<ImportedMesh>,
    pub children: Vec<ImportedNode>,
}

impl ImportedNode {
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            mesh: None,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this tree, including itself.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(ImportedNode::node_count).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Progress {
        id: LoadId,
        loaded: u64,
        total: Option<u64>,
    },
    Loaded {
        id: LoadId,
        scene: ImportedNode,
    },
    Failed {
        id: LoadId,
        reason: String,
    },
}

impl LoadEvent {
    pub fn id(&self) -> LoadId {
        match self {
            LoadEvent::Progress { id, .. } | LoadEvent::Loaded { id, .. } | LoadEvent::Failed { id, .. } => *id,
        }
    }
}

/// Source of GLTF imports.
pub trait GltfLoader {
    /// Start loading `path`. The result arrives later through [`poll`](Self::poll).
    fn load(&mut self, id: LoadId, path: &str);

    /// Drain the events produced since the last call.
    fn poll(&mut self) -> Vec<LoadEvent>;
}

/// Loader whose results are pushed by hand. Used for replaying captured
/// sessions and for tests.
#[derive(Debug, Default)]
pub struct ManualLoader {
    requests: Vec<(LoadId, String)>,
    events: VecDeque<LoadEvent>,
}

impl ManualLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests seen so far, oldest first.
    pub fn requests(&self) -> &[(LoadId, String)] {
        &self.requests
    }

    pub fn push(&mut self, event: LoadEvent) {
        self.events.push_back(event);
    }
}

impl GltfLoader for ManualLoader {
    fn load(&mut self, id: LoadId, path: &str) {
        self.requests.push((id, path.to_string()));
    }

    fn poll(&mut self) -> Vec<LoadEvent> {
        self.events.drain(..).collect()
    }
}

/// Invoked with the registered root once a load completes.
pub type LoadCallback = Box<dyn FnOnce(&mut SceneRegistry, ObjectId)>;

/// What to do with a load once it finishes.
pub struct PendingLoad {
    pub name: String,
    pub path: String,
    pub parent_name: Option<String>,
    pub init: NodeInit,
    pub on_done: Option<LoadCallback>,
}

impl std::fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLoad")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("parent_name", &self.parent_name)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

/// In-flight loads keyed by id.
#[derive(Debug, Default)]
pub struct PendingLoads {
    next_id: u64,
    pending: HashMap<LoadId, PendingLoad>,
}

impl PendingLoads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, load: PendingLoad) -> LoadId {
        let id = LoadId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id, load);
        id
    }

    pub fn get(&self, id: LoadId) -> Option<&PendingLoad> {
        self.pending.get(&id)
    }

    pub fn take(&mut self, id: LoadId) -> Option<PendingLoad> {
        self.pending.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
