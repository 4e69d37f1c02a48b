//! Scene registry mutated by the command dispatcher.
//!
//! Objects live in an arena keyed by [`ObjectId`]. A separate name map gives
//! the protocol its string handles, and graph nodes carry their own
//! parent/child links. Registering an object and attaching it to the graph are
//! separate steps: a registered object is not rendered until something parents
//! it under the `scene` root.

use std::collections::{HashMap, HashSet};

use glam::{Quat, Vec3};
use thiserror::Error;

use crate::animation::{AnimationClip, AnimationMixer, BindingResolver, SampledValue};
use crate::camera::{look_at_rotation, CameraControls, PerspectiveCamera};
use crate::geometry::Geometry;
use crate::lighting::Light;
use crate::loader::ImportedNode;
use crate::material::Material;

/// Name of the root group every fresh registry starts with.
pub const ROOT_NAME: &str = "scene";
pub const DEFAULT_CAMERA_NAME: &str = "camera";
pub const DEFAULT_CONTROLS_NAME: &str = "controls";
pub const AMBIENT_LIGHT_NAME: &str = "ambient_light";
pub const DIRECTIONAL_LIGHT_NAME: &str = "directional_light";

/// Unique identifier for objects in the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Transform, visibility and graph links shared by every renderable object.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub uuid: Option<String>,
    pub position: Vec3,
    pub quaternion: Quat,
    pub scale: Vec3,
    pub visible: bool,
    parent: Option<ObjectId>,
    children: Vec<ObjectId>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            position: Vec3::ZERO,
            quaternion: Quat::IDENTITY,
            scale: Vec3::ONE,
            visible: true,
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    pub fn children(&self) -> &[ObjectId] {
        &self.children
    }
}

/// A mesh references shared geometry and material objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRef {
    pub geometry: ObjectId,
    pub material: ObjectId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Mesh,
    Camera,
    Light,
    Group,
    Geometry,
    Material,
    AnimationClip,
    Controls,
}

/// Anything the registry can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneObject {
    Mesh(Node, MeshRef),
    Camera(Node, PerspectiveCamera),
    Light(Node, Light),
    Group(Node),
    Geometry(Geometry),
    Material(Material),
    AnimationClip(AnimationClip),
    Controls(CameraControls),
}

impl SceneObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            SceneObject::Mesh(..) => ObjectKind::Mesh,
            SceneObject::Camera(..) => ObjectKind::Camera,
            SceneObject::Light(..) => ObjectKind::Light,
            SceneObject::Group(_) => ObjectKind::Group,
            SceneObject::Geometry(_) => ObjectKind::Geometry,
            SceneObject::Material(_) => ObjectKind::Material,
            SceneObject::AnimationClip(_) => ObjectKind::AnimationClip,
            SceneObject::Controls(_) => ObjectKind::Controls,
        }
    }

    /// Graph node, for objects that can be placed in the scene.
    pub fn node(&self) -> Option<&Node> {
        match self {
            SceneObject::Mesh(n, _)
            | SceneObject::Camera(n, _)
            | SceneObject::Light(n, _)
            | SceneObject::Group(n) => Some(n),
            _ => None,
        }
    }

    pub fn node_mut(&mut self) -> Option<&mut Node> {
        match self {
            SceneObject::Mesh(n, _)
            | SceneObject::Camera(n, _)
            | SceneObject::Light(n, _)
            | SceneObject::Group(n) => Some(n),
            _ => None,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        match self {
            SceneObject::Geometry(g) => g.uuid.as_deref(),
            SceneObject::Material(m) => m.uuid.as_deref(),
            SceneObject::AnimationClip(c) => c.uuid.as_deref(),
            SceneObject::Controls(_) => None,
            other => other.node().and_then(|n| n.uuid.as_deref()),
        }
    }

    fn set_name(&mut self, name: &str) {
        match self {
            SceneObject::Geometry(g) => g.name = name.to_string(),
            SceneObject::Material(m) => m.name = name.to_string(),
            SceneObject::AnimationClip(c) => c.name = name.to_string(),
            SceneObject::Controls(_) => {}
            other => {
                if let Some(node) = other.node_mut() {
                    node.name = name.to_string();
                }
            }
        }
    }
}

/// How to find an object: by registered name first, then by uuid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectQuery {
    pub name: Option<String>,
    pub uuid: Option<String>,
}

impl ObjectQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            uuid: None,
        }
    }

    /// Human-readable handle for logs and errors.
    pub fn describe(&self) -> String {
        match (&self.name, &self.uuid) {
            (Some(name), _) => name.clone(),
            (None, Some(uuid)) => format!("uuid {}", uuid),
            (None, None) => "<no name or uuid>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("object {0:?} does not exist")]
    Missing(ObjectId),
    #[error("object {0:?} is not a scene node")]
    NotANode(ObjectId),
    #[error("attaching would create a cycle")]
    Cycle,
}

/// Result of registering an object under a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ObjectId,
    /// True if a previous occupant of the name was detached and discarded.
    pub replaced: bool,
}

/// The registry: name → object mapping, scene graph, dirty flag and mixer.
#[derive(Debug)]
pub struct SceneRegistry {
    objects: HashMap<ObjectId, SceneObject>,
    names: HashMap<String, ObjectId>,
    next_id: u64,
    root: ObjectId,
    needs_update: bool,
    mixer: AnimationMixer,
}

impl SceneRegistry {
    /// A registry holding only the `scene` root group.
    pub fn empty() -> Self {
        let mut registry = Self {
            objects: HashMap::new(),
            names: HashMap::new(),
            next_id: 1,
            root: ObjectId(0),
            needs_update: false,
            mixer: AnimationMixer::new(),
        };
        let root = registry.add_object(ROOT_NAME, SceneObject::Group(Node::new(ROOT_NAME)));
        registry.root = root.id;
        registry
    }

    /// A registry with the default camera, controls and lights attached to the root.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let root = registry.root;

        let eye = Vec3::new(180.0, 0.0, 0.0);
        let mut camera_node = Node::new(DEFAULT_CAMERA_NAME);
        camera_node.position = eye;
        camera_node.quaternion = look_at_rotation(eye, Vec3::ZERO, Vec3::Y).unwrap_or(Quat::IDENTITY);
        let camera = registry
            .add_object(
                DEFAULT_CAMERA_NAME,
                SceneObject::Camera(camera_node, PerspectiveCamera::new(75.0, 1.0, 1.0, 2000.0)),
            )
            .id;
        registry.add_object(
            DEFAULT_CONTROLS_NAME,
            SceneObject::Controls(CameraControls::new(camera, eye, Vec3::ZERO)),
        );

        let ambient = registry
            .add_object(
                AMBIENT_LIGHT_NAME,
                SceneObject::Light(Node::new(AMBIENT_LIGHT_NAME), Light::ambient(0.0)),
            )
            .id;
        let mut sun_node = Node::new(DIRECTIONAL_LIGHT_NAME);
        sun_node.position = Vec3::new(100.0, 0.0, 0.0);
        let sun = registry
            .add_object(
                DIRECTIONAL_LIGHT_NAME,
                SceneObject::Light(sun_node, Light::directional(30.0)),
            )
            .id;

        for child in [camera, ambient, sun] {
            // Freshly created nodes under the root cannot fail to attach
            let _ = registry.attach(root, child);
        }
        registry.needs_update = false;
        registry
    }

    fn new_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn root(&self) -> ObjectId {
        self.root
    }

    /// Put an object in the arena without naming it.
    ///
    /// An unnamed geometry/material/clip must be referenced before the next
    /// replacement or it is freed.
    pub fn insert(&mut self, object: SceneObject) -> ObjectId {
        let id = self.new_id();
        self.objects.insert(id, object);
        id
    }

    /// Insert an object and register it under `name`, replacing any previous occupant.
    pub fn add_object(&mut self, name: &str, object: SceneObject) -> Registration {
        let id = self.insert(object);
        self.register(name, id)
    }

    /// Register an arena object under `name`.
    ///
    /// A previous node occupant is detached and discarded together with its
    /// unnamed descendants; named descendants are left orphaned. Replacing the
    /// root with another node moves the root's children onto the new node.
    /// Controls bound to a replaced camera follow the replacement when it is a
    /// camera. A previous geometry/material/clip occupant is unmapped and freed
    /// once no mesh or action references it.
    pub fn register(&mut self, name: &str, id: ObjectId) -> Registration {
        let mut replaced = false;
        if let Some(old) = self.names.get(name).copied().filter(|&old| old != id) {
            replaced = true;
            self.names.remove(name);
            self.discard(old, id);
        }

        if let Some(object) = self.objects.get_mut(&id) {
            object.set_name(name);
        }
        self.names.insert(name.to_string(), id);
        if replaced {
            self.collect_unreferenced();
        }
        Registration { id, replaced }
    }

    fn discard(&mut self, old: ObjectId, replacement: ObjectId) {
        let Some(kind) = self.objects.get(&old).map(SceneObject::kind) else {
            return;
        };
        match kind {
            ObjectKind::Controls => {
                self.objects.remove(&old);
            }
            ObjectKind::Mesh | ObjectKind::Camera | ObjectKind::Light | ObjectKind::Group => {
                if old == self.root {
                    self.replace_root(replacement);
                    return;
                }
                if kind == ObjectKind::Camera {
                    self.rebind_controls(old, replacement);
                }
                if self.is_ancestor(old, replacement) {
                    self.detach(replacement);
                }
                self.detach(old);
                self.remove_subtree(old);
            }
            ObjectKind::Geometry | ObjectKind::Material | ObjectKind::AnimationClip => {}
        }
    }

    /// Make `new_root` the scene root, moving the old root's children under it.
    fn replace_root(&mut self, new_root: ObjectId) {
        let old_root = self.root;
        if self.objects.get(&new_root).and_then(SceneObject::node).is_none() {
            log::warn!("'{}' was taken by a non-node; keeping the old root unnamed", ROOT_NAME);
            return;
        }

        self.detach(new_root);
        let children = self.children_of(old_root).to_vec();
        for child in children {
            if let Err(e) = self.attach(new_root, child) {
                log::warn!("Could not move {:?} to the new root: {}", child, e);
            }
        }
        if self.mixer.active().is_some_and(|a| a.root == old_root) {
            self.mixer.stop();
        }
        self.objects.remove(&old_root);
        self.root = new_root;
        log::debug!("Scene root replaced by {:?}", new_root);
    }

    fn rebind_controls(&mut self, old_camera: ObjectId, replacement: ObjectId) {
        if !matches!(self.objects.get(&replacement), Some(SceneObject::Camera(..))) {
            return;
        }
        for object in self.objects.values_mut() {
            if let SceneObject::Controls(c) = object {
                if c.camera == old_camera {
                    c.camera = replacement;
                }
            }
        }
    }

    /// Remove a detached node and its unnamed descendants. Named descendants
    /// are orphaned and stay registered.
    fn remove_subtree(&mut self, id: ObjectId) {
        let named: HashSet<ObjectId> = self.names.values().copied().collect();
        let mut stack = vec![id];
        let (mut removed, mut orphaned) = (0, 0);
        while let Some(current) = stack.pop() {
            if current == self.root {
                continue;
            }
            let Some(object) = self.objects.remove(&current) else {
                continue;
            };
            removed += 1;
            if self.mixer.active().is_some_and(|a| a.root == current) {
                self.mixer.stop();
            }
            let children = object.node().map(Node::children).unwrap_or_default();
            for &child in children {
                if !named.contains(&child) {
                    stack.push(child);
                    continue;
                }
                if let Some(node) = self.objects.get_mut(&child).and_then(SceneObject::node_mut) {
                    node.parent = None;
                }
                orphaned += 1;
            }
        }
        log::debug!("Discarded {} nodes, orphaned {} named children", removed, orphaned);
    }

    /// Drop unnamed geometries, materials and clips that nothing references.
    fn collect_unreferenced(&mut self) {
        let mut keep: HashSet<ObjectId> = self.names.values().copied().collect();
        for object in self.objects.values() {
            if let SceneObject::Mesh(_, mesh) = object {
                keep.insert(mesh.geometry);
                keep.insert(mesh.material);
            }
        }
        if let Some(action) = self.mixer.active() {
            keep.insert(action.clip);
        }

        let before = self.objects.len();
        self.objects.retain(|id, object| {
            keep.contains(id)
                || !matches!(
                    object.kind(),
                    ObjectKind::Geometry | ObjectKind::Material | ObjectKind::AnimationClip
                )
        });
        let freed = before - self.objects.len();
        if freed > 0 {
            log::debug!("Freed {} unreferenced resources", freed);
        }
    }

    pub fn id_of(&self, name: &str) -> Option<ObjectId> {
        self.names.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Resolve a query to an object id.
    pub fn get_object(&self, query: &ObjectQuery) -> Option<ObjectId> {
        if let Some(id) = query.name.as_deref().and_then(|name| self.id_of(name)) {
            return Some(id);
        }
        let uuid = query.uuid.as_deref()?;
        self.names
            .values()
            .copied()
            .find(|id| self.objects.get(id).and_then(SceneObject::uuid) == Some(uuid))
    }

    pub fn get(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.get_mut(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&SceneObject> {
        self.id_of(name).and_then(|id| self.objects.get(&id))
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of objects in the arena, named or not.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.names.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Attach `child` under `parent`, detaching it from any previous parent.
    pub fn attach(&mut self, parent: ObjectId, child: ObjectId) -> Result<(), AttachError> {
        for id in [parent, child] {
            match self.objects.get(&id) {
                None => return Err(AttachError::Missing(id)),
                Some(object) if object.node().is_none() => return Err(AttachError::NotANode(id)),
                Some(_) => {}
            }
        }
        if parent == child || self.is_ancestor(child, parent) {
            return Err(AttachError::Cycle);
        }

        self.detach(child);
        if let Some(node) = self.objects.get_mut(&parent).and_then(SceneObject::node_mut) {
            node.children.push(child);
        }
        if let Some(node) = self.objects.get_mut(&child).and_then(SceneObject::node_mut) {
            node.parent = Some(parent);
        }
        Ok(())
    }

    /// Remove `child` from its parent. Returns false if it had none.
    pub fn detach(&mut self, child: ObjectId) -> bool {
        let Some(parent) = self.parent_of(child) else {
            return false;
        };
        if let Some(node) = self.objects.get_mut(&parent).and_then(SceneObject::node_mut) {
            node.children.retain(|&c| c != child);
        }
        if let Some(node) = self.objects.get_mut(&child).and_then(SceneObject::node_mut) {
            node.parent = None;
        }
        true
    }

    pub fn parent_of(&self, id: ObjectId) -> Option<ObjectId> {
        self.objects.get(&id)?.node()?.parent
    }

    pub fn children_of(&self, id: ObjectId) -> &[ObjectId] {
        match self.objects.get(&id).and_then(SceneObject::node) {
            Some(node) => &node.children,
            None => &[],
        }
    }

    /// Whether `ancestor` is `id` itself or above it in the graph.
    pub fn is_ancestor(&self, ancestor: ObjectId, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parent_of(node);
        }
        false
    }

    /// Whether the node is reachable from the root.
    pub fn is_in_scene(&self, id: ObjectId) -> bool {
        self.is_ancestor(self.root, id)
    }

    /// Find a node named `name` in the subtree rooted at `root` (inclusive).
    pub fn find_in_subtree(&self, root: ObjectId, name: &str) -> Option<ObjectId> {
        find_in_subtree(&self.objects, root, name)
    }

    /// Mark the frame dirty.
    pub fn set_update(&mut self) {
        self.needs_update = true;
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    /// Read and clear the dirty flag. Called by the render loop.
    pub fn take_update(&mut self) -> bool {
        std::mem::take(&mut self.needs_update)
    }

    pub fn mixer(&self) -> &AnimationMixer {
        &self.mixer
    }

    /// Bind a clip to a root node and make it the only active action.
    ///
    /// Returns `Some(replaced)` on success, `None` if `clip` is not a clip or
    /// `root` is not a node.
    pub fn load_animation(&mut self, clip: ObjectId, root: ObjectId) -> Option<bool> {
        if self.objects.get(&root).and_then(SceneObject::node).is_none() {
            return None;
        }
        let Some(SceneObject::AnimationClip(animation)) = self.objects.get(&clip) else {
            return None;
        };
        let resolver = SubtreeResolver { objects: &self.objects };
        let replaced = self.mixer.play(clip, animation, root, &resolver);
        if replaced {
            self.collect_unreferenced();
        }
        Some(replaced)
    }

    /// Camera driven by a controls object, if that camera is still registered.
    pub fn controls_camera(&self, controls: ObjectId) -> Option<ObjectId> {
        let Some(SceneObject::Controls(c)) = self.objects.get(&controls) else {
            return None;
        };
        matches!(self.objects.get(&c.camera), Some(SceneObject::Camera(..))).then_some(c.camera)
    }

    /// Point camera controls at a new eye/target. Returns false if `controls`
    /// is not a controls object or its camera is gone.
    pub fn set_look_at(&mut self, controls: ObjectId, eye: Vec3, target: Vec3, enable_transition: bool) -> bool {
        if self.controls_camera(controls).is_none() {
            return false;
        }
        let Some(SceneObject::Controls(c)) = self.objects.get_mut(&controls) else {
            return false;
        };
        c.set_look_at(eye, target, enable_transition);
        if !enable_transition {
            self.sync_camera(controls);
        }
        true
    }

    /// Copy a controls object's eye/target onto its camera node.
    fn sync_camera(&mut self, controls: ObjectId) {
        let Some(SceneObject::Controls(c)) = self.objects.get(&controls) else {
            return;
        };
        let (camera, eye, rotation) = (c.camera, c.eye, c.rotation());
        if let Some(SceneObject::Camera(node, _)) = self.objects.get_mut(&camera) {
            node.position = eye;
            if let Some(rotation) = rotation {
                node.quaternion = rotation;
            }
            self.needs_update = true;
        }
    }

    /// Step camera transitions and the active animation by `dt` seconds.
    pub fn advance(&mut self, dt: f32) {
        let controls: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, o)| o.kind() == ObjectKind::Controls)
            .map(|(&id, _)| id)
            .collect();
        for id in controls {
            let moved = match self.objects.get_mut(&id) {
                Some(SceneObject::Controls(c)) => c.update(dt),
                _ => false,
            };
            if moved {
                self.sync_camera(id);
            }
        }

        let Some(clip_id) = self.mixer.active().map(|a| a.clip) else {
            return;
        };
        let Some(SceneObject::AnimationClip(clip)) = self.objects.get(&clip_id) else {
            log::warn!("Active clip {:?} is no longer in the registry, stopping", clip_id);
            self.mixer.stop();
            return;
        };
        let samples = match self.mixer.advance_time(dt, clip.duration) {
            Some(action) => action.sample(clip),
            None => return,
        };

        for (target, value) in samples {
            let Some(node) = self.objects.get_mut(&target).and_then(SceneObject::node_mut) else {
                continue;
            };
            match value {
                SampledValue::Position(p) => node.position = p,
                SampledValue::Quaternion(q) => node.quaternion = q,
                SampledValue::Scale(s) => node.scale = s,
                SampledValue::Visible(v) => node.visible = v,
            }
            self.needs_update = true;
        }
    }

    /// Insert an imported node tree. Only the returned root is left for the
    /// caller to register; descendants stay unnamed but keep their node names.
    pub fn insert_imported(&mut self, imported: ImportedNode) -> ObjectId {
        let mut node = Node::new(imported.name);
        node.position = imported.translation;
        node.quaternion = imported.rotation;
        node.scale = imported.scale;

        let object = match imported.mesh {
            Some(mesh) => {
                let geometry = self.insert(SceneObject::Geometry(mesh.geometry));
                let material = self.insert(SceneObject::Material(mesh.material));
                SceneObject::Mesh(node, MeshRef { geometry, material })
            }
            None => SceneObject::Group(node),
        };
        let id = self.insert(object);

        for child in imported.children {
            let child_id = self.insert_imported(child);
            if let Err(e) = self.attach(id, child_id) {
                log::warn!("Failed to attach imported child: {}", e);
            }
        }
        id
    }
}

impl Default for SceneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn find_in_subtree(objects: &HashMap<ObjectId, SceneObject>, root: ObjectId, name: &str) -> Option<ObjectId> {
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(node) = objects.get(&id).and_then(SceneObject::node) else {
            continue;
        };
        if node.name == name {
            return Some(id);
        }
        stack.extend(node.children.iter().rev().copied());
    }
    None
}

struct SubtreeResolver<'a> {
    objects: &'a HashMap<ObjectId, SceneObject>,
}

impl BindingResolver for SubtreeResolver<'_> {
    fn resolve(&self, root: ObjectId, node_name: Option<&str>) -> Option<ObjectId> {
        match node_name {
            None => Some(root),
            Some(name) => find_in_subtree(self.objects, root, name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::Material;

    fn group(registry: &mut SceneRegistry, name: &str) -> ObjectId {
        registry.add_object(name, SceneObject::Group(Node::new(name))).id
    }

    #[test]
    fn test_default_scene() {
        let registry = SceneRegistry::new();
        for name in [ROOT_NAME, DEFAULT_CAMERA_NAME, DEFAULT_CONTROLS_NAME, AMBIENT_LIGHT_NAME, DIRECTIONAL_LIGHT_NAME] {
            assert!(registry.contains(name), "missing {}", name);
        }
        let camera = registry.id_of(DEFAULT_CAMERA_NAME).unwrap();
        assert!(registry.is_in_scene(camera));
        assert!(!registry.needs_update());
    }

    #[test]
    fn test_register_without_attach() {
        let mut registry = SceneRegistry::empty();
        let id = group(&mut registry, "orbit");

        assert!(registry.contains("orbit"));
        assert!(!registry.is_in_scene(id));
        assert_eq!(registry.parent_of(id), None);
    }

    #[test]
    fn test_attach_and_reparent() {
        let mut registry = SceneRegistry::empty();
        let root = registry.root();
        let a = group(&mut registry, "a");
        let b = group(&mut registry, "b");
        let c = group(&mut registry, "c");

        registry.attach(root, a).unwrap();
        registry.attach(a, c).unwrap();
        assert_eq!(registry.children_of(a), &[c]);

        registry.attach(b, c).unwrap();
        assert!(registry.children_of(a).is_empty());
        assert_eq!(registry.parent_of(c), Some(b));
    }

    #[test]
    fn test_attach_rejects_cycles_and_non_nodes() {
        let mut registry = SceneRegistry::empty();
        let a = group(&mut registry, "a");
        let b = group(&mut registry, "b");
        registry.attach(a, b).unwrap();

        assert_eq!(registry.attach(b, a), Err(AttachError::Cycle));
        assert_eq!(registry.attach(a, a), Err(AttachError::Cycle));

        let m = registry
            .add_object("m", SceneObject::Material(Material::new("m", "MeshBasicMaterial")))
            .id;
        assert_eq!(registry.attach(a, m), Err(AttachError::NotANode(m)));
        assert_eq!(registry.attach(a, ObjectId(999)), Err(AttachError::Missing(ObjectId(999))));
    }

    #[test]
    fn test_replace_detaches_previous_occupant() {
        let mut registry = SceneRegistry::empty();
        let root = registry.root();
        let first = group(&mut registry, "sat");
        let child = group(&mut registry, "antenna");
        registry.attach(root, first).unwrap();
        registry.attach(first, child).unwrap();

        let second = registry.add_object("sat", SceneObject::Group(Node::new("sat")));
        assert!(second.replaced);
        assert_eq!(registry.id_of("sat"), Some(second.id));
        assert!(registry.get(first).is_none());
        assert!(registry.children_of(root).is_empty());
        assert_eq!(registry.parent_of(child), None);
    }

    #[test]
    fn test_replacing_root_keeps_scene_reachable() {
        let mut registry = SceneRegistry::new();
        let old_root = registry.root();
        let camera = registry.id_of(DEFAULT_CAMERA_NAME).unwrap();

        let new_root = registry.add_object(ROOT_NAME, SceneObject::Group(Node::new(ROOT_NAME)));
        assert!(new_root.replaced);
        assert_eq!(registry.root(), new_root.id);
        assert!(registry.get(old_root).is_none());
        assert!(registry.is_in_scene(camera));
        assert_eq!(registry.parent_of(camera), Some(new_root.id));

        let g = group(&mut registry, "g");
        registry.attach(registry.id_of(ROOT_NAME).unwrap(), g).unwrap();
        assert!(registry.is_in_scene(g));
    }

    #[test]
    fn test_root_name_taken_by_resource_keeps_root() {
        let mut registry = SceneRegistry::new();
        let root = registry.root();
        let camera = registry.id_of(DEFAULT_CAMERA_NAME).unwrap();

        registry.add_object(ROOT_NAME, SceneObject::Material(Material::new(ROOT_NAME, "MeshBasicMaterial")));
        assert_eq!(registry.root(), root);
        assert!(registry.get(root).is_some());
        assert!(registry.is_in_scene(camera));
    }

    #[test]
    fn test_replacing_camera_rebinds_controls() {
        let mut registry = SceneRegistry::new();
        let controls = registry.id_of(DEFAULT_CONTROLS_NAME).unwrap();

        let camera = registry
            .add_object(
                DEFAULT_CAMERA_NAME,
                SceneObject::Camera(Node::new(DEFAULT_CAMERA_NAME), PerspectiveCamera::default()),
            )
            .id;
        assert_eq!(registry.controls_camera(controls), Some(camera));
        assert!(registry.set_look_at(controls, Vec3::new(0.0, 0.0, 40.0), Vec3::ZERO, false));
        assert_eq!(registry.get(camera).unwrap().node().unwrap().position, Vec3::new(0.0, 0.0, 40.0));

        registry.add_object(DEFAULT_CAMERA_NAME, SceneObject::Group(Node::new(DEFAULT_CAMERA_NAME)));
        assert_eq!(registry.controls_camera(controls), None);
        assert!(!registry.set_look_at(controls, Vec3::ONE, Vec3::ZERO, false));
    }

    #[test]
    fn test_replace_frees_unnamed_descendants_and_resources() {
        let mut registry = SceneRegistry::empty();
        let baseline = registry.object_count();

        for _ in 0..50 {
            let geometry = registry.add_object("g", SceneObject::Geometry(Geometry::placeholder("g", "BoxGeometry"))).id;
            let material = registry
                .add_object("m", SceneObject::Material(Material::new("m", "MeshBasicMaterial")))
                .id;
            let mut imported = ImportedNode::group("ship");
            imported.children.push(ImportedNode::group("hull"));
            let ship = registry.insert_imported(imported);
            registry.register("ship", ship);
            registry.add_object("s", SceneObject::Mesh(Node::new("s"), MeshRef { geometry, material }));
        }

        // scene, g, m, ship + hull, s
        assert_eq!(registry.object_count(), baseline + 5);
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_replaced_resource_survives_while_referenced() {
        let mut registry = SceneRegistry::empty();
        let old = registry.add_object("g", SceneObject::Geometry(Geometry::placeholder("g", "BoxGeometry"))).id;
        let material = registry
            .add_object("m", SceneObject::Material(Material::new("m", "MeshBasicMaterial")))
            .id;
        registry.add_object("s", SceneObject::Mesh(Node::new("s"), MeshRef { geometry: old, material }));

        registry.add_object("g", SceneObject::Geometry(Geometry::placeholder("g", "BoxGeometry")));
        assert!(registry.get(old).is_some());

        registry.add_object("s", SceneObject::Group(Node::new("s")));
        assert!(registry.get(old).is_none());
    }

    #[test]
    fn test_query_falls_back_to_uuid() {
        let mut registry = SceneRegistry::empty();
        let mut node = Node::new("x");
        node.uuid = Some("abc".into());
        let id = registry.add_object("x", SceneObject::Group(node)).id;

        let query = ObjectQuery {
            name: Some("stale".into()),
            uuid: Some("abc".into()),
        };
        assert_eq!(registry.get_object(&query), Some(id));
        assert_eq!(registry.get_object(&ObjectQuery::by_name("stale")), None);
    }

    #[test]
    fn test_query_by_uuid() {
        let mut registry = SceneRegistry::empty();
        let mut node = Node::new("x");
        node.uuid = Some("abc-123".into());
        let id = registry.add_object("x", SceneObject::Group(node)).id;

        let query = ObjectQuery {
            name: None,
            uuid: Some("abc-123".into()),
        };
        assert_eq!(registry.get_object(&query), Some(id));
        assert_eq!(registry.get_object(&ObjectQuery::default()), None);
    }

    #[test]
    fn test_take_update_clears_flag() {
        let mut registry = SceneRegistry::empty();
        registry.set_update();
        assert!(registry.take_update());
        assert!(!registry.take_update());
    }

    #[test]
    fn test_immediate_look_at_moves_camera() {
        let mut registry = SceneRegistry::new();
        let controls = registry.id_of(DEFAULT_CONTROLS_NAME).unwrap();
        assert!(registry.set_look_at(controls, Vec3::new(0.0, 0.0, 50.0), Vec3::ZERO, false));

        let camera = registry.get_by_name(DEFAULT_CAMERA_NAME).unwrap().node().unwrap();
        assert_eq!(camera.position, Vec3::new(0.0, 0.0, 50.0));
        assert!(registry.needs_update());

        let material = registry
            .add_object("m", SceneObject::Material(Material::new("m", "MeshBasicMaterial")))
            .id;
        assert!(!registry.set_look_at(material, Vec3::ONE, Vec3::ZERO, false));
    }

    #[test]
    fn test_find_in_subtree() {
        let mut registry = SceneRegistry::empty();
        let a = group(&mut registry, "a");
        let b = registry.insert(SceneObject::Group(Node::new("panel")));
        registry.attach(a, b).unwrap();

        assert_eq!(registry.find_in_subtree(a, "panel"), Some(b));
        assert_eq!(registry.find_in_subtree(a, "a"), Some(a));
        assert_eq!(registry.find_in_subtree(b, "a"), None);
    }
}
