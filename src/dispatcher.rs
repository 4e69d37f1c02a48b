//! Applies decoded commands to a [`SceneRegistry`].
//!
//! Every key of a frame produces one [`ReportEntry`]. Failures are logged and
//! recorded but never stop the keys after them; there is no rollback of keys
//! that already succeeded.

use serde_json::Value;

use crate::animation::AnimationClip;
use crate::camera::PerspectiveCamera;
use crate::error::DispatchError;
use crate::geometry::GeometryRegistry;
use crate::loader::{GltfLoader, LoadCallback, LoadEvent, LoadId, PendingLoad, PendingLoads};
use crate::material::Material;
use crate::protocol::{
    self, AddChild, AddObject, CameraControlsCommand, Command, LoadAnimation, NodeInit, ObjectSpec, PropUpdate,
    SetProps,
};
use crate::scene_graph::{AttachError, MeshRef, Node, ObjectId, ObjectKind, SceneObject, SceneRegistry};

/// What a successfully applied command did.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Registered {
        name: String,
        id: ObjectId,
        replaced: bool,
    },
    /// An unknown geometry type was registered as an empty placeholder.
    Placeholder {
        name: String,
        id: ObjectId,
        geometry_type: String,
    },
    Attached {
        parent: String,
        child: String,
    },
    PropsApplied {
        target: String,
        applied: Vec<&'static str>,
        skipped: Vec<&'static str>,
    },
    LookAt {
        controls: String,
        transition: bool,
    },
    AnimationBound {
        clip: String,
        root: String,
        replaced_action: bool,
    },
    LoadStarted {
        name: String,
        id: LoadId,
    },
    /// Nothing to do, e.g. an unrecognized key.
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub key: String,
    pub outcome: Result<Effect, DispatchError>,
}

/// Per-key outcomes of one dispatch, in the order they were applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub entries: Vec<ReportEntry>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Outcome for the first entry with this key.
    pub fn get(&self, key: &str) -> Option<&Result<Effect, DispatchError>> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.outcome)
    }

    pub fn errors(&self) -> impl Iterator<Item = &DispatchError> {
        self.entries.iter().filter_map(|e| e.outcome.as_ref().err())
    }

    pub fn effects(&self) -> impl Iterator<Item = &Effect> {
        self.entries.iter().filter_map(|e| e.outcome.as_ref().ok())
    }

    /// Whether any entry changed the registry.
    pub fn mutated(&self) -> bool {
        self.effects().any(|e| !matches!(e, Effect::Ignored(_)))
    }

    fn push(&mut self, key: impl Into<String>, outcome: Result<Effect, DispatchError>) {
        let key = key.into();
        match &outcome {
            Ok(Effect::Ignored(what)) => log::debug!("Ignoring '{}': {}", key, what),
            Ok(effect) => log::debug!("Applied '{}': {:?}", key, effect),
            Err(e) => log::warn!("Failed to apply '{}': {}", key, e),
        }
        self.entries.push(ReportEntry { key, outcome });
    }
}

/// Turns frames into registry mutations. Owns the geometry constructors and
/// the GLTF loader with its pending requests.
pub struct Dispatcher<L> {
    geometries: GeometryRegistry,
    loader: L,
    pending: PendingLoads,
}

impl<L: GltfLoader> Dispatcher<L> {
    pub fn new(loader: L) -> Self {
        Self {
            geometries: GeometryRegistry::default(),
            loader,
            pending: PendingLoads::new(),
        }
    }

    pub fn geometries_mut(&mut self) -> &mut GeometryRegistry {
        &mut self.geometries
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn loader_mut(&mut self) -> &mut L {
        &mut self.loader
    }

    pub fn pending_loads(&self) -> usize {
        self.pending.len()
    }

    /// Decode and apply one text frame. A frame that is not a JSON object is
    /// rejected as a whole.
    pub fn handle_frame(&mut self, registry: &mut SceneRegistry, text: &str) -> Result<DispatchReport, DispatchError> {
        let map = protocol::decode_frame(text)?;
        Ok(self.apply(registry, &map))
    }

    /// Apply an already parsed message.
    pub fn handle_message(&mut self, registry: &mut SceneRegistry, message: &Value) -> DispatchReport {
        match message.as_object() {
            Some(map) => self.apply(registry, map),
            None => {
                let mut report = DispatchReport::default();
                report.push("", Err(DispatchError::Parse("message is not a JSON object".to_string())));
                report
            }
        }
    }

    fn apply(&mut self, registry: &mut SceneRegistry, map: &serde_json::Map<String, Value>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for decoded in protocol::decode_message(map) {
            let outcome = decoded.command.and_then(|command| self.execute(registry, command));
            report.push(decoded.key, outcome);
        }
        report
    }

    fn execute(&mut self, registry: &mut SceneRegistry, command: Command) -> Result<Effect, DispatchError> {
        match command {
            Command::AddGeometry(payload) => self.add_geometry(registry, &payload),
            Command::AddMaterial(payload) => add_material(registry, &payload),
            Command::AddObject(add) => self.add_object(registry, add),
            Command::AddAnimation(payload) => add_animation(registry, &payload),
            Command::AddChild(add) => add_child(registry, &add),
            Command::SetProps(props) => set_props(registry, &props),
            Command::CameraControls(cmd) => camera_controls(registry, &cmd),
            Command::LoadAnimation(load) => load_animation(registry, &load),
            Command::Unknown(key) => Ok(Effect::Ignored(format!("unrecognized key '{}'", key))),
        }
    }

    fn add_geometry(&self, registry: &mut SceneRegistry, payload: &Value) -> Result<Effect, DispatchError> {
        let geometry = self.geometries.parse(payload, None)?;
        let name = geometry.name.clone();
        let geometry_type = geometry.geometry_type.clone();
        let placeholder = geometry.placeholder;
        let registration = registry.add_object(&name, SceneObject::Geometry(geometry));

        if placeholder {
            Ok(Effect::Placeholder {
                name,
                id: registration.id,
                geometry_type,
            })
        } else {
            Ok(Effect::Registered {
                name,
                id: registration.id,
                replaced: registration.replaced,
            })
        }
    }

    fn add_object(&mut self, registry: &mut SceneRegistry, add: AddObject) -> Result<Effect, DispatchError> {
        let parent = add
            .parent_name
            .as_deref()
            .map(|parent| resolve_node(registry, "parent", parent))
            .transpose()?;

        let mut node = Node::new(add.name.as_str());
        apply_init(&mut node, &add.init);

        let object = match add.spec {
            ObjectSpec::MeshRef {
                geometry_name,
                material_name,
            } => {
                let geometry = resolve_kind(registry, "geometry", &geometry_name, ObjectKind::Geometry)?;
                let material = resolve_kind(registry, "material", &material_name, ObjectKind::Material)?;
                SceneObject::Mesh(node, MeshRef { geometry, material })
            }
            ObjectSpec::Mesh { geometry, material } => {
                // Parse both before registering either
                let geometry = self
                    .geometries
                    .parse(&geometry, Some(format!("{}_geometry", add.name).as_str()))?;
                let material_name = format!("{}_material", add.name);
                let material = match material {
                    Some(payload) => Material::from_json(&payload, Some(material_name.as_str()))?,
                    None => Material::default_for_mesh(material_name),
                };
                let geometry = registry
                    .add_object(&geometry.name.clone(), SceneObject::Geometry(geometry))
                    .id;
                let material = registry
                    .add_object(&material.name.clone(), SceneObject::Material(material))
                    .id;
                SceneObject::Mesh(node, MeshRef { geometry, material })
            }
            ObjectSpec::Camera { fov, aspect, near, far } => {
                SceneObject::Camera(node, PerspectiveCamera::new(fov, aspect, near, far))
            }
            ObjectSpec::Group => SceneObject::Group(node),
            ObjectSpec::Gltf { path } => {
                let id = self.start_load(&add.name, &path, add.parent_name.clone(), add.init.clone(), None);
                return Ok(Effect::LoadStarted { name: add.name, id });
            }
        };

        let registration = registry.add_object(&add.name, object);
        if let Some(parent) = parent {
            attach(registry, parent, registration.id, add.parent_name.as_deref().unwrap_or_default(), &add.name)?;
        }
        if parent.is_some() || registration.replaced {
            registry.set_update();
        }

        Ok(Effect::Registered {
            name: add.name,
            id: registration.id,
            replaced: registration.replaced,
        })
    }

    /// Start an asynchronous GLTF import that will register its root under
    /// `name`, attach it under `parent_name` if given, and then call `on_done`.
    pub fn load_gltf(
        &mut self,
        name: &str,
        path: &str,
        parent_name: Option<String>,
        on_done: Option<LoadCallback>,
    ) -> LoadId {
        self.start_load(name, path, parent_name, NodeInit::default(), on_done)
    }

    fn start_load(
        &mut self,
        name: &str,
        path: &str,
        parent_name: Option<String>,
        init: NodeInit,
        on_done: Option<LoadCallback>,
    ) -> LoadId {
        let id = self.pending.start(PendingLoad {
            name: name.to_string(),
            path: path.to_string(),
            parent_name,
            init,
            on_done,
        });
        self.loader.load(id, path);
        id
    }

    /// Apply finished loads. Entries are keyed by the name the load registers.
    pub fn poll_loads(&mut self, registry: &mut SceneRegistry) -> DispatchReport {
        let mut report = DispatchReport::default();

        for event in self.loader.poll() {
            let id = event.id();
            match event {
                LoadEvent::Progress { loaded, total, .. } => {
                    if let Some(pending) = self.pending.get(id) {
                        match total {
                            Some(total) => log::info!("Loading '{}': {}/{} bytes", pending.path, loaded, total),
                            None => log::info!("Loading '{}': {} bytes", pending.path, loaded),
                        }
                    }
                }
                LoadEvent::Loaded { scene, .. } => {
                    let Some(pending) = self.pending.take(id) else {
                        log::warn!("Dropping result for unknown load {:?}", id);
                        continue;
                    };
                    log::info!("Loaded '{}' ({} nodes)", pending.path, scene.node_count());

                    let root = registry.insert_imported(scene);
                    if let Some(node) = registry.get_mut(root).and_then(SceneObject::node_mut) {
                        apply_init(node, &pending.init);
                    }
                    let registration = registry.register(&pending.name, root);

                    if let Some(parent_name) = &pending.parent_name {
                        let attached = resolve_node(registry, "parent", parent_name)
                            .and_then(|parent| attach(registry, parent, root, parent_name, &pending.name));
                        if let Err(e) = attached {
                            log::warn!("'{}' loaded but not attached: {}", pending.name, e);
                        }
                    }
                    registry.set_update();

                    if let Some(on_done) = pending.on_done {
                        on_done(registry, root);
                    }
                    report.push(
                        pending.name.clone(),
                        Ok(Effect::Registered {
                            name: pending.name,
                            id: root,
                            replaced: registration.replaced,
                        }),
                    );
                }
                LoadEvent::Failed { reason, .. } => {
                    let Some(pending) = self.pending.take(id) else {
                        log::warn!("Dropping failure for unknown load {:?}: {}", id, reason);
                        continue;
                    };
                    report.push(
                        pending.name,
                        Err(DispatchError::Load {
                            path: pending.path,
                            reason,
                        }),
                    );
                }
            }
        }

        report
    }
}

fn apply_init(node: &mut Node, init: &NodeInit) {
    if let Some(uuid) = &init.uuid {
        node.uuid = Some(uuid.clone());
    }
    if let Some(position) = init.position {
        node.position = position;
    }
    if let Some(quaternion) = init.quaternion {
        node.quaternion = quaternion;
    }
    if let Some(scale) = init.scale {
        node.scale = scale;
    }
    if let Some(visible) = init.visible {
        node.visible = visible;
    }
}

fn resolve(registry: &SceneRegistry, role: &'static str, name: &str) -> Result<ObjectId, DispatchError> {
    registry
        .id_of(name)
        .ok_or_else(|| DispatchError::not_found(role, name))
}

fn resolve_kind(
    registry: &SceneRegistry,
    role: &'static str,
    name: &str,
    kind: ObjectKind,
) -> Result<ObjectId, DispatchError> {
    let id = resolve(registry, role, name)?;
    match registry.get(id) {
        Some(object) if object.kind() == kind => Ok(id),
        Some(object) => Err(DispatchError::invalid_target(
            name,
            format!("expected a {:?}, found a {:?}", kind, object.kind()),
        )),
        None => Err(DispatchError::not_found(role, name)),
    }
}

fn resolve_node(registry: &SceneRegistry, role: &'static str, name: &str) -> Result<ObjectId, DispatchError> {
    let id = resolve(registry, role, name)?;
    match registry.get(id).and_then(SceneObject::node) {
        Some(_) => Ok(id),
        None => Err(DispatchError::invalid_target(name, "not a scene node")),
    }
}

fn attach(
    registry: &mut SceneRegistry,
    parent: ObjectId,
    child: ObjectId,
    parent_name: &str,
    child_name: &str,
) -> Result<(), DispatchError> {
    registry.attach(parent, child).map_err(|e| match e {
        AttachError::Cycle => DispatchError::invalid_target(
            child_name,
            format!("cannot be attached beneath '{}' (cycle)", parent_name),
        ),
        AttachError::NotANode(id) if id == parent => DispatchError::invalid_target(parent_name, e),
        AttachError::Missing(id) if id == parent => DispatchError::not_found("parent", parent_name),
        other => DispatchError::invalid_target(child_name, other),
    })
}

fn add_material(registry: &mut SceneRegistry, payload: &Value) -> Result<Effect, DispatchError> {
    let material = Material::from_json(payload, None)?;
    let name = material.name.clone();
    let registration = registry.add_object(&name, SceneObject::Material(material));
    Ok(Effect::Registered {
        name,
        id: registration.id,
        replaced: registration.replaced,
    })
}

fn add_animation(registry: &mut SceneRegistry, payload: &Value) -> Result<Effect, DispatchError> {
    let clip = AnimationClip::from_json(payload)?;
    let name = clip.name.clone();
    let registration = registry.add_object(&name, SceneObject::AnimationClip(clip));
    Ok(Effect::Registered {
        name,
        id: registration.id,
        replaced: registration.replaced,
    })
}

fn add_child(registry: &mut SceneRegistry, add: &AddChild) -> Result<Effect, DispatchError> {
    let parent = resolve_node(registry, "parent", &add.parent_name)?;
    let child = resolve_node(registry, "child", &add.child_name)?;
    attach(registry, parent, child, &add.parent_name, &add.child_name)?;
    registry.set_update();
    Ok(Effect::Attached {
        parent: add.parent_name.clone(),
        child: add.child_name.clone(),
    })
}

fn set_props(registry: &mut SceneRegistry, props: &SetProps) -> Result<Effect, DispatchError> {
    let target = registry
        .get_object(&props.query)
        .ok_or_else(|| DispatchError::not_found("object", props.query.describe()))?;

    let mut applied = Vec::new();
    let mut skipped = Vec::new();
    for (key, reason) in &props.rejected {
        log::warn!("set_props on '{}': invalid '{}': {}", props.query.describe(), key, reason);
        skipped.push(*key);
    }
    for update in &props.updates {
        if apply_prop(registry, target, *update) {
            registry.set_update();
            applied.push(update.key());
        } else {
            log::debug!("set_props: '{}' does not apply to '{}'", update.key(), props.query.describe());
            skipped.push(update.key());
        }
    }

    Ok(Effect::PropsApplied {
        target: props.query.describe(),
        applied,
        skipped,
    })
}

/// The material a color/opacity update lands on: a mesh's material, or the
/// material itself.
fn material_target(registry: &SceneRegistry, id: ObjectId) -> Option<ObjectId> {
    match registry.get(id)? {
        SceneObject::Mesh(_, mesh) => Some(mesh.material),
        SceneObject::Material(_) => Some(id),
        _ => None,
    }
}

fn with_material(registry: &mut SceneRegistry, id: ObjectId, f: impl FnOnce(&mut Material)) -> bool {
    let Some(material_id) = material_target(registry, id) else {
        return false;
    };
    match registry.get_mut(material_id) {
        Some(SceneObject::Material(material)) => {
            f(material);
            true
        }
        _ => false,
    }
}

fn with_node(registry: &mut SceneRegistry, id: ObjectId, f: impl FnOnce(&mut Node)) -> bool {
    match registry.get_mut(id).and_then(SceneObject::node_mut) {
        Some(node) => {
            f(node);
            true
        }
        None => false,
    }
}

fn with_camera(registry: &mut SceneRegistry, id: ObjectId, f: impl FnOnce(&mut PerspectiveCamera)) -> bool {
    match registry.get_mut(id) {
        Some(SceneObject::Camera(_, camera)) => {
            f(camera);
            camera.update_projection_matrix();
            true
        }
        _ => false,
    }
}

fn apply_prop(registry: &mut SceneRegistry, id: ObjectId, update: PropUpdate) -> bool {
    match update {
        PropUpdate::Position(p) => with_node(registry, id, |n| n.position = p),
        PropUpdate::Quaternion(q) => with_node(registry, id, |n| n.quaternion = q),
        PropUpdate::Scale(s) => with_node(registry, id, |n| n.scale = s),
        PropUpdate::Visible(v) => {
            if let Some(SceneObject::Material(material)) = registry.get_mut(id) {
                material.visible = v;
                return true;
            }
            with_node(registry, id, |n| n.visible = v)
        }
        PropUpdate::Color(c) => {
            if let Some(SceneObject::Light(_, light)) = registry.get_mut(id) {
                light.color = c;
                return true;
            }
            with_material(registry, id, |m| m.color = c)
        }
        PropUpdate::Opacity(o) => with_material(registry, id, |m| m.opacity = o.clamp(0.0, 1.0)),
        PropUpdate::Transparent(t) => with_material(registry, id, |m| m.transparent = t),
        PropUpdate::Near(v) => with_camera(registry, id, |c| c.near = v),
        PropUpdate::Far(v) => with_camera(registry, id, |c| c.far = v),
        PropUpdate::Fov(v) => with_camera(registry, id, |c| c.fov = v),
    }
}

fn camera_controls(registry: &mut SceneRegistry, cmd: &CameraControlsCommand) -> Result<Effect, DispatchError> {
    let controls = resolve_kind(registry, "controls", &cmd.controls_name, ObjectKind::Controls)?;
    let Some((eye, target)) = cmd.eye_target() else {
        return Ok(Effect::Ignored("camera_controls without setLookAt".to_string()));
    };

    if !registry.set_look_at(controls, eye, target, cmd.enable_transition) {
        return Err(DispatchError::invalid_target(
            &cmd.controls_name,
            "its camera is no longer in the registry",
        ));
    }
    registry.set_update();
    Ok(Effect::LookAt {
        controls: cmd.controls_name.clone(),
        transition: cmd.enable_transition,
    })
}

fn load_animation(registry: &mut SceneRegistry, load: &LoadAnimation) -> Result<Effect, DispatchError> {
    let clip = resolve_kind(registry, "clip", &load.clip_name, ObjectKind::AnimationClip)?;
    let root = resolve_node(registry, "root", &load.root_name)?;

    let replaced_action = registry
        .load_animation(clip, root)
        .ok_or_else(|| DispatchError::invalid_target(&load.clip_name, "could not be bound"))?;
    registry.set_update();
    Ok(Effect::AnimationBound {
        clip: load.clip_name.clone(),
        root: load.root_name.clone(),
        replaced_action,
    })
}
