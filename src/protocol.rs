//! Wire format: the handshake frame and the closed [`Command`] union decoded
//! from each inbound JSON frame.
//!
//! A frame is one JSON object. Every top-level key decodes independently into
//! a [`Decoded`] entry, so a malformed `set_props` does not stop the
//! `add_mesh` next to it. Entries come back in a fixed phase order (resources
//! first, then objects, graph edits, property updates, controls and finally
//! animation binding), whatever order the keys had on the wire.

use glam::{Quat, Vec3};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DispatchError;
use crate::material::Color;
use crate::scene_graph::{ObjectQuery, ROOT_NAME, DEFAULT_CONTROLS_NAME};

pub const ADD_GEOMETRY: &str = "add_geometry";
pub const ADD_MATERIAL: &str = "add_material";
pub const ADD_OBJECT: &str = "add_object";
pub const ADD_MESH: &str = "add_mesh";
pub const ADD_ANIMATION: &str = "add_animation";
pub const ADD_CHILD: &str = "add_child";
pub const SET_PROPS: &str = "set_props";
pub const CAMERA_CONTROLS: &str = "camera_controls";
pub const LOAD_ANIMATION: &str = "load_animation";

#[derive(Serialize)]
struct Handshake<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    client: &'a str,
}

/// The frame sent once every time the socket opens.
pub fn handshake_frame(client: &str) -> String {
    let handshake = Handshake { kind: "init", client };
    // Serializing two string fields cannot fail
    serde_json::to_string(&handshake).unwrap_or_default()
}

/// Parse a text frame into its top-level JSON object.
pub fn decode_frame(text: &str) -> Result<Map<String, Value>, DispatchError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DispatchError::Parse(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(DispatchError::Parse(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// What `add_object`/`add_mesh` should build.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectSpec {
    /// Mesh from geometry and material already in the registry.
    MeshRef {
        geometry_name: String,
        material_name: String,
    },
    /// Mesh from inline geometry and (optional) material payloads.
    Mesh { geometry: Value, material: Option<Value> },
    Camera {
        fov: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Group,
    /// Asynchronous GLTF import.
    Gltf { path: String },
}

/// Optional initial node state shared by every object kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInit {
    pub uuid: Option<String>,
    pub position: Option<Vec3>,
    pub quaternion: Option<Quat>,
    pub scale: Option<Vec3>,
    pub visible: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddObject {
    pub name: String,
    pub spec: ObjectSpec,
    pub parent_name: Option<String>,
    pub init: NodeInit,
}

#[derive(Debug, Deserialize)]
struct AddObjectJson {
    name: String,
    #[serde(default)]
    object_type: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    geometry_name: Option<String>,
    #[serde(default)]
    material_name: Option<String>,
    #[serde(default)]
    geometry: Option<Value>,
    #[serde(default)]
    material: Option<Value>,
    #[serde(default, alias = "parent")]
    parent_name: Option<String>,
    #[serde(default)]
    position: Option<[f32; 3]>,
    #[serde(default)]
    quaternion: Option<[f32; 4]>,
    #[serde(default)]
    scale: Option<[f32; 3]>,
    #[serde(default)]
    visible: Option<bool>,
    #[serde(default)]
    fov: Option<f32>,
    #[serde(default)]
    aspect: Option<f32>,
    #[serde(default)]
    near: Option<f32>,
    #[serde(default)]
    far: Option<f32>,
    #[serde(default)]
    path: Option<String>,
}

impl AddObject {
    fn decode(key: &'static str, value: &Value) -> Result<Self, DispatchError> {
        let json: AddObjectJson = payload(key, value)?;
        let missing = |field: &str| DispatchError::malformed(key, format!("missing field `{}`", field));

        let spec = match json.object_type.as_deref() {
            None | Some("SimpleMeshRef") => ObjectSpec::MeshRef {
                geometry_name: json.geometry_name.ok_or_else(|| missing("geometry_name"))?,
                material_name: json.material_name.ok_or_else(|| missing("material_name"))?,
            },
            Some("SimpleMesh") => ObjectSpec::Mesh {
                geometry: json.geometry.ok_or_else(|| missing("geometry"))?,
                material: json.material,
            },
            Some("Camera") => ObjectSpec::Camera {
                fov: json.fov.unwrap_or(75.0),
                aspect: json.aspect.unwrap_or(1.0),
                near: json.near.unwrap_or(1.0),
                far: json.far.unwrap_or(2000.0),
            },
            Some("Group") => ObjectSpec::Group,
            Some("GLTF") => ObjectSpec::Gltf {
                path: json.path.ok_or_else(|| missing("path"))?,
            },
            Some(other) => return Err(DispatchError::unsupported("object", other)),
        };

        Ok(Self {
            name: json.name,
            spec,
            parent_name: json.parent_name,
            init: NodeInit {
                uuid: json.uuid,
                position: json.position.map(Vec3::from_array),
                quaternion: json.quaternion.map(Quat::from_array),
                scale: json.scale.map(Vec3::from_array),
                visible: json.visible,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddChild {
    #[serde(alias = "parent")]
    pub parent_name: String,
    #[serde(alias = "child")]
    pub child_name: String,
}

/// One property update inside `set_props`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropUpdate {
    Position(Vec3),
    Quaternion(Quat),
    Scale(Vec3),
    Color(Color),
    Opacity(f32),
    Transparent(bool),
    Visible(bool),
    Near(f32),
    Far(f32),
    Fov(f32),
}

/// Recognized `set_props` keys, in application order.
pub const PROP_KEYS: &[&str] = &[
    "position",
    "quaternion",
    "scale",
    "color",
    "opacity",
    "transparent",
    "visible",
    "near",
    "far",
    "fov",
];

impl PropUpdate {
    pub fn key(&self) -> &'static str {
        match self {
            PropUpdate::Position(_) => "position",
            PropUpdate::Quaternion(_) => "quaternion",
            PropUpdate::Scale(_) => "scale",
            PropUpdate::Color(_) => "color",
            PropUpdate::Opacity(_) => "opacity",
            PropUpdate::Transparent(_) => "transparent",
            PropUpdate::Visible(_) => "visible",
            PropUpdate::Near(_) => "near",
            PropUpdate::Far(_) => "far",
            PropUpdate::Fov(_) => "fov",
        }
    }

    fn decode(key: &'static str, value: &Value) -> Result<Self, String> {
        Ok(match key {
            "position" => PropUpdate::Position(Vec3::from_array(floats::<3>(value)?)),
            "quaternion" => PropUpdate::Quaternion(Quat::from_array(floats::<4>(value)?)),
            "scale" => PropUpdate::Scale(Vec3::from_array(floats::<3>(value)?)),
            "color" => PropUpdate::Color(Color::from_json(value)?),
            "opacity" => PropUpdate::Opacity(float(value)?),
            "transparent" => PropUpdate::Transparent(boolean(value)?),
            "visible" => PropUpdate::Visible(boolean(value)?),
            "near" => PropUpdate::Near(float(value)?),
            "far" => PropUpdate::Far(float(value)?),
            "fov" => PropUpdate::Fov(float(value)?),
            other => return Err(format!("unknown property '{}'", other)),
        })
    }
}

fn float(value: &Value) -> Result<f32, String> {
    value
        .as_f64()
        .map(|f| f as f32)
        .ok_or_else(|| format!("expected a number, got {}", json_kind(value)))
}

fn boolean(value: &Value) -> Result<bool, String> {
    value
        .as_bool()
        .ok_or_else(|| format!("expected a boolean, got {}", json_kind(value)))
}

fn floats<const N: usize>(value: &Value) -> Result<[f32; N], String> {
    let items = value
        .as_array()
        .filter(|items| items.len() == N)
        .ok_or_else(|| format!("expected an array of {} numbers", N))?;
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = float(item)?;
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetProps {
    pub query: ObjectQuery,
    pub updates: Vec<PropUpdate>,
    /// Recognized keys whose value could not be decoded, with the reason.
    pub rejected: Vec<(&'static str, String)>,
}

impl SetProps {
    fn decode(map: &Map<String, Value>) -> Result<Self, DispatchError> {
        let query = ObjectQuery {
            name: map.get("name").and_then(Value::as_str).map(str::to_string),
            uuid: map.get("uuid").and_then(Value::as_str).map(str::to_string),
        };
        if query.name.is_none() && query.uuid.is_none() {
            return Err(DispatchError::malformed(SET_PROPS, "missing `name` or `uuid`"));
        }

        let mut updates = Vec::new();
        let mut rejected = Vec::new();
        for &key in PROP_KEYS {
            let Some(value) = map.get(key) else {
                continue;
            };
            match PropUpdate::decode(key, value) {
                Ok(update) => updates.push(update),
                Err(reason) => rejected.push((key, reason)),
            }
        }

        for key in map.keys() {
            if key != "name" && key != "uuid" && !PROP_KEYS.contains(&key.as_str()) {
                log::debug!("set_props ignores unknown property '{}'", key);
            }
        }

        Ok(Self {
            query,
            updates,
            rejected,
        })
    }

    /// Legacy `{"type":"set_position"|"set_quat","name":..,"data":[..]}` frames.
    fn decode_legacy(kind: &str, map: &Map<String, Value>) -> Result<Self, DispatchError> {
        let key = match kind {
            "set_position" => "position",
            "set_quat" => "quaternion",
            _ => return Err(DispatchError::unsupported("frame", kind)),
        };
        let mut props = Map::new();
        if let Some(name) = map.get("name") {
            props.insert("name".to_string(), name.clone());
        }
        if let Some(uuid) = map.get("uuid") {
            props.insert("uuid".to_string(), uuid.clone());
        }
        let data = map
            .get("data")
            .ok_or_else(|| DispatchError::malformed(SET_PROPS, "missing field `data`"))?;
        props.insert(key.to_string(), data.clone());
        Self::decode(&props)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CameraControlsCommand {
    #[serde(default = "default_controls_name")]
    pub controls_name: String,
    /// `[eye_x, eye_y, eye_z, target_x, target_y, target_z]`
    #[serde(default, rename = "setLookAt")]
    pub set_look_at: Option<[f32; 6]>,
    #[serde(default)]
    pub enable_transition: bool,
}

impl CameraControlsCommand {
    pub fn eye_target(&self) -> Option<(Vec3, Vec3)> {
        self.set_look_at
            .map(|v| (Vec3::new(v[0], v[1], v[2]), Vec3::new(v[3], v[4], v[5])))
    }
}

fn default_controls_name() -> String {
    DEFAULT_CONTROLS_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoadAnimation {
    pub clip_name: String,
    #[serde(default = "default_root_name")]
    pub root_name: String,
}

fn default_root_name() -> String {
    ROOT_NAME.to_string()
}

/// One recognized (or unrecognized) top-level key of a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddGeometry(Value),
    AddMaterial(Value),
    AddObject(AddObject),
    AddAnimation(Value),
    AddChild(AddChild),
    SetProps(SetProps),
    CameraControls(CameraControlsCommand),
    LoadAnimation(LoadAnimation),
    /// Any other key. Never mutates anything.
    Unknown(String),
}

/// A decoded top-level key: the key as it appeared and its command, or why
/// it could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub key: String,
    pub command: Result<Command, DispatchError>,
}

/// Position of a key in the dispatch order.
pub fn phase(key: &str) -> usize {
    match key {
        ADD_GEOMETRY => 0,
        ADD_MATERIAL => 1,
        ADD_OBJECT | ADD_MESH => 2,
        ADD_ANIMATION => 3,
        ADD_CHILD => 4,
        SET_PROPS => 5,
        CAMERA_CONTROLS => 6,
        LOAD_ANIMATION => 7,
        _ => 8,
    }
}

fn payload<T: DeserializeOwned>(key: &'static str, value: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(value.clone()).map_err(|e| DispatchError::malformed(key, e))
}

fn object_payload(key: &'static str, value: &Value) -> Result<Value, DispatchError> {
    if value.is_object() {
        Ok(value.clone())
    } else {
        Err(DispatchError::malformed(key, format!("expected an object, got {}", json_kind(value))))
    }
}

fn decode_key(key: &str, value: &Value) -> Result<Command, DispatchError> {
    match key {
        ADD_GEOMETRY => object_payload(ADD_GEOMETRY, value).map(Command::AddGeometry),
        ADD_MATERIAL => object_payload(ADD_MATERIAL, value).map(Command::AddMaterial),
        ADD_OBJECT => AddObject::decode(ADD_OBJECT, value).map(Command::AddObject),
        ADD_MESH => AddObject::decode(ADD_MESH, value).map(Command::AddObject),
        ADD_ANIMATION => object_payload(ADD_ANIMATION, value).map(Command::AddAnimation),
        ADD_CHILD => payload(ADD_CHILD, value).map(Command::AddChild),
        SET_PROPS => match value.as_object() {
            Some(map) => SetProps::decode(map).map(Command::SetProps),
            None => Err(DispatchError::malformed(SET_PROPS, "expected an object")),
        },
        CAMERA_CONTROLS => payload(CAMERA_CONTROLS, value).map(Command::CameraControls),
        LOAD_ANIMATION => payload(LOAD_ANIMATION, value).map(Command::LoadAnimation),
        other => Ok(Command::Unknown(other.to_string())),
    }
}

/// Decode every top-level key of a frame, in dispatch order.
pub fn decode_message(map: &Map<String, Value>) -> Vec<Decoded> {
    if let Some(kind @ ("set_position" | "set_quat")) = map.get("type").and_then(Value::as_str) {
        return vec![Decoded {
            key: kind.to_string(),
            command: SetProps::decode_legacy(kind, map).map(Command::SetProps),
        }];
    }

    let mut decoded: Vec<Decoded> = map
        .iter()
        .map(|(key, value)| Decoded {
            key: key.clone(),
            command: decode_key(key, value),
        })
        .collect();
    decoded.sort_by_key(|d| phase(&d.key));
    decoded
}
