//! Materials registered by name and shared between meshes.
//!
//! Payloads follow the three.js material JSON layout (`type`, `color`,
//! `opacity`, ...). The loader is generic: it validates the `type` against the
//! known material classes, lifts the properties the protocol can mutate into
//! typed fields and keeps everything else in `extra` untouched.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DispatchError;

/// Material classes the loader accepts.
pub const MATERIAL_TYPES: &[&str] = &[
    "LineBasicMaterial",
    "LineDashedMaterial",
    "MeshBasicMaterial",
    "MeshDepthMaterial",
    "MeshLambertMaterial",
    "MeshMatcapMaterial",
    "MeshNormalMaterial",
    "MeshPhongMaterial",
    "MeshPhysicalMaterial",
    "MeshStandardMaterial",
    "MeshToonMaterial",
    "PointsMaterial",
    "ShadowMaterial",
    "SpriteMaterial",
];

/// Linear RGB color, components in 0-1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Color {
    pub const WHITE: Color = Color { r: 1.0, g: 1.0, b: 1.0 };

    pub fn new(r: f32, g: f32, b: f32) -> Self {
        Self { r, g, b }
    }

    /// Build from a packed `0xRRGGBB` integer.
    pub fn from_hex(hex: u32) -> Self {
        Self {
            r: ((hex >> 16) & 0xff) as f32 / 255.0,
            g: ((hex >> 8) & 0xff) as f32 / 255.0,
            b: (hex & 0xff) as f32 / 255.0,
        }
    }

    pub fn to_hex(&self) -> u32 {
        let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
        (channel(self.r) << 16) | (channel(self.g) << 8) | channel(self.b)
    }

    /// Accepts an integer (`16711680`), a hex string (`"#ff0000"`, `"0xff0000"`)
    /// or an `[r, g, b]` array of floats.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        match value {
            Value::Number(n) => {
                let hex = n
                    .as_u64()
                    .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                    .ok_or_else(|| format!("invalid color number {}", n))?;
                if hex > 0xff_ffff {
                    return Err(format!("color {} out of range", hex));
                }
                Ok(Self::from_hex(hex as u32))
            }
            Value::String(s) => {
                let digits = s
                    .strip_prefix('#')
                    .or_else(|| s.strip_prefix("0x"))
                    .unwrap_or(s);
                if digits.len() != 6 {
                    return Err(format!("invalid color string '{}'", s));
                }
                u32::from_str_radix(digits, 16)
                    .map(Self::from_hex)
                    .map_err(|_| format!("invalid color string '{}'", s))
            }
            Value::Array(items) if items.len() == 3 => {
                let mut rgb = [0.0f32; 3];
                for (slot, item) in rgb.iter_mut().zip(items) {
                    *slot = item
                        .as_f64()
                        .ok_or_else(|| "color components must be numbers".to_string())?
                        as f32;
                }
                Ok(Self::new(rgb[0], rgb[1], rgb[2]))
            }
            other => Err(format!("unsupported color value {}", other)),
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::WHITE
    }
}

/// Which faces are rendered (three.js `FrontSide`/`BackSide`/`DoubleSide`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Side {
    #[default]
    Front,
    Back,
    Double,
}

impl Side {
    fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Side::Front),
            1 => Some(Side::Back),
            2 => Some(Side::Double),
            _ => None,
        }
    }
}

/// A parsed material.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub uuid: Option<String>,
    /// three.js class name, e.g. `MeshBasicMaterial`.
    pub material_type: String,
    pub color: Color,
    pub opacity: f32,
    pub transparent: bool,
    pub visible: bool,
    pub wireframe: bool,
    pub side: Side,
    /// Properties the protocol never mutates (roughness, emissive, ...).
    pub extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct MaterialJson {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    material_type: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    color: Option<Value>,
    #[serde(default)]
    opacity: Option<f32>,
    #[serde(default)]
    transparent: Option<bool>,
    #[serde(default)]
    visible: Option<bool>,
    #[serde(default)]
    wireframe: Option<bool>,
    #[serde(default)]
    side: Option<u64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Material {
    pub fn new(name: impl Into<String>, material_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            material_type: material_type.into(),
            color: Color::WHITE,
            opacity: 1.0,
            transparent: false,
            visible: true,
            wireframe: false,
            side: Side::Front,
            extra: Map::new(),
        }
    }

    /// Material used by `SimpleMesh` payloads that omit one.
    pub fn default_for_mesh(name: impl Into<String>) -> Self {
        let mut material = Self::new(name, "MeshLambertMaterial");
        material.color = Color::from_hex(0x0000ff);
        material
    }

    /// Parse a material payload. `fallback_name` is used when the payload has
    /// no `name` of its own.
    pub fn from_json(value: &Value, fallback_name: Option<&str>) -> Result<Self, DispatchError> {
        let json: MaterialJson = serde_json::from_value(value.clone())
            .map_err(|e| DispatchError::malformed("add_material", e))?;

        if !MATERIAL_TYPES.contains(&json.material_type.as_str()) {
            return Err(DispatchError::unsupported("material", json.material_type));
        }

        let name = json
            .name
            .or_else(|| fallback_name.map(str::to_string))
            .ok_or_else(|| DispatchError::malformed("add_material", "missing field `name`"))?;

        let mut material = Material::new(name, json.material_type);
        material.uuid = json.uuid;
        if let Some(color) = &json.color {
            material.color =
                Color::from_json(color).map_err(|e| DispatchError::malformed("add_material", e))?;
        }
        if let Some(opacity) = json.opacity {
            material.opacity = opacity.clamp(0.0, 1.0);
        }
        material.transparent = json.transparent.unwrap_or(false);
        material.visible = json.visible.unwrap_or(true);
        material.wireframe = json.wireframe.unwrap_or(false);
        if let Some(code) = json.side {
            material.side = Side::from_code(code).ok_or_else(|| {
                DispatchError::malformed("add_material", format!("invalid side {}", code))
            })?;
        }
        material.extra = json.extra;

        Ok(material)
    }
}
