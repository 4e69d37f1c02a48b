//! Geometry payload parsing.
//!
//! Geometries arrive as three.js JSON. Two paths exist:
//!
//! - Buffer-backed types (`BufferGeometry`, `InstancedBufferGeometry`) carry
//!   their vertex data inline under `data.attributes` / `data.index`.
//! - Every other type is parametric (`SphereGeometry { radius, ... }`) and is
//!   built by a constructor looked up in a [`GeometryRegistry`].
//!
//! An unrecognized type is not an error: the registry returns an empty
//! placeholder flagged with [`Geometry::placeholder`] so the name still
//! resolves for later `add_mesh` messages.
//!
//! ## Normal Handling
//!
//! Buffer geometries use provided normals when available. Normals are generated
//! only when missing, using area-weighted averaging of adjacent face normals.

use std::collections::HashMap;
use std::f32::consts::{PI, TAU};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::DispatchError;

/// Axis-aligned bounding box for a geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingBox {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl BoundingBox {
    /// Compute bounding box from a set of positions.
    pub fn from_positions(positions: &[[f32; 3]]) -> Self {
        if positions.is_empty() {
            return Self::default();
        }

        let mut min = [f32::MAX; 3];
        let mut max = [f32::MIN; 3];

        for p in positions {
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }

        Self { min, max }
    }

    /// Get the dimensions of the bounding box.
    pub fn size(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Raw vertex streams produced by a constructor or the buffer parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl MeshData {
    fn push_vertex(&mut self, position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> u32 {
        self.positions.push(position);
        self.normals.push(normal);
        self.uvs.push(uv);
        (self.positions.len() - 1) as u32
    }
}

/// A parsed geometry, registered by name.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub name: String,
    pub uuid: Option<String>,
    /// three.js class name from the payload.
    pub geometry_type: String,
    /// Constructor arguments as received (empty for buffer geometries).
    pub parameters: Map<String, Value>,
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    /// Triangle list; empty means non-indexed.
    pub indices: Vec<u32>,
    pub bounds: BoundingBox,
    /// True when the type was not recognized and nothing was built.
    pub placeholder: bool,
}

impl Geometry {
    pub fn new(name: impl Into<String>, geometry_type: impl Into<String>, data: MeshData) -> Self {
        let bounds = BoundingBox::from_positions(&data.positions);
        Self {
            name: name.into(),
            uuid: None,
            geometry_type: geometry_type.into(),
            parameters: Map::new(),
            positions: data.positions,
            normals: data.normals,
            uvs: data.uvs,
            indices: data.indices,
            bounds,
            placeholder: false,
        }
    }

    /// Empty stand-in for an unsupported type.
    pub fn placeholder(name: impl Into<String>, geometry_type: impl Into<String>) -> Self {
        let mut geometry = Self::new(name, geometry_type, MeshData::default());
        geometry.placeholder = true;
        geometry
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Get the number of triangles in the geometry.
    pub fn triangle_count(&self) -> usize {
        if self.indices.is_empty() {
            self.positions.len() / 3
        } else {
            self.indices.len() / 3
        }
    }
}

/// Whether a type name routes to the buffer parser.
pub fn is_buffer_type(geometry_type: &str) -> bool {
    matches!(geometry_type, "BufferGeometry" | "InstancedBufferGeometry")
}

/// Upper bound for any segment count of a parametric geometry.
pub const MAX_SEGMENTS: u32 = 512;

/// Builds vertex data from a parametric payload.
pub type GeometryConstructor = fn(&Params) -> Result<MeshData, String>;

/// Typed access to constructor arguments with three.js defaults.
pub struct Params<'a>(&'a Map<String, Value>);

impl<'a> Params<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn f32(&self, key: &str, default: f32) -> Result<f32, String> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| format!("parameter '{}' must be a number", key)),
        }
    }

    /// Segment counts: floored, then clamped to `min`. Counts above
    /// [`MAX_SEGMENTS`] are rejected.
    pub fn segments(&self, key: &str, default: u32, min: u32) -> Result<u32, String> {
        let value = self.f32(key, default as f32)?;
        if !value.is_finite() || value < 0.0 {
            return Err(format!("parameter '{}' must be a non-negative count", key));
        }
        if value > MAX_SEGMENTS as f32 {
            return Err(format!("parameter '{}' exceeds the limit of {} segments", key, MAX_SEGMENTS));
        }
        Ok((value.floor() as u32).max(min))
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| format!("parameter '{}' must be a boolean", key)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeometryHeader {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    geometry_type: String,
    #[serde(default)]
    uuid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BufferData {
    #[serde(default)]
    attributes: HashMap<String, AttributeJson>,
    #[serde(default)]
    index: Option<IndexJson>,
}

#[derive(Debug, Deserialize)]
struct AttributeJson {
    #[serde(rename = "itemSize")]
    item_size: usize,
    array: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct IndexJson {
    array: Vec<u32>,
}

/// Type-name → constructor table. Starts with the built-in three.js shapes.
pub struct GeometryRegistry {
    constructors: HashMap<&'static str, GeometryConstructor>,
}

impl Default for GeometryRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("BoxGeometry", build_box);
        registry.register("CircleGeometry", build_circle);
        registry.register("ConeGeometry", build_cone);
        registry.register("CylinderGeometry", build_cylinder);
        registry.register("PlaneGeometry", build_plane);
        registry.register("SphereGeometry", build_sphere);
        registry
    }
}

impl GeometryRegistry {
    /// Registry with no constructors (every parametric type becomes a placeholder).
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, type_name: &'static str, constructor: GeometryConstructor) {
        self.constructors.insert(type_name, constructor);
    }

    /// Parse a geometry payload. `fallback_name` is used when the payload has
    /// no `name` of its own.
    pub fn parse(&self, value: &Value, fallback_name: Option<&str>) -> Result<Geometry, DispatchError> {
        let object = value
            .as_object()
            .ok_or_else(|| DispatchError::malformed("add_geometry", "payload must be an object"))?;
        let header: GeometryHeader = serde_json::from_value(value.clone())
            .map_err(|e| DispatchError::malformed("add_geometry", e))?;
        let name = header
            .name
            .or_else(|| fallback_name.map(str::to_string))
            .ok_or_else(|| DispatchError::malformed("add_geometry", "missing field `name`"))?;

        let mut parameters = object.clone();
        for key in ["name", "type", "uuid", "data"] {
            parameters.remove(key);
        }

        let mut geometry = if is_buffer_type(&header.geometry_type) {
            let data = parse_buffer_data(object.get("data"))
                .map_err(|e| DispatchError::malformed("add_geometry", e))?;
            Geometry::new(name, header.geometry_type, data)
        } else if let Some(constructor) = self.constructors.get(header.geometry_type.as_str()) {
            let data = constructor(&Params::new(&parameters))
                .map_err(|e| DispatchError::malformed("add_geometry", e))?;
            Geometry::new(name, header.geometry_type, data)
        } else {
            log::warn!(
                "Unsupported geometry type '{}' for '{}', registering an empty placeholder",
                header.geometry_type,
                name
            );
            Geometry::placeholder(name, header.geometry_type)
        };

        geometry.uuid = header.uuid;
        geometry.parameters = parameters;
        Ok(geometry)
    }
}

fn parse_buffer_data(data: Option<&Value>) -> Result<MeshData, String> {
    let data: BufferData = match data {
        None | Some(Value::Null) => return Ok(MeshData::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| e.to_string())?,
    };

    let positions = match data.attributes.get("position") {
        Some(attr) => chunk3(attr, "position")?,
        None => Vec::new(),
    };
    let vertex_count = positions.len();

    let indices = data.index.map(|i| i.array).unwrap_or_default();
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(format!("index {} out of range for {} vertices", bad, vertex_count));
    }

    let normals = match data.attributes.get("normal") {
        Some(attr) => {
            let normals = chunk3(attr, "normal")?;
            if normals.len() != vertex_count {
                return Err("normal count does not match position count".to_string());
            }
            normals
        }
        None if vertex_count > 0 => {
            let implied: Vec<u32>;
            let triangles = if indices.is_empty() {
                implied = (0..vertex_count as u32).collect();
                &implied
            } else {
                &indices
            };
            compute_vertex_normals(&positions, triangles)
        }
        None => Vec::new(),
    };

    let uvs = match data.attributes.get("uv") {
        Some(attr) => {
            if attr.item_size != 2 || attr.array.len() % 2 != 0 {
                return Err("attribute 'uv' must have itemSize 2".to_string());
            }
            let uvs: Vec<[f32; 2]> = attr.array.chunks(2).map(|c| [c[0], c[1]]).collect();
            if uvs.len() != vertex_count {
                return Err("uv count does not match position count".to_string());
            }
            uvs
        }
        None => Vec::new(),
    };

    Ok(MeshData {
        positions,
        normals,
        uvs,
        indices,
    })
}

fn chunk3(attr: &AttributeJson, name: &str) -> Result<Vec<[f32; 3]>, String> {
    if attr.item_size != 3 || attr.array.len() % 3 != 0 {
        return Err(format!("attribute '{}' must have itemSize 3", name));
    }
    Ok(attr.array.chunks(3).map(|c| [c[0], c[1], c[2]]).collect())
}

/// Compute area-weighted vertex normals from face normals.
///
/// For each vertex, accumulates the (unnormalized) face normal of each adjacent triangle.
/// The resulting normal is normalized. This gives area-weighted averaging since
/// larger triangles contribute proportionally more to the normal.
pub fn compute_vertex_normals(positions: &[[f32; 3]], indices: &[u32]) -> Vec<[f32; 3]> {
    let mut normals = vec![glam::Vec3::ZERO; positions.len()];

    for tri in indices.chunks(3) {
        if tri.len() != 3 {
            continue;
        }

        let (i0, i1, i2) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
        if i0 >= positions.len() || i1 >= positions.len() || i2 >= positions.len() {
            continue;
        }

        let p0 = glam::Vec3::from_array(positions[i0]);
        let p1 = glam::Vec3::from_array(positions[i1]);
        let p2 = glam::Vec3::from_array(positions[i2]);

        // Magnitude is twice the triangle area
        let face_normal = (p1 - p0).cross(p2 - p0);
        for idx in [i0, i1, i2] {
            normals[idx] += face_normal;
        }
    }

    normals
        .into_iter()
        .map(|n| {
            if n.length() > 1e-6 {
                n.normalize().to_array()
            } else {
                // Degenerate normal, use Y-up as fallback
                [0.0, 1.0, 0.0]
            }
        })
        .collect()
}

fn normalized_or_up(v: glam::Vec3) -> [f32; 3] {
    v.try_normalize().unwrap_or(glam::Vec3::Y).to_array()
}

/// Push the two triangles of every cell of a `(cols+1) x (rows+1)` vertex grid
/// starting at `offset`.
fn push_grid_indices(indices: &mut Vec<u32>, offset: u32, cols: u32, rows: u32) {
    let stride = cols + 1;
    for iy in 0..rows {
        for ix in 0..cols {
            let a = offset + ix + stride * iy;
            let b = offset + ix + stride * (iy + 1);
            let c = offset + ix + 1 + stride * (iy + 1);
            let d = offset + ix + 1 + stride * iy;
            indices.extend_from_slice(&[a, b, d, b, c, d]);
        }
    }
}

fn build_plane(params: &Params) -> Result<MeshData, String> {
    let width = params.f32("width", 1.0)?;
    let height = params.f32("height", 1.0)?;
    let grid_x = params.segments("widthSegments", 1, 1)?;
    let grid_y = params.segments("heightSegments", 1, 1)?;

    let segment_width = width / grid_x as f32;
    let segment_height = height / grid_y as f32;

    let mut data = MeshData::default();
    for iy in 0..=grid_y {
        let y = iy as f32 * segment_height - height / 2.0;
        for ix in 0..=grid_x {
            let x = ix as f32 * segment_width - width / 2.0;
            data.push_vertex(
                [x, -y, 0.0],
                [0.0, 0.0, 1.0],
                [ix as f32 / grid_x as f32, 1.0 - iy as f32 / grid_y as f32],
            );
        }
    }
    push_grid_indices(&mut data.indices, 0, grid_x, grid_y);
    Ok(data)
}

fn build_box(params: &Params) -> Result<MeshData, String> {
    let width = params.f32("width", 1.0)?;
    let height = params.f32("height", 1.0)?;
    let depth = params.f32("depth", 1.0)?;
    let ws = params.segments("widthSegments", 1, 1)?;
    let hs = params.segments("heightSegments", 1, 1)?;
    let ds = params.segments("depthSegments", 1, 1)?;

    let mut data = MeshData::default();
    // (u, v, w, udir, vdir, width, height, depth, gridX, gridY) per face: +x -x +y -y +z -z
    let faces: [(usize, usize, usize, f32, f32, f32, f32, f32, u32, u32); 6] = [
        (2, 1, 0, -1.0, -1.0, depth, height, width, ds, hs),
        (2, 1, 0, 1.0, -1.0, depth, height, -width, ds, hs),
        (0, 2, 1, 1.0, 1.0, width, depth, height, ws, ds),
        (0, 2, 1, 1.0, -1.0, width, depth, -height, ws, ds),
        (0, 1, 2, 1.0, -1.0, width, height, depth, ws, hs),
        (0, 1, 2, -1.0, -1.0, width, height, -depth, ws, hs),
    ];

    for (u, v, w, udir, vdir, face_w, face_h, face_d, grid_x, grid_y) in faces {
        let offset = data.positions.len() as u32;
        let segment_width = face_w / grid_x as f32;
        let segment_height = face_h / grid_y as f32;
        for iy in 0..=grid_y {
            let y = iy as f32 * segment_height - face_h / 2.0;
            for ix in 0..=grid_x {
                let x = ix as f32 * segment_width - face_w / 2.0;
                let mut position = [0.0f32; 3];
                position[u] = x * udir;
                position[v] = y * vdir;
                position[w] = face_d / 2.0;
                let mut normal = [0.0f32; 3];
                normal[w] = if face_d > 0.0 { 1.0 } else { -1.0 };
                data.push_vertex(
                    position,
                    normal,
                    [ix as f32 / grid_x as f32, 1.0 - iy as f32 / grid_y as f32],
                );
            }
        }
        push_grid_indices(&mut data.indices, offset, grid_x, grid_y);
    }
    Ok(data)
}

fn build_circle(params: &Params) -> Result<MeshData, String> {
    let radius = params.f32("radius", 1.0)?;
    let segments = params.segments("segments", 32, 3)?;
    let theta_start = params.f32("thetaStart", 0.0)?;
    let theta_length = params.f32("thetaLength", TAU)?;

    let mut data = MeshData::default();
    data.push_vertex([0.0; 3], [0.0, 0.0, 1.0], [0.5, 0.5]);
    for s in 0..=segments {
        let segment = theta_start + s as f32 / segments as f32 * theta_length;
        let (sin, cos) = segment.sin_cos();
        data.push_vertex(
            [radius * cos, radius * sin, 0.0],
            [0.0, 0.0, 1.0],
            [(cos + 1.0) / 2.0, (sin + 1.0) / 2.0],
        );
    }
    for i in 1..=segments {
        data.indices.extend_from_slice(&[i, i + 1, 0]);
    }
    Ok(data)
}

fn build_sphere(params: &Params) -> Result<MeshData, String> {
    let radius = params.f32("radius", 1.0)?;
    let width_segments = params.segments("widthSegments", 32, 3)?;
    let height_segments = params.segments("heightSegments", 16, 2)?;
    let phi_start = params.f32("phiStart", 0.0)?;
    let phi_length = params.f32("phiLength", TAU)?;
    let theta_start = params.f32("thetaStart", 0.0)?;
    let theta_length = params.f32("thetaLength", PI)?;
    let theta_end = (theta_start + theta_length).min(PI);

    let mut data = MeshData::default();
    let mut grid = Vec::with_capacity(height_segments as usize + 1);

    for iy in 0..=height_segments {
        let v = iy as f32 / height_segments as f32;
        // Pole rows shift their uv so the triangle fan samples the cell center
        let u_offset = if iy == 0 && theta_start == 0.0 {
            0.5 / width_segments as f32
        } else if iy == height_segments && theta_end == PI {
            -0.5 / width_segments as f32
        } else {
            0.0
        };

        let mut row = Vec::with_capacity(width_segments as usize + 1);
        for ix in 0..=width_segments {
            let u = ix as f32 / width_segments as f32;
            let phi = phi_start + u * phi_length;
            let theta = theta_start + v * theta_length;
            let position = glam::Vec3::new(
                -radius * phi.cos() * theta.sin(),
                radius * theta.cos(),
                radius * phi.sin() * theta.sin(),
            );
            row.push(data.push_vertex(
                position.to_array(),
                normalized_or_up(position),
                [u + u_offset, 1.0 - v],
            ));
        }
        grid.push(row);
    }

    for iy in 0..height_segments as usize {
        for ix in 0..width_segments as usize {
            let a = grid[iy][ix + 1];
            let b = grid[iy][ix];
            let c = grid[iy + 1][ix];
            let d = grid[iy + 1][ix + 1];
            if iy != 0 || theta_start > 0.0 {
                data.indices.extend_from_slice(&[a, b, d]);
            }
            if iy != height_segments as usize - 1 || theta_end < PI {
                data.indices.extend_from_slice(&[b, c, d]);
            }
        }
    }
    Ok(data)
}

fn build_cylinder(params: &Params) -> Result<MeshData, String> {
    let radius_top = params.f32("radiusTop", 1.0)?;
    let radius_bottom = params.f32("radiusBottom", 1.0)?;
    cylinder(params, radius_top, radius_bottom)
}

fn build_cone(params: &Params) -> Result<MeshData, String> {
    let radius = params.f32("radius", 1.0)?;
    cylinder(params, 0.0, radius)
}

fn cylinder(params: &Params, radius_top: f32, radius_bottom: f32) -> Result<MeshData, String> {
    let height = params.f32("height", 1.0)?;
    let radial_segments = params.segments("radialSegments", 32, 1)?;
    let height_segments = params.segments("heightSegments", 1, 1)?;
    let open_ended = params.bool("openEnded", false)?;
    let theta_start = params.f32("thetaStart", 0.0)?;
    let theta_length = params.f32("thetaLength", TAU)?;

    let half_height = height / 2.0;
    let slope = if height != 0.0 {
        (radius_bottom - radius_top) / height
    } else {
        0.0
    };

    let mut data = MeshData::default();
    let mut grid = Vec::with_capacity(height_segments as usize + 1);

    for y in 0..=height_segments {
        let v = y as f32 / height_segments as f32;
        let radius = v * (radius_bottom - radius_top) + radius_top;
        let mut row = Vec::with_capacity(radial_segments as usize + 1);
        for x in 0..=radial_segments {
            let u = x as f32 / radial_segments as f32;
            let (sin, cos) = (u * theta_length + theta_start).sin_cos();
            row.push(data.push_vertex(
                [radius * sin, -v * height + half_height, radius * cos],
                normalized_or_up(glam::Vec3::new(sin, slope, cos)),
                [u, 1.0 - v],
            ));
        }
        grid.push(row);
    }

    for x in 0..radial_segments as usize {
        for y in 0..height_segments as usize {
            let a = grid[y][x];
            let b = grid[y + 1][x];
            let c = grid[y + 1][x + 1];
            let d = grid[y][x + 1];
            if radius_top > 0.0 || y != 0 {
                data.indices.extend_from_slice(&[a, b, d]);
            }
            if radius_bottom > 0.0 || y != height_segments as usize - 1 {
                data.indices.extend_from_slice(&[b, c, d]);
            }
        }
    }

    if !open_ended {
        let caps = [(true, radius_top), (false, radius_bottom)];
        for (top, radius) in caps {
            if radius <= 0.0 {
                continue;
            }
            let sign = if top { 1.0 } else { -1.0 };
            let center_start = data.positions.len() as u32;
            for _ in 1..=radial_segments {
                data.push_vertex([0.0, half_height * sign, 0.0], [0.0, sign, 0.0], [0.5, 0.5]);
            }
            let center_end = data.positions.len() as u32;
            for x in 0..=radial_segments {
                let u = x as f32 / radial_segments as f32;
                let (sin, cos) = (u * theta_length + theta_start).sin_cos();
                data.push_vertex(
                    [radius * sin, half_height * sign, radius * cos],
                    [0.0, sign, 0.0],
                    [cos * 0.5 + 0.5, sin * 0.5 * sign + 0.5],
                );
            }
            for x in 0..radial_segments {
                let c = center_start + x;
                let i = center_end + x;
                if top {
                    data.indices.extend_from_slice(&[i, i + 1, c]);
                } else {
                    data.indices.extend_from_slice(&[i + 1, i, c]);
                }
            }
        }
    }

    Ok(data)
}
