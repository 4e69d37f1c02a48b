pub mod error;
pub mod config;
pub mod protocol;
pub mod scene_graph;
pub mod dispatcher;
pub mod connection;
pub mod loader;
pub mod gltf_import;

// Scene object payloads
pub mod geometry;
pub mod material;
pub mod camera;
pub mod lighting;
pub mod animation;

#[cfg(not(target_arch = "wasm32"))]
pub mod native;

#[cfg(not(target_arch = "wasm32"))]
pub mod cli;

#[cfg(target_arch = "wasm32")]
pub mod wasm;
