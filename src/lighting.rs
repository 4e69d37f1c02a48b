//! Light nodes.
//!
//! Lights are only created by the default scene setup; the protocol can
//! recolor them through `set_props` and move them like any other node.

use crate::material::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Ambient,
    Directional,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Color,
    pub intensity: f32,
}

impl Light {
    pub fn new(kind: LightKind, color: Color, intensity: f32) -> Self {
        Self { kind, color, intensity }
    }

    pub fn ambient(intensity: f32) -> Self {
        Self::new(LightKind::Ambient, Color::WHITE, intensity)
    }

    pub fn directional(intensity: f32) -> Self {
        Self::new(LightKind::Directional, Color::WHITE, intensity)
    }
}
