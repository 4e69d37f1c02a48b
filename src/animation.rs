//! Keyframe animation clips and the single-action mixer.
//!
//! Clips arrive as three.js `AnimationClip.toJSON()` payloads. A track name is
//! `<node>.<property>` (or just `<property>` for the root itself); binding
//! resolves the node by name inside the root's subtree when the clip is
//! loaded onto a root.
//!
//! Only one action plays at a time. Loading a new clip stops the current
//! action and drops its cached bindings before the new one becomes active.

use std::sync::OnceLock;

use glam::{Quat, Vec3, Vec4};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::DispatchError;
use crate::scene_graph::ObjectId;

/// three.js `NormalAnimationBlendMode`.
pub const NORMAL_BLEND_MODE: i64 = 2500;

/// Keyframe interpolation, with the three.js numeric codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Discrete,
    Linear,
    /// Sampled linearly; cubic smoothing is not modelled.
    Smooth,
}

impl Interpolation {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2300 => Some(Interpolation::Discrete),
            2301 => Some(Interpolation::Linear),
            2302 => Some(Interpolation::Smooth),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackValueType {
    Number,
    Vector,
    Quaternion,
    Bool,
    Color,
}

impl TrackValueType {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "number" => Some(TrackValueType::Number),
            "vector" => Some(TrackValueType::Vector),
            "quaternion" => Some(TrackValueType::Quaternion),
            "bool" => Some(TrackValueType::Bool),
            "color" => Some(TrackValueType::Color),
            _ => None,
        }
    }
}

/// Node properties a track can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackProperty {
    Position,
    Quaternion,
    Scale,
    Visible,
}

impl TrackProperty {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "position" => Some(TrackProperty::Position),
            "quaternion" => Some(TrackProperty::Quaternion),
            "scale" => Some(TrackProperty::Scale),
            "visible" => Some(TrackProperty::Visible),
            _ => None,
        }
    }

    fn value_size(&self) -> usize {
        match self {
            TrackProperty::Position | TrackProperty::Scale => 3,
            TrackProperty::Quaternion => 4,
            TrackProperty::Visible => 1,
        }
    }
}

fn track_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(?P<node>[^.\[\]]+)\.)?(?P<property>[A-Za-z_][A-Za-z0-9_]*)$")
            .expect("track name pattern is valid")
    })
}

/// Split `"satellite.position"` into `(Some("satellite"), "position")`.
pub fn parse_track_name(name: &str) -> Option<(Option<&str>, &str)> {
    let caps = track_name_regex().captures(name)?;
    let node = caps.name("node").map(|m| m.as_str());
    let property = caps.name("property")?.as_str();
    Some((node, property))
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyframeTrack {
    pub name: String,
    pub value_type: TrackValueType,
    pub times: Vec<f32>,
    pub values: Vec<f32>,
    pub interpolation: Interpolation,
}

impl KeyframeTrack {
    pub fn value_size(&self) -> usize {
        if self.times.is_empty() {
            0
        } else {
            self.values.len() / self.times.len()
        }
    }

    pub fn end_time(&self) -> f32 {
        self.times.last().copied().unwrap_or(0.0)
    }

    fn keyframe(&self, index: usize) -> &[f32] {
        let size = self.value_size();
        &self.values[index * size..(index + 1) * size]
    }

    /// Sample the track at `time`, clamping outside the keyframe range.
    pub fn sample(&self, time: f32) -> Vec<f32> {
        let last = self.times.len() - 1;
        if time <= self.times[0] {
            return self.keyframe(0).to_vec();
        }
        if time >= self.times[last] {
            return self.keyframe(last).to_vec();
        }

        // First keyframe strictly after `time`; always in 1..=last here
        let next = self.times.partition_point(|&t| t <= time);
        let prev = next - 1;

        let discrete = matches!(self.interpolation, Interpolation::Discrete)
            || matches!(self.value_type, TrackValueType::Bool);
        if discrete {
            return self.keyframe(prev).to_vec();
        }

        let span = self.times[next] - self.times[prev];
        let alpha = if span > 0.0 { (time - self.times[prev]) / span } else { 0.0 };
        let a = self.keyframe(prev);
        let b = self.keyframe(next);

        // Degenerate keyframes fall back to a component-wise lerp
        if self.value_type == TrackValueType::Quaternion {
            if let (Some(qa), Some(qb)) = (unit_quat(a), unit_quat(b)) {
                return qa.slerp(qb, alpha).to_array().to_vec();
            }
        }

        a.iter().zip(b).map(|(x, y)| x + (y - x) * alpha).collect()
    }
}

fn unit_quat(values: &[f32]) -> Option<Quat> {
    if values.len() != 4 {
        return None;
    }
    Vec4::from_slice(values).try_normalize().map(Quat::from_vec4)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnimationClip {
    pub name: String,
    pub uuid: Option<String>,
    pub duration: f32,
    pub blend_mode: i64,
    pub tracks: Vec<KeyframeTrack>,
}

#[derive(Debug, Deserialize)]
struct ClipJson {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default = "unknown_duration")]
    duration: f32,
    #[serde(default = "default_blend_mode", rename = "blendMode")]
    blend_mode: i64,
    #[serde(default)]
    tracks: Vec<TrackJson>,
}

#[derive(Debug, Deserialize)]
struct TrackJson {
    name: String,
    #[serde(rename = "type")]
    value_type: String,
    times: Vec<f32>,
    values: Vec<Value>,
    #[serde(default)]
    interpolation: Option<i64>,
}

fn unknown_duration() -> f32 {
    -1.0
}

fn default_blend_mode() -> i64 {
    NORMAL_BLEND_MODE
}

impl AnimationClip {
    /// Parse a clip payload. A negative duration is replaced by the latest
    /// keyframe time across all tracks.
    pub fn from_json(value: &Value) -> Result<Self, DispatchError> {
        let json: ClipJson =
            serde_json::from_value(value.clone()).map_err(|e| DispatchError::malformed("add_animation", e))?;

        let tracks = json
            .tracks
            .into_iter()
            .map(parse_track)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DispatchError::malformed("add_animation", e))?;

        let duration = if json.duration < 0.0 {
            tracks.iter().map(KeyframeTrack::end_time).fold(0.0, f32::max)
        } else {
            json.duration
        };

        Ok(Self {
            name: json.name,
            uuid: json.uuid,
            duration,
            blend_mode: json.blend_mode,
            tracks,
        })
    }
}

fn parse_track(json: TrackJson) -> Result<KeyframeTrack, String> {
    let value_type = TrackValueType::from_name(&json.value_type)
        .ok_or_else(|| format!("track '{}' has unsupported type '{}'", json.name, json.value_type))?;

    if json.times.is_empty() {
        return Err(format!("track '{}' has no keyframes", json.name));
    }
    if json.times.windows(2).any(|w| w[1] < w[0]) {
        return Err(format!("track '{}' times are not sorted", json.name));
    }

    let values = json
        .values
        .iter()
        .map(|v| match v {
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            other => other
                .as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| format!("track '{}' has a non-numeric value", json.name)),
        })
        .collect::<Result<Vec<f32>, String>>()?;

    if values.is_empty() || values.len() % json.times.len() != 0 {
        return Err(format!(
            "track '{}' has {} values for {} keyframes",
            json.name,
            values.len(),
            json.times.len()
        ));
    }

    let interpolation = match json.interpolation {
        Some(code) => Interpolation::from_code(code)
            .ok_or_else(|| format!("track '{}' has unknown interpolation {}", json.name, code))?,
        None if value_type == TrackValueType::Bool => Interpolation::Discrete,
        None => Interpolation::Linear,
    };

    Ok(KeyframeTrack {
        name: json.name,
        value_type,
        times: json.times,
        values,
        interpolation,
    })
}

/// A track resolved against a concrete node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackBinding {
    pub track: usize,
    pub target: ObjectId,
    pub property: TrackProperty,
}

/// A value produced by sampling one binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampledValue {
    Position(Vec3),
    Quaternion(Quat),
    Scale(Vec3),
    Visible(bool),
}

impl SampledValue {
    fn from_sample(property: TrackProperty, values: &[f32]) -> Option<Self> {
        if values.len() != property.value_size() {
            return None;
        }
        Some(match property {
            TrackProperty::Position => SampledValue::Position(Vec3::from_slice(values)),
            TrackProperty::Quaternion => SampledValue::Quaternion(Quat::from_slice(values)),
            TrackProperty::Scale => SampledValue::Scale(Vec3::from_slice(values)),
            TrackProperty::Visible => SampledValue::Visible(values[0] >= 0.5),
        })
    }
}

/// A clip playing on a root node.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationAction {
    pub clip: ObjectId,
    pub root: ObjectId,
    pub time: f32,
    pub paused: bool,
    bindings: Vec<TrackBinding>,
}

impl AnimationAction {
    pub fn bindings(&self) -> &[TrackBinding] {
        &self.bindings
    }

    /// Sample every binding at the current time.
    pub fn sample(&self, clip: &AnimationClip) -> Vec<(ObjectId, SampledValue)> {
        self.bindings
            .iter()
            .filter_map(|binding| {
                let track = clip.tracks.get(binding.track)?;
                let values = track.sample(self.time);
                SampledValue::from_sample(binding.property, &values).map(|v| (binding.target, v))
            })
            .collect()
    }
}

/// Resolves the node a track name refers to, given the root and an optional
/// node name.
pub trait BindingResolver {
    fn resolve(&self, root: ObjectId, node_name: Option<&str>) -> Option<ObjectId>;
}

/// Owns the (at most one) active action.
#[derive(Debug, Default)]
pub struct AnimationMixer {
    active: Option<AnimationAction>,
}

impl AnimationMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&AnimationAction> {
        self.active.as_ref()
    }

    /// Stop the current action and release its bindings. Returns the stopped action.
    pub fn stop(&mut self) -> Option<AnimationAction> {
        let stopped = self.active.take();
        if let Some(action) = &stopped {
            log::debug!(
                "Stopped action for clip {:?} on {:?} ({} bindings released)",
                action.clip,
                action.root,
                action.bindings.len()
            );
        }
        stopped
    }

    /// Bind `clip` onto `root` and make it the active action, replacing any
    /// previous one. Returns true if an action was replaced.
    pub fn play(
        &mut self,
        clip_id: ObjectId,
        clip: &AnimationClip,
        root: ObjectId,
        resolver: &impl BindingResolver,
    ) -> bool {
        let replaced = self.stop().is_some();

        let mut bindings = Vec::with_capacity(clip.tracks.len());
        for (index, track) in clip.tracks.iter().enumerate() {
            let Some((node_name, property_name)) = parse_track_name(&track.name) else {
                log::warn!("Track '{}' in clip '{}' has an unparseable name", track.name, clip.name);
                continue;
            };
            let Some(property) = TrackProperty::from_name(property_name) else {
                log::warn!("Track '{}' targets unsupported property '{}'", track.name, property_name);
                continue;
            };
            if track.value_size() != property.value_size() {
                log::warn!("Track '{}' value size does not match '{}'", track.name, property_name);
                continue;
            }
            match resolver.resolve(root, node_name) {
                Some(target) => bindings.push(TrackBinding {
                    track: index,
                    target,
                    property,
                }),
                None => log::warn!("No node for track '{}' under the animation root", track.name),
            }
        }

        self.active = Some(AnimationAction {
            clip: clip_id,
            root,
            time: 0.0,
            paused: false,
            bindings,
        });
        replaced
    }

    /// Advance the active action's clock, looping over `duration`.
    pub fn advance_time(&mut self, dt: f32, duration: f32) -> Option<&AnimationAction> {
        let action = self.active.as_mut()?;
        if !action.paused {
            action.time += dt;
            if duration > 0.0 {
                action.time %= duration;
            } else {
                action.time = 0.0;
            }
        }
        Some(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FlatResolver;

    impl BindingResolver for FlatResolver {
        fn resolve(&self, root: ObjectId, node_name: Option<&str>) -> Option<ObjectId> {
            match node_name {
                None => Some(root),
                Some("sat") => Some(ObjectId(7)),
                Some(_) => None,
            }
        }
    }

    fn orbit_clip() -> AnimationClip {
        AnimationClip::from_json(&json!({
            "name": "orbit",
            "duration": -1,
            "tracks": [
                {"name": "sat.position", "type": "vector", "times": [0, 2], "values": [0, 0, 0, 2, 4, 6], "interpolation": 2301},
                {"name": "sat.visible", "type": "bool", "times": [0, 1], "values": [true, false]},
                {"name": "ghost.position", "type": "vector", "times": [0], "values": [1, 1, 1]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_track_name() {
        assert_eq!(parse_track_name("sat.position"), Some((Some("sat"), "position")));
        assert_eq!(parse_track_name("quaternion"), Some((None, "quaternion")));
        assert_eq!(parse_track_name("a.b.c"), None);
    }

    #[test]
    fn test_clip_duration_from_tracks() {
        let clip = orbit_clip();
        assert_eq!(clip.duration, 2.0);
        assert_eq!(clip.blend_mode, NORMAL_BLEND_MODE);
        assert_eq!(clip.tracks[1].interpolation, Interpolation::Discrete);
    }

    #[test]
    fn test_malformed_clip() {
        let bad = json!({"name": "x", "tracks": [{"name": "p", "type": "vector", "times": [0, 1], "values": [1, 2, 3]}]});
        assert!(matches!(AnimationClip::from_json(&bad), Err(DispatchError::Malformed { .. })));

        let unsorted = json!({"name": "x", "tracks": [{"name": "p", "type": "number", "times": [1, 0], "values": [1, 2]}]});
        assert!(AnimationClip::from_json(&unsorted).is_err());
    }

    #[test]
    fn test_linear_sampling() {
        let clip = orbit_clip();
        let track = &clip.tracks[0];
        assert_eq!(track.sample(-1.0), vec![0.0, 0.0, 0.0]);
        assert_eq!(track.sample(1.0), vec![1.0, 2.0, 3.0]);
        assert_eq!(track.sample(5.0), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_discrete_sampling() {
        let clip = orbit_clip();
        let track = &clip.tracks[1];
        assert_eq!(track.sample(0.5), vec![1.0]);
        assert_eq!(track.sample(1.5), vec![0.0]);
    }

    #[test]
    fn test_quaternion_slerp() {
        let quarter_turn = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        let q = quarter_turn.to_array();
        let track = KeyframeTrack {
            name: "quaternion".into(),
            value_type: TrackValueType::Quaternion,
            times: vec![0.0, 1.0],
            values: vec![0.0, 0.0, 0.0, 1.0, q[0], q[1], q[2], q[3]],
            interpolation: Interpolation::Linear,
        };
        let mid = Quat::from_slice(&track.sample(0.5));
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(mid.abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_zero_quaternion_keyframe_stays_finite() {
        let track = KeyframeTrack {
            name: "quaternion".into(),
            value_type: TrackValueType::Quaternion,
            times: vec![0.0, 1.0],
            values: vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0],
            interpolation: Interpolation::Linear,
        };
        assert_eq!(track.sample(0.5), vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(track.sample(1.0), vec![0.0, 0.0, 0.0, 2.0]);
        assert_eq!(
            SampledValue::from_sample(TrackProperty::Quaternion, &[0.0, 0.0, 0.0, 2.0]),
            Some(SampledValue::Quaternion(Quat::from_xyzw(0.0, 0.0, 0.0, 2.0)))
        );
    }

    #[test]
    fn test_play_replaces_active_action() {
        let clip = orbit_clip();
        let mut mixer = AnimationMixer::new();

        assert!(!mixer.play(ObjectId(1), &clip, ObjectId(2), &FlatResolver));
        let action = mixer.active().unwrap();
        // ghost.position does not resolve
        assert_eq!(action.bindings().len(), 2);

        assert!(mixer.play(ObjectId(3), &clip, ObjectId(2), &FlatResolver));
        assert_eq!(mixer.active().unwrap().clip, ObjectId(3));
    }

    #[test]
    fn test_advance_loops() {
        let clip = orbit_clip();
        let mut mixer = AnimationMixer::new();
        mixer.play(ObjectId(1), &clip, ObjectId(2), &FlatResolver);

        let action = mixer.advance_time(1.0, clip.duration).unwrap();
        let samples = action.sample(&clip);
        assert!(samples.contains(&(ObjectId(7), SampledValue::Position(Vec3::new(1.0, 2.0, 3.0)))));

        let action = mixer.advance_time(1.5, clip.duration).unwrap();
        assert!((action.time - 0.5).abs() < 1e-6);
    }
}
