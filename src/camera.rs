//! Perspective camera and the camera-controls object that drives it.
//!
//! The controls keep an eye/target pair. `set_look_at` either jumps there or,
//! with a transition, eases toward it on every
//! [`SceneRegistry::advance`](crate::scene_graph::SceneRegistry::advance).

use glam::{Mat3, Mat4, Quat, Vec3};

use crate::scene_graph::ObjectId;

/// Default easing time constant for look-at transitions, in seconds.
pub const DEFAULT_SMOOTH_TIME: f32 = 0.25;

/// Distance under which a transition snaps to its goal.
const SETTLE_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveCamera {
    /// Vertical field of view in degrees.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    projection: Mat4,
}

impl PerspectiveCamera {
    pub fn new(fov: f32, aspect: f32, near: f32, far: f32) -> Self {
        let mut camera = Self {
            fov,
            aspect,
            near,
            far,
            projection: Mat4::IDENTITY,
        };
        camera.update_projection_matrix();
        camera
    }

    /// Recompute the projection after `fov`/`aspect`/`near`/`far` changed.
    pub fn update_projection_matrix(&mut self) {
        self.projection = Mat4::perspective_rh_gl(self.fov.to_radians(), self.aspect, self.near, self.far);
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.projection
    }
}

impl Default for PerspectiveCamera {
    fn default() -> Self {
        Self::new(75.0, 1.0, 1.0, 2000.0)
    }
}

/// Rotation that makes a camera at `eye` look at `target` (cameras look down -Z).
///
/// Returns `None` when eye and target coincide.
pub fn look_at_rotation(eye: Vec3, target: Vec3, up: Vec3) -> Option<Quat> {
    let z = (eye - target).try_normalize()?;
    let x = up.cross(z).try_normalize().or_else(|| {
        // Looking straight along `up`; nudge the reference axis
        Vec3::Z.cross(z).try_normalize()
    })?;
    let y = z.cross(x);
    Some(Quat::from_mat3(&Mat3::from_cols(x, y, z)))
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LookAtGoal {
    eye: Vec3,
    target: Vec3,
}

/// Orbit-style controls bound to one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraControls {
    pub camera: ObjectId,
    pub eye: Vec3,
    pub target: Vec3,
    pub smooth_time: f32,
    goal: Option<LookAtGoal>,
}

impl CameraControls {
    pub fn new(camera: ObjectId, eye: Vec3, target: Vec3) -> Self {
        Self {
            camera,
            eye,
            target,
            smooth_time: DEFAULT_SMOOTH_TIME,
            goal: None,
        }
    }

    pub fn set_look_at(&mut self, eye: Vec3, target: Vec3, enable_transition: bool) {
        if enable_transition {
            self.goal = Some(LookAtGoal { eye, target });
        } else {
            self.eye = eye;
            self.target = target;
            self.goal = None;
        }
    }

    pub fn in_transition(&self) -> bool {
        self.goal.is_some()
    }

    /// Ease toward the pending goal. Returns true if eye or target moved.
    pub fn update(&mut self, dt: f32) -> bool {
        let Some(goal) = self.goal else {
            return false;
        };

        let t = if self.smooth_time > 0.0 {
            1.0 - (-dt / self.smooth_time).exp()
        } else {
            1.0
        };
        self.eye = self.eye.lerp(goal.eye, t);
        self.target = self.target.lerp(goal.target, t);

        if self.eye.distance(goal.eye) < SETTLE_EPSILON && self.target.distance(goal.target) < SETTLE_EPSILON {
            self.eye = goal.eye;
            self.target = goal.target;
            self.goal = None;
        }
        true
    }

    /// Camera orientation for the current eye/target.
    pub fn rotation(&self) -> Option<Quat> {
        look_at_rotation(self.eye, self.target, Vec3::Y)
    }
}
