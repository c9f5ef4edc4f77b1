use glam::{Affine3A, EulerRot, Mat3, Mat4, Quat, Vec3};

/// Local TRS state of a node plus the cached global matrix.
///
/// The local matrix scales and rotates about `pivot`, then translates by
/// `position`. The global matrix is written only by the hierarchy pass
/// ([`update_globals`](crate::scene::hierarchy::update_globals)); reading it
/// while the owning node is `TRANSFORM_DIRTY` returns last frame's value.
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub pivot: Vec3,

    pub(crate) world_matrix: Affine3A,
}

impl Transform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            pivot: Vec3::ZERO,
            world_matrix: Affine3A::IDENTITY,
        }
    }

    #[must_use]
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::new()
        }
    }

    /// Local matrix built from the current TRS and pivot.
    #[must_use]
    pub fn local_matrix(&self) -> Affine3A {
        let trs = Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position);
        if self.pivot == Vec3::ZERO {
            trs
        } else {
            trs * Affine3A::from_translation(-self.pivot)
        }
    }

    pub fn set_rotation_euler(&mut self, x: f32, y: f32, z: f32) {
        self.rotation = Quat::from_euler(EulerRot::XYZ, x, y, z);
    }

    #[must_use]
    pub fn rotation_euler(&self) -> Vec3 {
        let (x, y, z) = self.rotation.to_euler(EulerRot::XYZ);
        Vec3::new(x, y, z)
    }

    /// Decomposes `mat` into position/rotation/scale. Shear is lost.
    pub fn apply_local_matrix(&mut self, mat: Affine3A) {
        let (scale, rotation, translation) = mat.to_scale_rotation_translation();
        self.scale = scale;
        self.rotation = rotation;
        self.position = translation;
        self.pivot = Vec3::ZERO;
    }

    /// Orients the local -Z axis towards `target`, both in parent space.
    /// Leaves the rotation untouched when `target` is collinear with `up`.
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize_or_zero();
        if forward == Vec3::ZERO || forward.cross(up).length_squared() < 1e-4 {
            return;
        }
        let right = forward.cross(up).normalize();
        let new_up = right.cross(forward).normalize();
        self.rotation = Quat::from_mat3(&Mat3::from_cols(right, new_up, -forward));
    }

    #[inline]
    #[must_use]
    pub fn world_matrix(&self) -> &Affine3A {
        &self.world_matrix
    }

    #[inline]
    #[must_use]
    pub fn world_matrix_as_mat4(&self) -> Mat4 {
        Mat4::from(self.world_matrix)
    }

    #[inline]
    #[must_use]
    pub fn world_position(&self) -> Vec3 {
        self.world_matrix.translation.into()
    }

    /// World-space forward (-Z) direction, not normalized.
    #[inline]
    #[must_use]
    pub fn world_forward(&self) -> Vec3 {
        self.world_matrix.transform_vector3(Vec3::NEG_Z)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pivot_rotates_about_point() {
        let mut t = Transform::new();
        t.pivot = Vec3::new(1.0, 0.0, 0.0);
        t.rotation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let p = t.local_matrix().transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!(p.length() < 1e-5);
    }

    #[test]
    fn test_look_at_degenerate_is_noop() {
        let mut t = Transform::new();
        t.look_at(Vec3::new(0.0, 5.0, 0.0), Vec3::Y);
        assert_eq!(t.rotation, Quat::IDENTITY);
    }
}
