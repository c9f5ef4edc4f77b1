use glam::{Affine3A, Mat4, Vec2, Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionType {
    Perspective,
    Orthographic,
}

/// Camera parameters plus the matrices derived for the current frame.
///
/// Derived values are refreshed by [`Camera::update`] during layer
/// preparation; between frames they describe the last prepared view.
#[derive(Debug, Clone)]
pub struct Camera {
    pub projection_type: ProjectionType,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub near: f32,
    pub far: f32,
    /// Half the visible height for orthographic projections.
    pub ortho_size: f32,
    /// Disables frustum culling for everything seen by this camera.
    pub frustum_culling: bool,
    /// Projected size, in pixels, below which a mesh switches to a coarser
    /// level of detail. Zero or less disables level-of-detail selection.
    pub lod_pixel_threshold: f32,

    pub(crate) aspect: f32,
    pub(crate) position: Vec3,
    pub(crate) forward: Vec3,
    pub(crate) view_matrix: Mat4,
    pub(crate) projection_matrix: Mat4,
    pub(crate) view_projection_matrix: Mat4,
    pub(crate) frustum: Frustum,
}

impl Camera {
    /// `fov_degrees` is the vertical field of view.
    #[must_use]
    pub fn new_perspective(fov_degrees: f32, near: f32, far: f32) -> Self {
        Self::with_projection(ProjectionType::Perspective, fov_degrees.to_radians(), near, far)
    }

    #[must_use]
    pub fn new_orthographic(ortho_size: f32, near: f32, far: f32) -> Self {
        let mut camera = Self::with_projection(ProjectionType::Orthographic, 0.0, near, far);
        camera.ortho_size = ortho_size;
        camera
    }

    fn with_projection(projection_type: ProjectionType, fov: f32, near: f32, far: f32) -> Self {
        Self {
            projection_type,
            fov,
            near,
            far,
            ortho_size: 10.0,
            frustum_culling: true,
            lod_pixel_threshold: 1.0,
            aspect: 1.0,
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            view_matrix: Mat4::IDENTITY,
            projection_matrix: Mat4::IDENTITY,
            view_projection_matrix: Mat4::IDENTITY,
            frustum: Frustum::default(),
        }
    }

    /// Returns `true` if the camera cannot produce valid matrices from the
    /// given world transform: a zero or non-finite look direction, or
    /// clip planes that do not bound a volume.
    #[must_use]
    pub fn is_degenerate(&self, world: &Affine3A) -> bool {
        let forward = world.transform_vector3(Vec3::NEG_Z);
        if !forward.is_finite() || forward.length_squared() < 1e-12 {
            return true;
        }
        if !world.translation.is_finite() {
            return true;
        }
        match self.projection_type {
            ProjectionType::Perspective => {
                !(self.near > 0.0 && self.far > self.near && self.fov > 0.0 && self.fov < std::f32::consts::PI)
            }
            ProjectionType::Orthographic => !(self.far > self.near && self.ortho_size > 0.0),
        }
    }

    /// Recomputes view, projection and frustum. Returns `false` and leaves
    /// the cached matrices untouched for a degenerate camera.
    pub fn update(&mut self, world: &Affine3A, aspect: f32) -> bool {
        if self.is_degenerate(world) || !(aspect.is_finite() && aspect > 0.0) {
            return false;
        }
        self.aspect = aspect;
        self.projection_matrix = match self.projection_type {
            ProjectionType::Perspective => Mat4::perspective_rh(self.fov, aspect, self.near, self.far),
            ProjectionType::Orthographic => {
                let h = self.ortho_size;
                let w = h * aspect;
                Mat4::orthographic_rh(-w, w, -h, h, self.near, self.far)
            }
        };
        self.view_matrix = Mat4::from(*world).inverse();
        self.view_projection_matrix = self.projection_matrix * self.view_matrix;
        self.frustum = Frustum::from_matrix(self.view_projection_matrix);
        self.position = world.translation.into();
        self.forward = world.transform_vector3(Vec3::NEG_Z).normalize();
        true
    }

    /// Camera-space depth of a world-space point; larger is farther.
    #[inline]
    #[must_use]
    pub fn view_depth(&self, point: Vec3) -> f32 {
        -self.view_matrix.transform_point3(point).z
    }

    /// Scale from view distance to the visible half-height at that
    /// distance. Orthographic views ignore the distance.
    #[must_use]
    pub fn lod_threshold(&self, distance: f32) -> f32 {
        match self.projection_type {
            ProjectionType::Perspective => distance * (self.fov * 0.5).tan(),
            ProjectionType::Orthographic => self.ortho_size,
        }
    }

    /// World-space ray through a point in normalized device coordinates
    /// (`-1..1`, y up) of the last prepared view.
    #[must_use]
    pub fn ray_from_ndc(&self, ndc: Vec2) -> Ray {
        let inverse = self.view_projection_matrix.inverse();
        // wgpu clip space puts the near plane at z = 0.
        let near = inverse.project_point3(ndc.extend(0.0));
        let far = inverse.project_point3(ndc.extend(1.0));
        Ray::new(near, far - near)
    }

    /// World-space ray through a pixel of a `size` viewport, origin top-left.
    #[must_use]
    pub fn ray_from_viewport(&self, pixel: Vec2, size: (u32, u32)) -> Ray {
        let (w, h) = (size.0.max(1) as f32, size.1.max(1) as f32);
        let ndc = Vec2::new(pixel.x / w * 2.0 - 1.0, 1.0 - pixel.y / h * 2.0);
        self.ray_from_ndc(ndc)
    }

    #[inline]
    #[must_use]
    pub fn view_matrix(&self) -> &Mat4 {
        &self.view_matrix
    }

    #[inline]
    #[must_use]
    pub fn projection_matrix(&self) -> &Mat4 {
        &self.projection_matrix
    }

    #[inline]
    #[must_use]
    pub fn view_projection_matrix(&self) -> &Mat4 {
        &self.view_projection_matrix
    }

    #[inline]
    #[must_use]
    pub fn frustum(&self) -> &Frustum {
        &self.frustum
    }

    #[inline]
    #[must_use]
    pub fn position(&self) -> Vec3 {
        self.position
    }

    #[inline]
    #[must_use]
    pub fn forward(&self) -> Vec3 {
        self.forward
    }

    #[inline]
    #[must_use]
    pub fn aspect(&self) -> f32 {
        self.aspect
    }
}

/// A half-line in world or local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl Ray {
    /// Normalizes `direction`; a zero direction gives a ray that hits nothing.
    #[must_use]
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction: direction.normalize_or_zero(),
        }
    }

    #[inline]
    #[must_use]
    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }

    /// The ray in another space. The direction is not renormalized, so a
    /// parameter `t` names the same point in both spaces.
    #[must_use]
    pub fn transformed(&self, m: &Affine3A) -> Self {
        Self {
            origin: m.transform_point3(self.origin),
            direction: m.transform_vector3(self.direction),
        }
    }
}

/// Six clip planes: left, right, bottom, top, near, far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Gribb-Hartmann plane extraction for a [0, 1] depth range.
    #[must_use]
    pub fn from_matrix(m: Mat4) -> Self {
        let rows = [m.row(0), m.row(1), m.row(2), m.row(3)];
        let mut planes = [
            rows[3] + rows[0],
            rows[3] - rows[0],
            rows[3] + rows[1],
            rows[3] - rows[1],
            rows[2],
            rows[3] - rows[2],
        ];
        for plane in &mut planes {
            let length = plane.truncate().length();
            if length > 0.0 {
                *plane /= length;
            }
        }
        Self { planes }
    }

    #[must_use]
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(center) + plane.w >= -radius)
    }
}
