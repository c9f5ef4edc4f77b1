//! Built-in primitive meshes, addressable by `#Name` paths.

use std::f32::consts::PI;

use super::mesh::MeshData;

pub const CUBE: &str = "#Cube";
pub const RECTANGLE: &str = "#Rectangle";
pub const SPHERE: &str = "#Sphere";

/// Returns the primitive for a `#Name` path.
#[must_use]
pub fn builtin_mesh(path: &str) -> Option<MeshData> {
    match path {
        CUBE => Some(create_cube(1.0)),
        RECTANGLE => Some(create_rectangle(1.0, 1.0)),
        SPHERE => Some(create_sphere(0.5, 32, 16)),
        _ => None,
    }
}

#[must_use]
pub fn is_builtin(path: &str) -> bool {
    path.starts_with('#')
}

/// Axis-aligned cube centred on the origin, four vertices per face.
#[must_use]
pub fn create_cube(size: f32) -> MeshData {
    let s = size / 2.0;

    // (normal, tangent-u, tangent-v) per face; corners are n + (±u) + (±v).
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
    ];
    let corners = [(-1.0, -1.0, [0.0, 1.0]), (1.0, -1.0, [1.0, 1.0]), (1.0, 1.0, [1.0, 0.0]), (-1.0, 1.0, [0.0, 0.0])];

    let mut mesh = MeshData::default();
    for (n, u, v) in faces {
        for (cu, cv, uv) in corners {
            mesh.positions.push([
                (n[0] + cu * u[0] + cv * v[0]) * s,
                (n[1] + cu * u[1] + cv * v[1]) * s,
                (n[2] + cu * u[2] + cv * v[2]) * s,
            ]);
            mesh.normals.push(n);
            mesh.uv0.push(uv);
        }
    }
    // CCW: 0,1,2  0,2,3
    mesh.indices = (0..6u32)
        .flat_map(|face| {
            let base = face * 4;
            [base, base + 1, base + 2, base, base + 2, base + 3]
        })
        .collect();
    mesh
}

/// Unit quad in the XY plane facing +Z.
#[must_use]
pub fn create_rectangle(width: f32, height: f32) -> MeshData {
    let (w, h) = (width / 2.0, height / 2.0);
    MeshData {
        positions: vec![[-w, -h, 0.0], [w, -h, 0.0], [w, h, 0.0], [-w, h, 0.0]],
        normals: vec![[0.0, 0.0, 1.0]; 4],
        uv0: vec![[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]],
        indices: vec![0, 1, 2, 0, 2, 3],
        ..Default::default()
    }
}

/// UV sphere. Pole rows produce degenerate triangles, which the GPU drops.
#[must_use]
pub fn create_sphere(radius: f32, width_segments: u32, height_segments: u32) -> MeshData {
    let width_segments = width_segments.max(3);
    let height_segments = height_segments.max(2);

    let mut mesh = MeshData::default();
    for y in 0..=height_segments {
        let v = y as f32 / height_segments as f32;
        let theta = v * PI;
        let py = -radius * theta.cos();
        let ring = radius * theta.sin();

        for x in 0..=width_segments {
            let u = x as f32 / width_segments as f32;
            let phi = u * 2.0 * PI;
            let p = [-ring * phi.cos(), py, ring * phi.sin()];
            mesh.positions.push(p);
            mesh.normals.push([p[0] / radius, p[1] / radius, p[2] / radius]);
            mesh.uv0.push([u, 1.0 - v]);
        }
    }

    let stride = width_segments + 1;
    for y in 0..height_segments {
        for x in 0..width_segments {
            let v0 = y * stride + x;
            let v1 = v0 + 1;
            let v2 = v0 + stride;
            let v3 = v2 + 1;
            mesh.indices.extend_from_slice(&[v0, v1, v2, v1, v3, v2]);
        }
    }
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cube_shape() {
        let cube = create_cube(1.0);
        assert_eq!(cube.positions.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.validate(CUBE).is_ok());
        let bounds = cube.bounds();
        assert_eq!(bounds.max.to_array(), [0.5, 0.5, 0.5]);
        assert_eq!(bounds.min.to_array(), [-0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_builtin_lookup() {
        assert!(builtin_mesh(RECTANGLE).is_some());
        assert!(builtin_mesh("#Teapot").is_none());
        let sphere = builtin_mesh(SPHERE).unwrap();
        assert_eq!(sphere.positions.len(), 33 * 17);
        assert!(sphere.validate(SPHERE).is_ok());
    }
}
