//! Synthetic scenes for tests, benches and the `synth` command
//!
//! Depth maps are ray-cast against a planar wall at `z = 0` facing +Z, so
//! frames from different viewpoints observe the same surface.
//!
//! ```
//! use splatmap::synthetic::*;
//! use splatmap::Projection;
//!
//! let projection = Projection::from_fov(1.0, 4.0 / 3.0);
//! let views = orbit_views(8, 1.5, 0.6);
//! let depth = render_wall_depth(&views[0], &projection, 64, 48);
//! assert_eq!(depth.len(), 64 * 48);
//! ```

use glam::{Mat4, Vec3};

use crate::core::camera::{pixel_to_ndc, Projection};

/// RGB gradient image, 3 bytes per pixel
pub fn create_synthetic_color(width: usize, height: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            rgb.push((x * 255 / width.max(1)) as u8);
            rgb.push((y * 255 / height.max(1)) as u8);
            rgb.push(128);
        }
    }
    rgb
}

/// Views on an arc in front of the wall, all looking at the origin.
///
/// `arc` is the total sweep in radians; cameras sit `radius` meters away.
pub fn orbit_views(count: usize, radius: f32, arc: f32) -> Vec<Mat4> {
    (0..count)
        .map(|i| {
            let t = if count > 1 { i as f32 / (count - 1) as f32 } else { 0.5 };
            let angle = (t - 0.5) * arc;
            let eye = Vec3::new(radius * angle.sin(), 0.1, radius * angle.cos());
            Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y)
        })
        .collect()
}

/// Depth map of the `z = 0` wall seen from `view`. Pixels missing the wall read 0.
pub fn render_wall_depth(view: &Mat4, projection: &Projection, width: usize, height: usize) -> Vec<f32> {
    let camera_to_world = view.inverse();
    let origin = camera_to_world.transform_point3(Vec3::ZERO);
    let mut depth = vec![0.0f32; width * height];

    for y in 0..height {
        for x in 0..width {
            let (ndc_x, ndc_y) = pixel_to_ndc(x, y, width, height);
            // Camera-space ray at unit depth, so the hit parameter is the depth
            let ray = projection.unproject(ndc_x, ndc_y, 1.0);
            let dir = camera_to_world.transform_vector3(ray);
            if dir.z.abs() < f32::EPSILON {
                continue;
            }
            let t = -origin.z / dir.z;
            if t > 0.0 {
                depth[y * width + x] = t;
            }
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_gradient() {
        let rgb = create_synthetic_color(8, 4);
        assert_eq!(rgb.len(), 8 * 4 * 3);
        assert_eq!(&rgb[..3], &[0, 0, 128]);
        // Last pixel of the first row
        assert_eq!(&rgb[7 * 3..8 * 3], &[223, 0, 128]);
    }

    #[test]
    fn test_wall_depth_head_on() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
        let depth = render_wall_depth(&view, &Projection::from_fov(1.0, 1.0), 16, 16);
        assert!(depth.iter().all(|d| (d - 2.0).abs() < 1e-4));
    }

    #[test]
    fn test_orbit_views_face_origin() {
        let views = orbit_views(5, 1.5, 1.0);
        assert_eq!(views.len(), 5);
        for view in &views {
            let origin_in_camera = view.transform_point3(Vec3::ZERO);
            assert!(origin_in_camera.z < 0.0);
            assert!(origin_in_camera.x.abs() < 1e-4);
        }
    }
}
