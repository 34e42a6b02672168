//! Camera projection parameters and view-matrix helpers
//!
//! Conventions follow OpenGL: the camera looks down its negative Z axis,
//! NDC spans [-1, 1] with +Y up, matrices are column-major.

use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Determinant magnitude below which a view matrix is treated as singular
const MIN_VIEW_DETERMINANT: f32 = 1e-6;

/// Perspective projection terms in NDC units.
///
/// `focal_*` are the diagonal scale terms of a GL projection matrix
/// (`P[0][0]`, `P[1][1]`), `principal_*` the off-axis offsets (`P[2][0]`,
/// `P[2][1]`). A centered projection has zero principal offsets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub focal_x: f32,
    pub focal_y: f32,
    pub principal_x: f32,
    pub principal_y: f32,
}

impl Default for Projection {
    fn default() -> Self {
        Self {
            focal_x: 1.0,
            focal_y: 1.0,
            principal_x: 0.0,
            principal_y: 0.0,
        }
    }
}

impl Projection {
    pub fn new(focal_x: f32, focal_y: f32, principal_x: f32, principal_y: f32) -> Self {
        Self {
            focal_x,
            focal_y,
            principal_x,
            principal_y,
        }
    }

    /// Extract the terms from a column-major GL projection matrix
    pub fn from_matrix(proj: &Mat4) -> Self {
        Self {
            focal_x: proj.x_axis.x,
            focal_y: proj.y_axis.y,
            principal_x: proj.z_axis.x,
            principal_y: proj.z_axis.y,
        }
    }

    /// Convert pixel pinhole intrinsics of a `width`×`height` image
    pub fn from_pinhole(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        let w = width.max(1) as f32;
        let h = height.max(1) as f32;
        Self {
            focal_x: 2.0 * fx / w,
            focal_y: 2.0 * fy / h,
            principal_x: 1.0 - 2.0 * cx / w,
            principal_y: 2.0 * cy / h - 1.0,
        }
    }

    /// Symmetric perspective from a vertical field of view (radians)
    pub fn from_fov(fov_y: f32, aspect: f32) -> Self {
        let focal_y = 1.0 / (fov_y * 0.5).tan();
        Self {
            focal_x: focal_y / aspect,
            focal_y,
            principal_x: 0.0,
            principal_y: 0.0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.focal_x.is_finite()
            && self.focal_y.is_finite()
            && self.principal_x.is_finite()
            && self.principal_y.is_finite()
            && self.focal_x.abs() > f32::EPSILON
            && self.focal_y.abs() > f32::EPSILON
    }

    /// Camera-space point for an NDC coordinate at metric `depth`
    #[inline]
    pub fn unproject(&self, ndc_x: f32, ndc_y: f32, depth: f32) -> Vec3 {
        Vec3::new(
            (ndc_x + self.principal_x) * depth / self.focal_x,
            (ndc_y + self.principal_y) * depth / self.focal_y,
            -depth,
        )
    }

    /// GL projection matrix with the given clip planes
    pub fn to_matrix(&self, near: f32, far: f32) -> Mat4 {
        let range = near - far;
        Mat4::from_cols(
            Vec4::new(self.focal_x, 0.0, 0.0, 0.0),
            Vec4::new(0.0, self.focal_y, 0.0, 0.0),
            Vec4::new(self.principal_x, self.principal_y, (far + near) / range, -1.0),
            Vec4::new(0.0, 0.0, 2.0 * far * near / range, 0.0),
        )
    }
}

/// NDC coordinate of pixel `(x, y)` in a `width`×`height` image
#[inline]
pub fn pixel_to_ndc(x: usize, y: usize, width: usize, height: usize) -> (f32, f32) {
    let ndc_x = 2.0 * x as f32 / width as f32 - 1.0;
    let ndc_y = 1.0 - 2.0 * y as f32 / height as f32;
    (ndc_x, ndc_y)
}

/// Finite and invertible
pub fn is_valid_view(view: &Mat4) -> bool {
    view.is_finite() && view.determinant().abs() > MIN_VIEW_DETERMINANT
}

/// Distance in front of the camera along its forward axis
#[inline]
pub fn eye_depth(view: &Mat4, position: Vec3) -> f32 {
    -view.row(2).dot(position.extend(1.0))
}

/// World-space camera position of a view matrix
pub fn camera_position(view: &Mat4) -> Vec3 {
    view.inverse().w_axis.truncate()
}

/// World-space viewing direction of a view matrix
pub fn camera_forward(view: &Mat4) -> Vec3 {
    -view.row(2).truncate().normalize_or_zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_matrix_roundtrip() {
        let proj = Projection::new(1.5, 2.0, 0.1, -0.2);
        let m = proj.to_matrix(0.1, 100.0);
        assert_eq!(Projection::from_matrix(&m), proj);
    }

    #[test]
    fn test_from_perspective_rh_gl() {
        let m = Mat4::perspective_rh_gl(1.0, 4.0 / 3.0, 0.1, 50.0);
        let proj = Projection::from_matrix(&m);
        let fov = Projection::from_fov(1.0, 4.0 / 3.0);
        assert!((proj.focal_x - fov.focal_x).abs() < 1e-5);
        assert!((proj.focal_y - fov.focal_y).abs() < 1e-5);
        assert_eq!(proj.principal_x, 0.0);
    }

    #[test]
    fn test_pinhole_matches_pixel_model() {
        let (fx, fy, cx, cy, w, h) = (500.0, 480.0, 330.0, 250.0, 640, 480);
        let proj = Projection::from_pinhole(fx, fy, cx, cy, w, h);

        let (px, py, depth) = (100usize, 400usize, 2.0);
        let (ndc_x, ndc_y) = pixel_to_ndc(px, py, w as usize, h as usize);
        let p = proj.unproject(ndc_x, ndc_y, depth);

        let expected_x = (px as f32 - cx) * depth / fx;
        let expected_y = -(py as f32 - cy) * depth / fy;
        assert!((p.x - expected_x).abs() < 1e-4);
        assert!((p.y - expected_y).abs() < 1e-4);
        assert_eq!(p.z, -depth);
    }

    #[test]
    fn test_unproject_centered() {
        let proj = Projection::default();
        let p = proj.unproject(0.5, -0.25, 2.0);
        assert_eq!(p, Vec3::new(1.0, -0.5, -2.0));
    }

    #[test]
    fn test_eye_depth_positive_in_front() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!((eye_depth(&view, Vec3::ZERO) - 5.0).abs() < 1e-5);
        assert!(eye_depth(&view, Vec3::new(0.0, 0.0, 10.0)) < 0.0);
    }

    #[test]
    fn test_camera_pose_helpers() {
        let eye = Vec3::new(1.0, 2.0, 3.0);
        let view = Mat4::look_at_rh(eye, Vec3::new(1.0, 2.0, 0.0), Vec3::Y);
        assert!(camera_position(&view).distance(eye) < 1e-5);
        assert!(camera_forward(&view).distance(Vec3::NEG_Z) < 1e-5);
    }

    #[test]
    fn test_view_validity() {
        assert!(is_valid_view(&Mat4::IDENTITY));
        assert!(!is_valid_view(&Mat4::ZERO));
        let mut nan = Mat4::IDENTITY;
        nan.w_axis.x = f32::NAN;
        assert!(!is_valid_view(&nan));
    }
}
