//! Camera calibration and image undistortion.
//!
//! A [`CameraCalibration`] bundles intrinsics, the rig-to-camera extrinsics
//! and a radial/tangential distortion model. [`UndistortionMap`] bakes the
//! inverse distortion into a per-pixel lookup table once at startup; each
//! frame is then rectified with a single bilinear warp pass.

use anyhow::{ensure, Result};
use image::GrayImage;
use nalgebra::{Matrix3, Matrix3x4, Vector2, Vector3};

use crate::geometry::SE3;

/// Calibration of a single camera in the stereo rig.
#[derive(Debug, Clone)]
pub struct CameraCalibration {
    /// Intrinsic matrix K (fx, fy, cx, cy on the usual slots).
    intrinsics: Matrix3<f64>,
    /// Rig-to-camera transform. Identity for the reference camera.
    extrinsics: SE3,
    /// Radial distortion coefficients (k1, k2, k3).
    radial: Vector3<f64>,
    /// Tangential distortion coefficients (p1, p2).
    tangential: Vector2<f64>,
    /// Image size the calibration was computed for.
    width: u32,
    height: u32,
}

impl CameraCalibration {
    pub fn new(
        intrinsics: Matrix3<f64>,
        extrinsics: SE3,
        radial: Vector3<f64>,
        tangential: Vector2<f64>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            intrinsics,
            extrinsics,
            radial,
            tangential,
            width,
            height,
        }
    }

    /// Calibration without distortion, useful for synthetic data.
    pub fn undistorted(intrinsics: Matrix3<f64>, extrinsics: SE3, width: u32, height: u32) -> Self {
        Self::new(
            intrinsics,
            extrinsics,
            Vector3::zeros(),
            Vector2::zeros(),
            width,
            height,
        )
    }

    pub fn intrinsics(&self) -> &Matrix3<f64> {
        &self.intrinsics
    }

    pub fn extrinsics(&self) -> &SE3 {
        &self.extrinsics
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The 3x4 projection matrix K [R | t] mapping rig coordinates to pixels.
    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.extrinsics.rotation.to_rotation_matrix().matrix());
        rt.fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.extrinsics.translation);
        self.intrinsics * rt
    }

    /// Apply the distortion model to normalized image coordinates.
    fn distort_normalized(&self, p: Vector2<f64>) -> Vector2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial =
            1.0 + self.radial.x * r2 + self.radial.y * r2 * r2 + self.radial.z * r2 * r2 * r2;
        let (p1, p2) = (self.tangential.x, self.tangential.y);

        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }
}

/// Per-pixel undistortion lookup, computed once from a calibration.
///
/// For every pixel of the rectified output image, the map stores the
/// (distorted) source location to sample from the raw input.
pub struct UndistortionMap {
    source: Vec<(f32, f32)>,
    width: u32,
    height: u32,
}

impl UndistortionMap {
    pub fn new(calib: &CameraCalibration) -> Self {
        let (width, height) = (calib.width, calib.height);
        let k = calib.intrinsics;
        let (fx, fy) = (k[(0, 0)], k[(1, 1)]);
        let (cx, cy) = (k[(0, 2)], k[(1, 2)]);

        let mut source = Vec::with_capacity((width * height) as usize);
        for v in 0..height {
            for u in 0..width {
                let normalized = Vector2::new((u as f64 - cx) / fx, (v as f64 - cy) / fy);
                let distorted = calib.distort_normalized(normalized);
                source.push((
                    (fx * distorted.x + cx) as f32,
                    (fy * distorted.y + cy) as f32,
                ));
            }
        }

        Self {
            source,
            width,
            height,
        }
    }

    /// Rectify a raw image by bilinear sampling through the map.
    ///
    /// Samples falling outside the source image come out black.
    pub fn apply(&self, raw: &GrayImage) -> Result<GrayImage> {
        ensure!(
            raw.dimensions() == (self.width, self.height),
            "image size {:?} does not match calibration {}x{}",
            raw.dimensions(),
            self.width,
            self.height
        );

        let mut out = GrayImage::new(self.width, self.height);
        for v in 0..self.height {
            for u in 0..self.width {
                let (sx, sy) = self.source[(v * self.width + u) as usize];
                out.put_pixel(u, v, image::Luma([sample_bilinear(raw, sx, sy)]));
            }
        }
        Ok(out)
    }
}

fn sample_bilinear(img: &GrayImage, x: f32, y: f32) -> u8 {
    let (w, h) = img.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return 0;
    }

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let ax = x - x0 as f32;
    let ay = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0).0[0] as f32;
    let p10 = img.get_pixel(x1, y0).0[0] as f32;
    let p01 = img.get_pixel(x0, y1).0[0] as f32;
    let p11 = img.get_pixel(x1, y1).0[0] as f32;

    let top = p00 * (1.0 - ax) + p10 * ax;
    let bottom = p01 * (1.0 - ax) + p11 * ax;
    (top * (1.0 - ay) + bottom * ay).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_calibration(radial: Vector3<f64>) -> CameraCalibration {
        let k = Matrix3::new(100.0, 0.0, 32.0, 0.0, 100.0, 24.0, 0.0, 0.0, 1.0);
        CameraCalibration::new(k, SE3::identity(), radial, Vector2::zeros(), 64, 48)
    }

    #[test]
    fn test_identity_map_without_distortion() {
        let calib = test_calibration(Vector3::zeros());
        let map = UndistortionMap::new(&calib);

        let mut img = GrayImage::new(64, 48);
        for v in 0..48 {
            for u in 0..64 {
                img.put_pixel(u, v, image::Luma([((u * 3 + v * 7) % 251) as u8]));
            }
        }

        let out = map.apply(&img).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_distorted_map_moves_off_center_pixels() {
        let calib = test_calibration(Vector3::new(-0.2, 0.0, 0.0));
        let map = UndistortionMap::new(&calib);

        // The principal point maps to itself, corners do not.
        let center = map.source[(24 * 64 + 32) as usize];
        assert!((center.0 - 32.0).abs() < 1e-4);
        assert!((center.1 - 24.0).abs() < 1e-4);

        let corner = map.source[0];
        assert!((corner.0 - 0.0).abs() > 0.5 || (corner.1 - 0.0).abs() > 0.5);
    }

    #[test]
    fn test_apply_rejects_mismatched_size() {
        let calib = test_calibration(Vector3::zeros());
        let map = UndistortionMap::new(&calib);
        let img = GrayImage::new(10, 10);
        assert!(map.apply(&img).is_err());
    }

    #[test]
    fn test_projection_matrix_projects_rig_points() {
        let calib = test_calibration(Vector3::zeros());
        let proj = calib.projection_matrix();

        let p = nalgebra::Vector4::new(0.0, 0.0, 2.0, 1.0);
        let x = proj * p;
        assert!((x.x / x.z - 32.0).abs() < 1e-9);
        assert!((x.y / x.z - 24.0).abs() < 1e-9);
    }
}
