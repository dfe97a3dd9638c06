//! End-to-end pipeline scenarios on a synthetic stereo scene.
//!
//! A scripted extractor replays precomputed feature sets (projections of a
//! known 3D scene), and the stereo pair images carry small unique blobs at
//! the projected locations so the patch-similarity validation sees real
//! pixel content.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::GrayImage;
use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};

use stereo_slam::camera::CameraCalibration;
use stereo_slam::features::{Descriptor, Feature, FeatureExtractor, FeatureSet};
use stereo_slam::geometry::SE3;
use stereo_slam::slam::{SlamConfig, StereoSlam};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const BASELINE: f64 = 0.1;

fn intrinsics() -> Matrix3<f64> {
    Matrix3::new(400.0, 0.0, 320.0, 0.0, 400.0, 240.0, 0.0, 0.0, 1.0)
}

fn calibrations() -> (CameraCalibration, CameraCalibration) {
    let extr1 = SE3 {
        rotation: UnitQuaternion::identity(),
        translation: Vector3::new(-BASELINE, 0.0, 0.0),
    };
    (
        CameraCalibration::undistorted(intrinsics(), SE3::identity(), WIDTH, HEIGHT),
        CameraCalibration::undistorted(intrinsics(), extr1, WIDTH, HEIGHT),
    )
}

/// World points placed so that their projections are well inside both
/// views and far enough apart that SAD patches never overlap.
fn scene_points(count: usize) -> Vec<Vector3<f64>> {
    let targets: &[(f64, f64, f64)] = &[
        (100.0, 100.0, 5.0),
        (250.0, 90.0, 6.0),
        (420.0, 110.0, 4.5),
        (560.0, 140.0, 7.0),
        (130.0, 260.0, 5.5),
        (300.0, 250.0, 6.5),
        (470.0, 270.0, 5.0),
        (120.0, 400.0, 4.0),
        (320.0, 380.0, 7.5),
        (520.0, 400.0, 6.0),
    ];
    targets
        .iter()
        .take(count)
        .map(|&(u, v, z)| Vector3::new((u - 320.0) * z / 400.0, (v - 240.0) * z / 400.0, z))
        .collect()
}

fn descriptor_for(index: usize) -> Descriptor {
    // Cheap deterministic pseudo-random bytes, distinct per point.
    let mut state = (index as u32).wrapping_mul(2654435761).wrapping_add(1);
    let mut bytes = [0u8; 32];
    for b in bytes.iter_mut() {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        *b = (state >> 24) as u8;
    }
    Descriptor(bytes)
}

fn project(extrinsics: &SE3, p_world: &Vector3<f64>) -> Vector2<f64> {
    let p = extrinsics.transform_point(p_world);
    let k = intrinsics();
    Vector2::new(
        k[(0, 0)] * p.x / p.z + k[(0, 2)],
        k[(1, 1)] * p.y / p.z + k[(1, 2)],
    )
}

/// Feature set + rendered image of one view of the scene.
fn view(extrinsics: &SE3, points: &[Vector3<f64>]) -> (FeatureSet, GrayImage) {
    let mut features = Vec::new();
    let mut descriptors = Vec::new();
    let mut img = GrayImage::new(WIDTH, HEIGHT);

    for (i, p) in points.iter().enumerate() {
        let uv = project(extrinsics, p);
        features.push(Feature::new(uv.x as f32, uv.y as f32));
        descriptors.push(descriptor_for(i));

        // A 3x3 blob with a per-point intensity.
        let intensity = 80 + 15 * (i as u8 % 12);
        let (cu, cv) = (uv.x.round() as i64, uv.y.round() as i64);
        for dv in -1..=1 {
            for du in -1..=1 {
                img.put_pixel(
                    (cu + du) as u32,
                    (cv + dv) as u32,
                    image::Luma([intensity]),
                );
            }
        }
    }

    (FeatureSet::new(features, descriptors), img)
}

/// Replays queued feature sets, one per extraction call.
struct ScriptedExtractor {
    queue: VecDeque<FeatureSet>,
}

impl ScriptedExtractor {
    fn new(sets: Vec<FeatureSet>) -> Self {
        Self {
            queue: sets.into(),
        }
    }
}

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&mut self, _image: &GrayImage, _corner_threshold: u8) -> FeatureSet {
        self.queue.pop_front().unwrap_or_default()
    }
}

struct EventCounters {
    keyframes: Arc<AtomicUsize>,
    pose_updates: Arc<AtomicUsize>,
    last_tracked: Arc<AtomicUsize>,
}

fn connect_counters(slam: &mut StereoSlam) -> EventCounters {
    let keyframes = Arc::new(AtomicUsize::new(0));
    let pose_updates = Arc::new(AtomicUsize::new(0));
    let last_tracked = Arc::new(AtomicUsize::new(0));

    {
        let keyframes = keyframes.clone();
        slam.events.keyframe_added.connect(move |_| {
            keyframes.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let pose_updates = pose_updates.clone();
        slam.events.pose_changed.connect(move |_| {
            pose_updates.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let last_tracked = last_tracked.clone();
        slam.events.tracked_points.connect(move |n| {
            last_tracked.store(*n, Ordering::SeqCst);
        });
    }

    EventCounters {
        keyframes,
        pose_updates,
        last_tracked,
    }
}

/// Build a session whose extractor replays the same static scene for
/// `frames` stereo pairs, and return the rendered images.
fn static_scene_session(
    num_points: usize,
    frames: usize,
) -> (StereoSlam, GrayImage, GrayImage) {
    let (calib0, calib1) = calibrations();
    let points = scene_points(num_points);

    let (left_set, left_img) = view(calib0.extrinsics(), &points);
    let (right_set, right_img) = view(calib1.extrinsics(), &points);

    // Extraction order per frame: left always, right only on keyframe
    // creation (first frame here).
    let mut sets = vec![left_set.clone(), right_set];
    for _ in 1..frames {
        sets.push(left_set.clone());
    }

    let slam = StereoSlam::new(
        calib0,
        calib1,
        Box::new(ScriptedExtractor::new(sets)),
        SlamConfig::default(),
    )
    .unwrap();

    (slam, left_img, right_img)
}

#[test]
fn first_frame_bootstraps_the_map() {
    let (mut slam, left, right) = static_scene_session(10, 1);
    let counters = connect_counters(&mut slam);

    slam.new_images(&left, &right).unwrap();

    assert_eq!(slam.map().num_keyframes(), 1);
    assert_eq!(slam.map().num_features(), 10);
    assert_eq!(slam.descriptor_database().len(), 10);
    assert_eq!(counters.keyframes.load(Ordering::SeqCst), 1);
    assert!(slam.active_keyframe().is_some());

    // No map points existed yet, so no pose update on the first frame.
    assert_eq!(counters.pose_updates.load(Ordering::SeqCst), 0);
    assert_eq!(counters.last_tracked.load(Ordering::SeqCst), 0);
}

#[test]
fn triangulated_points_satisfy_acceptance_policy() {
    let (mut slam, left, right) = static_scene_session(10, 1);
    slam.new_images(&left, &right).unwrap();

    let points = scene_points(10);
    for (_, feature) in slam.map().features() {
        let depth = feature.position().z;
        assert!(depth > 0.0 && depth < 30.0, "depth {} out of range", depth);

        // Each recovered position matches one of the scene points.
        let best = points
            .iter()
            .map(|p| (feature.position() - p).norm())
            .fold(f64::MAX, f64::min);
        assert!(best < 1e-2, "triangulated point off by {}", best);
    }
}

#[test]
fn static_scene_does_not_rekey() {
    let (mut slam, left, right) = static_scene_session(10, 2);
    let counters = connect_counters(&mut slam);

    slam.new_images(&left, &right).unwrap();
    slam.new_images(&left, &right).unwrap();

    // Same scene, no motion: the first frame keyed, the second must not.
    assert_eq!(slam.map().num_keyframes(), 1);
    assert_eq!(counters.keyframes.load(Ordering::SeqCst), 1);

    // All ten points tracked, pose re-estimated and still at the origin.
    assert_eq!(counters.last_tracked.load(Ordering::SeqCst), 10);
    assert_eq!(counters.pose_updates.load(Ordering::SeqCst), 1);
    assert!(slam.pose().translation.norm() < 1e-3);
    assert!(slam.pose().rotation.angle() < 1e-3);
}

#[test]
fn too_few_correspondences_skip_pose_estimation() {
    let (mut slam, left, right) = static_scene_session(5, 2);
    let counters = connect_counters(&mut slam);

    slam.new_images(&left, &right).unwrap();
    slam.new_images(&left, &right).unwrap();

    // Five tracked correspondences are below the minimum of six: the pose
    // stays stale and no pose event fires.
    assert_eq!(counters.last_tracked.load(Ordering::SeqCst), 5);
    assert_eq!(counters.pose_updates.load(Ordering::SeqCst), 0);
    assert_eq!(slam.pose().translation, Vector3::zeros());

    // And weak tracking alone does not re-key without motion.
    assert_eq!(slam.map().num_keyframes(), 1);
}

#[test]
fn clear_resets_session_state() {
    let (mut slam, left, right) = static_scene_session(10, 2);

    slam.new_images(&left, &right).unwrap();
    slam.new_images(&left, &right).unwrap();
    assert!(slam.map().num_features() > 0);

    slam.clear();

    assert_eq!(slam.map().num_keyframes(), 0);
    assert_eq!(slam.map().num_features(), 0);
    assert!(slam.descriptor_database().is_empty());
    assert_eq!(slam.pose().matrix(), nalgebra::Matrix4::identity());
    assert!(slam.active_keyframe().is_none());
}

#[test]
fn detector_threshold_adapts_with_floor() {
    let (calib0, calib1) = calibrations();

    // Sparse extraction output on every call; right views are empty so no
    // keyframe is ever created.
    let sparse: Vec<FeatureSet> = (0..8)
        .map(|_| {
            let features: Vec<Feature> = (0..50)
                .map(|i| Feature::new(20.0 + 12.0 * i as f32, 100.0))
                .collect();
            let descriptors = vec![Descriptor::default(); 50];
            FeatureSet::new(features, descriptors)
        })
        .collect();

    let mut config = SlamConfig::default();
    config.detector.corner_threshold = 22;

    let mut slam = StereoSlam::new(
        calib0,
        calib1,
        Box::new(ScriptedExtractor::new(sparse)),
        config,
    )
    .unwrap();

    let blank = GrayImage::new(WIDTH, HEIGHT);

    // Starved frames step the threshold down while it stays above the
    // floor of 15: 22 -> 17 -> 12.
    slam.new_images(&blank, &blank).unwrap();
    assert_eq!(slam.detector_threshold(), 17);

    slam.new_images(&blank, &blank).unwrap();
    assert_eq!(slam.detector_threshold(), 12);

    // At or below the floor it stops moving.
    slam.new_images(&blank, &blank).unwrap();
    assert_eq!(slam.detector_threshold(), 12);

    slam.new_images(&blank, &blank).unwrap();
    assert_eq!(slam.detector_threshold(), 12);
}
