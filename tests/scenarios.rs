mod common;

use approx::assert_relative_eq;
use common::{estimator, parameters, Scene};
use rgbd_registration::{
    Correspondence, CycleError, CycleLogReader, CycleLogWriter, CycleRecord, DepthMap,
    DepthRepairer, FeatureMemory, InMemoryFeatureMemory, Keypoint, MatchConsistencyResolver, Rejection,
};

#[test]
fn three_correspondences_are_not_enough() {
    let scene = Scene::new();
    let mut estimator = estimator(parameters());
    let raw: Vec<Correspondence> = scene.identity_matches().into_iter().take(3).collect();

    let err = estimator
        .register(&raw, &scene.source(1), &mut scene.reference())
        .expect_err("rejected");
    assert!(matches!(
        err,
        CycleError::Rejected(Rejection::InsufficientCorrespondences { count: 3, .. })
    ));
    assert_eq!(err.code(), "insufficient_correspondences");
    assert!(!estimator.has_estimate());
}

#[test]
fn exact_scene_recovers_the_true_pose() {
    let scene = Scene::new();
    let mut estimator = estimator(parameters());

    let registration = estimator
        .register(&scene.identity_matches(), &scene.source(42), &mut scene.reference())
        .expect("accepted");

    let truth = common::reference_to_world() * common::camera_in_reference();
    let estimate = &registration.estimate;
    assert_eq!(estimate.inlier_count, 10);
    assert!(estimate.reprojection_error < 1e-2);
    assert_eq!(estimate.frame_id, "world");
    assert_eq!(estimate.timestamp.as_nanos(), 42);
    assert_relative_eq!(estimate.position, truth.translation.vector, epsilon = 1e-3);
    assert!(estimate.orientation.angle_to(&truth.rotation) < 1e-3);

    let state = estimator.state();
    assert!(state.has_estimate());
    assert_eq!(state.last_match_count(), 10);
}

#[test]
fn pose_above_the_ceiling_is_rejected() {
    let scene = Scene::new();
    let mut params = parameters();
    // The true camera sits at 1.8m in the world.
    params.max_pose_height_m = 1.0;
    let mut estimator = estimator(params);

    let err = estimator
        .register(&scene.identity_matches(), &scene.source(1), &mut scene.reference())
        .expect_err("rejected");
    match err.rejection() {
        Some(Rejection::HeightAboveMax { height, max }) => {
            assert!((height - 1.8).abs() < 1e-3);
            assert_eq!(*max, 1.0);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!estimator.has_estimate());
}

#[test]
fn keypoint_in_a_wide_depth_hole_is_dropped() {
    let mut depth = DepthMap::new(400, 400, vec![1500; 400 * 400]).expect("depth");
    for y in 100..300 {
        for x in 100..300 {
            depth.set(x, y, 0);
        }
    }
    let repairer = DepthRepairer::new(100.0);
    let reference = [Keypoint::at(200.0, 200.0), Keypoint::at(50.0, 200.0)];
    let kept = repairer.repair(
        &[Correspondence::new(0, 0, 5.0), Correspondence::new(1, 1, 5.0)],
        &reference,
        &mut depth,
    );
    assert_eq!(kept, vec![Correspondence::new(1, 1, 5.0)]);
    assert_eq!(depth.get(200, 200), Some(0));
    assert_eq!(depth.get(50, 200), Some(1500));
}

#[test]
fn depth_hole_correspondence_never_reaches_the_solver() {
    let mut scene = Scene::new();
    // Farther than the search radius from every valid sample.
    scene.reference_keypoints.push(Keypoint::at(620.0, 460.0));
    scene.source_keypoints.push(Keypoint::at(40.0, 40.0));
    let mut estimator = estimator(parameters());

    let registration = estimator
        .register(&scene.identity_matches(), &scene.source(1), &mut scene.reference())
        .expect("accepted");
    assert_eq!(registration.correspondence_count, 10);
    assert!(registration.inliers.iter().all(|c| c.reference_idx != 10));
}

#[test]
fn ambiguous_source_pixel_drops_both_matches() {
    let source = [Keypoint::at(50.0, 50.0), Keypoint::at(50.0, 50.0)];
    let reference = [Keypoint::at(100.0, 400.0), Keypoint::at(600.0, 60.0)];
    let raw = [Correspondence::new(0, 0, 5.0), Correspondence::new(1, 1, 7.0)];

    let resolved = MatchConsistencyResolver::new(50.0, 3.0)
        .resolve(&raw, &source, &reference)
        .expect("valid indices");
    assert!(resolved.is_empty());
}

#[test]
fn ambiguous_matches_are_removed_before_solving() {
    let mut scene = Scene::new();
    scene.source_keypoints.push(Keypoint::at(40.0, 40.0));
    scene.source_keypoints.push(Keypoint::at(40.0, 40.0));
    scene.reference_keypoints.push(Keypoint::at(100.0, 400.0));
    scene.reference_keypoints.push(Keypoint::at(600.0, 60.0));
    let mut estimator = estimator(parameters());

    let registration = estimator
        .register(&scene.identity_matches(), &scene.source(1), &mut scene.reference())
        .expect("accepted");
    assert_eq!(registration.correspondence_count, 10);
    assert_eq!(registration.estimate.inlier_count, 10);
}

#[test]
fn recorded_cycles_replay_to_the_same_outcome() {
    let scene = Scene::new();
    let mut bytes = Vec::new();
    {
        let mut writer = CycleLogWriter::new(&mut bytes);
        for t in 0..3 {
            writer
                .write(&CycleRecord {
                    source: scene.source(t * 33_000_000),
                    reference: scene.reference(),
                })
                .expect("write");
        }
        writer.flush().expect("flush");
    }

    let mut estimator = estimator(parameters());
    let mut accepted = 0;
    for record in CycleLogReader::new(&bytes[..]) {
        let mut record = record.expect("record");
        estimator
            .update_from_features(&record.source, &mut record.reference)
            .expect("accepted");
        accepted += 1;
    }
    assert_eq!(accepted, 3);
    assert_eq!(
        estimator.last_estimate().map(|e| e.timestamp.as_nanos()),
        Some(66_000_000)
    );
}

#[test]
fn accepted_inliers_are_remembered() {
    let scene = Scene::new();
    let mut params = parameters();
    params.enable_feature_memory = true;
    let mut estimator = estimator(params).with_feature_memory(InMemoryFeatureMemory::new(100, 50));

    estimator
        .update_from_features(&scene.source(1), &mut scene.reference())
        .expect("accepted");

    let remembered = estimator
        .feature_memory()
        .map(|m| m.list_features())
        .unwrap_or_default();
    assert_eq!(remembered.len(), 10);
    let device = common::camera_in_reference().translation.vector;
    for (feature, &(x, y, d)) in remembered.iter().zip(&common::POINTS) {
        assert_eq!(feature.keypoint, Keypoint::at(x as f32, y as f32));
        assert_eq!(feature.raw_depth_mm, d);
        let point = common::reference_intrinsics()
            .deproject(x as f64, y as f64, d as f64 / 1000.0)
            .coords;
        assert!((feature.observer_distance_m - (point - device).norm()).abs() < 1e-3);
    }
}
