use nalgebra::Vector3;
use panelreg::{CompositeTransform, PanelRegError, Transform, TransformFamily};

fn close(a: &Vector3<f64>, b: &Vector3<f64>, tol: f64) -> bool {
    (a - b).norm() < tol
}

fn points() -> Vec<Vector3<f64>> {
    vec![
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(10.0, -3.0, 2.0),
        Vector3::new(-7.5, 4.25, -1.0),
        Vector3::new(31.0, 17.0, 5.5),
    ]
}

#[test]
fn rigid_3d_inverse_undoes_mapping() {
    let t = Transform::rigid_3d([0.1, -0.2, 0.3], [4.0, -1.0, 2.5], [16.0, 12.0, 4.0]).unwrap();
    let inv = t.inverse().unwrap();
    assert_eq!(inv.family(), TransformFamily::Rigid);
    for p in points() {
        assert!(close(&inv.apply(&t.apply(&p)), &p, 1e-9));
    }
}

#[test]
fn singular_affine_is_not_invertible() {
    let t = Transform::affine(&[1.0, 2.0, 2.0, 4.0], &[0.0, 0.0], &[0.0, 0.0]).unwrap();
    assert_eq!(t.inverse().err().unwrap(), PanelRegError::NonInvertibleTransform);
}

#[test]
fn promotion_preserves_the_mapping() {
    let rigid = Transform::rigid_2d(0.25, [3.0, -2.0], [10.0, 8.0]).unwrap();
    let affine = rigid.promote(TransformFamily::Affine).unwrap();
    assert_eq!(affine.parameters().len(), 6);
    for p in points() {
        let p = Vector3::new(p[0], p[1], 0.0);
        assert!(close(&rigid.apply(&p), &affine.apply(&p), 1e-12));
    }
    assert!(affine.promote(TransformFamily::Rigid).is_err());
}

#[test]
fn flattened_chain_matches_stagewise_application() {
    let mut chain = CompositeTransform::new();
    chain
        .push(Transform::translation(&[1.0, 2.0, -1.0]).unwrap())
        .unwrap();
    chain
        .push(Transform::rigid_3d([0.0, 0.1, 0.2], [0.5, 0.0, 0.0], [5.0, 5.0, 5.0]).unwrap())
        .unwrap();
    chain
        .push(
            Transform::affine(
                &[1.1, 0.0, 0.05, 0.0, 0.9, 0.0, 0.0, 0.02, 1.0],
                &[0.0, -1.0, 0.0],
                &[2.0, 2.0, 2.0],
            )
            .unwrap(),
        )
        .unwrap();
    let flat = chain.flatten().unwrap();
    assert_eq!(flat.family(), TransformFamily::Affine);
    for p in points() {
        assert!(close(&flat.apply(&p), &chain.apply(&p), 1e-9));
    }

    let err = chain.push(Transform::translation(&[1.0, 1.0]).unwrap());
    assert!(err.is_err());
}

#[test]
fn translation_chain_stays_translation() {
    let chain: CompositeTransform = [
        Transform::translation(&[1.0, 2.0]).unwrap(),
        Transform::translation(&[-0.5, 4.0]).unwrap(),
    ]
    .into_iter()
    .collect();
    let flat = chain.flatten().unwrap();
    assert_eq!(flat.family(), TransformFamily::Translation);
    assert_eq!(flat.parameters(), &[0.5, 6.0]);
}

#[cfg(feature = "serde")]
#[test]
fn transform_json_round_trip() {
    let t = Transform::rigid_2d(-0.125, [2.0, 3.5], [12.0, 9.0]).unwrap();
    let json = serde_json::to_string(&t).unwrap();
    assert!(json.contains("\"family\":\"rigid\""));
    let back: Transform = serde_json::from_str(&json).unwrap();
    assert_eq!(back, t);

    let bad = r#"{"family":"affine","dim":2,"parameters":[1.0,0.0],"center":[0.0,0.0]}"#;
    assert!(serde_json::from_str::<Transform>(bad).is_err());
}
