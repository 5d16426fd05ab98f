//! Host-side rotation conversions on top of `nalgebra`.
//!
//! Tensor rows cross this boundary as plain arrays: quaternions are
//! scalar-last `(x, y, z, w)` and euler angles are extrinsic `xyz` in degrees
//! unless a function says otherwise.

use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};

pub type Quat = [f32; 4];
pub type Mat3 = Matrix3<f32>;

const EPS: f32 = 1e-8;

/// Unit quaternion for an `(x, y, z, w)` row; near-zero rows map to identity.
pub fn to_unit(q: Quat) -> UnitQuaternion<f32> {
    UnitQuaternion::try_new(Quaternion::new(q[3], q[0], q[1], q[2]), EPS)
        .unwrap_or_else(UnitQuaternion::identity)
}

/// `(x, y, z, w)` row of a unit quaternion.
pub fn from_unit(q: &UnitQuaternion<f32>) -> Quat {
    [q.i, q.j, q.k, q.w]
}

pub fn normalize_quat(q: Quat) -> Quat {
    from_unit(&to_unit(q))
}

pub fn quat_to_matrix(q: Quat) -> Mat3 {
    to_unit(q).to_rotation_matrix().into_inner()
}

/// Nearest rotation to `m`, which is assumed orthonormal.
pub fn matrix_to_quat(m: Mat3) -> Quat {
    from_unit(&UnitQuaternion::from_rotation_matrix(
        &Rotation3::from_matrix_unchecked(m),
    ))
}

/// Gram-Schmidt a 6D vector (two raw columns) into a rotation matrix.
pub fn ortho6d_to_matrix(v: [f32; 6]) -> Mat3 {
    let a = Vector3::new(v[0], v[1], v[2]);
    let b = Vector3::new(v[3], v[4], v[5]);
    let x = a.try_normalize(EPS).unwrap_or_else(Vector3::x);
    let z = x.cross(&b).try_normalize(EPS).unwrap_or_else(|| {
        // `b` parallel to `x`: any axis orthogonal to `x` completes the frame.
        x.cross(&Vector3::z())
            .try_normalize(EPS)
            .unwrap_or_else(|| x.cross(&Vector3::y()).normalize())
    });
    let y = z.cross(&x);
    Rotation3::from_basis_unchecked(&[x, y, z]).into_inner()
}

/// First two columns of the matrix, column after column.
pub fn matrix_to_ortho6d(m: Mat3) -> [f32; 6] {
    let (x, y) = (m.column(0), m.column(1));
    [x[0], x[1], x[2], y[0], y[1], y[2]]
}

/// Extrinsic `xyz` euler angles in degrees to a quaternion.
pub fn euler_to_quat(euler_deg: [f32; 3]) -> Quat {
    let [roll, pitch, yaw] = euler_deg.map(f32::to_radians);
    from_unit(&UnitQuaternion::from_euler_angles(roll, pitch, yaw))
}

/// Quaternion to extrinsic `xyz` euler angles in degrees, each in `[-180, 180]`.
pub fn quat_to_euler(q: Quat) -> [f32; 3] {
    let (roll, pitch, yaw) = to_unit(q).euler_angles();
    [roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()]
}

/// Wrap an angle in degrees into `[-180, 180)`.
pub fn wrap_degrees(angle: f32) -> f32 {
    (angle + 180.0).rem_euclid(360.0) - 180.0
}

/// Bin index per axis for `resolution`-degree bins covering `[-180, 180)`.
///
/// Rounds to the nearest bin edge; the edge at +180 wraps to bin 0.
pub fn euler_to_bins(euler_deg: [f32; 3], resolution: usize) -> [usize; 3] {
    let bins = 360 / resolution;
    euler_deg.map(|a| {
        let shifted = (a + 180.0).rem_euclid(360.0);
        let disc = (shifted / resolution as f32).round() as usize;
        if disc >= bins {
            0
        } else {
            disc
        }
    })
}

pub fn bins_to_euler(bins: [usize; 3], resolution: usize) -> [f32; 3] {
    bins.map(|b| (b * resolution) as f32 - 180.0)
}

pub fn bins_to_quat(bins: [usize; 3], resolution: usize) -> Quat {
    euler_to_quat(bins_to_euler(bins, resolution))
}

/// Rotation angle between two quaternions in degrees, sign-invariant.
pub fn quat_angle_deg(a: Quat, b: Quat) -> f32 {
    to_unit(a).angle_to(&to_unit(b)).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_quat_close(a: Quat, b: Quat, tol_deg: f32) {
        let angle = quat_angle_deg(a, b);
        assert!(angle < tol_deg, "quaternions {a:?} and {b:?} differ by {angle} deg");
    }

    #[test]
    fn test_identity() {
        let m = quat_to_matrix([0.0, 0.0, 0.0, 1.0]);
        assert!((m - Mat3::identity()).abs().max() < 1e-6);
        let euler = quat_to_euler([0.0, 0.0, 0.0, 1.0]);
        assert!(euler.iter().all(|a| a.abs() < 1e-6), "{euler:?}");
        assert_eq!(normalize_quat([0.0; 4]), [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_matrix_round_trip() {
        let samples = [
            [0.1_f32, -0.4, 0.3, 0.85],
            [0.9, 0.1, 0.0, 0.1],
            [0.0, 0.99, 0.1, 0.0],
            [0.2, 0.1, -0.97, 0.05],
        ];
        for q in samples {
            let back = matrix_to_quat(quat_to_matrix(q));
            assert_quat_close(q, back, 0.05);
        }
    }

    #[test]
    fn test_ortho6d_round_trip() {
        let q = normalize_quat([0.3, -0.2, 0.6, 0.7]);
        let six = matrix_to_ortho6d(quat_to_matrix(q));
        let back = matrix_to_quat(ortho6d_to_matrix(six));
        assert_quat_close(q, back, 0.05);
    }

    #[test]
    fn test_ortho6d_orthogonalizes_raw_input() {
        let m = ortho6d_to_matrix([2.0, 0.1, 0.0, 0.3, 3.0, 0.2]);
        assert!((m.transpose() * m - Mat3::identity()).abs().max() < 1e-5);
        assert!((m.determinant() - 1.0).abs() < 1e-5);
        // The first column keeps the direction of the first raw vector.
        let x = Vector3::new(2.0_f32, 0.1, 0.0).normalize();
        assert!((m.column(0) - x).norm() < 1e-6);
    }

    #[test]
    fn test_ortho6d_degenerate_input_is_still_a_rotation() {
        for six in [[0.0_f32; 6], [1.0, 0.0, 0.0, 2.0, 0.0, 0.0]] {
            let m = ortho6d_to_matrix(six);
            assert!((m.transpose() * m - Mat3::identity()).abs().max() < 1e-5, "{six:?}");
        }
    }

    #[test]
    fn test_euler_round_trip() {
        let euler = [30.0_f32, -45.0, 120.0];
        let back = quat_to_euler(euler_to_quat(euler));
        for (a, b) in euler.iter().zip(back) {
            assert!((a - b).abs() < 1e-3, "{euler:?} vs {back:?}");
        }
    }

    #[test]
    fn test_euler_is_extrinsic_xyz() {
        // Extrinsic xyz applies x first, so the matrix is Rz * Ry * Rx.
        let [r, p, y] = [20.0_f32, -35.0, 70.0].map(f32::to_radians);
        let expected = Rotation3::from_axis_angle(&Vector3::z_axis(), y)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), p)
            * Rotation3::from_axis_angle(&Vector3::x_axis(), r);
        let m = quat_to_matrix(euler_to_quat([20.0, -35.0, 70.0]));
        assert!((m - expected.into_inner()).abs().max() < 1e-5);
    }

    #[test]
    fn test_euler_single_axis_matches_axis_angle() {
        // 90 degrees about z.
        let q = euler_to_quat([0.0, 0.0, 90.0]);
        let half = std::f32::consts::FRAC_PI_4;
        assert_quat_close(q, [0.0, 0.0, half.sin(), half.cos()], 1e-3);
    }

    #[test]
    fn test_wrap_degrees() {
        assert_eq!(wrap_degrees(0.0), 0.0);
        assert_eq!(wrap_degrees(180.0), -180.0);
        assert_eq!(wrap_degrees(-358.0), 2.0);
        assert_eq!(wrap_degrees(270.0), -90.0);
    }

    #[test]
    fn test_bins_wrap_and_round() {
        assert_eq!(euler_to_bins([-180.0, 0.0, 179.0], 5), [0, 36, 0]);
        assert_eq!(euler_to_bins([-177.4, 2.6, 92.0], 5), [1, 37, 54]);
        assert_eq!(bins_to_euler([0, 36, 71], 5), [-180.0, 0.0, 175.0]);
    }

    #[test]
    fn test_discrete_round_trip_within_one_bin() {
        let resolution = 5;
        for euler in [[12.3_f32, -47.9, 101.0], [-170.0, 33.3, -2.4], [88.8, 0.4, 176.0]] {
            let q = euler_to_quat(euler);
            let decoded = bins_to_quat(euler_to_bins(quat_to_euler(q), resolution), resolution);
            // Per-axis error is at most half a bin; the combined rotation stays within one bin width.
            assert_quat_close(q, decoded, resolution as f32);
        }
    }
}
