// Quaternion and rotation-matrix helpers shared by the kinematics engine and the
// center-of-mass model. Quaternions are stored scalar-first as [w, x, y, z].

pub type Quat = [f64; 4];
pub type Vec3 = [f64; 3];
pub type Mat3 = [[f64; 3]; 3];

pub const IDENTITY_QUAT: Quat = [1.0, 0.0, 0.0, 0.0];

/// Long axis of a limb segment in the sensor frame (sensor -Y points down the bone).
pub const BONE_AXIS: Vec3 = [0.0, -1.0, 0.0];

/// World vertical (Y-up).
pub const WORLD_UP: Vec3 = [0.0, 1.0, 0.0];

/// Convert intrinsic Z-Y-X Euler angles (degrees) to a unit quaternion.
pub fn quat_from_euler_zyx(ex_deg: f64, ey_deg: f64, ez_deg: f64) -> Quat {
    let (sr, cr) = (ex_deg.to_radians() * 0.5).sin_cos();
    let (sp, cp) = (ey_deg.to_radians() * 0.5).sin_cos();
    let (sy, cy) = (ez_deg.to_radians() * 0.5).sin_cos();

    [
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    ]
}

/// Rotate `v` by the unit quaternion `q` (Hamilton convention, `v' = v + w·t + q×t`
/// with `t = 2·(q×v)`).
pub fn rotate_vec(q: &Quat, v: Vec3) -> Vec3 {
    let [w, x, y, z] = *q;
    let t0 = 2.0 * (-z * v[1] + y * v[2]);
    let t1 = 2.0 * (z * v[0] - x * v[2]);
    let t2 = 2.0 * (-y * v[0] + x * v[1]);
    [
        v[0] + w * t0 + (y * t2 - z * t1),
        v[1] + w * t1 + (z * t0 - x * t2),
        v[2] + w * t2 + (x * t1 - y * t0),
    ]
}

pub fn mat3_from_quat(q: &Quat) -> Mat3 {
    let [w, x, y, z] = *q;
    [
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - z * w),
            2.0 * (x * z + y * w),
        ],
        [
            2.0 * (x * y + z * w),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - x * w),
        ],
        [
            2.0 * (x * z - y * w),
            2.0 * (y * z + x * w),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

pub fn transpose3(m: &Mat3) -> Mat3 {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

pub fn mul3(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    out
}

pub fn mul_mat_vec(m: &Mat3, v: Vec3) -> Vec3 {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

/// Orientation of `child` expressed in the frame of `parent`: `R_parent^T · R_child`.
pub fn relative_rotation(parent: &Quat, child: &Quat) -> Mat3 {
    mul3(&transpose3(&mat3_from_quat(parent)), &mat3_from_quat(child))
}

pub fn dot3(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn norm3(v: Vec3) -> f64 {
    dot3(v, v).sqrt()
}

pub fn add3(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn scale3(v: Vec3, s: f64) -> Vec3 {
    [v[0] * s, v[1] * s, v[2] * s]
}

/// Angle between two vectors in degrees. The cosine is clamped to [-1, 1] so
/// floating noise never leaves the arccos domain; degenerate vectors yield 0.
pub fn angle_between_deg(a: Vec3, b: Vec3) -> f64 {
    let denom = norm3(a) * norm3(b);
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (dot3(a, b) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Wrap an angle (degrees) into (-180, 180].
pub fn wrap180(deg: f64) -> f64 {
    let wrapped = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped <= -180.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_vec_close(a: Vec3, b: Vec3, tol: f64) {
        for k in 0..3 {
            assert!((a[k] - b[k]).abs() < tol, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_zero_euler_is_identity() {
        let q = quat_from_euler_zyx(0.0, 0.0, 0.0);
        assert_vec_close([q[1], q[2], q[3]], [0.0, 0.0, 0.0], EPS);
        assert!((q[0] - 1.0).abs() < EPS);
    }

    #[test]
    fn test_euler_roll_90() {
        let q = quat_from_euler_zyx(90.0, 0.0, 0.0);
        assert!((q[0] - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
        assert!((q[1] - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn test_euler_quaternion_is_unit() {
        let q = quat_from_euler_zyx(-96.6, -14.1, 43.1);
        let n = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
        assert!((n - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rotate_yaw_90() {
        let q = quat_from_euler_zyx(0.0, 0.0, 90.0);
        assert_vec_close(rotate_vec(&q, [1.0, 0.0, 0.0]), [0.0, 1.0, 0.0], 1e-9);
        assert_vec_close(rotate_vec(&IDENTITY_QUAT, [1.0, 2.0, 3.0]), [1.0, 2.0, 3.0], EPS);
    }

    #[test]
    fn test_matrix_agrees_with_vector_rotation() {
        let q = quat_from_euler_zyx(25.0, -40.0, 110.0);
        let m = mat3_from_quat(&q);
        let v = [0.3, -1.2, 0.7];
        assert_vec_close(mul_mat_vec(&m, v), rotate_vec(&q, v), 1e-9);
        let back = mul_mat_vec(&transpose3(&m), mul_mat_vec(&m, v));
        assert_vec_close(back, v, 1e-9);
    }

    #[test]
    fn test_relative_rotation_of_same_frame_is_identity() {
        let q = quat_from_euler_zyx(12.0, 34.0, 56.0);
        let r = relative_rotation(&q, &q);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((r[i][j] - expected).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_angle_between_clamps_domain() {
        let a = [0.0, -1.0, 0.0];
        assert_eq!(angle_between_deg(a, a), 0.0);
        assert!((angle_between_deg(a, [0.0, 1.0, 0.0]) - 180.0).abs() < EPS);
        assert_eq!(angle_between_deg([0.0; 3], a), 0.0);
    }

    #[test]
    fn test_wrap180_range() {
        assert!((wrap180(358.0) + 2.0).abs() < EPS);
        assert!((wrap180(-181.0) - 179.0).abs() < EPS);
        assert_eq!(wrap180(180.0), 180.0);
        assert_eq!(wrap180(-180.0), 180.0);
        assert_eq!(wrap180(0.0), 0.0);
    }
}
