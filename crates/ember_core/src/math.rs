//! Math utilities
//!
//! Re-exports glam with the rotation helpers used by editor-facing
//! component views.

pub use glam::*;

/// Build a rotation from euler angles expressed in degrees (XYZ order).
pub fn quat_from_euler_degrees(euler: Vec3) -> Quat {
    Quat::from_euler(
        EulerRot::XYZ,
        euler.x.to_radians(),
        euler.y.to_radians(),
        euler.z.to_radians(),
    )
}

/// Decompose a rotation into euler angles in degrees (XYZ order).
pub fn quat_to_euler_degrees(rotation: Quat) -> Vec3 {
    let (x, y, z) = rotation.to_euler(EulerRot::XYZ);
    Vec3::new(x.to_degrees(), y.to_degrees(), z.to_degrees())
}

/// Rotations are equal up to sign (q and -q describe the same orientation).
pub fn quat_approx_eq(a: Quat, b: Quat, epsilon: f32) -> bool {
    a.abs_diff_eq(b, epsilon) || a.abs_diff_eq(-b, epsilon)
}
