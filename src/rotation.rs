use nalgebra::{Matrix3, Rotation3, UnitQuaternion};

/// 回転行列を単位クォータニオン (x, y, z, w) に変換
///
/// カメラ姿勢のログ用。入力は正規直交な回転行列を前提とする。
pub fn quaternion_xyzw(rotation: &Matrix3<f32>) -> [f32; 4] {
    let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation));
    [q.i, q.j, q.k, q.w]
}
