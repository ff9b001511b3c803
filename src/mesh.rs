use nalgebra::Vector3;
use ndarray::ArrayView2;

/// 頂点法線を計算する
///
/// 各頂点に接続する面の法線 (面の巻き順に従う外向き) を加算平均し正規化する。
/// `vertices` は (V, 3)、`faces` は (F, 3) の頂点インデックス。
pub fn vertex_normals(vertices: ArrayView2<f32>, faces: ArrayView2<u32>) -> Vec<[f32; 3]> {
    let num_vertices = vertices.nrows();
    let mut accum = vec![Vector3::zeros(); num_vertices];

    for face in faces.rows() {
        let (ia, ib, ic) = (face[0] as usize, face[1] as usize, face[2] as usize);
        let a = Vector3::new(vertices[[ia, 0]], vertices[[ia, 1]], vertices[[ia, 2]]);
        let b = Vector3::new(vertices[[ib, 0]], vertices[[ib, 1]], vertices[[ib, 2]]);
        let c = Vector3::new(vertices[[ic, 0]], vertices[[ic, 1]], vertices[[ic, 2]]);

        // 面積重み付き: 外積の大きさをそのまま使う
        let face_normal = (b - a).cross(&(c - a));
        accum[ia] += face_normal;
        accum[ib] += face_normal;
        accum[ic] += face_normal;
    }

    accum
        .into_iter()
        .map(|n| {
            let len = n.norm();
            if len > 1e-12 {
                [n.x / len, n.y / len, n.z / len]
            } else {
                // 孤立頂点や退化面のみの頂点
                [0.0, 0.0, 0.0]
            }
        })
        .collect()
}

/// (V, 3) ビューを rerun に渡せる座標配列へ変換
pub fn positions(vertices: ArrayView2<f32>) -> Vec<[f32; 3]> {
    vertices
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect()
}

/// (F, 3) ビューを三角形インデックス配列へ変換
pub fn triangles(faces: ArrayView2<u32>) -> Vec<[u32; 3]> {
    faces
        .rows()
        .into_iter()
        .map(|row| [row[0], row[1], row[2]])
        .collect()
}
