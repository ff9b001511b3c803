use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, Array3, Array4};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

/// betas を省略した場合の形状係数次元 (平均体型 = ゼロ)
pub const NUM_BETAS: usize = 10;

/// 1フェーズ分のバッチ化されたポーズパラメータ
///
/// B = トラック数、T = フレーム数。評価は必ずフェーズ単位の一括呼び出しで
/// 行う (フレーム単位の再評価は禁止。モデル評価コストが支配的なため)。
#[derive(Debug, Clone)]
pub struct PoseBatch {
    pub trans: Array3<f32>,       // (B, T, 3)
    pub root_orient: Array3<f32>, // (B, T, 3)
    pub pose_body: Array3<f32>,   // (B, T, 63)
    pub betas: Option<Array2<f32>>, // (B, NUM_BETAS)
}

impl PoseBatch {
    pub fn num_tracks(&self) -> usize {
        self.trans.shape()[0]
    }

    pub fn num_frames(&self) -> usize {
        self.trans.shape()[1]
    }

    /// 各パラメータの次元整合を確認する
    pub fn validate(&self) -> Result<()> {
        let (b, t) = (self.num_tracks(), self.num_frames());
        if self.trans.shape()[2] != 3 {
            bail!("trans must be (B, T, 3), got {:?}", self.trans.shape());
        }
        if self.root_orient.shape() != [b, t, 3] {
            bail!(
                "root_orient shape {:?} does not match trans (B={}, T={})",
                self.root_orient.shape(),
                b,
                t
            );
        }
        if self.pose_body.shape()[0] != b || self.pose_body.shape()[1] != t {
            bail!(
                "pose_body shape {:?} does not match trans (B={}, T={})",
                self.pose_body.shape(),
                b,
                t
            );
        }
        if let Some(betas) = &self.betas {
            if betas.shape()[0] != b {
                bail!("betas shape {:?} does not match B={}", betas.shape(), b);
            }
        }
        Ok(())
    }
}

/// ボディモデル評価の結果
///
/// 面トポロジーは全トラック・全フレームで共有の定数。
#[derive(Debug, Clone)]
pub struct MeshBatch {
    pub vertices: Array4<f32>, // (B, T, V, 3)
    pub faces: Array2<u32>,    // (F, 3)
}

impl MeshBatch {
    pub fn vertex_count(&self) -> usize {
        self.vertices.shape()[2]
    }

    /// 1 (トラック, フレーム) 分の頂点ビュー (V, 3)
    pub fn track_frame(&self, track: usize, frame: usize) -> ndarray::ArrayView2<f32> {
        self.vertices.slice(s![track, frame, .., ..])
    }
}

/// パラメトリックボディモデルの評価器
///
/// 順運動学の実装詳細はモデルアセット側 (ONNX) に閉じる。
pub trait BodyModel {
    fn evaluate(&mut self, batch: &PoseBatch) -> Result<MeshBatch>;
}

/// ONNXエクスポートされたボディモデル
///
/// 入力: trans [N,3], root_orient [N,3], pose_body [N,63], betas [N,10]
/// 出力: vertices [N,V,3] (f32), faces [F,3] (i64)。N = B * T。
pub struct OnnxBodyModel {
    session: Session,
    /// 1回の session.run に渡すペア数上限。0 で無制限
    batch_size: usize,
}

impl OnnxBodyModel {
    /// ONNXアセットを読み込んで初期化
    ///
    /// device を指定した場合は CUDA 実行プロバイダをそのデバイスに固定する。
    /// デバイス割り当てはワーカー起動時に一度だけ行い、以後変更しない。
    pub fn new<P: AsRef<Path>>(model_path: P, device: Option<u32>, batch_size: usize) -> Result<Self> {
        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?;
        if let Some(dev) = device {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(dev as i32)
                .build()])?;
        }
        let session = builder
            .commit_from_file(model_path.as_ref())
            .context("Failed to load body model ONNX asset")?;

        Ok(Self {
            session,
            batch_size,
        })
    }

    fn run_chunk(
        &mut self,
        trans: Array2<f32>,
        root_orient: Array2<f32>,
        pose_body: Array2<f32>,
        betas: Array2<f32>,
    ) -> Result<(Array3<f32>, Array2<u32>)> {
        let outputs = self
            .session
            .run(ort::inputs![
                "trans" => Tensor::from_array(trans)?,
                "root_orient" => Tensor::from_array(root_orient)?,
                "pose_body" => Tensor::from_array(pose_body)?,
                "betas" => Tensor::from_array(betas)?
            ])
            .context("Body model inference failed")?;

        let vertices: ndarray::ArrayViewD<f32> = outputs["vertices"]
            .try_extract_array()
            .context("Failed to extract vertices tensor")?;
        let vertices = vertices
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()
            .context("vertices output must be [N, V, 3]")?;

        let faces: ndarray::ArrayViewD<i64> = outputs["faces"]
            .try_extract_array()
            .context("Failed to extract faces tensor")?;
        let faces = faces
            .to_owned()
            .into_dimensionality::<ndarray::Ix2>()
            .context("faces output must be [F, 3]")?
            .mapv(|v| v as u32);

        Ok((vertices, faces))
    }
}

impl BodyModel for OnnxBodyModel {
    fn evaluate(&mut self, batch: &PoseBatch) -> Result<MeshBatch> {
        batch.validate()?;
        let (b, t) = (batch.num_tracks(), batch.num_frames());
        let n = b * t;

        let trans = flatten_pairs(&batch.trans)?;
        let root_orient = flatten_pairs(&batch.root_orient)?;
        let pose_body = flatten_pairs(&batch.pose_body)?;
        let betas = broadcast_betas(batch.betas.as_ref(), b, t);

        let mut all_vertices: Option<Array3<f32>> = None;
        let mut faces: Option<Array2<u32>> = None;

        for (start, end) in chunk_ranges(n, self.batch_size) {
            let (chunk_verts, chunk_faces) = self.run_chunk(
                trans.slice(s![start..end, ..]).to_owned(),
                root_orient.slice(s![start..end, ..]).to_owned(),
                pose_body.slice(s![start..end, ..]).to_owned(),
                betas.slice(s![start..end, ..]).to_owned(),
            )?;

            let v = chunk_verts.shape()[1];
            let out = all_vertices.get_or_insert_with(|| Array3::zeros((n, v, 3)));
            if out.shape()[1] != v {
                bail!("inconsistent vertex count across chunks: {} vs {}", out.shape()[1], v);
            }
            out.slice_mut(s![start..end, .., ..]).assign(&chunk_verts);
            accumulate_faces(&mut faces, chunk_faces, v)?;
        }

        let all_vertices = all_vertices.context("empty pose batch")?;
        let faces = faces.context("empty pose batch")?;
        let v = all_vertices.shape()[1];
        let vertices = all_vertices
            .into_shape_with_order((b, t, v, 3))
            .context("failed to reshape vertices to (B, T, V, 3)")?;

        Ok(MeshBatch { vertices, faces })
    }
}

/// 面インデックスが頂点数の範囲内にあることを検証する
///
/// モデル出力をそのまま信用すると、範囲外インデックスは法線計算で
/// パニックになるため、組み立て時点でエラーにする。
fn validate_faces(faces: &Array2<u32>, vertex_count: usize) -> Result<()> {
    if faces.shape()[1] != 3 {
        bail!("faces must be triangles, got width {}", faces.shape()[1]);
    }
    for (i, face) in faces.rows().into_iter().enumerate() {
        for &idx in face {
            if idx as usize >= vertex_count {
                bail!(
                    "face {} references vertex {} but mesh has only {} vertices",
                    i,
                    idx,
                    vertex_count
                );
            }
        }
    }
    Ok(())
}

/// チャンク評価の面トポロジーを取り込む
///
/// 最初のチャンクで検証して保持し、以降のチャンクは同一であることを要求する。
fn accumulate_faces(
    faces: &mut Option<Array2<u32>>,
    chunk: Array2<u32>,
    vertex_count: usize,
) -> Result<()> {
    match faces {
        None => {
            validate_faces(&chunk, vertex_count)?;
            *faces = Some(chunk);
        }
        Some(prev) => {
            if *prev != chunk {
                bail!("face topology differs across evaluation chunks");
            }
        }
    }
    Ok(())
}

/// (B, T, K) を (B*T, K) に平坦化する
fn flatten_pairs(a: &Array3<f32>) -> Result<Array2<f32>> {
    let (b, t, k) = a.dim();
    Ok(a.to_shape((b * t, k))
        .context("failed to flatten pose batch")?
        .to_owned())
}

/// (B, betas) を (B*T, betas) に展開。None は平均体型 (ゼロ)
fn broadcast_betas(betas: Option<&Array2<f32>>, b: usize, t: usize) -> Array2<f32> {
    match betas {
        Some(src) => {
            let k = src.shape()[1];
            let mut out = Array2::zeros((b * t, k));
            for track in 0..b {
                let row = src.slice(s![track, ..]);
                for frame in 0..t {
                    out.slice_mut(s![track * t + frame, ..]).assign(&row);
                }
            }
            out
        }
        None => Array2::zeros((b * t, NUM_BETAS)),
    }
}

/// [0, n) を batch_size ごとの半開区間に分割。0 は一括
fn chunk_ranges(n: usize, batch_size: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }
    if batch_size == 0 || batch_size >= n {
        return vec![(0, n)];
    }
    let mut ranges = Vec::with_capacity(n.div_ceil(batch_size));
    let mut start = 0;
    while start < n {
        let end = (start + batch_size).min(n);
        ranges.push((start, end));
        start = end;
    }
    ranges
}
