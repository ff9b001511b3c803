//! Recording sink: a thin wrapper over the rerun recording stream.
//!
//! Every call takes an explicit timeline key; nothing here relies on an
//! implicit "current frame". Writes go to a temporary `.rrd` that is renamed
//! into place on `finish()`, so a failed run never leaves a partial recording.

use anyhow::{Context, Result};
use rerun::RecordingStream;
use std::fs;
use std::path::{Path, PathBuf};

use crate::timeline::{TimelineKey, TIMELINE};

/// ワールド座標のルートエンティティ
pub const WORLD_PATH: &str = "world";

/// タイムラインキー付きログエントリの書き込み先
///
/// オーケストレータはこのインターフェースにのみ依存する。
/// 本番実装は rerun へ書き込む [`RecordingSink`]。
pub trait Sink {
    /// ワールド座標系の規約を固定する
    fn log_world_coordinates(&self) -> Result<()>;

    /// 画像ファイルをそのままログする (デコードはビューア側)
    fn log_image_file(&self, entity: &str, key: TimelineKey, path: &Path) -> Result<()>;

    /// ピンホール射影 (fx, fy, cx, cy + 解像度) をログする
    fn log_pinhole(
        &self,
        entity: &str,
        key: TimelineKey,
        intrinsics: [f32; 4],
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// 剛体変換 (並進 + クォータニオン) をログする
    fn log_transform(
        &self,
        entity: &str,
        key: TimelineKey,
        translation: [f32; 3],
        quaternion_xyzw: [f32; 4],
    ) -> Result<()>;

    /// 頂点・面・法線つきメッシュをログする
    fn log_mesh(
        &self,
        entity: &str,
        key: TimelineKey,
        vertices: Vec<[f32; 3]>,
        faces: Vec<[u32; 3]>,
        normals: Vec<[f32; 3]>,
    ) -> Result<()>;

    /// 2D線分群をログする
    fn log_line_segments(
        &self,
        entity: &str,
        key: TimelineKey,
        segments: &[[[f32; 2]; 2]],
    ) -> Result<()>;

    /// エンティティを明示的にクリアする
    ///
    /// 未更新のまま残すのではなく、そのフレームで不在であることを記録する。
    fn clear(&self, entity: &str, key: TimelineKey) -> Result<()>;
}

pub struct RecordingSink {
    rec: RecordingStream,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl RecordingSink {
    /// `final_path` に保存する記録セッションを開始する
    pub fn create(app_id: &str, final_path: &Path) -> Result<Self> {
        let tmp_path = final_path.with_extension("rrd.tmp");
        let rec = rerun::RecordingStreamBuilder::new(app_id)
            .save(&tmp_path)
            .with_context(|| format!("failed to open recording {}", tmp_path.display()))?;
        Ok(Self {
            rec,
            tmp_path,
            final_path: final_path.to_path_buf(),
        })
    }

    /// 記録を確定する。フラッシュ後、一時ファイルを最終パスへリネーム
    pub fn finish(self) -> Result<()> {
        let Self {
            rec,
            tmp_path,
            final_path,
        } = self;
        rec.flush_blocking();
        drop(rec);
        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to move recording {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }

    /// 失敗したランの書きかけ記録を破棄する
    pub fn discard(self) {
        let Self { rec, tmp_path, .. } = self;
        drop(rec);
        let _ = fs::remove_file(&tmp_path);
    }
}

impl Sink for RecordingSink {
    /// 定義カメラのフレーム0姿勢が直立と仮定し、ワールドの上方向は -Y
    fn log_world_coordinates(&self) -> Result<()> {
        self.rec
            .log_static(WORLD_PATH, &rerun::ViewCoordinates::RIGHT_HAND_Y_DOWN())?;
        Ok(())
    }

    fn log_image_file(&self, entity: &str, key: TimelineKey, path: &Path) -> Result<()> {
        self.rec.set_time_sequence(TIMELINE, key.sequence());
        let image = rerun::EncodedImage::from_file(path)
            .with_context(|| format!("failed to read image {}", path.display()))?;
        self.rec.log(entity, &image)?;
        Ok(())
    }

    fn log_pinhole(
        &self,
        entity: &str,
        key: TimelineKey,
        intrinsics: [f32; 4],
        width: u32,
        height: u32,
    ) -> Result<()> {
        let [fx, fy, cx, cy] = intrinsics;
        self.rec.set_time_sequence(TIMELINE, key.sequence());
        // K = [[fx, 0, cx], [0, fy, cy], [0, 0, 1]] を列優先で渡す
        self.rec.log(
            entity,
            &rerun::Pinhole::new([
                [fx, 0.0, 0.0],
                [0.0, fy, 0.0],
                [cx, cy, 1.0],
            ])
            .with_resolution([width as f32, height as f32]),
        )?;
        Ok(())
    }

    fn log_transform(
        &self,
        entity: &str,
        key: TimelineKey,
        translation: [f32; 3],
        quaternion_xyzw: [f32; 4],
    ) -> Result<()> {
        self.rec.set_time_sequence(TIMELINE, key.sequence());
        self.rec.log(
            entity,
            &rerun::Transform3D::from_translation_rotation(
                translation,
                rerun::Quaternion::from_xyzw(quaternion_xyzw),
            ),
        )?;
        Ok(())
    }

    fn log_mesh(
        &self,
        entity: &str,
        key: TimelineKey,
        vertices: Vec<[f32; 3]>,
        faces: Vec<[u32; 3]>,
        normals: Vec<[f32; 3]>,
    ) -> Result<()> {
        self.rec.set_time_sequence(TIMELINE, key.sequence());
        self.rec.log(
            entity,
            &rerun::Mesh3D::new(vertices)
                .with_triangle_indices(faces)
                .with_vertex_normals(normals),
        )?;
        Ok(())
    }

    fn log_line_segments(
        &self,
        entity: &str,
        key: TimelineKey,
        segments: &[[[f32; 2]; 2]],
    ) -> Result<()> {
        self.rec.set_time_sequence(TIMELINE, key.sequence());
        let strips: Vec<Vec<[f32; 2]>> = segments.iter().map(|s| s.to_vec()).collect();
        self.rec.log(entity, &rerun::LineStrips2D::new(strips))?;
        Ok(())
    }

    fn clear(&self, entity: &str, key: TimelineKey) -> Result<()> {
        self.rec.set_time_sequence(TIMELINE, key.sequence());
        self.rec.log(entity, &rerun::Clear::flat())?;
        Ok(())
    }
}
