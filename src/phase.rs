//! Phase resolution: locate the latest optimization snapshot for a named
//! phase, or synthesize the "input" phase directly from the dataset.
//!
//! Snapshot layout: `log_dir/<phase>/<iteration>_results.json` with 6-digit
//! zero-padded iteration keys. The lexicographically last key is the most
//! converged result and is the one loaded.

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::body_model::PoseBatch;
use crate::dataset::MotionDataset;

/// データセットから直接合成される疑似フェーズ名
pub const INPUT_PHASE: &str = "input";

/// 合成フェーズのイテレーションキー
pub const INPUT_ITERATION: &str = "000000";

/// スナップショットファイル名の接尾辞
const RESULTS_SUFFIX: &str = "_results.json";

/// 解決済みの1フェーズ分の結果
#[derive(Debug)]
pub struct PhaseResult {
    pub name: String,
    pub iteration: String,
    pub params: PoseBatch,
    /// このフェーズ自身のカメラストリーム (フレームごと)
    pub cam_translations: Vec<Vector3<f32>>,
    pub cam_rotations: Vec<Matrix3<f32>>,
}

/// フェーズを解決する
///
/// - "input": データセットの初期パラメータと定義カメラから合成する
/// - それ以外: `log_dir/<phase>` の最新スナップショットを読み込む。
///   ディレクトリが無ければ Ok(None) (呼び出し側がスキップ)。
///   ディレクトリはあるがスナップショットが壊れている場合はエラー (伝播)。
pub fn resolve(
    phase: &str,
    log_dir: &Path,
    dataset: &MotionDataset,
) -> Result<Option<PhaseResult>> {
    if phase == INPUT_PHASE {
        return synthesize_input(dataset).map(Some);
    }

    let phase_dir = log_dir.join(phase);
    if !phase_dir.is_dir() {
        return Ok(None);
    }

    let mut iterations = list_iterations(&phase_dir)?;
    let Some(iteration) = latest_iteration(&mut iterations) else {
        bail!("phase directory {} has no snapshots", phase_dir.display());
    };

    let snapshot_path = phase_dir.join(format!("{}{}", iteration, RESULTS_SUFFIX));
    let result = load_snapshot(&snapshot_path)
        .with_context(|| format!("failed to load snapshot {}", snapshot_path.display()))?;

    Ok(Some(build_result(phase, iteration, result, dataset)?))
}

/// 存在するイテレーションキーから最終のものを選ぶ
/// (固定幅ゼロ詰めのため辞書順最大 = 数値最大)
fn latest_iteration(iterations: &mut Vec<String>) -> Option<String> {
    iterations.sort();
    iterations.last().cloned()
}

fn list_iterations(phase_dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let entries = fs::read_dir(phase_dir)
        .with_context(|| format!("failed to list snapshots in {}", phase_dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(key) = name.strip_suffix(RESULTS_SUFFIX) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}

// --- スナップショットファイル形式 ---

#[derive(Deserialize)]
struct SnapshotFile {
    /// ワールド座標系の結果ブロックのみを使用する
    world: WorldBlock,
}

#[derive(Deserialize)]
struct WorldBlock {
    trans: Vec<Vec<[f32; 3]>>,       // (B, T, 3)
    root_orient: Vec<Vec<[f32; 3]>>, // (B, T, 3)
    pose_body: Vec<Vec<Vec<f32>>>,   // (B, T, 63)
    #[serde(default)]
    betas: Option<Vec<Vec<f32>>>, // (B, 10)
    cam_t: Vec<[f32; 3]>, // (T, 3)
    cam_r: Vec<[f32; 9]>, // (T, 9) 行優先
}

fn load_snapshot(path: &Path) -> Result<WorldBlock> {
    let content = fs::read_to_string(path)?;
    let file: SnapshotFile = serde_json::from_str(&content)?;
    Ok(file.world)
}

fn build_result(
    phase: &str,
    iteration: String,
    world: WorldBlock,
    dataset: &MotionDataset,
) -> Result<PhaseResult> {
    let b = world.trans.len();
    let t = dataset.seq_len;

    if b != dataset.num_tracks() {
        bail!(
            "phase {} has {} tracks, dataset has {}",
            phase,
            b,
            dataset.num_tracks()
        );
    }
    if world.cam_t.len() != t || world.cam_r.len() != t {
        bail!(
            "phase {} camera stream has {} frames, expected {}",
            phase,
            world.cam_t.len(),
            t
        );
    }

    let trans = nested3_to_array(&world.trans, b, t, "trans")?;
    let root_orient = nested3_to_array(&world.root_orient, b, t, "root_orient")?;
    let pose_body = nested_pose_to_array(&world.pose_body, b, t)?;

    let betas = match &world.betas {
        Some(rows) => {
            let k = rows.first().map(|r| r.len()).unwrap_or(0);
            let mut flat = Vec::with_capacity(b * k);
            for row in rows {
                if row.len() != k {
                    bail!("ragged betas in phase {}", phase);
                }
                flat.extend_from_slice(row);
            }
            Some(Array2::from_shape_vec((b, k), flat).context("bad betas shape")?)
        }
        None => None,
    };

    let params = PoseBatch {
        trans,
        root_orient,
        pose_body,
        betas,
    };
    params.validate()?;

    let cam_translations = world
        .cam_t
        .iter()
        .map(|v| Vector3::from_column_slice(v))
        .collect();
    let cam_rotations = world.cam_r.iter().map(|r| Matrix3::from_row_slice(r)).collect();

    Ok(PhaseResult {
        name: phase.to_string(),
        iteration,
        params,
        cam_translations,
        cam_rotations,
    })
}

/// "input" フェーズ: データセットの初期パラメータ + 定義カメラから合成
fn synthesize_input(dataset: &MotionDataset) -> Result<PhaseResult> {
    let b = dataset.num_tracks();
    let t = dataset.seq_len;

    let mut trans = Array3::zeros((b, t, 3));
    let mut root_orient = Array3::zeros((b, t, 3));
    let mut pose_body: Option<Array3<f32>> = None;
    let mut betas: Option<Array2<f32>> = None;

    for (i, track) in dataset.tracks.iter().enumerate() {
        let init = track.init.as_ref().with_context(|| {
            format!(
                "track {} has no init parameters; cannot synthesize input phase",
                track.track_id
            )
        })?;

        trans
            .slice_mut(ndarray::s![i, .., ..])
            .assign(&init.trans);
        root_orient
            .slice_mut(ndarray::s![i, .., ..])
            .assign(&init.root_orient);

        let pose_dim = init.pose_body.shape()[1];
        let pose = pose_body.get_or_insert_with(|| Array3::zeros((b, t, pose_dim)));
        if pose.shape()[2] != pose_dim {
            bail!("inconsistent pose_body dimension across tracks");
        }
        pose.slice_mut(ndarray::s![i, .., ..]).assign(&init.pose_body);

        if let Some(track_betas) = &init.betas {
            let k = track_betas.len();
            let all = betas.get_or_insert_with(|| Array2::zeros((b, k)));
            if all.shape()[1] != k {
                bail!("inconsistent betas dimension across tracks");
            }
            for (j, &v) in track_betas.iter().enumerate() {
                all[[i, j]] = v;
            }
        }
    }

    let params = PoseBatch {
        trans,
        root_orient,
        pose_body: pose_body.context("dataset has no tracks")?,
        betas,
    };
    params.validate()?;

    Ok(PhaseResult {
        name: INPUT_PHASE.to_string(),
        iteration: INPUT_ITERATION.to_string(),
        params,
        cam_translations: dataset.camera.translations.clone(),
        cam_rotations: dataset.camera.rotations.clone(),
    })
}

fn nested3_to_array(
    rows: &[Vec<[f32; 3]>],
    b: usize,
    t: usize,
    name: &str,
) -> Result<Array3<f32>> {
    let mut flat = Vec::with_capacity(b * t * 3);
    for (i, track) in rows.iter().enumerate() {
        if track.len() != t {
            bail!("{}: track {} has {} frames, expected {}", name, i, track.len(), t);
        }
        for v in track {
            flat.extend_from_slice(v);
        }
    }
    Array3::from_shape_vec((b, t, 3), flat).with_context(|| format!("bad {} shape", name))
}

fn nested_pose_to_array(rows: &[Vec<Vec<f32>>], b: usize, t: usize) -> Result<Array3<f32>> {
    let pose_dim = rows
        .first()
        .and_then(|track| track.first())
        .map(|p| p.len())
        .unwrap_or(0);
    let mut flat = Vec::with_capacity(b * t * pose_dim);
    for (i, track) in rows.iter().enumerate() {
        if track.len() != t {
            bail!("pose_body: track {} has {} frames, expected {}", i, track.len(), t);
        }
        for pose in track {
            if pose.len() != pose_dim {
                bail!("pose_body: ragged pose dimension in track {}", i);
            }
            flat.extend_from_slice(pose);
        }
    }
    Array3::from_shape_vec((b, t, pose_dim), flat).context("bad pose_body shape")
}
