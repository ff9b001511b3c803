//! Dataset adapter: loads one sequence's images, defining-camera stream,
//! and per-track keypoints/visibility from the run's source directory.
//!
//! Layout:
//!   sources/images/*.jpg|png   frame images, lexicographic order = timeline
//!   sources/cameras.json       defining camera stream (intrinsics + extrinsics)
//!   sources/tracks/<id>.json   per-track visibility, 2D keypoints, init params

use anyhow::{bail, Context, Result};
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// カメラの定義ストリーム (フレーム0の姿勢がワールド座標系を定める)
#[derive(Debug, Clone)]
pub struct CameraData {
    pub width: u32,
    pub height: u32,
    /// フレームごとの (fx, fy, cx, cy)
    pub intrinsics: Vec<[f32; 4]>,
    pub rotations: Vec<Matrix3<f32>>,
    pub translations: Vec<Vector3<f32>>,
}

/// "input" フェーズ合成用の初期ボディパラメータ
#[derive(Debug, Clone)]
pub struct InitParams {
    pub trans: Array2<f32>,       // (T, 3)
    pub root_orient: Array2<f32>, // (T, 3)
    pub pose_body: Array2<f32>,   // (T, 63)
    pub betas: Option<Vec<f32>>,  // (10)
}

/// 1人分のトラック。ロード後は不変
#[derive(Debug, Clone)]
pub struct TrackData {
    pub track_id: String,
    /// フレームごとの可視性コード (-1 / 0 / 1)
    pub visibility: Vec<i8>,
    /// (T, J, 3) の生キーポイント (x, y, confidence)
    pub joints2d: Array3<f32>,
    pub init: Option<InitParams>,
}

/// 1シーケンス分のデータセット
#[derive(Debug)]
pub struct MotionDataset {
    pub seq_len: usize,
    pub img_paths: Vec<PathBuf>,
    pub camera: CameraData,
    pub tracks: Vec<TrackData>,
}

// --- JSONファイル形式 ---

#[derive(Deserialize)]
struct CameraFile {
    width: u32,
    height: u32,
    frames: Vec<CameraFrame>,
}

#[derive(Deserialize)]
struct CameraFrame {
    fx: f32,
    fy: f32,
    cx: f32,
    cy: f32,
    /// 行優先の3x3回転行列
    rotation: [f32; 9],
    translation: [f32; 3],
}

#[derive(Deserialize)]
struct TrackFile {
    visibility: Vec<i8>,
    joints2d: Vec<Vec<[f32; 3]>>,
    #[serde(default)]
    init: Option<TrackInitFile>,
}

#[derive(Deserialize)]
struct TrackInitFile {
    trans: Vec<[f32; 3]>,
    root_orient: Vec<[f32; 3]>,
    pose_body: Vec<Vec<f32>>,
    #[serde(default)]
    betas: Option<Vec<f32>>,
}

impl MotionDataset {
    /// ソースディレクトリからシーケンスを読み込む
    ///
    /// 画像・カメラ・全トラックのフレーム数が一致しない場合はエラー。
    pub fn load(sources: &Path) -> Result<Self> {
        let img_paths = list_images(&sources.join("images"))?;
        let camera = load_camera(&sources.join("cameras.json"))?;
        let tracks = load_tracks(&sources.join("tracks"))?;

        let seq_len = img_paths.len();
        if seq_len == 0 {
            bail!("no frame images in {}", sources.display());
        }
        if camera.translations.len() != seq_len {
            bail!(
                "camera stream has {} frames, expected {}",
                camera.translations.len(),
                seq_len
            );
        }
        for track in &tracks {
            if track.visibility.len() != seq_len || track.joints2d.shape()[0] != seq_len {
                bail!(
                    "track {} has mismatched frame count (visibility {}, joints2d {}, expected {})",
                    track.track_id,
                    track.visibility.len(),
                    track.joints2d.shape()[0],
                    seq_len
                );
            }
        }

        Ok(Self {
            seq_len,
            img_paths,
            camera,
            tracks,
        })
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list images in {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if matches!(ext.as_deref(), Some("jpg" | "jpeg" | "png")) {
            paths.push(path);
        }
    }
    // ファイル名の辞書順 = タイムライン順
    paths.sort();
    Ok(paths)
}

fn load_camera(path: &Path) -> Result<CameraData> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read camera file {}", path.display()))?;
    let file: CameraFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse camera file {}", path.display()))?;

    let mut intrinsics = Vec::with_capacity(file.frames.len());
    let mut rotations = Vec::with_capacity(file.frames.len());
    let mut translations = Vec::with_capacity(file.frames.len());
    for frame in &file.frames {
        intrinsics.push([frame.fx, frame.fy, frame.cx, frame.cy]);
        rotations.push(Matrix3::from_row_slice(&frame.rotation));
        translations.push(Vector3::from_column_slice(&frame.translation));
    }

    Ok(CameraData {
        width: file.width,
        height: file.height,
        intrinsics,
        rotations,
        translations,
    })
}

fn load_tracks(dir: &Path) -> Result<Vec<TrackData>> {
    let mut files: Vec<PathBuf> = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list tracks in {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    // トラックIDの辞書順で安定したインデックス付け
    files.sort();

    let mut tracks = Vec::with_capacity(files.len());
    for path in files {
        let track_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read track file {}", path.display()))?;
        let file: TrackFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse track file {}", path.display()))?;
        tracks.push(build_track(track_id, file)?);
    }
    Ok(tracks)
}

fn build_track(track_id: String, file: TrackFile) -> Result<TrackData> {
    let num_frames = file.joints2d.len();
    let num_joints = file.joints2d.first().map(|f| f.len()).unwrap_or(0);
    if num_frames > 0 && num_joints < crate::skeleton::RAW_JOINT_COUNT {
        bail!(
            "track {}: {} joints per frame, skeleton extraction needs at least {}",
            track_id,
            num_joints,
            crate::skeleton::RAW_JOINT_COUNT
        );
    }

    let mut flat = Vec::with_capacity(num_frames * num_joints * 3);
    for (frame_id, frame) in file.joints2d.iter().enumerate() {
        if frame.len() != num_joints {
            bail!(
                "track {}: frame {} has {} joints, expected {}",
                track_id,
                frame_id,
                frame.len(),
                num_joints
            );
        }
        for joint in frame {
            flat.extend_from_slice(joint);
        }
    }
    let joints2d = Array3::from_shape_vec((num_frames, num_joints, 3), flat)
        .with_context(|| format!("track {}: bad joints2d shape", track_id))?;

    let init = match file.init {
        Some(init) => Some(build_init(&track_id, init, num_frames)?),
        None => None,
    };

    Ok(TrackData {
        track_id,
        visibility: file.visibility,
        joints2d,
        init,
    })
}

fn build_init(track_id: &str, init: TrackInitFile, num_frames: usize) -> Result<InitParams> {
    if init.trans.len() != num_frames
        || init.root_orient.len() != num_frames
        || init.pose_body.len() != num_frames
    {
        bail!("track {}: init params do not cover all frames", track_id);
    }

    let trans = rows_to_array2(&init.trans);
    let root_orient = rows_to_array2(&init.root_orient);

    let pose_dim = init.pose_body.first().map(|p| p.len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(num_frames * pose_dim);
    for (frame_id, pose) in init.pose_body.iter().enumerate() {
        if pose.len() != pose_dim {
            bail!(
                "track {}: frame {} pose_body has {} values, expected {}",
                track_id,
                frame_id,
                pose.len(),
                pose_dim
            );
        }
        flat.extend_from_slice(pose);
    }
    let pose_body = Array2::from_shape_vec((num_frames, pose_dim), flat)
        .with_context(|| format!("track {}: bad pose_body shape", track_id))?;

    Ok(InitParams {
        trans,
        root_orient,
        pose_body,
        betas: init.betas,
    })
}

fn rows_to_array2(rows: &[[f32; 3]]) -> Array2<f32> {
    let mut flat = Vec::with_capacity(rows.len() * 3);
    for row in rows {
        flat.extend_from_slice(row);
    }
    // rows.len() * 3 と一致するため失敗しない
    Array2::from_shape_vec((rows.len(), 3), flat).unwrap()
}
