//! Scene timeline orchestration: drives dataset, phases, body model, and
//! sink for one log directory and persists the recording.
//!
//! Per-run sequence: world coordinate convention, raw input frames, 2D
//! skeleton overlays, defining camera trajectory, then each requested phase
//! (posed meshes + that phase's own camera stream), then persist. Within a
//! frame the camera pose is logged before any geometry referencing the same
//! timeline key.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::body_model::{BodyModel, MeshBatch, OnnxBodyModel};
use crate::config::RunConfig;
use crate::dataset::{CameraData, MotionDataset};
use crate::mesh;
use crate::phase::{self, PhaseResult};
use crate::rotation;
use crate::sink::{RecordingSink, Sink};
use crate::skeleton::{self, SkeletonFrame};
use crate::timeline::{self, TimelineKey};
use crate::visibility::{self, RenderDecision};

/// 記録のアプリケーションID
pub const APP_ID: &str = "mocap_replay";

/// 出力ファイル名 (save_dir 直下)
pub const RECORDING_FILE: &str = "log.rrd";

/// 定義カメラのエンティティパス
pub const CAMERA_PATH: &str = "world/camera";

/// 入力フレーム画像のエンティティパス
pub const CAMERA_IMAGE_PATH: &str = "world/camera/image";

pub fn skeleton_path(track: usize) -> String {
    format!("world/camera/image/skeleton/track_{track}")
}

pub fn mesh_path(phase: &str, track: usize) -> String {
    format!("world/phase_{phase}/track_{track}")
}

pub fn phase_camera_path(phase: &str) -> String {
    format!("world/camera_{phase}")
}

/// 1ランのレンダリングオプション
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// レンダリングするフェーズ名 (指定順に処理)
    pub phases: Vec<String>,
    /// 2Dキーポイントオーバーレイを出力するか
    pub render_kps: bool,
    /// 既存の log.rrd があるランを再レンダリングするか
    pub overwrite: bool,
    /// フェーズごとに独立したカメラパスを使うか
    ///
    /// false (既定) では全フェーズが共有の world/camera に書き込み、
    /// 最後に処理されたフェーズのカメラ軌跡だけが見える (last-wins)。
    pub camera_per_phase: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            phases: vec!["motion_chunks".to_string()],
            render_kps: true,
            overwrite: false,
            camera_per_phase: false,
        }
    }
}

/// ランの処理結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Rendered,
    /// トラックが1つも無い (ラン全体をスキップ)
    SkippedNoTracks,
    /// 出力が既に存在し overwrite 指定なし
    SkippedExisting,
}

/// 1 (フレーム, トラック) ごとのレンダリング判定
///
/// 判定はメッシュをログする直前に毎回、トラック独立に評価する。
pub fn plan_frame<'a>(
    visibility: impl IntoIterator<Item = &'a [i8]>,
    frame: usize,
) -> Vec<(usize, RenderDecision)> {
    visibility
        .into_iter()
        .enumerate()
        .map(|(i, mask)| (i, visibility::decide(mask[frame])))
        .collect()
}

/// 1ランをレンダリングして記録を保存する
pub fn render_run(
    run_dir: &Path,
    save_dir: &Path,
    device: Option<u32>,
    options: &RenderOptions,
) -> Result<RunOutcome> {
    let config = RunConfig::load(run_dir)?;
    let dataset = MotionDataset::load(&config.sources_dir(run_dir))
        .with_context(|| format!("failed to load dataset for {}", run_dir.display()))?;

    if dataset.num_tracks() == 0 {
        return Ok(RunOutcome::SkippedNoTracks);
    }

    let recording_path = save_dir.join(RECORDING_FILE);
    if recording_path.exists() && !options.overwrite {
        return Ok(RunOutcome::SkippedExisting);
    }

    // ボディモデルはラン内で一度だけロードし全フェーズで再利用する
    let mut model = OnnxBodyModel::new(
        config.model_path(run_dir),
        device,
        config.body_model.batch_size,
    )?;

    fs::create_dir_all(save_dir)
        .with_context(|| format!("failed to create {}", save_dir.display()))?;
    let sink = RecordingSink::create(APP_ID, &recording_path)?;

    match log_run(&dataset, &mut model, &sink, run_dir, options) {
        Ok(()) => {
            sink.finish()?;
            Ok(RunOutcome::Rendered)
        }
        Err(e) => {
            sink.discard();
            Err(e)
        }
    }
}

fn log_run(
    dataset: &MotionDataset,
    model: &mut dyn BodyModel,
    sink: &dyn Sink,
    log_dir: &Path,
    options: &RenderOptions,
) -> Result<()> {
    sink.log_world_coordinates()?;

    log_input_frames(dataset, sink)?;
    if options.render_kps {
        log_skeleton_2d(dataset, sink)?;
    }
    log_camera(&dataset.camera, dataset.seq_len, sink)?;

    for phase_name in &options.phases {
        match phase::resolve(phase_name, log_dir, dataset)? {
            Some(result) => {
                println!("{}", phase_label(&result));
                log_phase(dataset, model, sink, &result, options)?;
            }
            None => {
                // フェーズディレクトリ不在は非致命。診断を出して続行
                println!("{} does not exist, skipping", log_dir.join(phase_name).display());
            }
        }
    }

    Ok(())
}

/// どのスナップショットをレンダリングするかの診断行
fn phase_label(result: &PhaseResult) -> String {
    format!("phase {} (snapshot {})", result.name, result.iteration)
}

/// 生の入力フレームをログする
fn log_input_frames(dataset: &MotionDataset, sink: &dyn Sink) -> Result<()> {
    for (frame_id, img_path) in dataset.img_paths.iter().enumerate() {
        sink.log_image_file(CAMERA_IMAGE_PATH, TimelineKey::new(frame_id), img_path)?;
    }
    Ok(())
}

/// 全トラックの2D骨格オーバーレイをログする
///
/// 各 (トラック, フレーム) で必ず1イベント (線分群 or クリア) を出力する。
/// 全フレーム不可視のトラックもフレームごとにクリアされる。
fn log_skeleton_2d(dataset: &MotionDataset, sink: &dyn Sink) -> Result<()> {
    for (i, track) in dataset.tracks.iter().enumerate() {
        let entity = skeleton_path(i);
        for frame_id in 0..dataset.seq_len {
            let key = TimelineKey::new(frame_id);
            let joints = track.joints2d.slice(ndarray::s![frame_id, .., ..]);
            match skeleton::extract_segments(joints) {
                SkeletonFrame::Segments(segments) => {
                    sink.log_line_segments(&entity, key, &segments)?
                }
                SkeletonFrame::Clear => sink.clear(&entity, key)?,
            }
        }
    }
    Ok(())
}

/// 定義カメラの軌跡をログする (フェーズと独立に一度だけ)
fn log_camera(camera: &CameraData, seq_len: usize, sink: &dyn Sink) -> Result<()> {
    for key in timeline::keys(seq_len) {
        let frame_id = key.sequence() as usize;
        sink.log_pinhole(
            CAMERA_IMAGE_PATH,
            key,
            camera.intrinsics[frame_id],
            camera.width,
            camera.height,
        )?;
        let t = camera.translations[frame_id];
        let q = rotation::quaternion_xyzw(&camera.rotations[frame_id]);
        sink.log_transform(CAMERA_PATH, key, [t.x, t.y, t.z], q)?;
    }
    Ok(())
}

/// 1フェーズ分: ボディモデルを一括評価し、フレームごとにカメラ姿勢と
/// 可視性ゲート済みメッシュをログする
fn log_phase(
    dataset: &MotionDataset,
    model: &mut dyn BodyModel,
    sink: &dyn Sink,
    result: &PhaseResult,
    options: &RenderOptions,
) -> Result<()> {
    // フェーズ単位の一括評価 (フレーム単位の再評価はしない)
    let meshes: MeshBatch = model
        .evaluate(&result.params)
        .with_context(|| format!("body model evaluation failed for phase {}", result.name))?;
    let faces = mesh::triangles(meshes.faces.view());

    let camera_entity = if options.camera_per_phase {
        phase_camera_path(&result.name)
    } else {
        CAMERA_PATH.to_string()
    };

    for key in timeline::keys(dataset.seq_len) {
        let frame_id = key.sequence() as usize;

        // 先にカメラ姿勢 (pose-before-geometry)
        let t = result.cam_translations[frame_id];
        let q = rotation::quaternion_xyzw(&result.cam_rotations[frame_id]);
        sink.log_transform(&camera_entity, key, [t.x, t.y, t.z], q)?;

        let masks = dataset.tracks.iter().map(|track| track.visibility.as_slice());
        for (i, decision) in plan_frame(masks, frame_id) {
            let entity = mesh_path(&result.name, i);
            match decision {
                RenderDecision::Render => {
                    let verts = meshes.track_frame(i, frame_id);
                    let normals = mesh::vertex_normals(verts, meshes.faces.view());
                    sink.log_mesh(&entity, key, mesh::positions(verts), faces.clone(), normals)?;
                }
                RenderDecision::Clear => sink.clear(&entity, key)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body_model::PoseBatch;
    use crate::dataset::{InitParams, TrackData};
    use crate::visibility::RenderDecision::{Clear, Render};
    use nalgebra::{Matrix3, Vector3};
    use ndarray::{array, Array2, Array3, Array4};
    use std::cell::RefCell;
    use std::path::PathBuf;

    #[test]
    fn test_plan_frame_two_tracks() {
        // トラック0: [1, -1, 0] / トラック1: [-1, 1, 1]
        let track0: Vec<i8> = vec![1, -1, 0];
        let track1: Vec<i8> = vec![-1, 1, 1];
        let masks = || vec![track0.as_slice(), track1.as_slice()];

        assert_eq!(plan_frame(masks(), 0), vec![(0, Render), (1, Clear)]);
        assert_eq!(plan_frame(masks(), 1), vec![(0, Clear), (1, Render)]);
        assert_eq!(plan_frame(masks(), 2), vec![(0, Render), (1, Render)]);
    }

    #[test]
    fn test_plan_frame_decisions_per_track_per_frame() {
        // 全フレーム不可視のトラックも毎フレーム判定される
        let track: Vec<i8> = vec![-1, -1, -1];
        for frame in 0..3 {
            assert_eq!(
                plan_frame(vec![track.as_slice()], frame),
                vec![(0, Clear)]
            );
        }
    }

    #[test]
    fn test_entity_paths() {
        assert_eq!(skeleton_path(2), "world/camera/image/skeleton/track_2");
        assert_eq!(mesh_path("motion_chunks", 0), "world/phase_motion_chunks/track_0");
        assert_eq!(phase_camera_path("input"), "world/camera_input");
    }

    #[test]
    fn test_default_options() {
        let options = RenderOptions::default();
        assert_eq!(options.phases, vec!["motion_chunks".to_string()]);
        assert!(options.render_kps);
        assert!(!options.overwrite);
        assert!(!options.camera_per_phase);
    }

    // --- log_run の出力イベント検証 ---

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Coordinates,
        Image { frame: i64 },
        Pinhole { frame: i64 },
        Transform { entity: String, frame: i64 },
        Mesh { entity: String, frame: i64 },
        Segments { entity: String, frame: i64, count: usize },
        Clear { entity: String, frame: i64 },
    }

    /// 発行されたイベントを順番通りに記録するシンク
    #[derive(Default)]
    struct EventLog {
        events: RefCell<Vec<Event>>,
    }

    impl EventLog {
        fn push(&self, event: Event) {
            self.events.borrow_mut().push(event);
        }
    }

    impl Sink for EventLog {
        fn log_world_coordinates(&self) -> Result<()> {
            self.push(Event::Coordinates);
            Ok(())
        }

        fn log_image_file(&self, _entity: &str, key: TimelineKey, _path: &Path) -> Result<()> {
            self.push(Event::Image { frame: key.sequence() });
            Ok(())
        }

        fn log_pinhole(
            &self,
            _entity: &str,
            key: TimelineKey,
            _intrinsics: [f32; 4],
            _width: u32,
            _height: u32,
        ) -> Result<()> {
            self.push(Event::Pinhole { frame: key.sequence() });
            Ok(())
        }

        fn log_transform(
            &self,
            entity: &str,
            key: TimelineKey,
            _translation: [f32; 3],
            _quaternion_xyzw: [f32; 4],
        ) -> Result<()> {
            self.push(Event::Transform {
                entity: entity.to_string(),
                frame: key.sequence(),
            });
            Ok(())
        }

        fn log_mesh(
            &self,
            entity: &str,
            key: TimelineKey,
            _vertices: Vec<[f32; 3]>,
            _faces: Vec<[u32; 3]>,
            _normals: Vec<[f32; 3]>,
        ) -> Result<()> {
            self.push(Event::Mesh {
                entity: entity.to_string(),
                frame: key.sequence(),
            });
            Ok(())
        }

        fn log_line_segments(
            &self,
            entity: &str,
            key: TimelineKey,
            segments: &[[[f32; 2]; 2]],
        ) -> Result<()> {
            self.push(Event::Segments {
                entity: entity.to_string(),
                frame: key.sequence(),
                count: segments.len(),
            });
            Ok(())
        }

        fn clear(&self, entity: &str, key: TimelineKey) -> Result<()> {
            self.push(Event::Clear {
                entity: entity.to_string(),
                frame: key.sequence(),
            });
            Ok(())
        }
    }

    /// バッチ形状だけ本物に合わせた平坦メッシュを返すモデル
    struct FlatBodyModel;

    impl BodyModel for FlatBodyModel {
        fn evaluate(&mut self, batch: &PoseBatch) -> Result<MeshBatch> {
            Ok(MeshBatch {
                vertices: Array4::zeros((batch.num_tracks(), batch.num_frames(), 3, 3)),
                faces: array![[0u32, 1, 2]],
            })
        }
    }

    fn test_track(track_id: &str, visibility: Vec<i8>, confident_frame: Option<usize>) -> TrackData {
        let seq_len = visibility.len();
        let mut joints2d = Array3::zeros((seq_len, skeleton::RAW_JOINT_COUNT, 3));
        if let Some(frame) = confident_frame {
            for j in 0..skeleton::RAW_JOINT_COUNT {
                joints2d[[frame, j, 0]] = j as f32;
                joints2d[[frame, j, 1]] = j as f32 + 1.0;
                joints2d[[frame, j, 2]] = 0.9;
            }
        }
        TrackData {
            track_id: track_id.to_string(),
            visibility,
            joints2d,
            init: Some(InitParams {
                trans: Array2::zeros((seq_len, 3)),
                root_orient: Array2::zeros((seq_len, 3)),
                pose_body: Array2::zeros((seq_len, 63)),
                betas: None,
            }),
        }
    }

    /// 3フレーム2トラック。トラック0は可視性 [1, -1, 0] で関節信頼度ゼロ、
    /// トラック1は [-1, 1, 1] でフレーム1のみ高信頼の関節を持つ。
    fn test_dataset() -> MotionDataset {
        let seq_len = 3;
        MotionDataset {
            seq_len,
            img_paths: (0..seq_len)
                .map(|i| PathBuf::from(format!("frame_{i:06}.jpg")))
                .collect(),
            camera: CameraData {
                width: 640,
                height: 360,
                intrinsics: vec![[500.0, 500.0, 320.0, 180.0]; seq_len],
                rotations: vec![Matrix3::identity(); seq_len],
                translations: vec![Vector3::zeros(); seq_len],
            },
            tracks: vec![
                test_track("0001", vec![1, -1, 0], None),
                test_track("0002", vec![-1, 1, 1], Some(1)),
            ],
        }
    }

    /// input フェーズは log_dir に触れないため、存在しないパスで十分
    fn input_options() -> RenderOptions {
        RenderOptions {
            phases: vec![phase::INPUT_PHASE.to_string()],
            ..RenderOptions::default()
        }
    }

    fn run_with(options: &RenderOptions) -> Vec<Event> {
        let dataset = test_dataset();
        let sink = EventLog::default();
        let mut model = FlatBodyModel;
        log_run(&dataset, &mut model, &sink, Path::new("unused_log_dir"), options).unwrap();
        sink.events.into_inner()
    }

    #[test]
    fn test_log_run_preamble() {
        let events = run_with(&input_options());
        assert_eq!(events[0], Event::Coordinates);
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::Image { .. })).count(),
            3
        );
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::Pinhole { .. })).count(),
            3
        );
    }

    #[test]
    fn test_log_run_gates_meshes_by_visibility() {
        let events = run_with(&input_options());
        let mesh_events: Vec<(String, i64, bool)> = events
            .iter()
            .filter_map(|e| match e {
                Event::Mesh { entity, frame } if entity.starts_with("world/phase_input/") => {
                    Some((entity.clone(), *frame, true))
                }
                Event::Clear { entity, frame } if entity.starts_with("world/phase_input/") => {
                    Some((entity.clone(), *frame, false))
                }
                _ => None,
            })
            .collect();

        // フレーム外 (-1) だけがクリアになり、遮蔽 (0) はメッシュを出す
        let expected = vec![
            (mesh_path("input", 0), 0, true),
            (mesh_path("input", 1), 0, false),
            (mesh_path("input", 0), 1, false),
            (mesh_path("input", 1), 1, true),
            (mesh_path("input", 0), 2, true),
            (mesh_path("input", 1), 2, true),
        ];
        assert_eq!(mesh_events, expected);
    }

    #[test]
    fn test_log_run_skeleton_event_every_frame() {
        let events = run_with(&input_options());
        let t0 = skeleton_path(0);
        let t1 = skeleton_path(1);
        let for_entity = |target: &str| -> Vec<Event> {
            events
                .iter()
                .filter(|e| {
                    matches!(e,
                        Event::Segments { entity, .. } | Event::Clear { entity, .. }
                            if entity == target)
                })
                .cloned()
                .collect()
        };

        // 信頼度が全フレームゼロのトラックもフレームごとに必ずクリアされる
        assert_eq!(
            for_entity(&t0),
            vec![
                Event::Clear { entity: t0.clone(), frame: 0 },
                Event::Clear { entity: t0.clone(), frame: 1 },
                Event::Clear { entity: t0.clone(), frame: 2 },
            ]
        );
        assert_eq!(
            for_entity(&t1),
            vec![
                Event::Clear { entity: t1.clone(), frame: 0 },
                Event::Segments {
                    entity: t1.clone(),
                    frame: 1,
                    count: skeleton::SKELETON_EDGES.len(),
                },
                Event::Clear { entity: t1.clone(), frame: 2 },
            ]
        );
    }

    #[test]
    fn test_log_run_camera_pose_precedes_frame_geometry() {
        let events = run_with(&input_options());
        for frame in 0..3i64 {
            let first_geom = events
                .iter()
                .position(|e| {
                    matches!(e,
                        Event::Mesh { entity, frame: f } | Event::Clear { entity, frame: f }
                            if entity.starts_with("world/phase_input/") && *f == frame)
                })
                .unwrap();
            assert!(matches!(
                &events[first_geom - 1],
                Event::Transform { entity, frame: f } if entity == CAMERA_PATH && *f == frame
            ));
        }
    }

    #[test]
    fn test_log_run_camera_per_phase_entity() {
        let options = RenderOptions {
            camera_per_phase: true,
            ..input_options()
        };
        let events = run_with(&options);
        let phase_cam = phase_camera_path("input");
        let count = events
            .iter()
            .filter(|e| matches!(e, Event::Transform { entity, .. } if *entity == phase_cam))
            .count();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_log_run_without_keypoint_overlay() {
        let options = RenderOptions {
            render_kps: false,
            ..input_options()
        };
        let events = run_with(&options);
        assert!(!events.iter().any(|e| matches!(e, Event::Segments { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Clear { entity, .. } if entity.contains("skeleton"))));
    }

    #[test]
    fn test_phase_label_names_snapshot() {
        let dataset = test_dataset();
        let result = phase::resolve("input", Path::new("unused"), &dataset)
            .unwrap()
            .unwrap();
        assert_eq!(phase_label(&result), "phase input (snapshot 000000)");
    }
}
