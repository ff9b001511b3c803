use ndarray::ArrayView2;

/// 正規化後 (COCO-17) のキーポイントインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;
}

/// 検出器の生の関節順 (OpenPose系25関節の先頭) から COCO-17 への並び替えテーブル
///
/// `canonical[i] = raw[RAW_TO_CANONICAL[i]]`。検出器側と骨格定義側で
/// 関節順が異なるため、エッジ適用前に必ずこの表で正規化する。
pub const RAW_TO_CANONICAL: [usize; KeypointIndex::COUNT] = [
    0, 16, 15, 18, 17, 5, 2, 6, 3, 7, 4, 12, 9, 13, 10, 14, 11,
];

/// 並び替えに必要な生関節数の下限 (RAW_TO_CANONICAL の最大インデックス + 1)
pub const RAW_JOINT_COUNT: usize = 19;

/// 解剖学的な骨格エッジの定義 (正規化後インデックスのペア)
pub const SKELETON_EDGES: [(KeypointIndex, KeypointIndex); 19] = [
    // 下半身
    (KeypointIndex::LeftAnkle, KeypointIndex::LeftKnee),
    (KeypointIndex::LeftKnee, KeypointIndex::LeftHip),
    (KeypointIndex::RightAnkle, KeypointIndex::RightKnee),
    (KeypointIndex::RightKnee, KeypointIndex::RightHip),
    // 胴体
    (KeypointIndex::LeftHip, KeypointIndex::RightHip),
    (KeypointIndex::LeftShoulder, KeypointIndex::LeftHip),
    (KeypointIndex::RightShoulder, KeypointIndex::RightHip),
    (KeypointIndex::LeftShoulder, KeypointIndex::RightShoulder),
    // 腕
    (KeypointIndex::LeftShoulder, KeypointIndex::LeftElbow),
    (KeypointIndex::RightShoulder, KeypointIndex::RightElbow),
    (KeypointIndex::LeftElbow, KeypointIndex::LeftWrist),
    (KeypointIndex::RightElbow, KeypointIndex::RightWrist),
    // 顔
    (KeypointIndex::LeftEye, KeypointIndex::RightEye),
    (KeypointIndex::Nose, KeypointIndex::LeftEye),
    (KeypointIndex::Nose, KeypointIndex::RightEye),
    (KeypointIndex::LeftEye, KeypointIndex::LeftEar),
    (KeypointIndex::RightEye, KeypointIndex::RightEar),
    (KeypointIndex::LeftEar, KeypointIndex::LeftShoulder),
    (KeypointIndex::RightEar, KeypointIndex::RightShoulder),
];

/// セグメント信頼度の閾値。min(両端の信頼度) がこの値より大きい場合のみ採用
/// (ちょうど閾値のセグメントは除外: 厳密な `>` 比較)
pub const SEGMENT_CONFIDENCE_THRESHOLD: f32 = 0.3;

/// 1フレーム分の骨格オーバーレイ出力
#[derive(Debug, Clone, PartialEq)]
pub enum SkeletonFrame {
    /// 2D線分のリスト (各要素は [始点, 終点])
    Segments(Vec<[[f32; 2]; 2]>),
    /// 有効なセグメントなし。明示的なクリアを出力する
    Clear,
}

/// 生のキーポイント検出から解剖学的な線分を抽出する
///
/// `frame_joints` は (J, 3) で各行が (x, y, confidence)、J >= RAW_JOINT_COUNT。
/// 全セグメントが閾値を下回るフレームは Clear を返す。呼び出し側は各
/// (トラック, フレーム) ごとに必ず1イベント (線分群 or クリア) を出力すること。
pub fn extract_segments(frame_joints: ArrayView2<f32>) -> SkeletonFrame {
    assert!(
        frame_joints.nrows() >= RAW_JOINT_COUNT && frame_joints.ncols() == 3,
        "expected (J >= {}, 3) keypoints, got {:?}",
        RAW_JOINT_COUNT,
        frame_joints.shape()
    );

    let mut segments = Vec::with_capacity(SKELETON_EDGES.len());
    for &(a, b) in SKELETON_EDGES.iter() {
        let ja = RAW_TO_CANONICAL[a as usize];
        let jb = RAW_TO_CANONICAL[b as usize];
        let conf = frame_joints[[ja, 2]].min(frame_joints[[jb, 2]]);
        if conf > SEGMENT_CONFIDENCE_THRESHOLD {
            segments.push([
                [frame_joints[[ja, 0]], frame_joints[[ja, 1]]],
                [frame_joints[[jb, 0]], frame_joints[[jb, 1]]],
            ]);
        }
    }

    if segments.is_empty() {
        SkeletonFrame::Clear
    } else {
        SkeletonFrame::Segments(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// 全関節を同じ信頼度にしたダミーフレーム
    fn uniform_frame(confidence: f32) -> Array2<f32> {
        let mut joints = Array2::zeros((RAW_JOINT_COUNT, 3));
        for j in 0..RAW_JOINT_COUNT {
            joints[[j, 0]] = j as f32;
            joints[[j, 1]] = j as f32 * 2.0;
            joints[[j, 2]] = confidence;
        }
        joints
    }

    #[test]
    fn test_remap_table_bounds() {
        for &raw in RAW_TO_CANONICAL.iter() {
            assert!(raw < RAW_JOINT_COUNT);
        }
    }

    #[test]
    fn test_all_confident_yields_all_edges() {
        let frame = uniform_frame(0.9);
        match extract_segments(frame.view()) {
            SkeletonFrame::Segments(segs) => assert_eq!(segs.len(), SKELETON_EDGES.len()),
            SkeletonFrame::Clear => panic!("expected segments"),
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        // ちょうど 0.3 は除外、僅かに上回れば採用
        let at = uniform_frame(SEGMENT_CONFIDENCE_THRESHOLD);
        assert_eq!(extract_segments(at.view()), SkeletonFrame::Clear);

        let above = uniform_frame(SEGMENT_CONFIDENCE_THRESHOLD + 0.00001);
        match extract_segments(above.view()) {
            SkeletonFrame::Segments(segs) => assert_eq!(segs.len(), SKELETON_EDGES.len()),
            SkeletonFrame::Clear => panic!("expected segments just above threshold"),
        }
    }

    #[test]
    fn test_segment_confidence_is_min_of_endpoints() {
        // 片端だけ低信頼度にすると、その関節を含むエッジだけ落ちる
        let mut frame = uniform_frame(0.9);
        let raw_left_ankle = RAW_TO_CANONICAL[KeypointIndex::LeftAnkle as usize];
        frame[[raw_left_ankle, 2]] = 0.0;

        match extract_segments(frame.view()) {
            SkeletonFrame::Segments(segs) => {
                let dropped = SKELETON_EDGES
                    .iter()
                    .filter(|&&(a, b)| {
                        a == KeypointIndex::LeftAnkle || b == KeypointIndex::LeftAnkle
                    })
                    .count();
                assert_eq!(segs.len(), SKELETON_EDGES.len() - dropped);
            }
            SkeletonFrame::Clear => panic!("expected remaining segments"),
        }
    }

    #[test]
    fn test_empty_frame_clears() {
        let frame = uniform_frame(0.0);
        assert_eq!(extract_segments(frame.view()), SkeletonFrame::Clear);
    }

    #[test]
    fn test_segments_use_remapped_coordinates() {
        let frame = uniform_frame(1.0);
        let segs = match extract_segments(frame.view()) {
            SkeletonFrame::Segments(s) => s,
            SkeletonFrame::Clear => panic!("expected segments"),
        };
        // 最初のエッジは LeftAnkle-LeftKnee。座標は生インデックス由来のはず
        let raw_ankle = RAW_TO_CANONICAL[KeypointIndex::LeftAnkle as usize] as f32;
        let raw_knee = RAW_TO_CANONICAL[KeypointIndex::LeftKnee as usize] as f32;
        assert_eq!(segs[0][0], [raw_ankle, raw_ankle * 2.0]);
        assert_eq!(segs[0][1], [raw_knee, raw_knee * 2.0]);
    }
}
