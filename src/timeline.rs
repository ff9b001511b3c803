//! Shared per-frame timeline key.
//!
//! Every logged entity (camera, mesh, skeleton, raw image) is tagged with the
//! same sequence timeline so the recording scrubs in lockstep. The key is
//! passed explicitly to every sink call; there is no implicit "current frame".

/// 記録内のシーケンスタイムライン名
pub const TIMELINE: &str = "input_frame_id";

/// フレームインデックス `[0, seq_len)` に対応するタイムラインキー
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimelineKey(i64);

impl TimelineKey {
    pub fn new(frame_id: usize) -> Self {
        Self(frame_id as i64)
    }

    /// シーケンス値 (rerun の set_time_sequence へ渡す)
    pub fn sequence(self) -> i64 {
        self.0
    }
}

impl From<usize> for TimelineKey {
    fn from(frame_id: usize) -> Self {
        Self::new(frame_id)
    }
}

/// `[0, seq_len)` のキーを昇順で返す
pub fn keys(seq_len: usize) -> impl Iterator<Item = TimelineKey> {
    (0..seq_len).map(TimelineKey::new)
}
