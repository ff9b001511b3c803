//! Per-(track, frame) visibility gating.

/// 可視性コード: フレーム外
pub const OUT_OF_FRAME: i8 = -1;
/// 可視性コード: 遮蔽中
pub const OCCLUDED: i8 = 0;
/// 可視性コード: 可視
pub const VISIBLE: i8 = 1;

/// メッシュをログするか、明示的にクリアするか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderDecision {
    Render,
    Clear,
}

/// 可視性コードからレンダリング判定を返す
///
/// コード >= 0 でレンダリング。遮蔽中 (0) も可視 (1) と同一に描画し、
/// フレーム外 (-1) のみ抑制する。この非対称は仕様であり変更しないこと。
pub fn decide(code: i8) -> RenderDecision {
    if code >= 0 {
        RenderDecision::Render
    } else {
        RenderDecision::Clear
    }
}
