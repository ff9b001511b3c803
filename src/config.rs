use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// 完了したランを示すセンチネルディレクトリ名
pub const CONFIG_CACHE_DIR: &str = "config_cache";

/// ラン設定ファイル名 (config_cache 内)
pub const RUN_CONFIG_FILE: &str = "config.toml";

/// 1ラン分の設定 (最適化実行時に config_cache へ書き出されたもの)
///
/// 本ツールが参照するフィールドのみを明示的に列挙する。
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub body_model: BodyModelConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    /// データセットソースのディレクトリ (images/, cameras.json, tracks/)
    /// 相対パスはランディレクトリ基準
    #[serde(default = "default_sources")]
    pub sources: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BodyModelConfig {
    /// ボディモデルのONNXアセットパス。相対パスはランディレクトリ基準
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// 1回の推論に含める (トラック, フレーム) ペア数の上限。0 で無制限
    #[serde(default)]
    pub batch_size: usize,
}

fn default_sources() -> String {
    "sources".to_string()
}

fn default_model_path() -> String {
    "models/body_model.onnx".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            sources: default_sources(),
        }
    }
}

impl Default for BodyModelConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            batch_size: 0,
        }
    }
}

impl RunConfig {
    /// ランディレクトリの config_cache/config.toml を読み込む
    pub fn load(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(CONFIG_CACHE_DIR).join(RUN_CONFIG_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read run config {}", path.display()))?;
        let config: RunConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse run config {}", path.display()))?;
        Ok(config)
    }

    /// ソースディレクトリの絶対パス
    pub fn sources_dir(&self, run_dir: &Path) -> PathBuf {
        resolve(run_dir, &self.data.sources)
    }

    /// ボディモデルアセットの絶対パス
    pub fn model_path(&self, run_dir: &Path) -> PathBuf {
        resolve(run_dir, &self.body_model.model_path)
    }
}

fn resolve(run_dir: &Path, value: &str) -> PathBuf {
    let p = Path::new(value);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        run_dir.join(p)
    }
}
