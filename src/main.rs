use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use mocap_replay::launch;
use mocap_replay::RenderOptions;

/// 再構築結果のバッチレンダラ
///
/// 結果ルート以下の完了済みランを探し、ランごとに log.rrd を書き出す。
#[derive(Parser, Debug)]
#[command(version = env!("GIT_VERSION"), about)]
struct Args {
    /// 結果ルートディレクトリ
    #[arg(long)]
    log_root: PathBuf,

    /// 出力ルート。未指定なら各ランのディレクトリに保存
    #[arg(long)]
    save_root: Option<PathBuf>,

    /// レンダリングするフェーズ名 (指定順)
    #[arg(long, num_args = 0.., default_values_t = vec!["motion_chunks".to_string()])]
    phases: Vec<String>,

    /// 使用するGPUデバイスID。複数指定で並列レンダリング
    #[arg(long, num_args = 0.., default_values_t = vec![0u32])]
    devices: Vec<u32>,

    /// カメラビュー選択 (オフラインレンダラ互換。rrd出力では無効)
    #[arg(long = "render-views", num_args = 0..)]
    render_views: Vec<String>,

    /// 2Dキーポイントオーバーレイを出力しない (既定は出力する)
    #[arg(long)]
    no_render_kps: bool,

    /// レイヤー分割レンダリング (オフラインレンダラ互換。rrd出力では無効)
    #[arg(long)]
    render_layers: bool,

    /// フレーム画像の個別書き出し (オフラインレンダラ互換。rrd出力では無効)
    #[arg(long)]
    save_frames: bool,

    /// 累積モード (オフラインレンダラ互換。rrd出力では無効)
    #[arg(long)]
    accumulate: bool,

    /// フェーズごとに独立したカメラパスを使う
    /// (既定では全フェーズが共有カメラパスに書き last-wins)
    #[arg(long)]
    camera_per_phase: bool,

    /// 既存の log.rrd を上書きする
    #[arg(short = 'y', long)]
    overwrite: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    println!("mocap-replay ({})", env!("GIT_VERSION"));

    for (flag, set) in [
        ("--render-views", !args.render_views.is_empty()),
        ("--render-layers", args.render_layers),
        ("--save-frames", args.save_frames),
        ("--accumulate", args.accumulate),
    ] {
        if set {
            println!("note: {flag} has no effect on rrd output");
        }
    }

    let options = RenderOptions {
        phases: args.phases,
        render_kps: !args.no_render_kps,
        overwrite: args.overwrite,
        camera_per_phase: args.camera_per_phase,
    };

    let failed = launch::render_all(
        &args.log_root,
        args.save_root.as_deref(),
        &args.devices,
        &options,
    )?;

    if failed > 0 {
        eprintln!("{failed} runs failed");
        std::process::exit(1);
    }
    Ok(())
}
