//! Batch launcher: discovers completed runs under a results root, assigns
//! each to a device round-robin, and renders them — one worker per device
//! when several devices are supplied, sequentially in-process otherwise.
//!
//! One run's failure never aborts sibling runs; failures are counted and
//! reported at the end.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result};

use crate::config::CONFIG_CACHE_DIR;
use crate::orchestrate::{render_run, RenderOptions, RunOutcome};

/// 完了したランのディレクトリを再帰的に探す
///
/// config_cache サブディレクトリを持つディレクトリをランとみなす。
/// 結果は決定的な順序 (パスの辞書順) で返す。
pub fn find_run_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    walk(root, &mut found)
        .with_context(|| format!("failed to scan results root {}", root.display()))?;
    found.sort();
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    if dir.join(CONFIG_CACHE_DIR).is_dir() {
        found.push(dir.to_path_buf());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, found)?;
        }
    }
    Ok(())
}

/// ラウンドロビンでランにデバイスを割り当てる
pub fn assign_device(run_index: usize, devices: &[u32]) -> u32 {
    devices[run_index % devices.len()]
}

/// ランの実験名: ルートからの相対パスの先頭2要素を '-' で結合
pub fn experiment_name(run_dir: &Path, log_root: &Path) -> String {
    let relative = run_dir.strip_prefix(log_root).unwrap_or(run_dir);
    let parts: Vec<&str> = relative
        .components()
        .take(2)
        .filter_map(|c| c.as_os_str().to_str())
        .collect();
    if parts.is_empty() {
        "run".to_string()
    } else {
        parts.join("-")
    }
}

/// ランの出力先を決める。save_root 未指定ならランディレクトリそのもの
pub fn save_dir_for(run_dir: &Path, log_root: &Path, save_root: Option<&Path>) -> PathBuf {
    match save_root {
        Some(root) => root.join(experiment_name(run_dir, log_root)),
        None => run_dir.to_path_buf(),
    }
}

/// 発見した全ランをレンダリングする。戻り値は失敗したランの数
pub fn render_all(
    log_root: &Path,
    save_root: Option<&Path>,
    devices: &[u32],
    options: &RenderOptions,
) -> Result<usize> {
    let run_dirs = find_run_dirs(log_root)?;
    println!("FOUND {} runs to render", run_dirs.len());

    let failures = AtomicUsize::new(0);

    if devices.len() > 1 {
        // デバイスごとに1ワーカー。ラン i はデバイス devices[i % len] に固定
        thread::scope(|scope| {
            for (worker, &device) in devices.iter().enumerate() {
                let runs: Vec<(usize, &PathBuf)> = run_dirs
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| i % devices.len() == worker)
                    .collect();
                let failures = &failures;
                scope.spawn(move || {
                    for (_, run_dir) in runs {
                        if !process_run(run_dir, log_root, save_root, device, options) {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
    } else {
        for (i, run_dir) in run_dirs.iter().enumerate() {
            let device = assign_device(i, devices);
            if !process_run(run_dir, log_root, save_root, device, options) {
                failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    Ok(failures.into_inner())
}

fn process_run(
    run_dir: &Path,
    log_root: &Path,
    save_root: Option<&Path>,
    device: u32,
    options: &RenderOptions,
) -> bool {
    println!("{}", run_dir.display());
    let save_dir = save_dir_for(run_dir, log_root, save_root);

    match render_run(run_dir, &save_dir, Some(device), options) {
        Ok(RunOutcome::Rendered) => {
            println!("saved {}", save_dir.join(crate::orchestrate::RECORDING_FILE).display());
            true
        }
        Ok(RunOutcome::SkippedNoTracks) => {
            println!("No tracks in dataset, skipping");
            true
        }
        Ok(RunOutcome::SkippedExisting) => {
            println!("recording exists, skipping (pass --overwrite to re-render)");
            true
        }
        Err(e) => {
            eprintln!("render failed for {}: {:#}", run_dir.display(), e);
            false
        }
    }
}
