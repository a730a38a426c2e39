// 系统命令：环境检查、预设与模型列表

use crate::audio::separator::check_onnx_gpu;
use crate::config::{self, ToolsConfig};
use crate::error::AppResult;
use crate::models::{self, get_available_models};
use crate::presets::Preset;
use crate::process;
use crate::utils::{resolve_tool_path, AppState, DependencyCheck, SystemInfo, ToolCommand};
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

/// 待检查的外部工具：显示名、命令、探测参数、未安装时的提示
struct ToolProbe<'a> {
    name: &'static str,
    tool: &'a ToolCommand,
    args: &'static [&'static str],
    hint: &'static str,
}

fn probes(tools: &ToolsConfig) -> Vec<ToolProbe<'_>> {
    vec![
        ToolProbe {
            name: "audio-separator",
            tool: &tools.audio_separator,
            args: &["--version"],
            hint: "请执行 pip install \"audio-separator[gpu]\"",
        },
        ToolProbe {
            name: "Demucs",
            tool: &tools.demucs,
            args: &["--help"],
            hint: "请执行 pip install demucs",
        },
        ToolProbe {
            name: "Open-Unmix",
            tool: &tools.umx,
            args: &["--help"],
            hint: "请执行 pip install openunmix",
        },
        ToolProbe {
            name: "yt-dlp",
            tool: &tools.yt_dlp,
            args: &["--version"],
            hint: "请执行 pip install yt-dlp",
        },
        ToolProbe {
            name: "FFmpeg",
            tool: &tools.ffmpeg,
            args: &["-version"],
            hint: "请安装 FFmpeg 并添加到 PATH",
        },
        ToolProbe {
            name: "FFprobe",
            tool: &tools.ffprobe,
            args: &["-version"],
            hint: "请安装 FFmpeg 并添加到 PATH",
        },
    ]
}

/// 检查单个工具
fn check_tool(probe: &ToolProbe<'_>) -> DependencyCheck {
    let path = resolve_tool_path(&probe.tool.program);
    match process::run_capture(probe.tool, probe.args) {
        Ok(output) if output.status.success() => {
            // --help 的第一行是用法说明，不作为版本
            let version = if probe.args[0].contains("version") {
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .map(|l| l.trim().to_string())
            } else {
                None
            };
            DependencyCheck {
                name: probe.name.to_string(),
                available: true,
                version,
                path: Some(path),
                message: format!("{} 已安装", probe.name),
            }
        }
        Ok(output) => {
            debug!("{} 探测失败，退出码: {:?}", probe.name, output.status.code());
            DependencyCheck {
                name: probe.name.to_string(),
                available: false,
                version: None,
                path: Some(path),
                message: format!("{} 无法运行，{}", probe.name, probe.hint),
            }
        }
        Err(e) => {
            debug!("{} 探测失败: {}", probe.name, e);
            DependencyCheck {
                name: probe.name.to_string(),
                available: false,
                version: None,
                path: None,
                message: format!("{} 未安装，{}", probe.name, probe.hint),
            }
        }
    }
}

/// 并行检查所有外部工具
pub fn check_dependencies(tools: &ToolsConfig) -> Vec<DependencyCheck> {
    probes(tools).par_iter().map(check_tool).collect()
}

/// 获取系统信息
pub fn get_system_info(tools: &ToolsConfig) -> SystemInfo {
    let cpu_threads = num_cpus::get();
    let mut cpu_cores = num_cpus::get_physical();
    if cpu_cores == 0 {
        cpu_cores = cpu_threads;
    }

    let (dependencies, onnx_gpu_available) =
        rayon::join(|| check_dependencies(tools), || check_onnx_gpu(&tools.audio_separator));

    SystemInfo {
        os: std::env::consts::OS.to_string(),
        cpu_cores,
        cpu_threads,
        onnx_gpu_available,
        dependencies,
    }
}

/// vocalsplit check
pub fn check(json: bool) -> AppResult<()> {
    let info = get_system_info(&config::get_config().tools);

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("系统: {}  CPU: {} 核 / {} 线程", info.os, info.cpu_cores, info.cpu_threads);
    println!(
        "ONNX GPU 加速: {}",
        if info.onnx_gpu_available { "可用" } else { "不可用（使用 CPU）" }
    );
    for dep in &info.dependencies {
        let mark = if dep.available { "✓" } else { "✗" };
        match &dep.version {
            Some(version) => println!("  {} {:<16} {}", mark, dep.name, version),
            None => println!("  {} {:<16} {}", mark, dep.name, dep.message),
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PresetEntry {
    name: &'static str,
    label: &'static str,
    note: &'static str,
    eta: &'static str,
    main_segment_size: u32,
    main_overlap: f32,
    hq_segment_size: u32,
    hq_overlap: f32,
}

/// vocalsplit presets
pub fn list_presets(json: bool) -> AppResult<()> {
    let default_preset = config::get_config().separation.default_preset;
    let entries: Vec<PresetEntry> = Preset::all()
        .iter()
        .map(|p| PresetEntry {
            name: p.as_str(),
            label: p.label(),
            note: p.note(),
            eta: p.eta(),
            main_segment_size: p.main().segment_size,
            main_overlap: p.main().overlap,
            hq_segment_size: p.hq().segment_size,
            hq_overlap: p.hq().overlap,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        let marker = if entry.name == default_preset { "*" } else { " " };
        println!(
            "{} {:<7} {:<19} {:<38} {}  (seg {}/{}, overlap {}/{})",
            marker,
            entry.name,
            entry.label,
            entry.note,
            entry.eta,
            entry.main_segment_size,
            entry.hq_segment_size,
            entry.main_overlap,
            entry.hq_overlap
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    #[serde(flatten)]
    info: models::ModelInfo,
    cached: bool,
}

/// vocalsplit models
pub fn list_models(state: &AppState, json: bool) -> AppResult<()> {
    let cfg = config::get_config();
    let models_dir = models::get_models_cache_dir(cfg.separation.models_dir.as_deref(), &state.app_dir);

    let entries: Vec<ModelEntry> = get_available_models()
        .into_iter()
        .map(|info| {
            let cached = models::is_model_cached(&info, &models_dir);
            ModelEntry { info, cached }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("模型缓存目录: {}", models_dir.display());
    for entry in &entries {
        let cached = if entry.cached { " [已缓存]" } else { "" };
        println!(
            "  {:<13} {:<28} {} 轨  {}{}",
            entry.info.id, entry.info.filename, entry.info.stems, entry.info.description, cached
        );
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, name: &str) -> ToolCommand {
        ToolCommand::with_args("sh", &["-c", script, name])
    }

    #[test]
    fn test_check_tool_reports_version() {
        let tool = sh("echo; echo 'yt-dlp 2026.01.01'", "yt-dlp");
        let probe = ToolProbe {
            name: "yt-dlp",
            tool: &tool,
            args: &["--version"],
            hint: "",
        };
        let check = check_tool(&probe);
        assert!(check.available);
        assert_eq!(check.version.as_deref(), Some("yt-dlp 2026.01.01"));
    }

    #[test]
    fn test_check_tool_help_has_no_version() {
        let tool = sh("echo 'usage: demucs'", "demucs");
        let probe = ToolProbe {
            name: "Demucs",
            tool: &tool,
            args: &["--help"],
            hint: "",
        };
        let check = check_tool(&probe);
        assert!(check.available);
        assert_eq!(check.version, None);
    }

    #[test]
    fn test_missing_tools_are_reported() {
        let mut tools = ToolsConfig::default();
        tools.ffmpeg = ToolCommand::new("vocalsplit-no-such-ffmpeg");
        tools.yt_dlp = sh("exit 1", "yt-dlp");

        let checks = check_dependencies(&tools);
        assert_eq!(checks.len(), 6);

        let ffmpeg = checks.iter().find(|c| c.name == "FFmpeg").unwrap();
        assert!(!ffmpeg.available);
        assert!(ffmpeg.path.is_none());
        assert!(ffmpeg.message.contains("未安装"));

        let yt_dlp = checks.iter().find(|c| c.name == "yt-dlp").unwrap();
        assert!(!yt_dlp.available);
        assert!(yt_dlp.message.contains("无法运行"));
    }
}
