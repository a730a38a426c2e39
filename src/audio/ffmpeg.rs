// FFmpeg 辅助：时长探测与混音

use crate::error::{AppError, AppResult};
use crate::process;
use crate::utils::ToolCommand;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

/// 获取音频时长（秒）
pub fn get_audio_duration(ffprobe: &ToolCommand, audio_path: &Path) -> AppResult<f64> {
    let path = audio_path.to_string_lossy();
    let output = process::run_capture(
        ffprobe,
        &[
            "-v", "quiet",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
            &path,
        ],
    )
    .map_err(|e| AppError::FFmpeg(format!("ffprobe 执行失败: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::FFmpeg("ffprobe 获取时长失败".to_string()));
    }

    parse_duration(&String::from_utf8_lossy(&output.stdout))
}

fn parse_duration(stdout: &str) -> AppResult<f64> {
    stdout
        .trim()
        .parse::<f64>()
        .map_err(|_| AppError::FFmpeg("解析音频时长失败".to_string()))
}

/// 获取时长，失败时只记录警告
pub fn try_audio_duration(ffprobe: &ToolCommand, audio_path: &Path) -> Option<f64> {
    match get_audio_duration(ffprobe, audio_path) {
        Ok(duration) => Some(duration),
        Err(e) => {
            warn!("获取时长失败 {}: {}", audio_path.display(), e);
            None
        }
    }
}

/// 构建 amix 混音参数（normalize=0，直接相加）
pub fn build_mix_args(inputs: &[&Path], output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-hide_banner".to_string()];
    for input in inputs {
        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());
    }
    args.push("-filter_complex".to_string());
    args.push(format!("amix=inputs={}:duration=longest:normalize=0", inputs.len()));
    args.push(output.to_string_lossy().to_string());
    args
}

/// 把多条轨道混成一条
pub fn mix_sources(
    ffmpeg: &ToolCommand,
    inputs: &[&Path],
    output: &Path,
    job_id: &str,
    cancel_flag: &AtomicBool,
    on_line: &dyn Fn(&str),
) -> AppResult<()> {
    if inputs.is_empty() {
        return Err(AppError::InvalidArgument("混音输入为空".to_string()));
    }
    for input in inputs {
        if !input.exists() {
            return Err(AppError::NotFound(format!("混音输入不存在: {}", input.display())));
        }
    }

    info!("混音 {} 条轨道 -> {}", inputs.len(), output.display());
    let args = build_mix_args(inputs, output);
    process::run_with_logs(ffmpeg, &args, job_id, cancel_flag, on_line)
        .map_err(|e| match e {
            AppError::ProcessFailed { detail, .. } => AppError::FFmpeg(format!("混音失败: {}", detail)),
            other => other,
        })?;
    Ok(())
}
