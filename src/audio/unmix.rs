// Open-Unmix 分离模块
//
// 调用 umx 命令行得到 vocals / drums / bass / other 四轨，
// 再用 ffmpeg 把 drums + bass + other 混成伴奏

use crate::audio::ffmpeg;
use crate::error::{AppError, AppResult};
use crate::process;
use crate::utils::{file_stem_string, ToolCommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::info;

/// umx 输出的四个源
pub const SOURCES: [&str; 4] = ["vocals", "drums", "bass", "other"];

/// 组成伴奏的源
pub const ACCOMPANIMENT_SOURCES: [&str; 3] = ["drums", "bass", "other"];

pub const ACCOMPANIMENT_NAME: &str = "accompaniment";

pub fn build_args(model: &str, input: &Path, output_dir: &Path) -> Vec<String> {
    vec![
        input.to_string_lossy().to_string(),
        "--outdir".to_string(),
        output_dir.to_string_lossy().to_string(),
        "--model".to_string(),
        model.to_string(),
    ]
}

/// umx 输出的轨道目录: <output_dir>/<track>
pub fn track_dir(input: &Path, output_dir: &Path) -> PathBuf {
    output_dir.join(file_stem_string(input))
}

/// 运行 umx 并生成伴奏，返回轨道目录
#[allow(clippy::too_many_arguments)]
pub fn run_unmix(
    umx: &ToolCommand,
    ffmpeg_tool: &ToolCommand,
    model: &str,
    input: &Path,
    output_dir: &Path,
    job_id: &str,
    cancel_flag: &AtomicBool,
    on_line: &dyn Fn(&str),
) -> AppResult<PathBuf> {
    info!("=== 开始 Open-Unmix 分离 ===");
    info!("音频路径: {}, 模型: {}", input.display(), model);

    if !input.exists() {
        return Err(AppError::NotFound(format!("音频文件不存在: {}", input.display())));
    }
    std::fs::create_dir_all(output_dir)?;

    let args = build_args(model, input, output_dir);
    process::run_with_logs(umx, &args, job_id, cancel_flag, on_line)?;

    let track_dir = track_dir(input, output_dir);
    let sources: Vec<PathBuf> = ACCOMPANIMENT_SOURCES
        .iter()
        .map(|name| track_dir.join(format!("{}.wav", name)))
        .collect();
    let source_refs: Vec<&Path> = sources.iter().map(|p| p.as_path()).collect();
    let accompaniment = track_dir.join(format!("{}.wav", ACCOMPANIMENT_NAME));

    ffmpeg::mix_sources(ffmpeg_tool, &source_refs, &accompaniment, job_id, cancel_flag, on_line)?;

    info!("伴奏已生成: {}", accompaniment.display());
    Ok(track_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_and_layout() {
        let args = build_args("umxl", Path::new("AL.wav"), Path::new("outputs"));
        assert_eq!(args, vec!["AL.wav", "--outdir", "outputs", "--model", "umxl"]);
        assert_eq!(track_dir(Path::new("dir/AL.wav"), Path::new("outputs")), PathBuf::from("outputs/AL"));
    }

    #[test]
    fn test_accompaniment_excludes_vocals() {
        assert!(!ACCOMPANIMENT_SOURCES.contains(&"vocals"));
        assert!(ACCOMPANIMENT_SOURCES.iter().all(|s| SOURCES.contains(s)));
    }
}
