// Demucs 分离模块
//
// 通过 demucs 命令行运行 htdemucs 预训练模型，
// 输出布局为 <output_dir>/<model>/<track>/<source>.<ext>

use crate::error::{AppError, AppResult};
use crate::process;
use crate::utils::{file_stem_string, ToolCommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::info;

/// 高质量模式的时间平移次数
pub const HQ_SHIFTS: u32 = 4;
/// 高质量模式的重叠比例
pub const HQ_OVERLAP: f32 = 0.25;

/// demucs 调用参数
#[derive(Debug, Clone, PartialEq)]
pub struct DemucsArgs {
    pub model: String,
    pub output_dir: PathBuf,
    /// 只分成两轨，例如 "vocals" 得到 vocals / no_vocals
    pub two_stems: Option<String>,
    pub shifts: u32,
    pub overlap: f32,
    /// 输出 mp3 而不是 wav
    pub mp3: bool,
}

impl DemucsArgs {
    pub fn new(model: &str, output_dir: &Path) -> Self {
        Self {
            model: model.to_string(),
            output_dir: output_dir.to_path_buf(),
            two_stems: None,
            shifts: 1,
            overlap: 0.25,
            mp3: false,
        }
    }

    pub fn with_two_stems(mut self, stem: Option<&str>) -> Self {
        self.two_stems = stem.map(|s| s.to_string());
        self
    }

    pub fn with_quality(mut self, shifts: u32, overlap: f32) -> Self {
        self.shifts = shifts.max(1);
        self.overlap = overlap;
        self
    }

    /// 高质量模式：shifts=4, overlap=0.25
    pub fn high_quality(self) -> Self {
        self.with_quality(HQ_SHIFTS, HQ_OVERLAP)
    }

    pub fn with_mp3(mut self, mp3: bool) -> Self {
        self.mp3 = mp3;
        self
    }

    /// 输出文件扩展名
    pub fn extension(&self) -> &'static str {
        if self.mp3 { "mp3" } else { "wav" }
    }

    /// 构建命令行参数；shifts 为 1 时不传（与 demucs 默认值一致）
    pub fn build_args(&self, input: &Path) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            self.model.clone(),
            "-o".to_string(),
            self.output_dir.to_string_lossy().to_string(),
        ];

        if let Some(ref stem) = self.two_stems {
            args.push("--two-stems".to_string());
            args.push(stem.clone());
        }

        if self.shifts > 1 {
            args.push("--shifts".to_string());
            args.push(self.shifts.to_string());
        }

        args.push("--overlap".to_string());
        args.push(self.overlap.to_string());

        if self.mp3 {
            args.push("--mp3".to_string());
        }

        args.push(input.to_string_lossy().to_string());
        args
    }

    /// 指定输入对应的轨道目录
    pub fn track_dir(&self, input: &Path) -> PathBuf {
        self.output_dir.join(&self.model).join(file_stem_string(input))
    }
}

/// 运行 demucs，返回轨道目录
pub fn run_demucs(
    tool: &ToolCommand,
    params: &DemucsArgs,
    input: &Path,
    job_id: &str,
    cancel_flag: &AtomicBool,
    on_line: &dyn Fn(&str),
) -> AppResult<PathBuf> {
    info!("=== 开始 Demucs 分离 ===");
    info!("音频路径: {}, 模型: {}, two_stems: {:?}", input.display(), params.model, params.two_stems);

    if !input.exists() {
        return Err(AppError::NotFound(format!("音频文件不存在: {}", input.display())));
    }

    std::fs::create_dir_all(&params.output_dir)?;

    let args = params.build_args(input);
    process::run_with_logs(tool, &args, job_id, cancel_flag, on_line)?;

    let track_dir = params.track_dir(input);
    info!("Demucs 输出目录: {}", track_dir.display());
    Ok(track_dir)
}
