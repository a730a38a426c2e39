// 人声分离模块 - 使用 audio-separator (MDX-Net ONNX 模型)

use crate::error::{AppError, AppResult};
use crate::presets::MdxParams;
use crate::process;
use crate::utils::ToolCommand;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::info;

/// audio-separator 调用参数
#[derive(Debug, Clone, PartialEq)]
pub struct SeparatorArgs {
    /// 模型文件名，例如 UVR_MDXNET_Main.onnx
    pub model: String,
    pub segment_size: u32,
    pub overlap: f32,
    /// 输出格式（MP3 / WAV / FLAC）
    pub output_format: String,
    pub output_dir: PathBuf,
    /// 只输出指定轨道
    pub single_stem: Option<String>,
    pub denoise: bool,
    /// 模型缓存目录
    pub model_file_dir: Option<PathBuf>,
}

impl SeparatorArgs {
    pub fn mdx(model: &str, params: MdxParams, output_format: &str, output_dir: &Path) -> Self {
        Self {
            model: model.to_string(),
            segment_size: params.segment_size,
            overlap: params.overlap,
            output_format: output_format.to_uppercase(),
            output_dir: output_dir.to_path_buf(),
            single_stem: None,
            denoise: false,
            model_file_dir: None,
        }
    }

    pub fn with_single_stem(mut self, stem: &str) -> Self {
        self.single_stem = Some(stem.to_string());
        self
    }

    pub fn with_denoise(mut self, denoise: bool) -> Self {
        self.denoise = denoise;
        self
    }

    pub fn with_model_file_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.model_file_dir = dir;
        self
    }

    /// 构建命令行参数，输入文件放在最后
    pub fn build_args(&self, input: &Path) -> Vec<String> {
        let mut args = vec!["-m".to_string(), self.model.clone()];

        if let Some(ref stem) = self.single_stem {
            args.push("--single_stem".to_string());
            args.push(stem.clone());
        }

        args.push("--mdx_segment_size".to_string());
        args.push(self.segment_size.to_string());
        args.push("--mdx_overlap".to_string());
        args.push(self.overlap.to_string());

        if self.denoise {
            args.push("--mdx_enable_denoise".to_string());
        }

        args.push("--output_format".to_string());
        args.push(self.output_format.clone());
        args.push("--output_dir".to_string());
        args.push(self.output_dir.to_string_lossy().to_string());

        if let Some(ref dir) = self.model_file_dir {
            args.push("--model_file_dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }

        args.push(input.to_string_lossy().to_string());
        args
    }
}

/// 运行 audio-separator
pub fn run_separator(
    tool: &ToolCommand,
    params: &SeparatorArgs,
    input: &Path,
    job_id: &str,
    cancel_flag: &AtomicBool,
    on_line: &dyn Fn(&str),
) -> AppResult<()> {
    info!("=== 开始人声分离 (audio-separator) ===");
    info!("音频路径: {}", input.display());
    info!("模型: {}, segment={}, overlap={}", params.model, params.segment_size, params.overlap);

    if !input.exists() {
        return Err(AppError::NotFound(format!("音频文件不存在: {}", input.display())));
    }

    std::fs::create_dir_all(&params.output_dir)?;
    if let Some(ref dir) = params.model_file_dir {
        std::fs::create_dir_all(dir)?;
    }

    let args = params.build_args(input);
    process::run_with_logs(tool, &args, job_id, cancel_flag, on_line)?;

    info!("audio-separator 处理成功: {}", params.output_dir.display());
    Ok(())
}

/// 检测 ONNX Runtime GPU 是否可用
/// audio-separator -e 在 stderr 输出环境信息，检查执行提供者关键字
pub fn check_onnx_gpu(tool: &ToolCommand) -> bool {
    let temp_dir = std::env::temp_dir();
    let temp_dir = temp_dir.to_string_lossy();
    match process::run_capture(tool, &["-e", "--model_file_dir", &temp_dir]) {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stderr).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stdout));
            let has_cuda = text.contains("CUDAExecutionProvider");
            let has_dml = text.contains("DmlExecutionProvider");
            let has_tensorrt = text.contains("TensorrtExecutionProvider");
            info!("audio-separator GPU 检测: CUDA={}, DML={}, TensorRT={}", has_cuda, has_dml, has_tensorrt);
            has_cuda || has_dml || has_tensorrt
        }
        Err(e) => {
            info!("audio-separator GPU 检测失败: {}", e);
            false
        }
    }
}
