// 配置管理模块

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use crate::error::{AppError, AppResult};
use crate::utils::ToolCommand;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::info;

static CONFIG: OnceCell<RwLock<AppConfig>> = OnceCell::new();
static CONFIG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// 日志级别
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    /// 转换为 tracing 过滤器字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// 外部工具命令配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub audio_separator: ToolCommand,
    /// 默认通过 `python -m demucs` 调用
    pub demucs: ToolCommand,
    pub umx: ToolCommand,
    pub yt_dlp: ToolCommand,
    pub ffmpeg: ToolCommand,
    pub ffprobe: ToolCommand,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            audio_separator: ToolCommand::new("audio-separator"),
            demucs: ToolCommand::with_args("python", &["-m", "demucs"]),
            umx: ToolCommand::new("umx"),
            yt_dlp: ToolCommand::new("yt-dlp"),
            ffmpeg: ToolCommand::new("ffmpeg"),
            ffprobe: ToolCommand::new("ffprobe"),
        }
    }
}

/// MDX 人声分离配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// 第一阶段模型
    pub main_model: String,
    /// 第二阶段（精修）模型
    pub hq_model: String,
    /// 输出格式，传给 audio-separator --output_format
    pub output_format: String,
    /// 默认预设
    pub default_preset: String,
    /// audio-separator 模型缓存目录，为空时使用 models 模块的默认目录
    pub models_dir: Option<String>,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            main_model: "UVR_MDXNET_Main.onnx".to_string(),
            hq_model: "UVR-MDX-NET-Inst_HQ_5.onnx".to_string(),
            output_format: "MP3".to_string(),
            default_preset: "normal".to_string(),
            models_dir: None,
        }
    }
}

/// Demucs 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemucsConfig {
    pub model: String,
    /// 时间平移增强次数
    pub shifts: u32,
    pub overlap: f32,
}

impl Default for DemucsConfig {
    fn default() -> Self {
        Self {
            model: "htdemucs".to_string(),
            shifts: 1,
            overlap: 0.25,
        }
    }
}

/// Open-Unmix 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmixConfig {
    pub model: String,
}

impl Default for UnmixConfig {
    fn default() -> Self {
        Self {
            model: "umxl".to_string(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub audio_format: String,
    /// yt-dlp --audio-quality，0 为最佳
    pub audio_quality: String,
    /// 是否复用已下载的链接
    pub cache_enabled: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            audio_format: "mp3".to_string(),
            audio_quality: "0".to_string(),
            cache_enabled: true,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub separation: SeparationConfig,
    #[serde(default)]
    pub demucs: DemucsConfig,
    #[serde(default)]
    pub unmix: UnmixConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    /// 结果输出目录，为空时使用数据目录下的 outputs
    #[serde(default)]
    pub output_dir: Option<String>,
    /// 日志级别
    #[serde(default)]
    pub log_level: LogLevel,
}

impl AppConfig {
    /// 解析结果输出目录
    pub fn resolve_output_dir(&self, data_dir: &Path) -> PathBuf {
        match self.output_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => data_dir.join("outputs"),
        }
    }
}

/// 读取配置文件，解析失败时回退到默认配置
pub fn load_config(config_path: &Path) -> AppResult<AppConfig> {
    if config_path.exists() {
        let content = fs::read_to_string(config_path)?;
        Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("配置文件 JSON 解析失败: {}，使用默认配置", e);
            AppConfig::default()
        }))
    } else {
        let config = AppConfig::default();
        let content = serde_json::to_string_pretty(&config)?;
        fs::write(config_path, content)?;
        Ok(config)
    }
}

/// 初始化配置
pub fn init_config(config_path: &Path) -> AppResult<()> {
    CONFIG_PATH.set(config_path.to_path_buf())
        .map_err(|_| AppError::Config("配置路径已初始化".to_string()))?;

    let config = load_config(config_path)?;

    info!("[CONFIG] 配置已加载: {}", config_path.display());

    CONFIG.set(RwLock::new(config))
        .map_err(|_| AppError::Config("配置已初始化".to_string()))?;

    Ok(())
}

/// 获取配置
pub fn get_config() -> AppConfig {
    CONFIG.get()
        .map(|c| c.read().clone())
        .unwrap_or_default()
}

/// 更新配置
pub fn update_config(config: AppConfig) -> AppResult<()> {
    info!("[CONFIG] 配置更新");

    // 先写入文件，成功后再更新内存，避免文件写入失败导致内存与文件不一致
    if let Some(path) = CONFIG_PATH.get() {
        let content = serde_json::to_string_pretty(&config)?;
        fs::write(path, content)?;
    }

    if let Some(lock) = CONFIG.get() {
        let mut current = lock.write();
        *current = config;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "separation": { "output_format": "WAV" }, "log_level": "debug" }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.separation.output_format, "WAV");
        assert_eq!(config.separation.main_model, "UVR_MDXNET_Main.onnx");
        assert_eq!(config.demucs.model, "htdemucs");
        assert_eq!(config.tools.demucs.args, vec!["-m", "demucs"]);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = load_config(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.download.audio_format, "mp3");
    }

    #[test]
    fn test_load_invalid_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.separation.default_preset, "normal");
    }

    #[test]
    fn test_output_dir_resolution() {
        let mut config = AppConfig::default();
        assert_eq!(config.resolve_output_dir(Path::new("/data")), PathBuf::from("/data/outputs"));
        config.output_dir = Some("/music/out".to_string());
        assert_eq!(config.resolve_output_dir(Path::new("/data")), PathBuf::from("/music/out"));
    }
}
