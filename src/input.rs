// 输入获取模块

use crate::download::Downloader;
use crate::error::{AppError, AppResult};
use crate::utils::generate_id;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::info;

/// 支持的音频格式
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["mp3", "wav", "flac"];

/// 音频输入：本地文件或链接
#[derive(Debug, Clone, PartialEq)]
pub enum AudioInput {
    File(PathBuf),
    Link(String),
}

impl fmt::Display for AudioInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioInput::File(path) => write!(f, "{}", path.display()),
            AudioInput::Link(link) => f.write_str(link.trim()),
        }
    }
}

/// 获取到的输入文件
#[derive(Debug, Clone)]
pub struct AcquiredInput {
    pub path: PathBuf,
    /// 导入到临时目录的副本，任务结束后删除；下载文件保留在缓存中
    pub is_temporary: bool,
}

impl AcquiredInput {
    /// 删除临时副本
    pub fn cleanup(&self) {
        if self.is_temporary {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// 校验本地文件扩展名
pub fn validate_extension(path: &Path) -> AppResult<()> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        Ok(())
    } else {
        Err(AppError::InvalidArgument(format!(
            "不支持的音频格式: {}（支持: {}）",
            path.display(),
            ALLOWED_EXTENSIONS.join(", ")
        )))
    }
}

/// 把本地文件复制到临时目录，文件名加 UUID 前缀
pub fn import_file(source: &Path, temp_dir: &Path) -> AppResult<PathBuf> {
    if !source.is_file() {
        return Err(AppError::NotFound(format!("音频文件不存在: {}", source.display())));
    }
    validate_extension(source)?;

    fs::create_dir_all(temp_dir)?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string());
    let target = temp_dir.join(format!("{}_{}", generate_id().replace('-', ""), name));
    fs::copy(source, &target)?;

    info!("已导入音频: {} -> {}", source.display(), target.display());
    Ok(target)
}

impl AudioInput {
    pub fn from_args(file: Option<PathBuf>, link: Option<String>) -> AppResult<Self> {
        match (file, link) {
            (Some(file), None) => Ok(AudioInput::File(file)),
            (None, Some(link)) if !link.trim().is_empty() => Ok(AudioInput::Link(link)),
            (None, Some(_)) => Err(AppError::InvalidArgument("链接为空".to_string())),
            (Some(_), Some(_)) => Err(AppError::InvalidArgument("--file 与 --link 只能选择一个".to_string())),
            (None, None) => Err(AppError::InvalidArgument("请通过 --file 或 --link 提供音频".to_string())),
        }
    }

    /// 获取输入音频
    pub fn acquire(
        &self,
        temp_dir: &Path,
        downloader: &Downloader,
        job_id: &str,
        cancel_flag: &AtomicBool,
        on_line: &dyn Fn(&str),
    ) -> AppResult<AcquiredInput> {
        match self {
            AudioInput::File(path) => Ok(AcquiredInput {
                path: import_file(path, temp_dir)?,
                is_temporary: true,
            }),
            AudioInput::Link(link) => {
                let downloads = temp_dir.join("downloads");
                let path = downloader.get_cached_download(link, &downloads, job_id, cancel_flag, on_line)?;
                Ok(AcquiredInput {
                    path,
                    is_temporary: false,
                })
            }
        }
    }
}
