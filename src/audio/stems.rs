// 输出轨道查找
//
// 各分离工具按约定的文件名输出轨道（例如 "xxx_(Vocals)_UVR_MDXNET_Main.mp3"），
// 这里按关键字匹配文件名来定位

use crate::error::{AppError, AppResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};
use walkdir::WalkDir;

/// 目录中的文件名（排序后）
fn sorted_file_names(folder: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(folder) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// 查找文件名包含关键字的第一个文件（区分大小写，等价于 glob `*keyword*`）
pub fn find_stem(folder: &Path, keyword: &str) -> Option<PathBuf> {
    let found = sorted_file_names(folder)
        .into_iter()
        .find(|name| name.contains(keyword))
        .map(|name| folder.join(name));
    debug!("查找轨道: dir={}, keyword={}, found={:?}", folder.display(), keyword, found);
    found
}

/// 查找轨道，找不到时返回 "<what> file not found."
pub fn require_stem(folder: &Path, keyword: &str, what: &str) -> AppResult<PathBuf> {
    find_stem(folder, keyword).ok_or_else(|| {
        error!(
            "轨道文件不存在: dir={}, keyword={}, 目录中的文件: {:?}",
            folder.display(),
            keyword,
            sorted_file_names(folder)
        );
        AppError::StemNotFound(format!("{} file not found.", what))
    })
}

/// 按关键字优先级查找：先尝试更精确的关键字，例如 "(Vocals)" 再 "Vocals"
pub fn require_stem_any(folder: &Path, keywords: &[&str], what: &str) -> AppResult<PathBuf> {
    for keyword in keywords {
        if let Some(found) = find_stem(folder, keyword) {
            return Ok(found);
        }
    }
    let last = keywords.last().copied().unwrap_or_default();
    require_stem(folder, last, what)
}

/// 按完整文件名递归查找（demucs / umx 会把输出放在嵌套目录中，
/// 且 "no_vocals.wav" 也包含 "vocals"，不能按子串匹配）
pub fn find_named_recursive(root: &Path, file_name: &str) -> Option<PathBuf> {
    let mut matches: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy() == file_name)
        .map(|e| e.into_path())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

/// 定位指定源文件：先查轨道目录，再在整个输出目录中递归查找
pub fn require_source(track_dir: &Path, search_root: &Path, file_name: &str, what: &str) -> AppResult<PathBuf> {
    let direct = track_dir.join(file_name);
    if direct.is_file() {
        return Ok(direct);
    }
    find_named_recursive(search_root, file_name).ok_or_else(|| {
        error!("轨道文件不存在: {} (搜索目录: {})", file_name, search_root.display());
        AppError::StemNotFound(format!("{} file not found.", what))
    })
}

/// 列出指定扩展名的所有轨道（不区分大小写）
pub fn list_stems(folder: &Path, extension: &str) -> Vec<PathBuf> {
    let extension = extension.trim_start_matches('.').to_lowercase();
    sorted_file_names(folder)
        .into_iter()
        .map(|name| folder.join(name))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().to_lowercase() == extension)
                .unwrap_or(false)
        })
        .collect()
}
