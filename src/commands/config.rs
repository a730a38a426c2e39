// 配置与存储命令

use crate::cli::ConfigAction;
use crate::config::{self, AppConfig};
use crate::database;
use crate::error::AppResult;
use crate::utils::{calculate_dir_size, format_size, AppState};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

/// vocalsplit config show | reset | path
pub fn run(state: &AppState, action: ConfigAction, json: bool) -> AppResult<()> {
    match action {
        ConfigAction::Show => {
            // 配置本身就是 JSON
            println!("{}", serde_json::to_string_pretty(&config::get_config())?);
        }
        ConfigAction::Reset => {
            reset_config()?;
            if json {
                println!("{}", serde_json::json!({ "reset": true }));
            } else {
                println!("配置已恢复默认: {}", state.config_path.display());
            }
        }
        ConfigAction::Path => {
            if json {
                println!("{}", serde_json::json!({ "path": state.config_path }));
            } else {
                println!("{}", state.config_path.display());
            }
        }
    }
    Ok(())
}

/// 重置配置为默认值
pub fn reset_config() -> AppResult<()> {
    config::update_config(AppConfig::default())
}

/// 清理结果
#[derive(Debug, Clone, Serialize)]
pub struct CleanReport {
    pub cleared_bytes: u64,
    pub cache_entries: usize,
}

/// 清空临时目录；keep_downloads 时保留下载目录
pub fn clear_temp_dir(temp_dir: &Path, keep_downloads: bool) -> AppResult<u64> {
    if !temp_dir.exists() {
        return Ok(0);
    }

    let mut cleared = 0u64;
    for entry in fs::read_dir(temp_dir)?.flatten() {
        let path = entry.path();
        if keep_downloads && entry.file_name() == "downloads" {
            continue;
        }
        if path.is_dir() {
            cleared += calculate_dir_size(&path);
            fs::remove_dir_all(&path)?;
        } else {
            cleared += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path)?;
        }
    }
    Ok(cleared)
}

/// vocalsplit clean [--downloads]
pub fn clean(state: &AppState, downloads: bool, json: bool) -> AppResult<()> {
    let temp_dir = state.temp_dir();
    let cleared_bytes = clear_temp_dir(&temp_dir, !downloads)?;
    fs::create_dir_all(&temp_dir)?;

    let cache_entries = if downloads {
        database::clear_download_cache()?
    } else {
        0
    };
    info!("清理临时文件: {} 字节, 下载缓存 {} 条", cleared_bytes, cache_entries);

    let report = CleanReport {
        cleared_bytes,
        cache_entries,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("已清理 {}", format_size(report.cleared_bytes));
        if downloads {
            println!("已清空下载缓存 ({} 条)", report.cache_entries);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(temp: &Path) {
        fs::create_dir_all(temp.join("downloads")).unwrap();
        fs::create_dir_all(temp.join("step1_abcd1234")).unwrap();
        fs::write(temp.join("downloads").join("0123456789abcdef.mp3"), [0u8; 100]).unwrap();
        fs::write(temp.join("step1_abcd1234").join("a_(Vocals)_x.mp3"), [0u8; 10]).unwrap();
        fs::write(temp.join("deadbeef_song.mp3"), [0u8; 5]).unwrap();
    }

    #[test]
    fn test_clear_temp_keeps_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        populate(&temp);

        let cleared = clear_temp_dir(&temp, true).unwrap();
        assert_eq!(cleared, 15);
        assert!(temp.join("downloads").join("0123456789abcdef.mp3").exists());
        assert!(!temp.join("step1_abcd1234").exists());
        assert!(!temp.join("deadbeef_song.mp3").exists());
    }

    #[test]
    fn test_clear_temp_everything() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        populate(&temp);

        assert_eq!(clear_temp_dir(&temp, false).unwrap(), 115);
        assert_eq!(fs::read_dir(&temp).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_missing_temp() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(clear_temp_dir(&dir.path().join("temp"), false).unwrap(), 0);
    }
}
