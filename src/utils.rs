// 工具模块

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use serde::{Deserialize, Serialize};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows 下隐藏控制台窗口的标志
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// 创建一个隐藏控制台窗口的 Command（Windows 专用）
/// 在非 Windows 平台上等同于 Command::new
#[cfg(target_os = "windows")]
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

#[cfg(not(target_os = "windows"))]
pub fn hidden_command(program: &str) -> Command {
    Command::new(program)
}

/// 外部工具命令：程序 + 前置参数（例如 `python -m demucs`）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// 构建 Command，程序路径优先使用打包版本
    pub fn command(&self) -> Command {
        let program = resolve_tool_path(&self.program);
        let mut cmd = hidden_command(&program);
        cmd.args(&self.args);
        cmd
    }

    /// 用于日志显示的命令行
    pub fn display_with(&self, args: &[String]) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }

    /// 工具名（用于错误信息）
    pub fn name(&self) -> String {
        // python -m demucs 这类命令以模块名称呼
        if let Some(pos) = self.args.iter().position(|a| a == "-m") {
            if let Some(module) = self.args.get(pos + 1) {
                return module.clone();
            }
        }
        Path::new(&self.program)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.clone())
    }
}

/// 应用状态：数据目录下各文件的位置
#[derive(Debug, Clone)]
pub struct AppState {
    pub app_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
}

impl AppState {
    pub fn new(app_dir: &Path) -> Self {
        Self {
            app_dir: app_dir.to_path_buf(),
            db_path: app_dir.join("vocalsplit.db"),
            config_path: app_dir.join("config.json"),
        }
    }

    /// 临时文件目录（导入副本、下载缓存、步骤目录）
    pub fn temp_dir(&self) -> PathBuf {
        self.app_dir.join("temp")
    }
}

/// 单个输出轨道
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StemFile {
    pub name: String,
    pub path: String,
}

/// 分离结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationResult {
    pub job_id: String,
    pub stems: Vec<StemFile>,
    pub duration: Option<f64>,
}

/// 依赖检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
    pub path: Option<String>,
    pub message: String,
}

/// 系统信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub cpu_cores: usize,
    pub cpu_threads: usize,
    pub onnx_gpu_available: bool,
    pub dependencies: Vec<DependencyCheck>,
}

/// 生成 UUID
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 任务短 ID：UUID 去掉连字符后的前 8 位
pub fn short_id(id: &str) -> String {
    id.chars().filter(|c| *c != '-').take(8).collect()
}

/// 获取可执行文件所在目录
pub fn get_exe_dir() -> Option<PathBuf> {
    std::env::current_exe().ok()?.parent().map(|p| p.to_path_buf())
}

/// 解析程序路径，优先使用相对于可执行文件的 tools 目录
pub fn resolve_tool_path(tool_name: &str) -> String {
    // 已经是路径的不再解析
    if tool_name.contains('/') || tool_name.contains('\\') {
        return tool_name.to_string();
    }

    let file_name = if cfg!(target_os = "windows") {
        format!("{}.exe", tool_name)
    } else {
        tool_name.to_string()
    };

    if let Some(exe_dir) = get_exe_dir() {
        // 检查 tools 子目录
        let tool_path = exe_dir.join("tools").join(&file_name);
        if tool_path.is_file() {
            return tool_path.to_string_lossy().to_string();
        }
        // 检查可执行文件同级目录
        let tool_path = exe_dir.join(&file_name);
        if tool_path.is_file() {
            return tool_path.to_string_lossy().to_string();
        }
    }
    // 回退到系统 PATH
    tool_name.to_string()
}

/// 计算目录大小
pub fn calculate_dir_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }

    let mut size = 0u64;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                size += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            } else if path.is_dir() {
                size += calculate_dir_size(&path);
            }
        }
    }
    size
}

/// 文件名主干（不含扩展名）
pub fn file_stem_string(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// 格式化字节数
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
