// 错误处理模块

use thiserror::Error;
use serde::Serialize;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP 错误: {0}")]
    Http(String),

    #[error("{tool} 处理失败 (退出码: {code:?}): {detail}")]
    ProcessFailed {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("下载失败: {0}")]
    Download(String),

    #[error("FFmpeg 错误: {0}")]
    FFmpeg(String),

    #[error("{0}")]
    StemNotFound(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("依赖缺失: {0}")]
    DependencyMissing(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("后台任务异常: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),
}

impl AppError {
    /// 进程退出码：取消为 130，其余为 1
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<ureq::Error> for AppError {
    fn from(e: ureq::Error) -> Self {
        AppError::Http(e.to_string())
    }
}

// 以字符串形式序列化，用于 --json 输出
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_as_message() {
        let err = AppError::StemNotFound("Vocals file not found.".to_string());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Vocals file not found.\"");
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(AppError::Cancelled.exit_code(), 130);
        assert_eq!(AppError::NotFound("x".into()).exit_code(), 1);
    }
}
