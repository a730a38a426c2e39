// 质量预设模块
//
// 每个预设包含两阶段 MDX 分离的 segment size / overlap 参数

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::error::AppError;

/// MDX 分离参数
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MdxParams {
    pub segment_size: u32,
    pub overlap: f32,
}

impl MdxParams {
    pub const fn new(segment_size: u32, overlap: f32) -> Self {
        Self { segment_size, overlap }
    }
}

/// 质量预设
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// 速度与质量的最佳平衡
    Normal,
    /// 强力去除伴奏
    Heavy,
    /// 嘈杂 / 现场录音
    Noisy,
}

impl Default for Preset {
    fn default() -> Self {
        Self::Normal
    }
}

impl Preset {
    pub fn all() -> [Preset; 3] {
        [Preset::Normal, Preset::Heavy, Preset::Noisy]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Normal => "normal",
            Preset::Heavy => "heavy",
            Preset::Noisy => "noisy",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Preset::Normal => "Normal",
            Preset::Heavy => "Heavy instrumental",
            Preset::Noisy => "Noisy / live",
        }
    }

    pub fn note(&self) -> &'static str {
        match self {
            Preset::Normal => "Best balance — Recommended",
            Preset::Heavy => "Slower — Strong music removal",
            Preset::Noisy => "Very Slow — Best for noisy recordings",
        }
    }

    pub fn eta(&self) -> &'static str {
        match self {
            Preset::Normal => "≈ 6 minutes",
            Preset::Heavy | Preset::Noisy => "≈ 26 minutes",
        }
    }

    /// 第一阶段（主模型）参数
    pub fn main(&self) -> MdxParams {
        match self {
            Preset::Normal => MdxParams::new(512, 0.5),
            Preset::Heavy => MdxParams::new(768, 0.75),
            Preset::Noisy => MdxParams::new(1024, 0.9),
        }
    }

    /// 第二阶段（HQ 精修）参数
    pub fn hq(&self) -> MdxParams {
        match self {
            Preset::Normal => MdxParams::new(256, 0.25),
            Preset::Heavy => MdxParams::new(256, 0.4),
            Preset::Noisy => MdxParams::new(512, 0.5),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "normal" => Ok(Preset::Normal),
            "heavy" | "heavy-instrumental" | "heavy_instrumental" => Ok(Preset::Heavy),
            "noisy" | "live" | "noisy-live" => Ok(Preset::Noisy),
            other => Err(AppError::InvalidArgument(format!(
                "未知预设: {}（可选: normal, heavy, noisy）",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_table() {
        assert_eq!(Preset::Normal.main(), MdxParams::new(512, 0.5));
        assert_eq!(Preset::Normal.hq(), MdxParams::new(256, 0.25));
        assert_eq!(Preset::Heavy.main(), MdxParams::new(768, 0.75));
        assert_eq!(Preset::Heavy.hq(), MdxParams::new(256, 0.4));
        assert_eq!(Preset::Noisy.main(), MdxParams::new(1024, 0.9));
        assert_eq!(Preset::Noisy.hq(), MdxParams::new(512, 0.5));
    }

    #[test]
    fn test_parse() {
        assert_eq!("Heavy".parse::<Preset>().unwrap(), Preset::Heavy);
        assert_eq!(" live ".parse::<Preset>().unwrap(), Preset::Noisy);
        assert!("turbo".parse::<Preset>().is_err());
    }

    #[test]
    fn test_eta() {
        assert_eq!(Preset::default().eta(), "≈ 6 minutes");
        assert_eq!(Preset::Noisy.eta(), Preset::Heavy.eta());
    }
}
