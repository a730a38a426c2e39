// 命令行参数定义

use crate::presets::Preset;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "vocalsplit")]
#[command(version, about = "AI 人声分离：audio-separator / demucs / open-unmix 流水线")]
pub struct CommandLine {
    /// 数据目录（配置、数据库、日志、临时文件）
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// 以 JSON 输出结果
    #[arg(long, global = true)]
    pub json: bool,

    /// 在终端输出调试日志
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// 输入音频：本地文件或链接，二选一
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// 本地音频文件（mp3 / wav / flac）
    #[arg(short, long, value_name = "PATH", conflicts_with = "link", required_unless_present = "link")]
    pub file: Option<PathBuf>,

    /// YouTube / Spotify / 音频直链
    #[arg(short, long, value_name = "URL")]
    pub link: Option<String>,
}

/// 任务通用选项
#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// 结果输出目录，默认使用配置中的 output_dir
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// 保留中间步骤目录
    #[arg(long)]
    pub keep_temp: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 两阶段 MDX 人声提取
    #[command(alias = "x")]
    Extract {
        #[command(flatten)]
        input: InputArgs,
        /// 质量预设: normal / heavy / noisy
        #[arg(short, long)]
        preset: Option<Preset>,
        #[command(flatten)]
        job: JobArgs,
    },
    /// demucs 分离人声后用 MDX 降噪清理
    Hybrid {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        job: JobArgs,
    },
    /// demucs 多轨分离
    Demucs {
        #[command(flatten)]
        input: InputArgs,
        /// 模型名，默认使用配置中的模型
        #[arg(short, long)]
        model: Option<String>,
        /// 只分离为 <STEM> 与 no_<STEM> 两轨
        #[arg(long, value_name = "STEM")]
        two_stems: Option<String>,
        /// 高质量模式（shifts=4, overlap=0.25）
        #[arg(long)]
        hq: bool,
        /// 输出 mp3
        #[arg(long)]
        mp3: bool,
        #[command(flatten)]
        job: JobArgs,
    },
    /// Open-Unmix 多轨分离并混出伴奏
    Unmix {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        job: JobArgs,
    },
    /// 列出质量预设
    Presets,
    /// 列出模型
    Models,
    /// 检查外部工具与系统环境
    Check,
    /// 最近的任务
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// 清理临时文件
    Clean {
        /// 同时清空下载缓存
        #[arg(long)]
        downloads: bool,
    },
    /// 配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub enum ConfigAction {
    /// 显示当前配置
    Show,
    /// 恢复默认配置
    Reset,
    /// 配置文件路径
    Path,
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        CommandLine::command().debug_assert();
    }

    #[test]
    fn test_parse_extract() {
        let cli = CommandLine::try_parse_from([
            "vocalsplit", "--json", "extract", "--file", "song.mp3", "--preset", "heavy", "--keep-temp",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Extract { input, preset, job } => {
                assert_eq!(input.file, Some(PathBuf::from("song.mp3")));
                assert_eq!(preset, Some(Preset::Heavy));
                assert!(job.keep_temp);
                assert!(job.output.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_input_is_required_and_exclusive() {
        assert!(CommandLine::try_parse_from(["vocalsplit", "hybrid"]).is_err());
        assert!(CommandLine::try_parse_from([
            "vocalsplit", "hybrid", "--file", "a.mp3", "--link", "https://youtu.be/x",
        ])
        .is_err());
        assert!(CommandLine::try_parse_from(["vocalsplit", "unmix", "--link", "https://youtu.be/x"]).is_ok());
    }

    #[test]
    fn test_unknown_preset_rejected() {
        assert!(CommandLine::try_parse_from(["vocalsplit", "extract", "-f", "a.mp3", "-p", "ultra"]).is_err());
    }

    #[test]
    fn test_parse_demucs_options() {
        let cli = CommandLine::try_parse_from([
            "vocalsplit", "demucs", "-f", "a.wav", "--two-stems", "vocals", "--hq", "--mp3", "-o", "out",
        ])
        .unwrap();
        match cli.command {
            Commands::Demucs { two_stems, hq, mp3, job, model, .. } => {
                assert_eq!(two_stems.as_deref(), Some("vocals"));
                assert!(hq && mp3);
                assert_eq!(model, None);
                assert_eq!(job.output, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
