// 模型目录模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const MODELS_DIR_ENV: &str = "VOCALSPLIT_MODELS_DIR";

/// 模型架构类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ModelArchitecture {
    /// MDX-Net (ONNX 格式，audio-separator 调用)
    MdxNet,
    /// Hybrid Transformer Demucs
    Demucs,
    /// Open-Unmix
    OpenUnmix,
}

/// 模型信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// 模型唯一标识
    pub id: String,
    /// 显示名称
    pub name: String,
    /// 模型架构
    pub architecture: ModelArchitecture,
    /// 传给外部工具的模型文件名 / 名称
    pub filename: String,
    /// 模型描述
    pub description: String,
    /// 输出轨道数
    pub stems: u8,
}

/// 获取所有可用模型列表
pub fn get_available_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "mdx-main".to_string(),
            name: "MDX-Net Main".to_string(),
            architecture: ModelArchitecture::MdxNet,
            filename: "UVR_MDXNET_Main.onnx".to_string(),
            description: "第一阶段人声提取".to_string(),
            stems: 2,
        },
        ModelInfo {
            id: "mdx-inst-hq5".to_string(),
            name: "MDX-Net Inst HQ5".to_string(),
            architecture: ModelArchitecture::MdxNet,
            filename: "UVR-MDX-NET-Inst_HQ_5.onnx".to_string(),
            description: "第二阶段人声精修".to_string(),
            stems: 2,
        },
        ModelInfo {
            id: "htdemucs".to_string(),
            name: "HT Demucs".to_string(),
            architecture: ModelArchitecture::Demucs,
            filename: "htdemucs".to_string(),
            description: "四轨分离: vocals / drums / bass / other".to_string(),
            stems: 4,
        },
        ModelInfo {
            id: "umxl".to_string(),
            name: "Open-Unmix (umxl)".to_string(),
            architecture: ModelArchitecture::OpenUnmix,
            filename: "umxl".to_string(),
            description: "四轨分离，另外混出伴奏".to_string(),
            stems: 4,
        },
    ]
}

/// 根据 ID 获取模型信息
pub fn get_model_by_id(model_id: &str) -> Option<ModelInfo> {
    get_available_models().into_iter().find(|m| m.id == model_id)
}

/// 根据传给工具的文件名查找模型
pub fn get_model_by_filename(filename: &str) -> Option<ModelInfo> {
    get_available_models().into_iter().find(|m| m.filename == filename)
}

/// 获取 audio-separator 模型缓存目录
/// 优先使用配置项，其次环境变量 VOCALSPLIT_MODELS_DIR，最后回退到数据目录下的 models/audio-separator
pub fn get_models_cache_dir(configured: Option<&str>, data_dir: &std::path::Path) -> PathBuf {
    if let Some(dir) = configured.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os(MODELS_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    data_dir.join("models").join("audio-separator")
}

/// 确保模型缓存目录存在
pub fn ensure_models_dir(configured: Option<&str>, data_dir: &std::path::Path) -> std::io::Result<PathBuf> {
    let dir = get_models_cache_dir(configured, data_dir);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// 模型文件是否已缓存（仅对 MDX 模型有意义）
pub fn is_model_cached(model: &ModelInfo, models_dir: &std::path::Path) -> bool {
    model.architecture == ModelArchitecture::MdxNet && models_dir.join(&model.filename).exists()
}
