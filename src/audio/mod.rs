// 音频处理模块
//
// 子模块：
// - separator: MDX-Net 人声分离（调用 audio-separator）
// - demucs: htdemucs 多轨分离（调用 demucs）
// - unmix: Open-Unmix 多轨分离（调用 umx）
// - stems: 按关键字定位输出轨道
// - ffmpeg: 时长探测与混音

pub mod demucs;
pub mod ffmpeg;
pub mod separator;
pub mod stems;
pub mod unmix;
