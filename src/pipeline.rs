// 分离流水线
//
// 获取输入 -> 工具 1 -> 按关键字定位中间轨道 -> 工具 2 -> 定位最终轨道 -> 输出

use crate::audio::demucs::{self, DemucsArgs};
use crate::audio::ffmpeg::try_audio_duration;
use crate::audio::separator::{self, SeparatorArgs};
use crate::audio::stems::{list_stems, require_source, require_stem_any};
use crate::audio::unmix;
use crate::config::AppConfig;
use crate::database::{self, JobStatus};
use crate::download::Downloader;
use crate::error::{AppError, AppResult};
use crate::input::AudioInput;
use crate::presets::{MdxParams, Preset};
use crate::process;
use crate::utils::{file_stem_string, generate_id, short_id, SeparationResult, StemFile};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// 第二阶段人声关键字，优先匹配 audio-separator 的 "(Vocals)" 标记
const VOCALS_KEYWORDS: [&str; 2] = ["(Vocals)", "Vocals"];

/// 混合流程中 MDX 清理阶段的参数
const HYBRID_CLEANUP: MdxParams = MdxParams::new(256, 0.35);

/// 任务事件
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JobEvent<'a> {
    /// 步骤开始
    Step { number: u8, title: &'a str },
    /// 步骤完成
    StepComplete { number: u8 },
    /// 外部工具输出的一行
    Log(&'a str),
}

pub type EventCallback = Box<dyn Fn(JobEvent<'_>) + Send + Sync>;

/// Demucs 选项
#[derive(Debug, Clone, PartialEq)]
pub struct DemucsOptions {
    pub model: String,
    pub two_stems: Option<String>,
    /// shifts=4, overlap=0.25
    pub high_quality: bool,
    pub mp3: bool,
}

/// 任务类型
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// 两阶段 MDX 人声提取
    Extract(Preset),
    /// demucs 两轨 + MDX 降噪清理
    Hybrid,
    /// demucs 多轨分离
    Demucs(DemucsOptions),
    /// Open-Unmix 多轨分离 + 伴奏
    Unmix,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extract(_) => "extract",
            JobKind::Hybrid => "hybrid",
            JobKind::Demucs(_) => "demucs",
            JobKind::Unmix => "unmix",
        }
    }

    pub fn preset(&self) -> Option<Preset> {
        match self {
            JobKind::Extract(preset) => Some(*preset),
            _ => None,
        }
    }
}

/// 任务上下文
///
/// 持有任务 ID、临时目录和取消标志；drop 时清理取消标志、子进程句柄和步骤目录
pub struct JobContext {
    pub id: String,
    pub job8: String,
    pub config: AppConfig,
    pub temp_dir: PathBuf,
    pub output_dir: PathBuf,
    pub models_dir: Option<PathBuf>,
    pub keep_temp: bool,
    cancel_flag: Arc<AtomicBool>,
    on_event: EventCallback,
}

impl JobContext {
    pub fn new(
        config: AppConfig,
        temp_dir: &Path,
        output_dir: &Path,
        models_dir: Option<PathBuf>,
        keep_temp: bool,
        on_event: EventCallback,
    ) -> Self {
        Self::with_id(generate_id(), config, temp_dir, output_dir, models_dir, keep_temp, on_event)
    }

    /// 使用预先登记的任务 ID，登记后到任务开始前的取消请求仍然有效
    pub fn with_id(
        id: String,
        config: AppConfig,
        temp_dir: &Path,
        output_dir: &Path,
        models_dir: Option<PathBuf>,
        keep_temp: bool,
        on_event: EventCallback,
    ) -> Self {
        let job8 = short_id(&id);
        let cancel_flag = process::cancel_flag(&id);
        Self {
            id,
            job8,
            config,
            temp_dir: temp_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            models_dir,
            keep_temp,
            cancel_flag,
            on_event,
        }
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel_flag
    }

    /// 步骤目录: temp/step{n}_{job8}
    pub fn step_dir(&self, number: u8) -> PathBuf {
        self.temp_dir.join(format!("step{}_{}", number, self.job8))
    }

    fn step(&self, number: u8, title: &str) {
        info!("[JOB {}] {}", self.job8, title);
        (self.on_event)(JobEvent::Step { number, title });
    }

    fn step_complete(&self, number: u8) {
        (self.on_event)(JobEvent::StepComplete { number });
    }

    fn log(&self, line: &str) {
        (self.on_event)(JobEvent::Log(line));
    }
}

impl Drop for JobContext {
    fn drop(&mut self) {
        process::remove_cancel_flag(&self.id);
        process::clear_child_processes(&self.id);

        if self.keep_temp {
            return;
        }
        for number in 1..=2 {
            let dir = self.step_dir(number);
            if dir.exists() {
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!("清理临时目录失败 {}: {}", dir.display(), e);
                }
            }
        }
    }
}

/// 复制到输出目录
pub fn deliver(source: &Path, dest_dir: &Path, file_name: &str) -> AppResult<PathBuf> {
    fs::create_dir_all(dest_dir)?;
    let target = dest_dir.join(file_name);
    fs::copy(source, &target)?;
    info!("输出文件: {}", target.display());
    Ok(target)
}

fn stem_file(name: &str, path: &Path) -> StemFile {
    StemFile {
        name: name.to_string(),
        path: path.to_string_lossy().to_string(),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "wav".to_string())
}

/// 输出文件使用的曲名：本地文件用原文件名，链接用下载文件名
fn track_name(input: &AudioInput, acquired: &Path) -> String {
    match input {
        AudioInput::File(path) => file_stem_string(path),
        AudioInput::Link(_) => file_stem_string(acquired),
    }
}

/// 运行任务并记录到任务历史
pub fn run_job(ctx: &JobContext, kind: &JobKind, input: &AudioInput) -> AppResult<SeparationResult> {
    info!("=== 开始任务 {} ({}) ===", ctx.id, kind.as_str());

    let preset = kind.preset().map(|p| p.to_string());
    if let Err(e) = database::insert_job(&ctx.id, kind.as_str(), &input.to_string(), preset.as_deref()) {
        warn!("记录任务失败: {}", e);
    }

    let result = execute(ctx, kind, input);

    let (status, output, error) = match &result {
        Ok(r) => (JobStatus::Completed, r.stems.first().map(|s| s.path.clone()), None),
        Err(AppError::Cancelled) => (JobStatus::Cancelled, None, Some(AppError::Cancelled.to_string())),
        Err(e) => (JobStatus::Failed, None, Some(e.to_string())),
    };
    if let Err(e) = database::finish_job(&ctx.id, status, output.as_deref(), error.as_deref()) {
        warn!("更新任务状态失败: {}", e);
    }

    match &result {
        Ok(_) => info!("任务完成: {}", ctx.id),
        Err(e) => warn!("任务结束 ({}): {}", status.as_str(), e),
    }
    result
}

fn execute(ctx: &JobContext, kind: &JobKind, input: &AudioInput) -> AppResult<SeparationResult> {
    if ctx.cancel_flag().load(Ordering::SeqCst) {
        return Err(AppError::Cancelled);
    }

    let downloader = Downloader::new(ctx.config.tools.yt_dlp.clone(), ctx.config.download.clone());
    let acquired = input.acquire(&ctx.temp_dir, &downloader, &ctx.id, ctx.cancel_flag(), &|line| ctx.log(line))?;
    let track = track_name(input, &acquired.path);

    let stems = match kind {
        JobKind::Extract(preset) => extract_vocals(ctx, &acquired.path, &track, *preset),
        JobKind::Hybrid => hybrid_vocals(ctx, &acquired.path, &track),
        JobKind::Demucs(options) => demucs_stems(ctx, &acquired.path, &track, options),
        JobKind::Unmix => unmix_stems(ctx, &acquired.path, &track),
    };
    acquired.cleanup();
    let stems = stems?;

    let duration = stems
        .first()
        .and_then(|s| try_audio_duration(&ctx.config.tools.ffprobe, Path::new(&s.path)));

    Ok(SeparationResult {
        job_id: ctx.id.clone(),
        stems,
        duration,
    })
}

/// 两阶段 MDX 人声提取：主模型提取人声，HQ 模型精修
pub fn extract_vocals(ctx: &JobContext, input: &Path, track: &str, preset: Preset) -> AppResult<Vec<StemFile>> {
    let sep = &ctx.config.separation;
    let tool = &ctx.config.tools.audio_separator;

    // 第一阶段
    ctx.step(1, "Step 1 — Extracting vocals");
    let step1 = ctx.step_dir(1);
    let main = SeparatorArgs::mdx(&sep.main_model, preset.main(), &sep.output_format, &step1)
        .with_model_file_dir(ctx.models_dir.clone());
    separator::run_separator(tool, &main, input, &ctx.id, ctx.cancel_flag(), &|line| ctx.log(line))?;

    let vocals = require_stem_any(&step1, &VOCALS_KEYWORDS, "Vocals")?;
    ctx.step_complete(1);

    // 第二阶段
    ctx.step(2, "Step 2 — Cleaning vocals");
    let step2 = ctx.step_dir(2);
    let hq = SeparatorArgs::mdx(&sep.hq_model, preset.hq(), &sep.output_format, &step2)
        .with_single_stem("Vocals")
        .with_model_file_dir(ctx.models_dir.clone());
    separator::run_separator(tool, &hq, &vocals, &ctx.id, ctx.cancel_flag(), &|line| ctx.log(line))?;

    let final_vocals = require_stem_any(&step2, &VOCALS_KEYWORDS, "Final vocals")?;
    ctx.step_complete(2);

    let name = format!("{}_vocals.{}", track, extension_of(&final_vocals));
    let delivered = deliver(&final_vocals, &ctx.output_dir, &name)?;
    Ok(vec![stem_file("vocals", &delivered)])
}

/// demucs 两轨分离后用 MDX 主模型降噪清理人声
pub fn hybrid_vocals(ctx: &JobContext, input: &Path, track: &str) -> AppResult<Vec<StemFile>> {
    let cfg = &ctx.config;

    ctx.step(1, "Step 1 — Demucs vocal split");
    let step1 = ctx.step_dir(1);
    let params = DemucsArgs::new(&cfg.demucs.model, &step1)
        .with_two_stems(Some("vocals"))
        .with_quality(cfg.demucs.shifts, cfg.demucs.overlap);
    let track_dir = demucs::run_demucs(&cfg.tools.demucs, &params, input, &ctx.id, ctx.cancel_flag(), &|line| ctx.log(line))?;

    let vocals = require_source(&track_dir, &step1, &format!("vocals.{}", params.extension()), "Vocals")?;
    ctx.step_complete(1);

    ctx.step(2, "Step 2 — MDX cleanup");
    let step2 = ctx.step_dir(2);
    let cleanup = SeparatorArgs::mdx(&cfg.separation.main_model, HYBRID_CLEANUP, "WAV", &step2)
        .with_single_stem("Vocals")
        .with_denoise(true)
        .with_model_file_dir(ctx.models_dir.clone());
    separator::run_separator(&cfg.tools.audio_separator, &cleanup, &vocals, &ctx.id, ctx.cancel_flag(), &|line| ctx.log(line))?;

    let final_vocals = require_stem_any(&step2, &VOCALS_KEYWORDS, "Final vocals")?;
    ctx.step_complete(2);

    let name = format!("{}_vocals.{}", track, extension_of(&final_vocals));
    let delivered = deliver(&final_vocals, &ctx.output_dir, &name)?;
    Ok(vec![stem_file("vocals", &delivered)])
}

/// 复制目录中的所有轨道到 <output>/<track>/
fn deliver_all(ctx: &JobContext, stems: &[PathBuf], track: &str) -> AppResult<Vec<StemFile>> {
    let dest = ctx.output_dir.join(track);
    let mut delivered = Vec::with_capacity(stems.len());
    for stem in stems {
        let file_name = stem
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| AppError::InvalidArgument(format!("无效的轨道路径: {}", stem.display())))?;
        let target = deliver(stem, &dest, &file_name)?;
        delivered.push(stem_file(&file_stem_string(stem), &target));
    }
    Ok(delivered)
}

/// demucs 多轨分离
pub fn demucs_stems(ctx: &JobContext, input: &Path, track: &str, options: &DemucsOptions) -> AppResult<Vec<StemFile>> {
    let cfg = &ctx.config;

    ctx.step(1, "Step 1 — Running Demucs");
    let step1 = ctx.step_dir(1);
    let mut params = DemucsArgs::new(&options.model, &step1)
        .with_two_stems(options.two_stems.as_deref())
        .with_mp3(options.mp3);
    params = if options.high_quality {
        params.high_quality()
    } else {
        params.with_quality(cfg.demucs.shifts, cfg.demucs.overlap)
    };
    let track_dir = demucs::run_demucs(&cfg.tools.demucs, &params, input, &ctx.id, ctx.cancel_flag(), &|line| ctx.log(line))?;

    let stems = list_stems(&track_dir, params.extension());
    if stems.is_empty() {
        return Err(AppError::StemNotFound("Stems file not found.".to_string()));
    }
    ctx.step_complete(1);

    deliver_all(ctx, &stems, track)
}

/// Open-Unmix 多轨分离，另外输出伴奏
pub fn unmix_stems(ctx: &JobContext, input: &Path, track: &str) -> AppResult<Vec<StemFile>> {
    let cfg = &ctx.config;

    ctx.step(1, "Step 1 — Running Open-Unmix");
    let step1 = ctx.step_dir(1);
    let track_dir = unmix::run_unmix(
        &cfg.tools.umx,
        &cfg.tools.ffmpeg,
        &cfg.unmix.model,
        input,
        &step1,
        &ctx.id,
        ctx.cancel_flag(),
        &|line| ctx.log(line),
    )?;

    let mut stems = Vec::new();
    for name in unmix::SOURCES.iter().chain(std::iter::once(&unmix::ACCOMPANIMENT_NAME)) {
        stems.push(require_source(&track_dir, &step1, &format!("{}.wav", name), name)?);
    }
    ctx.step_complete(1);

    deliver_all(ctx, &stems, track)
}
