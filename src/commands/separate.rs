// 分离命令
//
// 外部工具输出与步骤标题写到 stderr，结果路径写到 stdout

use crate::cli::{InputArgs, JobArgs};
use crate::config::{self, AppConfig};
use crate::error::AppResult;
use crate::input::AudioInput;
use crate::models;
use crate::pipeline::{self, EventCallback, JobContext, JobEvent, JobKind};
use crate::presets::Preset;
use crate::utils::{AppState, SeparationResult};
use std::path::PathBuf;
use tracing::warn;

/// 未指定 --preset 时使用配置中的默认预设
pub fn resolve_preset(preset: Option<Preset>, config: &AppConfig) -> Preset {
    match preset {
        Some(preset) => preset,
        None => config.separation.default_preset.parse().unwrap_or_else(|e| {
            warn!("配置中的默认预设无效: {}，使用 normal", e);
            Preset::Normal
        }),
    }
}

/// 任务使用的模型（显示名），按执行顺序
pub fn job_models(kind: &JobKind, config: &AppConfig) -> Vec<String> {
    let by_file = |file: &str| models::get_model_by_filename(file).map(|m| m.name).unwrap_or_else(|| file.to_string());
    let by_id = |id: &str| models::get_model_by_id(id).map(|m| m.name).unwrap_or_else(|| id.to_string());

    match kind {
        JobKind::Extract(_) => vec![
            by_file(&config.separation.main_model),
            by_file(&config.separation.hq_model),
        ],
        JobKind::Hybrid => vec![by_id(&config.demucs.model), by_file(&config.separation.main_model)],
        JobKind::Demucs(options) => vec![by_id(&options.model)],
        JobKind::Unmix => vec![by_id(&config.unmix.model)],
    }
}

fn console_events() -> EventCallback {
    Box::new(|event: JobEvent<'_>| match event {
        JobEvent::Step { title, .. } => eprintln!("\n==> {}", title),
        JobEvent::StepComplete { number } => eprintln!("==> Step {} done", number),
        JobEvent::Log(line) => eprintln!("{}", line),
    })
}

/// 运行一次分离任务（阻塞，需在 spawn_blocking 中调用）
///
/// job_id 需已通过 process::reset_cancel_flag 登记
pub fn run(
    state: &AppState,
    job_id: String,
    kind: JobKind,
    input: InputArgs,
    job: JobArgs,
    json: bool,
) -> AppResult<SeparationResult> {
    let cfg = config::get_config();
    let audio = AudioInput::from_args(input.file, input.link)?;

    let output_dir: PathBuf = job.output.unwrap_or_else(|| cfg.resolve_output_dir(&state.app_dir));
    let models_dir = models::ensure_models_dir(cfg.separation.models_dir.as_deref(), &state.app_dir)?;

    eprintln!("Models: {}", job_models(&kind, &cfg).join(" → "));
    if let Some(preset) = kind.preset() {
        eprintln!("Preset: {} ({})", preset.label(), preset.note());
        eprintln!("Estimated time: {}", preset.eta());
    }

    let ctx = JobContext::with_id(
        job_id,
        cfg,
        &state.temp_dir(),
        &output_dir,
        Some(models_dir),
        job.keep_temp,
        console_events(),
    );
    let result = pipeline::run_job(&ctx, &kind, &audio)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for stem in &result.stems {
            println!("{}", stem.path);
        }
        if job.keep_temp {
            eprintln!("临时文件保留在: {}", state.temp_dir().display());
        }
    }
    Ok(result)
}
