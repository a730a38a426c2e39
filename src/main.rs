// vocalsplit - AI 人声分离命令行工具
// 主入口文件

mod audio;
mod cli;
mod commands;
mod config;
mod database;
mod download;
mod error;
mod input;
mod logging;
mod models;
mod pipeline;
mod presets;
mod process;
mod utils;

use cli::{CommandLine, Commands, InputArgs, JobArgs};
use commands::config as config_cmd;
use commands::{history, separate, system};
use error::{AppError, AppResult};
use pipeline::{DemucsOptions, JobKind};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use utils::AppState;

const DATA_DIR_ENV: &str = "VOCALSPLIT_DATA_DIR";

/// 获取应用数据目录
/// 优先 --data-dir，其次环境变量，最后使用系统本地数据目录
fn get_app_data_dir(cli_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = cli_dir {
        return dir.to_path_buf();
    }
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = dirs::data_local_dir() {
        return dir.join("vocalsplit");
    }

    // 回退到当前工作目录
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("data")
}

/// 初始化配置、数据库和目录
fn setup(state: &AppState) -> AppResult<()> {
    config::init_config(&state.config_path).map_err(|e| {
        error!("配置初始化失败: {}", e);
        e
    })?;

    database::init_database(&state.db_path).map_err(|e| {
        error!("数据库初始化失败: {}", e);
        e
    })?;

    // 创建临时文件目录
    if let Err(e) = std::fs::create_dir_all(state.temp_dir()) {
        warn!("创建临时目录失败: {}", e);
    }

    let output_dir = config::get_config().resolve_output_dir(&state.app_dir);
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        warn!("创建输出目录失败: {}", e);
    }
    Ok(())
}

/// 监听 Ctrl-C：第一次取消任务，第二次终止所有子进程并立即退出
async fn watch_interrupts(job_id: String) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("收到中断信号，正在取消任务: {}", job_id);
    eprintln!("\n正在取消... 再按一次 Ctrl-C 强制退出");
    process::cancel_job(&job_id);

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("再次收到中断信号，强制退出");
        process::cancel_all();
        std::process::exit(AppError::Cancelled.exit_code());
    }
}

/// 在阻塞线程中运行分离任务
///
/// 任务 ID 在启动阻塞线程前登记，任何时刻的 Ctrl-C 都能命中
async fn run_separation(state: AppState, kind: JobKind, input: InputArgs, job: JobArgs, json: bool) -> AppResult<()> {
    let job_id = utils::generate_id();
    process::reset_cancel_flag(&job_id);
    let cancel_watch = tokio::spawn(watch_interrupts(job_id.clone()));

    let registered = job_id.clone();
    let result =
        tokio::task::spawn_blocking(move || separate::run(&state, job_id, kind, input, job, json)).await;
    cancel_watch.abort();
    process::remove_cancel_flag(&registered);

    result??;
    Ok(())
}

async fn run(cli: CommandLine, state: AppState) -> AppResult<()> {
    setup(&state)?;
    let json = cli.json;

    match cli.command {
        Commands::Extract { input, preset, job } => {
            let preset = separate::resolve_preset(preset, &config::get_config());
            run_separation(state, JobKind::Extract(preset), input, job, json).await
        }
        Commands::Hybrid { input, job } => run_separation(state, JobKind::Hybrid, input, job, json).await,
        Commands::Demucs {
            input,
            model,
            two_stems,
            hq,
            mp3,
            job,
        } => {
            let options = DemucsOptions {
                model: model.unwrap_or_else(|| config::get_config().demucs.model),
                two_stems,
                high_quality: hq,
                mp3,
            };
            run_separation(state, JobKind::Demucs(options), input, job, json).await
        }
        Commands::Unmix { input, job } => run_separation(state, JobKind::Unmix, input, job, json).await,
        Commands::Presets => system::list_presets(json),
        Commands::Models => system::list_models(&state, json),
        Commands::Check => tokio::task::spawn_blocking(move || system::check(json)).await?,
        Commands::History { limit } => history::list(limit, json),
        Commands::Clean { downloads } => config_cmd::clean(&state, downloads, json),
        Commands::Config { action } => config_cmd::run(&state, action, json),
    }
}

fn report_error(e: &AppError, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "error": e }));
    } else {
        eprintln!("错误: {}", e);
    }
}

#[tokio::main]
async fn main() {
    let cli = CommandLine::parse_args();

    let app_dir = get_app_data_dir(cli.data_dir.as_deref());
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        eprintln!("创建数据目录失败 {}: {}", app_dir.display(), e);
        std::process::exit(1);
    }

    // guard 必须保持存活，否则异步日志线程会退出
    let log_guard = logging::init_logging(&app_dir, cli.verbose);
    info!("vocalsplit {} 启动, 数据目录: {:?}", env!("CARGO_PKG_VERSION"), app_dir);

    let json = cli.json;
    let code = match run(cli, AppState::new(&app_dir)).await {
        Ok(()) => 0,
        Err(e) => {
            match &e {
                AppError::Cancelled => warn!("任务已取消"),
                other => error!("命令失败: {}", other),
            }
            report_error(&e, json);
            e.exit_code()
        }
    };

    // process::exit 不会运行析构，先刷新日志
    drop(log_guard);
    std::process::exit(code);
}
