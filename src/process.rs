// 外部进程模块
//
// 启动外部工具，逐行转发 stdout/stderr 输出，支持按任务 ID 即时取消

use crate::error::{AppError, AppResult};
use crate::utils::ToolCommand;
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ExitStatus, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 失败信息保留的日志长度
const ERROR_DETAIL_CHARS: usize = 500;

/// 运行期间保留的输出尾部上限（字节）
const LOG_TAIL_BYTES: usize = ERROR_DETAIL_CHARS * 4;

/// 轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type ChildHandle = Arc<Mutex<Option<Child>>>;

// 按任务 ID 管理的取消标志与子进程句柄
lazy_static::lazy_static! {
    static ref CANCEL_FLAGS: Mutex<HashMap<String, Arc<AtomicBool>>> = Mutex::new(HashMap::new());
    static ref CHILD_PROCESSES: Mutex<HashMap<String, Vec<ChildHandle>>> = Mutex::new(HashMap::new());
}

/// 进程运行结果
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: Option<i32>,
    /// stdout 与 stderr 合并后的输出尾部
    pub tail: String,
}

/// 只保留最近输出的行缓冲，长时间运行的工具不会让内存无限增长
#[derive(Debug, Default)]
struct LogTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl LogTail {
    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        // 至少保留最后一行
        while self.bytes > LOG_TAIL_BYTES && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|line| line.trim().is_empty())
    }

    fn text(&self) -> String {
        let mut text = String::with_capacity(self.bytes);
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }
}

/// 重置任务的取消标志（开始新任务时调用）
pub fn reset_cancel_flag(job_id: &str) -> Arc<AtomicBool> {
    let mut flags = CANCEL_FLAGS.lock();
    let flag = flags
        .entry(job_id.to_string())
        .or_insert_with(|| Arc::new(AtomicBool::new(false)));
    flag.store(false, Ordering::SeqCst);
    flag.clone()
}

/// 获取任务的取消标志，不存在时创建；已有标志保持原状态
pub fn cancel_flag(job_id: &str) -> Arc<AtomicBool> {
    CANCEL_FLAGS
        .lock()
        .entry(job_id.to_string())
        .or_insert_with(|| Arc::new(AtomicBool::new(false)))
        .clone()
}

/// 清理任务的取消标志
pub fn remove_cancel_flag(job_id: &str) {
    CANCEL_FLAGS.lock().remove(job_id);
}

/// 注册子进程到任务（用于即时取消）
pub fn register_child_process(job_id: &str, child: Child) -> ChildHandle {
    let handle = Arc::new(Mutex::new(Some(child)));
    CHILD_PROCESSES
        .lock()
        .entry(job_id.to_string())
        .or_default()
        .push(handle.clone());
    handle
}

/// 清理任务的所有子进程句柄
pub fn clear_child_processes(job_id: &str) {
    CHILD_PROCESSES.lock().remove(job_id);
}

/// kill 任务的所有子进程
fn kill_child_processes(job_id: &str) {
    let processes = CHILD_PROCESSES.lock();
    if let Some(handles) = processes.get(job_id) {
        for handle in handles {
            if let Some(ref mut child) = *handle.lock() {
                info!("正在终止子进程: job_id={}, pid={}", job_id, child.id());
                let _ = child.kill();
            }
        }
    }
}

/// 取消指定任务：设置取消标志并立即终止子进程
pub fn cancel_job(job_id: &str) {
    if let Some(flag) = CANCEL_FLAGS.lock().get(job_id) {
        flag.store(true, Ordering::SeqCst);
    }
    kill_child_processes(job_id);
}

/// 取消所有正在运行的任务（Ctrl-C）
pub fn cancel_all() {
    let job_ids: Vec<String> = CANCEL_FLAGS.lock().keys().cloned().collect();
    for job_id in job_ids {
        info!("取消任务: job_id={}", job_id);
        cancel_job(&job_id);
    }
}

/// 解析进度输出
/// 格式类似: "100%|██████████| 100/100 [00:10<00:00, 10.00it/s]"
pub fn parse_progress(line: &str) -> Option<f32> {
    let pos = line.find('%')?;
    let start = line[..pos]
        .rfind(|c: char| !c.is_ascii_digit() && c != '.')
        .map(|i| i + 1)
        .unwrap_or(0);
    line[start..pos].parse::<f32>().ok().map(|p| (p / 100.0).clamp(0.0, 1.0))
}

/// 按 \n 或 \r 切分输出并发送到通道（tqdm 用 \r 刷新进度）
fn pump_lines<R: Read>(reader: R, tx: Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut current: Vec<u8> = Vec::new();

    let flush = |current: &mut Vec<u8>| {
        if !current.is_empty() {
            let line = String::from_utf8_lossy(current).trim_end().to_string();
            if !line.trim().is_empty() {
                let _ = tx.send(line);
            }
            current.clear();
        }
    };

    loop {
        let consumed = match reader.fill_buf() {
            Ok([]) => break,
            Ok(buf) => {
                for &b in buf {
                    if b == b'\n' || b == b'\r' {
                        flush(&mut current);
                    } else {
                        current.push(b);
                    }
                }
                buf.len()
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        reader.consume(consumed);
    }
    flush(&mut current);
}

fn spawn_error(tool: &ToolCommand, e: std::io::Error) -> AppError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AppError::DependencyMissing(format!("未找到 {}，请安装并添加到 PATH", tool.program))
    } else {
        AppError::ProcessFailed {
            tool: tool.name(),
            code: None,
            detail: format!("启动失败: {}", e),
        }
    }
}

/// 日志尾部（Python 异常信息通常在最后）
fn log_tail(log: &str) -> String {
    let count = log.chars().count();
    if count <= ERROR_DETAIL_CHARS {
        return log.to_string();
    }
    log.chars().skip(count - ERROR_DETAIL_CHARS).collect()
}

/// 运行外部工具并逐行回调输出
///
/// stdout 与 stderr 合并；非零退出码返回 ProcessFailed，
/// 取消标志被设置时终止子进程并返回 Cancelled
pub fn run_with_logs(
    tool: &ToolCommand,
    args: &[String],
    job_id: &str,
    cancel_flag: &AtomicBool,
    on_line: &dyn Fn(&str),
) -> AppResult<RunOutput> {
    if cancel_flag.load(Ordering::SeqCst) {
        return Err(AppError::Cancelled);
    }

    info!("执行命令: {}", tool.display_with(args));

    let mut cmd = tool.command();
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        error!("启动 {} 失败: {}", tool.program, e);
        spawn_error(tool, e)
    })?;

    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || pump_lines(stdout, tx)));
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        readers.push(std::thread::spawn(move || pump_lines(stderr, tx)));
    }
    drop(tx);

    let child_handle = register_child_process(job_id, child);
    debug!("子进程已注册: job_id={}", job_id);

    let mut tail = LogTail::default();

    // 读取输出直到两个管道都关闭
    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            return Err(abort_child(&child_handle, job_id));
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                debug!("{}: {}", tool.name(), line);
                if let Some(progress) = parse_progress(&line) {
                    debug!("进度: {:.1}%", progress * 100.0);
                }
                on_line(&line);
                tail.push(&line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for reader in readers {
        let _ = reader.join();
    }

    // 管道关闭后等待进程退出
    let status = loop {
        if cancel_flag.load(Ordering::SeqCst) {
            return Err(abort_child(&child_handle, job_id));
        }
        match try_wait(&child_handle)? {
            Some(status) => break status,
            None => std::thread::sleep(POLL_INTERVAL),
        }
    };

    info!("{} 进程退出码: {:?}", tool.name(), status.code());

    if !status.success() {
        error!("{} 处理失败，退出码: {:?}", tool.name(), status.code());
        let detail = if tail.is_empty() {
            "无详细错误信息".to_string()
        } else {
            log_tail(tail.text().trim_end())
        };
        return Err(AppError::ProcessFailed {
            tool: tool.name(),
            code: status.code(),
            detail,
        });
    }

    Ok(RunOutput {
        code: status.code(),
        tail: tail.text(),
    })
}

/// 检查进程状态，退出后释放句柄
fn try_wait(handle: &ChildHandle) -> AppResult<Option<ExitStatus>> {
    let mut guard = handle.lock();
    let child = match guard.as_mut() {
        Some(child) => child,
        None => return Err(AppError::Cancelled),
    };
    match child.try_wait()? {
        Some(status) => {
            guard.take();
            Ok(Some(status))
        }
        None => Ok(None),
    }
}

fn abort_child(handle: &ChildHandle, job_id: &str) -> AppError {
    info!("任务被取消: job_id={}", job_id);
    if let Some(mut child) = handle.lock().take() {
        let _ = child.kill();
        let _ = child.wait();
    }
    AppError::Cancelled
}

/// 运行外部工具并捕获输出（用于版本探测等短命令）
pub fn run_capture(tool: &ToolCommand, args: &[&str]) -> AppResult<Output> {
    let output = tool
        .command()
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| spawn_error(tool, e))?;
    if !output.status.success() {
        warn!("{} {:?} 退出码: {:?}", tool.name(), args, output.status.code());
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("100%|██████████| 100/100 [00:10<00:00]"), Some(1.0));
        assert_eq!(parse_progress(" 45%|████▌     | 45/100"), Some(0.45));
        assert_eq!(parse_progress("12.5% done"), Some(0.125));
        assert_eq!(parse_progress("no progress here"), None);
        assert_eq!(parse_progress("%"), None);
    }

    #[test]
    fn test_log_tail() {
        let long = "x".repeat(600) + "END";
        let tail = log_tail(&long);
        assert_eq!(tail.chars().count(), ERROR_DETAIL_CHARS);
        assert!(tail.ends_with("END"));
        assert_eq!(log_tail("short"), "short");
    }

    #[test]
    fn test_missing_program() {
        let tool = ToolCommand::new("vocalsplit-definitely-missing-tool");
        let flag = AtomicBool::new(false);
        let err = run_with_logs(&tool, &[], "test-missing", &flag, &|_| {}).unwrap_err();
        assert!(matches!(err, AppError::DependencyMissing(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let tool = ToolCommand::new("true");
        let flag = AtomicBool::new(true);
        let err = run_with_logs(&tool, &[], "test-precancel", &flag, &|_| {}).unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_stdout_and_stderr() {
        let tool = ToolCommand::with_args("sh", &["-c", "echo first; echo second 1>&2; printf '10%%\\r50%%\\rdone\\n'"]);
        let flag = AtomicBool::new(false);
        let seen = Mutex::new(Vec::new());
        let output = run_with_logs(&tool, &[], "test-stream", &flag, &|line| {
            seen.lock().push(line.to_string());
        })
        .unwrap();
        clear_child_processes("test-stream");

        let seen = seen.into_inner();
        assert!(seen.contains(&"first".to_string()));
        assert!(seen.contains(&"second".to_string()));
        assert!(seen.contains(&"50%".to_string()));
        assert!(seen.contains(&"done".to_string()));
        assert_eq!(output.code, Some(0));
        assert!(output.tail.contains("first"));
    }

    #[test]
    fn test_log_tail_buffer_is_bounded() {
        let mut tail = LogTail::default();
        for i in 0..10_000 {
            tail.push(&format!("line {} {}", i, "x".repeat(40)));
        }
        assert!(tail.bytes <= LOG_TAIL_BYTES);
        assert_eq!(tail.bytes, tail.text().len());
        assert!(tail.text().ends_with(&format!("line 9999 {}\n", "x".repeat(40))));
        assert!(!tail.text().contains("line 0 "));

        // 超长单行也保留
        let mut single = LogTail::default();
        single.push(&"y".repeat(LOG_TAIL_BYTES * 2));
        assert_eq!(single.lines.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_long_running_output_keeps_only_tail() {
        let tool = ToolCommand::with_args(
            "sh",
            &["-c", "i=0; while [ $i -lt 5000 ]; do echo \"progress line $i\"; i=$((i+1)); done; echo 'Traceback: final error'; exit 2"],
        );
        let flag = AtomicBool::new(false);
        let lines = std::sync::atomic::AtomicUsize::new(0);
        let err = run_with_logs(&tool, &[], "test-long-output", &flag, &|_| {
            lines.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
        clear_child_processes("test-long-output");

        assert_eq!(lines.load(Ordering::SeqCst), 5001);
        match err {
            AppError::ProcessFailed { detail, .. } => {
                assert!(detail.ends_with("Traceback: final error"));
                assert!(detail.chars().count() <= ERROR_DETAIL_CHARS);
                assert!(!detail.contains("progress line 0\n"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_flag_keeps_existing_state() {
        let job_id = "test-cancel-flag-existing";
        reset_cancel_flag(job_id);
        cancel_job(job_id);

        // 任务开始前的取消请求不会被覆盖
        let flag = cancel_flag(job_id);
        assert!(flag.load(Ordering::SeqCst));
        assert!(!reset_cancel_flag(job_id).load(Ordering::SeqCst));
        remove_cancel_flag(job_id);

        assert!(!cancel_flag("test-cancel-flag-fresh").load(Ordering::SeqCst));
        remove_cancel_flag("test-cancel-flag-fresh");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit() {
        let tool = ToolCommand::with_args("sh", &["-c", "echo 'Traceback: boom'; exit 3"]);
        let flag = AtomicBool::new(false);
        let err = run_with_logs(&tool, &[], "test-fail", &flag, &|_| {}).unwrap_err();
        clear_child_processes("test-fail");
        match err {
            AppError::ProcessFailed { tool, code, detail } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, Some(3));
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_kills_running_child() {
        let job_id = "test-cancel-running";
        let flag = reset_cancel_flag(job_id);
        let tool = ToolCommand::with_args("sh", &["-c", "echo started; sleep 30"]);

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            cancel_job(job_id);
        });

        let started = std::time::Instant::now();
        let err = run_with_logs(&tool, &[], job_id, &flag, &|_| {}).unwrap_err();
        canceller.join().unwrap();
        remove_cancel_flag(job_id);
        clear_child_processes(job_id);

        assert!(matches!(err, AppError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
