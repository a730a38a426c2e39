// 链接下载模块
//
// 普通链接交给 yt-dlp 提取音频；直链音频文件用 HTTP 直接下载；
// 下载结果按链接缓存，避免重复下载

use crate::audio::stems::find_stem;
use crate::config::DownloadConfig;
use crate::database;
use crate::error::{AppError, AppResult};
use crate::process;
use crate::utils::{file_stem_string, ToolCommand};
use once_cell::sync::Lazy;
use crossbeam_channel::RecvTimeoutError;
use regex::Regex;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP 连接超时
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// HTTP 读取超时（两次收到数据之间的最长间隔）
const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// 检查取消标志的间隔
const HTTP_POLL_INTERVAL: Duration = Duration::from_millis(100);

const HTTP_CHUNK_SIZE: usize = 64 * 1024;

static SPOTIFY_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://open\.spotify\.com/").expect("valid regex")
});

static DIRECT_AUDIO_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^https?://[^?#\s]+\.(mp3|wav|flac)([?#].*)?$").expect("valid regex")
});

/// 规范化链接：去掉首尾空白；Spotify 链接转成 yt-dlp 的 YouTube 搜索
pub fn normalize_link(link: &str) -> String {
    let link = link.trim();
    if SPOTIFY_LINK.is_match(link) {
        spotify_to_ytsearch(link)
    } else {
        link.to_string()
    }
}

/// yt-dlp 会自动在 YouTube 搜索
pub fn spotify_to_ytsearch(url: &str) -> String {
    format!("ytsearch1:{}", url)
}

/// 是否为音频文件直链，返回扩展名
pub fn direct_audio_extension(link: &str) -> Option<String> {
    DIRECT_AUDIO_URL
        .captures(link.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// 下载文件名：规范化链接的 SHA256 前 16 位
pub fn download_file_name(normalized_link: &str, extension: &str) -> String {
    let digest = Sha256::digest(normalized_link.as_bytes());
    let hash = hex::encode(digest);
    format!("{}.{}", &hash[..16], extension)
}

pub fn build_ytdlp_args(link: &str, output: &Path, audio_format: &str, audio_quality: &str) -> Vec<String> {
    vec![
        "-x".to_string(),
        "--audio-format".to_string(),
        audio_format.to_string(),
        "--audio-quality".to_string(),
        audio_quality.to_string(),
        "-o".to_string(),
        output.to_string_lossy().to_string(),
        link.to_string(),
    ]
}

/// 链接下载器
pub struct Downloader {
    yt_dlp: ToolCommand,
    config: DownloadConfig,
}

impl Downloader {
    pub fn new(yt_dlp: ToolCommand, config: DownloadConfig) -> Self {
        Self { yt_dlp, config }
    }

    /// 下载链接中的音频
    pub fn download_audio(
        &self,
        link: &str,
        out_dir: &Path,
        job_id: &str,
        cancel_flag: &AtomicBool,
        on_line: &dyn Fn(&str),
    ) -> AppResult<PathBuf> {
        let normalized = normalize_link(link);
        if normalized.is_empty() {
            return Err(AppError::InvalidArgument("链接为空".to_string()));
        }
        fs::create_dir_all(out_dir)?;

        if let Some(ext) = direct_audio_extension(&normalized) {
            let out_file = out_dir.join(download_file_name(&normalized, &ext));
            return http_download(&normalized, &out_file, cancel_flag);
        }

        let out_file = out_dir.join(download_file_name(&normalized, &self.config.audio_format));
        info!("下载音频: {} -> {}", normalized, out_file.display());

        let args = build_ytdlp_args(
            &normalized,
            &out_file,
            &self.config.audio_format,
            &self.config.audio_quality,
        );
        process::run_with_logs(&self.yt_dlp, &args, job_id, cancel_flag, on_line).map_err(|e| match e {
            AppError::ProcessFailed { detail, .. } => AppError::Download(detail),
            other => other,
        })?;

        if out_file.exists() {
            return Ok(out_file);
        }

        // yt-dlp 转码后可能改写扩展名，按哈希前缀查找
        let prefix = file_stem_string(&out_file);
        find_stem(out_dir, &prefix)
            .ok_or_else(|| AppError::Download(format!("下载完成但未找到输出文件: {}", out_file.display())))
    }

    /// 带缓存的下载：同一链接且文件仍存在时直接复用
    pub fn get_cached_download(
        &self,
        link: &str,
        out_dir: &Path,
        job_id: &str,
        cancel_flag: &AtomicBool,
        on_line: &dyn Fn(&str),
    ) -> AppResult<PathBuf> {
        self.get_cached_download_with(database::get_conn, link, out_dir, job_id, cancel_flag, on_line)
    }

    /// 缓存查询与写入各自短暂取用连接，下载期间不持有数据库锁
    fn get_cached_download_with<C, F>(
        &self,
        conn: F,
        link: &str,
        out_dir: &Path,
        job_id: &str,
        cancel_flag: &AtomicBool,
        on_line: &dyn Fn(&str),
    ) -> AppResult<PathBuf>
    where
        C: Deref<Target = Connection>,
        F: Fn() -> AppResult<C>,
    {
        let normalized = normalize_link(link);

        if self.config.cache_enabled {
            match conn().and_then(|c| database::get_cached_download_with(&c, &normalized)) {
                Ok(Some(path)) if Path::new(&path).exists() => {
                    info!("使用缓存的下载: {}", path);
                    return Ok(PathBuf::from(path));
                }
                Ok(Some(path)) => {
                    info!("缓存文件已不存在，重新下载: {}", path);
                    if let Err(e) = conn().and_then(|c| database::remove_cached_download_with(&c, &normalized)) {
                        warn!("删除失效缓存记录失败: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("读取下载缓存失败: {}", e),
            }
        }

        let path = self.download_audio(&normalized, out_dir, job_id, cancel_flag, on_line)?;

        if self.config.cache_enabled {
            let saved = path.to_string_lossy();
            if let Err(e) = conn().and_then(|c| database::put_cached_download_with(&c, &normalized, &saved)) {
                warn!("写入下载缓存失败: {}", e);
            }
        }
        Ok(path)
    }
}

/// 下载线程发往调用线程的消息
enum HttpChunk {
    Data(Vec<u8>),
    Done,
    Failed(AppError),
}

/// 在后台线程中请求并读取响应，数据块经通道送回
fn spawn_http_reader(url: &str) -> crossbeam_channel::Receiver<HttpChunk> {
    let (tx, rx) = crossbeam_channel::bounded::<HttpChunk>(16);
    let url = url.to_string();

    std::thread::spawn(move || {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HTTP_CONNECT_TIMEOUT)
            .timeout_read(HTTP_READ_TIMEOUT)
            .build();
        let response = match agent.get(&url).call() {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send(HttpChunk::Failed(e.into()));
                return;
            }
        };

        let mut reader = response.into_reader();
        let mut buffer = vec![0u8; HTTP_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    let _ = tx.send(HttpChunk::Done);
                    return;
                }
                Ok(n) => {
                    // 接收端已放弃（取消），停止读取
                    if tx.send(HttpChunk::Data(buffer[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = tx.send(HttpChunk::Failed(AppError::Download(format!("读取响应失败: {}", e))));
                    return;
                }
            }
        }
    });
    rx
}

/// HTTP 直接下载，先写临时文件再重命名
///
/// 取消标志被设置时立即返回 Cancelled，并删除未完成的临时文件
fn http_download(url: &str, out_file: &Path, cancel_flag: &AtomicBool) -> AppResult<PathBuf> {
    if out_file.exists() {
        return Ok(out_file.to_path_buf());
    }
    if cancel_flag.load(Ordering::SeqCst) {
        return Err(AppError::Cancelled);
    }
    info!("HTTP 下载: {} -> {}", url, out_file.display());

    let part = out_file.with_extension("part");
    let mut file = fs::File::create(&part)?;
    let rx = spawn_http_reader(url);
    let mut received: u64 = 0;

    let outcome = loop {
        if cancel_flag.load(Ordering::SeqCst) {
            info!("HTTP 下载已取消: {}", url);
            break Err(AppError::Cancelled);
        }
        match rx.recv_timeout(HTTP_POLL_INTERVAL) {
            Ok(HttpChunk::Data(bytes)) => {
                if let Err(e) = file.write_all(&bytes) {
                    break Err(AppError::Download(format!("写入文件失败: {}", e)));
                }
                received += bytes.len() as u64;
            }
            Ok(HttpChunk::Done) => break file.flush().map_err(AppError::from),
            Ok(HttpChunk::Failed(e)) => break Err(e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                break Err(AppError::Download("下载线程意外退出".to_string()))
            }
        }
    };
    drop(file);

    match outcome {
        Ok(()) => {
            debug!("HTTP 下载完成: {} 字节", received);
            fs::rename(&part, out_file)?;
            Ok(out_file.to_path_buf())
        }
        Err(e) => {
            if let Err(remove_err) = fs::remove_file(&part) {
                warn!("删除未完成的下载失败 {}: {}", part.display(), remove_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::time::Instant;

    /// 模拟 yt-dlp：向 -o 指定的文件写入内容
    const FAKE_YTDLP: &str = r#"out=""; prev=""; for a in "$@"; do if [ "$prev" = "-o" ]; then out="$a"; fi; prev="$a"; done; echo "[download] 100%"; printf audio > "$out""#;

    fn fake_ytdlp(script: &str) -> ToolCommand {
        ToolCommand::with_args("sh", &["-c", script, "yt-dlp"])
    }

    /// 本地 HTTP 服务：读取请求后写出固定响应，再保持连接 hold 时长
    fn serve_once(response: &'static [u8], hold: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 2048];
                let _ = stream.read(&mut request);
                let _ = stream.write_all(response);
                let _ = stream.flush();
                std::thread::sleep(hold);
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_normalize_link() {
        assert_eq!(normalize_link("  https://youtu.be/abc \n"), "https://youtu.be/abc");
        assert_eq!(
            normalize_link("https://open.spotify.com/track/123"),
            "ytsearch1:https://open.spotify.com/track/123"
        );
    }

    #[test]
    fn test_direct_audio_extension() {
        assert_eq!(direct_audio_extension("https://cdn.example.com/a/song.MP3"), Some("mp3".to_string()));
        assert_eq!(direct_audio_extension("http://x.org/t.flac?sig=1"), Some("flac".to_string()));
        assert_eq!(direct_audio_extension("https://www.youtube.com/watch?v=abc"), None);
        assert_eq!(direct_audio_extension("ftp://x.org/t.wav"), None);
    }

    #[test]
    fn test_download_file_name_is_stable() {
        let a = download_file_name("https://youtu.be/abc", "mp3");
        let b = download_file_name("https://youtu.be/abc", "mp3");
        let c = download_file_name("https://youtu.be/xyz", "mp3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16 + ".mp3".len());
    }

    #[test]
    fn test_ytdlp_args() {
        let args = build_ytdlp_args("https://youtu.be/abc", Path::new("temp/downloads/x.mp3"), "mp3", "0");
        assert_eq!(
            args,
            vec![
                "-x", "--audio-format", "mp3", "--audio-quality", "0",
                "-o", "temp/downloads/x.mp3", "https://youtu.be/abc",
            ]
        );
    }

    #[test]
    fn test_empty_link_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(ToolCommand::new("yt-dlp"), DownloadConfig::default());
        let flag = AtomicBool::new(false);
        let err = downloader
            .download_audio("   ", dir.path(), "test-dl-empty", &flag, &|_| {})
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_download_with_fake_ytdlp() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(fake_ytdlp(FAKE_YTDLP), DownloadConfig::default());
        let flag = AtomicBool::new(false);

        let path = downloader
            .download_audio("https://youtu.be/abc", dir.path(), "test-dl-fake", &flag, &|_| {})
            .unwrap();
        crate::process::clear_child_processes("test-dl-fake");

        assert_eq!(path, dir.path().join(download_file_name("https://youtu.be/abc", "mp3")));
        assert_eq!(fs::read_to_string(path).unwrap(), "audio");
    }

    #[cfg(unix)]
    #[test]
    fn test_download_failure_maps_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ToolCommand::with_args("sh", &["-c", "echo 'ERROR: Video unavailable'; exit 1", "yt-dlp"]);
        let downloader = Downloader::new(tool, DownloadConfig::default());
        let flag = AtomicBool::new(false);

        let err = downloader
            .download_audio("https://youtu.be/gone", dir.path(), "test-dl-fail", &flag, &|_| {})
            .unwrap_err();
        crate::process::clear_child_processes("test-dl-fail");

        match err {
            AppError::Download(detail) => assert!(detail.contains("Video unavailable")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_http_download_direct_link() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\naudio",
            Duration::ZERO,
        );
        let link = format!("{}/track.mp3", base);
        let downloader = Downloader::new(ToolCommand::new("vocalsplit-missing-yt-dlp"), DownloadConfig::default());
        let flag = AtomicBool::new(false);

        let path = downloader.download_audio(&link, dir.path(), "test-http-ok", &flag, &|_| {}).unwrap();
        assert_eq!(path, dir.path().join(download_file_name(&link, "mp3")));
        assert_eq!(fs::read_to_string(&path).unwrap(), "audio");
        assert!(!path.with_extension("part").exists());
    }

    #[test]
    fn test_http_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", Duration::ZERO);
        let out_file = dir.path().join("gone.mp3");
        let flag = AtomicBool::new(false);

        let err = http_download(&format!("{}/gone.mp3", base), &out_file, &flag).unwrap_err();
        assert!(matches!(err, AppError::Http(_)));
        assert!(!out_file.exists());
        assert!(!out_file.with_extension("part").exists());
    }

    #[test]
    fn test_http_download_cancelled_while_stalled() {
        let dir = tempfile::tempdir().unwrap();
        // 声明 1000 字节，只发送 7 字节后停住
        let base = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\npartial",
            Duration::from_secs(5),
        );
        let out_file = dir.path().join("stall.mp3");
        let flag = Arc::new(AtomicBool::new(false));

        let canceller = {
            let flag = flag.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                flag.store(true, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        let err = http_download(&format!("{}/stall.mp3", base), &out_file, &flag).unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, AppError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!out_file.exists());
        assert!(!out_file.with_extension("part").exists());
    }

    #[test]
    fn test_http_download_cancelled_before_request() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("never.mp3");
        let flag = AtomicBool::new(true);

        let err = http_download("http://127.0.0.1:9/never.mp3", &out_file, &flag).unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
        assert!(!out_file.with_extension("part").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cached_download_hit_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let conn = database::open_test_connection();
        let cached = dir.path().join("cached.mp3");
        fs::write(&cached, "cached").unwrap();
        database::put_cached_download_with(&conn, "https://youtu.be/abc", &cached.to_string_lossy()).unwrap();

        // 命中缓存时不会调用 yt-dlp
        let downloader = Downloader::new(fake_ytdlp("echo 'should not run'; exit 1"), DownloadConfig::default());
        let flag = AtomicBool::new(false);
        let path = downloader
            .get_cached_download_with(|| Ok::<_, AppError>(&conn), " https://youtu.be/abc ", dir.path(), "test-cache-hit", &flag, &|_| {})
            .unwrap();

        assert_eq!(path, cached);
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_cache_entry_redownloads() {
        let dir = tempfile::tempdir().unwrap();
        let conn = database::open_test_connection();
        let link = "https://youtu.be/stale";
        let missing = dir.path().join("deleted.mp3");
        database::put_cached_download_with(&conn, link, &missing.to_string_lossy()).unwrap();

        let downloader = Downloader::new(fake_ytdlp(FAKE_YTDLP), DownloadConfig::default());
        let flag = AtomicBool::new(false);
        let path = downloader
            .get_cached_download_with(|| Ok::<_, AppError>(&conn), link, dir.path(), "test-cache-stale", &flag, &|_| {})
            .unwrap();
        crate::process::clear_child_processes("test-cache-stale");

        assert_eq!(path, dir.path().join(download_file_name(link, "mp3")));
        assert_eq!(fs::read_to_string(&path).unwrap(), "audio");
        // 失效记录被新路径替换
        let recorded = database::get_cached_download_with(&conn, link).unwrap();
        assert_eq!(recorded.as_deref(), Some(path.to_string_lossy().as_ref()));
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_unavailable_still_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(fake_ytdlp(FAKE_YTDLP), DownloadConfig::default());
        let flag = AtomicBool::new(false);
        let unavailable = || -> AppResult<&'static Connection> { Err(AppError::Database(rusqlite::Error::InvalidQuery)) };

        let path = downloader
            .get_cached_download_with(unavailable, "https://youtu.be/nodb", dir.path(), "test-cache-nodb", &flag, &|_| {})
            .unwrap();
        crate::process::clear_child_processes("test-cache-nodb");

        assert_eq!(fs::read_to_string(path).unwrap(), "audio");
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_disabled_ignores_records() {
        let dir = tempfile::tempdir().unwrap();
        let conn = database::open_test_connection();
        let link = "https://youtu.be/nocache";
        let cached = dir.path().join("old.mp3");
        fs::write(&cached, "old").unwrap();
        database::put_cached_download_with(&conn, link, &cached.to_string_lossy()).unwrap();

        let config = DownloadConfig {
            cache_enabled: false,
            ..DownloadConfig::default()
        };
        let downloader = Downloader::new(fake_ytdlp(FAKE_YTDLP), config);
        let flag = AtomicBool::new(false);
        let path = downloader
            .get_cached_download_with(|| Ok::<_, AppError>(&conn), link, dir.path(), "test-cache-off", &flag, &|_| {})
            .unwrap();
        crate::process::clear_child_processes("test-cache-off");

        assert_ne!(path, cached);
        assert_eq!(fs::read_to_string(path).unwrap(), "audio");
        let recorded = database::get_cached_download_with(&conn, link).unwrap();
        assert_eq!(recorded.as_deref(), Some(cached.to_string_lossy().as_ref()));
    }
}
