// 数据库模块
//
// 记录任务历史和链接下载缓存

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use once_cell::sync::OnceCell;
use tracing::{warn, error, debug};
use crate::error::{AppError, AppResult};

static DB: OnceCell<Mutex<Connection>> = OnceCell::new();

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }
}

/// 任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    /// extract / hybrid / demucs / unmix
    pub kind: String,
    pub input: String,
    pub preset: Option<String>,
    pub status: JobStatus,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

fn now_string() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 创建表结构
fn create_tables(conn: &Connection) -> AppResult<()> {
    // 任务表
    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            input TEXT NOT NULL,
            preset TEXT,
            status TEXT NOT NULL DEFAULT 'running',
            output_path TEXT,
            error TEXT,
            created_at TEXT NOT NULL,
            finished_at TEXT
        )",
        [],
    )?;

    // 创建时间索引（用于排序）
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)",
        [],
    )?;

    // 下载缓存表
    conn.execute(
        "CREATE TABLE IF NOT EXISTS download_cache (
            link TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// 初始化数据库
pub fn init_database(db_path: &Path) -> AppResult<()> {
    let conn = Connection::open(db_path)?;
    create_tables(&conn)?;

    DB.set(Mutex::new(conn))
        .map_err(|_| AppError::Database(rusqlite::Error::InvalidQuery))?;

    debug!("数据库已初始化: {}", db_path.display());
    Ok(())
}

/// 获取数据库连接
pub(crate) fn get_conn() -> AppResult<std::sync::MutexGuard<'static, Connection>> {
    let mutex = DB.get()
        .ok_or_else(|| AppError::Database(rusqlite::Error::InvalidQuery))?;

    match mutex.lock() {
        Ok(guard) => Ok(guard),
        Err(poisoned) => {
            error!("数据库 Mutex 被毒化：持有锁的线程发生 panic");
            warn!("尝试恢复毒化的 Mutex，后续操作可能不稳定");
            Ok(poisoned.into_inner())
        }
    }
}

// ==================== 任务操作 ====================

fn insert_job_with(conn: &Connection, job: &JobRecord) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO jobs (id, kind, input, preset, status, output_path, error, created_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            job.id,
            job.kind,
            job.input,
            job.preset,
            job.status.as_str(),
            job.output_path,
            job.error,
            job.created_at,
            job.finished_at,
        ],
    )?;
    Ok(())
}

fn finish_job_with(
    conn: &Connection,
    id: &str,
    status: JobStatus,
    output_path: Option<&str>,
    error: Option<&str>,
) -> AppResult<()> {
    let updated = conn.execute(
        "UPDATE jobs SET status = ?2, output_path = ?3, error = ?4, finished_at = ?5 WHERE id = ?1",
        params![id, status.as_str(), output_path, error, now_string()],
    )?;
    if updated == 0 {
        return Err(AppError::NotFound(format!("任务不存在: {}", id)));
    }
    Ok(())
}

fn list_jobs_with(conn: &Connection, limit: usize) -> AppResult<Vec<JobRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, input, preset, status, output_path, error, created_at, finished_at
         FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
    )?;

    let rows = stmt.query_map([limit as i64], |row| {
        let status: String = row.get(4)?;
        Ok(JobRecord {
            id: row.get(0)?,
            kind: row.get(1)?,
            input: row.get(2)?,
            preset: row.get(3)?,
            status: JobStatus::parse(&status),
            output_path: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    })?;

    let mut jobs = Vec::new();
    for job in rows {
        jobs.push(job?);
    }
    Ok(jobs)
}

/// 新建任务记录（状态为 running）
pub fn insert_job(id: &str, kind: &str, input: &str, preset: Option<&str>) -> AppResult<()> {
    let job = JobRecord {
        id: id.to_string(),
        kind: kind.to_string(),
        input: input.to_string(),
        preset: preset.map(|p| p.to_string()),
        status: JobStatus::Running,
        output_path: None,
        error: None,
        created_at: now_string(),
        finished_at: None,
    };
    let conn = get_conn()?;
    insert_job_with(&conn, &job)
}

/// 结束任务
pub fn finish_job(id: &str, status: JobStatus, output_path: Option<&str>, error: Option<&str>) -> AppResult<()> {
    let conn = get_conn()?;
    finish_job_with(&conn, id, status, output_path, error)
}

/// 最近的任务
pub fn list_jobs(limit: usize) -> AppResult<Vec<JobRecord>> {
    let conn = get_conn()?;
    list_jobs_with(&conn, limit)
}

// ==================== 下载缓存 ====================

/// 查询链接的缓存路径
pub(crate) fn get_cached_download_with(conn: &Connection, link: &str) -> AppResult<Option<String>> {
    let path = conn
        .query_row(
            "SELECT path FROM download_cache WHERE link = ?1",
            [link],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(path)
}

/// 记录链接的下载结果
pub(crate) fn put_cached_download_with(conn: &Connection, link: &str, path: &str) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO download_cache (link, path, created_at) VALUES (?1, ?2, ?3)",
        params![link, path, now_string()],
    )?;
    Ok(())
}

/// 删除失效的缓存记录
pub(crate) fn remove_cached_download_with(conn: &Connection, link: &str) -> AppResult<()> {
    conn.execute("DELETE FROM download_cache WHERE link = ?1", [link])?;
    Ok(())
}

fn clear_download_cache_with(conn: &Connection) -> AppResult<usize> {
    Ok(conn.execute("DELETE FROM download_cache", [])?)
}

/// 清空下载缓存，返回删除的记录数
pub fn clear_download_cache() -> AppResult<usize> {
    let conn = get_conn()?;
    clear_download_cache_with(&conn)
}

/// 测试用：建好表的内存数据库
#[cfg(test)]
pub(crate) fn open_test_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory database");
    create_tables(&conn).expect("create tables");
    conn
}

/// 测试用：全局连接指向内存数据库，整个测试进程共用一份
#[cfg(test)]
pub(crate) fn init_test_database() {
    DB.get_or_init(|| Mutex::new(open_test_connection()));
}

#[cfg(test)]
pub(crate) fn get_job(id: &str) -> AppResult<Option<JobRecord>> {
    let conn = get_conn()?;
    Ok(list_jobs_with(&conn, 10_000)?.into_iter().find(|job| job.id == id))
}
