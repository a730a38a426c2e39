// 任务历史命令

use crate::database::{self, JobRecord};
use crate::error::AppResult;

fn describe(job: &JobRecord) -> String {
    let kind = match &job.preset {
        Some(preset) => format!("{}:{}", job.kind, preset),
        None => job.kind.clone(),
    };
    let detail = match (&job.output_path, &job.error) {
        (Some(path), _) => path.as_str(),
        (None, Some(error)) => error.as_str(),
        (None, None) => "",
    };
    format!(
        "{}  {:<9} {:<10} {:<16} {}  {}",
        job.created_at,
        job.status.as_str(),
        crate::utils::short_id(&job.id),
        kind,
        job.input,
        detail
    )
}

/// vocalsplit history [--limit N]
pub fn list(limit: usize, json: bool) -> AppResult<()> {
    let jobs = database::list_jobs(limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("暂无任务记录");
        return Ok(());
    }
    for job in &jobs {
        println!("{}", describe(job));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JobStatus;

    #[test]
    fn test_describe_failed_job() {
        let job = JobRecord {
            id: "3f2a9c1e-77aa-4b1c-9d0e-123456789abc".to_string(),
            kind: "extract".to_string(),
            input: "song.mp3".to_string(),
            preset: Some("heavy".to_string()),
            status: JobStatus::Failed,
            output_path: None,
            error: Some("Vocals file not found.".to_string()),
            created_at: "2026-01-01 10:00:00".to_string(),
            finished_at: None,
        };
        let line = describe(&job);
        assert!(line.starts_with("2026-01-01 10:00:00  failed"));
        assert!(line.contains("3f2a9c1e"));
        assert!(line.contains("extract:heavy"));
        assert!(line.ends_with("Vocals file not found."));
    }
}
