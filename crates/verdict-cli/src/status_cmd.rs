//! `verdict status` command: show one check's record, or list checks.

use anyhow::{Context, Result};
use serde_json::Value;

use verdict_core::store::JobStore;
use verdict_db::models::{JobStatus, JobSummary, JobView};

/// Run the status command.
///
/// When `check_id` is `Some`, shows that check's record. When `None`,
/// lists checks, optionally only those of `owner_id`.
pub async fn run_status(
    store: &dyn JobStore,
    check_id: Option<&str>,
    owner_id: Option<&str>,
) -> Result<()> {
    match check_id {
        Some(id) => {
            let view = store
                .get_view(id)
                .await?
                .with_context(|| format!("check {id} not found"))?;
            print!("{}", render_check(&view));
        }
        None => print!("{}", render_list(&store.list(owner_id).await?)),
    }
    Ok(())
}

fn status_icon(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => ".",
        JobStatus::Running => "*",
        JobStatus::Completed => "+",
        JobStatus::NoClaims => "-",
        JobStatus::Failed => "!",
    }
}

fn render_check(view: &JobView) -> String {
    let job = &view.job;
    let mut out = String::new();
    out.push_str(&format!("Check: {}\n", job.id));
    if let Some(title) = &job.title {
        out.push_str(&format!("Title: {title}\n"));
    }
    out.push_str(&format!("Status: {}\n", job.status));
    if let Some(owner) = &job.owner_id {
        out.push_str(&format!("Owner: {owner}\n"));
    }
    out.push_str(&format!("Public: {}\n", if job.is_public { "yes" } else { "no" }));
    out.push_str(&format!(
        "Created: {}\n",
        job.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(completed_at) = job.completed_at {
        out.push_str(&format!(
            "Completed: {}\n",
            completed_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    if let Some(error) = &job.error {
        out.push_str(&format!("Error: {error}\n"));
    }

    if let Some(groups) = job.result.as_ref().and_then(Value::as_array) {
        if !groups.is_empty() {
            out.push_str("\nClaims:\n");
        }
        for group in groups {
            out.push_str(&format!("  {}\n", group[0].as_str().unwrap_or("")));
            for claim in group[1].as_array().into_iter().flatten() {
                let result = claim["result"].as_str().unwrap_or("?");
                let text = claim["text"].as_str().unwrap_or("");
                out.push_str(&format!("    [{result}] {text}\n"));
            }
        }
    }
    out
}

fn render_list(checks: &[JobSummary]) -> String {
    if checks.is_empty() {
        return "No checks found.\n".to_string();
    }

    let mut out = format!("{:<38} {:<11} {:<20} {}\n", "ID", "STATUS", "UPDATED", "TEXT");
    out.push_str(&"-".repeat(100));
    out.push('\n');
    for check in checks {
        let id = if check.id.chars().count() > 36 {
            let short: String = check.id.chars().take(33).collect();
            format!("{short}...")
        } else {
            check.id.clone()
        };
        out.push_str(&format!(
            "{:<38} {} {:<9} {:<20} {}\n",
            id,
            status_icon(check.status),
            check.status.to_string(),
            check.updated_at.format("%Y-%m-%d %H:%M:%S"),
            check.text_preview.as_deref().unwrap_or(""),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use verdict_db::models::Job;

    fn view(status: JobStatus, result: Option<Value>, error: Option<&str>) -> JobView {
        let now = Utc::now();
        JobView {
            job: Job {
                id: "check-1".to_string(),
                status,
                result,
                error: error.map(str::to_owned),
                text_id: Uuid::nil(),
                owner_id: Some("alice".to_string()),
                title: Some("Geography".to_string()),
                is_public: false,
                created_at: now,
                updated_at: now,
                completed_at: status.is_terminal().then_some(now),
            },
            content: "Paris is in France.".to_string(),
        }
    }

    #[test]
    fn renders_completed_check_with_claims() {
        let out = render_check(&view(
            JobStatus::Completed,
            Some(json!([["Paris is in France.", [
                {"text": "Paris is in France", "status": "verified", "result": "Supported"}
            ]]])),
            None,
        ));
        assert!(out.contains("Check: check-1\n"));
        assert!(out.contains("Title: Geography\n"));
        assert!(out.contains("Status: completed\n"));
        assert!(out.contains("Completed: "));
        assert!(out.contains("    [Supported] Paris is in France\n"));
    }

    #[test]
    fn renders_failed_check_with_error() {
        let out = render_check(&view(JobStatus::Failed, None, Some("agent crashed")));
        assert!(out.contains("Status: failed\n"));
        assert!(out.contains("Error: agent crashed\n"));
        assert!(!out.contains("Claims:"));
    }

    #[test]
    fn renders_empty_list() {
        assert_eq!(render_list(&[]), "No checks found.\n");
    }

    #[test]
    fn renders_list_rows() {
        let now = Utc::now();
        let summary = JobSummary {
            id: "x".repeat(50),
            title: None,
            status: JobStatus::Running,
            created_at: now,
            updated_at: now,
            completed_at: None,
            text_preview: Some("The sky is blue.".to_string()),
        };
        let out = render_list(&[summary]);
        let row = out.lines().nth(2).unwrap();
        assert!(row.starts_with(&format!("{}...", "x".repeat(33))));
        assert!(row.contains("* running"));
        assert!(row.ends_with("The sky is blue."));
    }
}
