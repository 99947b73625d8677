use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::pipeline::RunSummary;

/// Write `summary.json` and `daily_brief.md` under `<reports_root>/<run_id>/`.
pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    fs::write(reports_dir.join("daily_brief.md"), daily_brief(summary))
        .await
        .context("writing daily_brief.md")?;

    Ok(reports_dir)
}

pub fn daily_brief(summary: &RunSummary) -> String {
    let opportunities = if summary.opportunities.is_empty() {
        "- none".to_string()
    } else {
        summary
            .opportunities
            .iter()
            .map(|o| {
                format!(
                    "- `{}` {} ({}, {}) {} | {:.2} [{}] | relevant items: {}/{}",
                    o.control_number,
                    o.title,
                    o.organization,
                    o.state_code.as_deref().unwrap_or("--"),
                    o.status,
                    o.value,
                    o.size_bucket.as_str(),
                    o.relevant_items,
                    o.items_total
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let heading = if summary.discovery_only {
        "Candidates (discovery only)"
    } else {
        "Relevant Opportunities"
    };

    format!(
        "# PPOF Daily Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Vocabulary: {} ({})\n- Listing queries: {}\n{}{}\n## Counts\n- fetched: {}\n- malformed: {}\n- filtered: {}\n- candidates: {}\n- skipped (already processed): {}\n- classified: {}\n- relevant: {}\n- persisted: {} ({} items)\n- skipped (error): {}\n- listing errors: {}\n- export failures: {}\n\n## {}\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.vocabulary_version,
        summary.policy,
        summary.listing_queries,
        if summary.cancelled { "- Cancelled before completion\n" } else { "" },
        if summary.discovery_only { "- Discovery only: no item fetches\n" } else { "" },
        summary.fetched,
        summary.malformed,
        summary.filtered,
        summary.candidates,
        summary.skipped_dedup,
        summary.classified,
        summary.relevant,
        summary.persisted,
        summary.items_persisted,
        summary.skipped_error,
        summary.listing_errors,
        summary.export_failures,
        heading,
        opportunities
    )
}

/// Markdown index of the most recent `runs` reports, newest first.
pub fn recent_runs_report(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("summary.json").is_file())
        .map(|entry| {
            let path = entry.path().join("summary.json");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let summary: RunSummary = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((entry.path(), summary))
        })
        .collect::<Result<Vec<_>>>()?;
    dirs.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# PPOF Recent Runs".to_string(), String::new()];
    for (dir, summary) in dirs.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- relevant: {} of {} candidates",
            summary.relevant, summary.candidates
        ));
        lines.push(format!("- skipped (error): {}", summary.skipped_error));
        lines.push(format!("- brief: `{}`", dir.join("daily_brief.md").display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ppof_core::SizeBucket;
    use uuid::Uuid;

    use crate::pipeline::OpportunityDigest;

    fn summary(day: u32) -> RunSummary {
        let started = Utc.with_ymd_and_hms(2025, 3, day, 6, 0, 0).unwrap();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: started,
            finished_at: started + chrono::Duration::minutes(12),
            vocabulary_version: "seals-v1".into(),
            policy: "exhaustive".into(),
            discovery_only: false,
            listing_queries: 5,
            fetched: 120,
            malformed: 1,
            filtered: 110,
            candidates: 9,
            skipped_dedup: 2,
            classified: 7,
            relevant: 1,
            persisted: 1,
            items_persisted: 14,
            skipped_error: 0,
            listing_errors: 0,
            export_failures: 0,
            cancelled: false,
            opportunities: vec![OpportunityDigest {
                control_number: "11222333000144-1-000001/2025".into(),
                title: "Aquisição de lacres".into(),
                organization: "PREFEITURA MUNICIPAL DE TESTE".into(),
                state_code: Some("SP".into()),
                status: "open".into(),
                value: 10_000.0,
                size_bucket: SizeBucket::Small,
                relevant_items: 2,
                items_total: 14,
            }],
        }
    }

    #[tokio::test]
    async fn writes_summary_and_brief_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary(1);
        let out = write_run_report(dir.path(), &summary).await.unwrap();

        assert_eq!(out, dir.path().join(summary.run_id.to_string()));
        let brief = std::fs::read_to_string(out.join("daily_brief.md")).unwrap();
        assert!(brief.starts_with("# PPOF Daily Brief"));
        assert!(brief.contains("- relevant: 1"));
        assert!(brief.contains("11222333000144-1-000001/2025"));
        assert!(brief.contains("relevant items: 2/14"));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("summary.json")).unwrap()).unwrap();
        assert_eq!(json["candidates"], 9);
        assert_eq!(json["opportunities"][0]["size_bucket"], "small");
    }

    #[tokio::test]
    async fn recent_runs_are_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let older = summary(1);
        let newer = summary(2);
        write_run_report(dir.path(), &older).await.unwrap();
        write_run_report(dir.path(), &newer).await.unwrap();
        std::fs::create_dir(dir.path().join("not-a-run")).unwrap();

        let index = recent_runs_report(dir.path(), 5).unwrap();
        let newer_at = index.find(&newer.run_id.to_string()).unwrap();
        let older_at = index.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);

        let only_one = recent_runs_report(dir.path(), 1).unwrap();
        assert!(!only_one.contains(&older.run_id.to_string()));
    }
}
