//! Prompt contract builders (§4.6.1, §4.6.2).
//!
//! Context documents are human/agent-authored and read-only to the core;
//! a missing optional document degrades to an empty string rather than
//! failing the round.

use std::path::Path;

use crate::persistence::Milestone;

async fn read_optional(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "context document not found");
            String::new()
        }
    }
}

/// The four documents concatenated into every developer/acceptor prompt,
/// in the order named by §4.6.1: vision, soul, milestone doc, per-project
/// memory.
pub struct ProjectContext {
    pub vision: String,
    pub soul: String,
    pub memory: String,
}

impl ProjectContext {
    pub async fn load(project_root: &Path, anima_dir: &Path) -> Self {
        Self {
            vision: read_optional(&project_root.join("VISION.md")).await,
            soul: read_optional(&anima_dir.join("soul.md")).await,
            memory: read_optional(&anima_dir.join("memory").join("project.md")).await,
        }
    }
}

/// Build the per-round developer prompt (§4.6.1).
#[allow(clippy::too_many_arguments)]
pub async fn developer_prompt(
    ctx: &ProjectContext,
    milestone: &Milestone,
    milestone_doc: &str,
    branch_name: &str,
    round_index: u32,
    completed_features: &[String],
    last_rejection_reason: Option<&str>,
) -> String {
    let mut sections = vec![
        section("Project Vision", &ctx.vision),
        section("Project Soul", &ctx.soul),
        section("Milestone", milestone_doc),
    ];
    if !ctx.memory.is_empty() {
        sections.push(section("Project Memory", &ctx.memory));
    }
    sections.push(format!("Current branch: {branch_name}"));
    sections.push(format!("Round: {round_index}"));
    sections.push(section(
        "Features already reported complete",
        &completed_features.join("\n"),
    ));
    if let Some(reason) = last_rejection_reason {
        sections.push(section("Most recent acceptor rejection", reason));
    }
    sections.push(
        "Implement the next not-yet-done feature for this milestone. Run the project's \
         lint/type/test checks. Commit with a conventional-commit message on the current \
         branch. Respond with a structured report of what changed. If every feature in this \
         milestone is complete, respond with ALL_FEATURES_COMPLETE and a Commits: list of the \
         commit hashes produced this milestone."
            .to_string(),
    );
    sections.join("\n\n")
}

/// Build a per-round acceptor prompt reviewing a single feature (§4.6.2).
pub async fn acceptor_round_prompt(ctx: &ProjectContext, criterion: &str, commit_hash: &str) -> String {
    let sections = vec![
        section("Project Soul", &ctx.soul),
        section("Acceptance criterion under review", criterion),
        format!("Developer commit: {commit_hash}"),
        "Inspect the actual change via version-control commands. Reply exactly ACCEPTED or \
         REJECTED: <reason referencing which criterion failed>."
            .to_string(),
    ];
    sections.join("\n\n")
}

/// Build the final-review acceptor prompt (§4.6.2).
pub async fn acceptor_final_review_prompt(
    ctx: &ProjectContext,
    acceptance_criteria: &str,
    commits_since_base: &[String],
) -> String {
    let sections = vec![
        section("Project Soul", &ctx.soul),
        section("Milestone acceptance criteria", acceptance_criteria),
        section("Commits since baseCommit", &commits_since_base.join("\n")),
        "Reply exactly ACCEPTED or REJECTED: <missing criteria and why>.".to_string(),
    ];
    sections.join("\n\n")
}

/// Recovery context injected when re-attaching to a milestone after a
/// crash (§4.8): current iteration count, commit log since `baseCommit`,
/// current memory, and an explicit resumption directive.
pub fn recovery_prompt(milestone: &Milestone, commits_since_base: &[String], memory: &str) -> String {
    let sections = vec![
        "This is a resumed session after a restart.".to_string(),
        format!("Iteration count so far: {}", milestone.iteration_count),
        section("Commits since baseCommit", &commits_since_base.join("\n")),
        section("Project Memory", memory),
    ];
    sections.join("\n\n")
}

fn section(title: &str, body: &str) -> String {
    format!("## {title}\n{body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Milestone;
    use std::path::PathBuf;

    #[tokio::test]
    async fn developer_prompt_includes_all_required_sections_in_order() {
        let ctx = ProjectContext {
            vision: "Build a great thing".into(),
            soul: "Be honest".into(),
            memory: "Remember X".into(),
        };
        let milestone = Milestone::new("Do the thing".into(), PathBuf::from("m.md"), false);
        let prompt = developer_prompt(
            &ctx,
            &milestone,
            "Milestone doc body",
            "milestone/abc",
            3,
            &["feature A".to_string()],
            Some("missed edge case"),
        )
        .await;

        let vision_pos = prompt.find("Build a great thing").unwrap();
        let soul_pos = prompt.find("Be honest").unwrap();
        let milestone_pos = prompt.find("Milestone doc body").unwrap();
        let memory_pos = prompt.find("Remember X").unwrap();
        let rejection_pos = prompt.find("missed edge case").unwrap();
        assert!(vision_pos < soul_pos);
        assert!(soul_pos < milestone_pos);
        assert!(milestone_pos < memory_pos);
        assert!(memory_pos < rejection_pos);
        assert!(prompt.contains("Round: 3"));
        assert!(prompt.contains("milestone/abc"));
    }

    #[tokio::test]
    async fn developer_prompt_omits_memory_section_when_empty() {
        let ctx = ProjectContext {
            vision: "v".into(),
            soul: "s".into(),
            memory: String::new(),
        };
        let milestone = Milestone::new("T".into(), PathBuf::from("m.md"), false);
        let prompt = developer_prompt(&ctx, &milestone, "doc", "b", 0, &[], None).await;
        assert!(!prompt.contains("Project Memory"));
    }

    #[tokio::test]
    async fn acceptor_round_prompt_demands_exact_reply_format() {
        let ctx = ProjectContext {
            vision: String::new(),
            soul: "soul".into(),
            memory: String::new(),
        };
        let prompt = acceptor_round_prompt(&ctx, "Feature X works end to end", "abc123").await;
        assert!(prompt.contains("ACCEPTED"));
        assert!(prompt.contains("REJECTED:"));
        assert!(prompt.contains("abc123"));
    }
}
