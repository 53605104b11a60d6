use voxnav_core::types::{StepOutcome, Task, TaskState};
use voxnav_core::Paths;
use voxnav_storage::TaskStore;

fn state_icon(state: TaskState) -> &'static str {
    match state {
        TaskState::Idle => "⏳",
        TaskState::Executing => "🔄",
        TaskState::Succeeded => "✅",
        TaskState::Failed => "❌",
        TaskState::Aborted => "⛔",
    }
}

fn open_store(paths: &Paths) -> anyhow::Result<Option<TaskStore>> {
    let db = paths.db_file();
    if !db.exists() {
        println!();
        println!("📋 No task history yet.");
        println!("   Tasks are recorded once `voxnav serve`, `run` or `say` has executed a command.");
        println!();
        return Ok(None);
    }
    Ok(Some(TaskStore::open(&db)?))
}

fn command_text(task: &Task) -> &str {
    task.transcript.as_ref().map(|t| t.text.as_str()).unwrap_or("(no transcript)")
}

/// List recent tasks from the history database.
pub fn list(paths: &Paths, state: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let filter = match state {
        Some(raw) => Some(
            TaskState::from_str(raw)
                .ok_or_else(|| anyhow::anyhow!("Unknown state '{}'. Use idle, executing, succeeded, failed or aborted.", raw))?,
        ),
        None => None,
    };
    let Some(store) = open_store(paths)? else {
        return Ok(());
    };

    let tasks = store.list_tasks(filter, limit)?;
    let summary = store.summary()?;
    println!();
    println!(
        "📋 Tasks ({} total: {} succeeded, {} failed, {} aborted, {} pending)",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.aborted,
        summary.idle + summary.executing
    );
    let stats = &summary.transcripts;
    if stats.transcribed > 0 {
        println!(
            "   {} transcript(s), {} words, average confidence {:.0}%",
            stats.transcribed,
            stats.words,
            stats.average_confidence * 100.0
        );
    }
    println!();

    for task in &tasks {
        let short_id: String = task.id.chars().take(12).collect();
        println!("  {} [{}] {}: {}", state_icon(task.state), short_id, task.state, command_text(task));
        if let Some(failure) = &task.failure {
            println!("     Error: {} ({})", failure.reason, failure.kind);
        }
        println!("     Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
    }
    if tasks.is_empty() {
        println!("  (none)");
    }
    println!();
    Ok(())
}

/// Show one task by id or unique id prefix.
pub fn show(paths: &Paths, task_id: &str) -> anyhow::Result<()> {
    let Some(store) = open_store(paths)? else {
        return Ok(());
    };

    let task = match store.get_task(task_id)? {
        Some(task) => task,
        None => {
            let matched: Vec<Task> = store
                .list_tasks(None, 10_000)?
                .into_iter()
                .filter(|t| t.id.starts_with(task_id))
                .collect();
            match matched.len() {
                0 => {
                    println!("No task found with ID prefix: {}", task_id);
                    return Ok(());
                }
                1 => match store.get_task(&matched[0].id)? {
                    Some(task) => task,
                    None => return Ok(()),
                },
                n => {
                    println!("Ambiguous ID prefix '{}' matches {} tasks. Please be more specific:", task_id, n);
                    for t in matched {
                        println!("  {}", t.id);
                    }
                    return Ok(());
                }
            }
        }
    };

    print_task(&task);
    Ok(())
}

/// Human-readable task details with its step log.
pub fn print_task(task: &Task) {
    println!();
    println!("{} Task {}", state_icon(task.state), task.id);
    println!("  State:    {} ({})", task.state, task.stage.as_str());
    println!("  Source:   {}", task.source.as_str());
    if let Some(transcript) = &task.transcript {
        println!("  Heard:    \"{}\" (confidence {:.2})", transcript.text, transcript.confidence);
    }
    if let Some(path) = &task.audio_path {
        println!("  Audio:    {}", path);
    }
    if let Some(plan) = &task.plan {
        println!("  Plan ({} step(s), {:?}):", plan.len(), plan.origin);
        for (i, step) in plan.steps.iter().enumerate() {
            let detail = serde_json::to_string(step).unwrap_or_default();
            println!("    {}. {}", i, detail);
        }
    }
    if !task.log.is_empty() {
        println!("  Log:");
        for entry in &task.log {
            let line = match &entry.outcome {
                StepOutcome::Success { attempts, verified, .. } => {
                    let how = if *verified { ", verified by post-condition" } else { "" };
                    format!("success after {} attempt(s){}", attempts, how)
                }
                StepOutcome::Retrying { attempt, kind, reason } => {
                    format!("attempt {} failed ({}): {}", attempt, kind, reason)
                }
                StepOutcome::Failed { attempts, kind, reason } => {
                    format!("failed after {} attempt(s) ({}): {}", attempts, kind, reason)
                }
                StepOutcome::Cancelled => "cancelled".to_string(),
            };
            println!("    [{}] step {}: {}", entry.at.format("%H:%M:%S%.3f"), entry.step_index, line);
        }
    }
    if let Some(result) = &task.result {
        if let Some(url) = &result.final_url {
            println!("  Final URL: {}", url);
        }
        for extraction in &result.extracted {
            println!("  Extracted {}: {}", extraction.selector, extraction.value);
        }
    }
    if let Some(failure) = &task.failure {
        match failure.step_index {
            Some(step) => println!("  Error:    {} at step {}: {}", failure.kind, step, failure.reason),
            None => println!("  Error:    {}: {}", failure.kind, failure.reason),
        }
    }
    println!();
}
