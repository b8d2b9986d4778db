use anyhow::{Context, Result};
use console::{Term, style};
use dialoguer::Confirm;
use lecture_dl::config::ConfigManager;
use lecture_dl::download::cleanup::find_leftover_files;
use lecture_dl::download::{CleanupManager, ProcessRegistry};

pub async fn handle_clean(config_manager: &ConfigManager, dry_run: bool, yes: bool) -> Result<()> {
    let term = Term::stdout();
    let config = config_manager.config();
    let options = config.scheduler_options();
    let temp_root = options.temp_root.clone();
    let output_dir = config.output_dir();

    if dry_run {
        term.write_line(&format!(
            "{} Dry run - showing what would be cleaned",
            style("🧹").cyan()
        ))?;
    } else {
        term.write_line(&format!(
            "{} Looking for leftovers of interrupted downloads...",
            style("🧹").cyan()
        ))?;
    }
    term.write_line(&format!(
        "   {}: {}",
        style("Temp directory").dim(),
        temp_root.display()
    ))?;
    term.write_line(&format!(
        "   {}: {}",
        style("Output directory").dim(),
        output_dir.display()
    ))?;

    let manager = CleanupManager::new(ProcessRegistry::new(), options.cleanup_options());
    let (_, planned) = manager.sweep_orphans(&temp_root, true).await;
    let leftovers = find_leftover_files(&output_dir);

    if planned.is_empty() && leftovers.is_empty() {
        term.write_line(&format!("{} Nothing to clean", style("✅").green()))?;
        return Ok(());
    }

    for action in &planned {
        term.write_line(&format!("   • {}", action))?;
    }
    for path in &leftovers {
        term.write_line(&format!("   • remove {}", path.display()))?;
    }

    if dry_run {
        return Ok(());
    }

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt("Make sure no other download is running. Clean up now?")
            .default(false)
            .interact()?;
        if !confirmed {
            term.write_line("Aborted")?;
            return Ok(());
        }
    }

    let (mut report, _) = manager.sweep_orphans(&temp_root, false).await;
    for path in &leftovers {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to remove leftover file: {:?}", path))?;
        report.paths_removed += 1;
    }

    term.write_line(&format!(
        "{} Killed {} stray process(es), removed {} path(s)",
        style("✅").green(),
        report.orphans_killed,
        report.paths_removed
    ))?;
    Ok(())
}
