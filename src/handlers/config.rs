use crate::cli::{ConfigAction, ConfigFormat};
use anyhow::Result;
use console::{Term, style};
use lecture_dl::config::ConfigManager;
use std::process;

pub async fn handle_config(config_manager: &ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show { format } => {
            term.write_line(&format!(
                "{} Current configuration ({}):",
                style("⚙️").cyan(),
                config_manager.config_file().display()
            ))?;
            term.write_line("")?;

            let content = match format {
                ConfigFormat::Toml => toml::to_string_pretty(config_manager.config())?,
                ConfigFormat::Json => serde_json::to_string_pretty(config_manager.config())?,
            };
            term.write_line(&content)?;

            let config = config_manager.config();
            term.write_line(&format!(
                "{} Effective output directory: {}",
                style("📁").cyan(),
                config.output_dir().display()
            ))?;
            term.write_line(&format!(
                "{} Effective temp directory: {}",
                style("📁").cyan(),
                config.temp_root().display()
            ))?;
        }

        ConfigAction::Validate => {
            term.write_line(&format!(
                "{} Validating configuration...",
                style("🔍").cyan()
            ))?;

            match config_manager.validate() {
                Ok(()) => {
                    term.write_line(&format!("{} Configuration is valid", style("✅").green()))?;
                }
                Err(e) => {
                    term.write_line(&format!(
                        "{} Configuration validation failed:",
                        style("❌").red()
                    ))?;
                    term.write_line(&format!("   {}", e))?;
                    term.write_line(&format!(
                        "{} Edit {} and run this command again",
                        style("💡").yellow(),
                        config_manager.config_file().display()
                    ))?;
                    process::exit(1);
                }
            }
        }

        ConfigAction::Sample => {
            let sample = config_manager.create_sample_config()?;
            term.write_line(&format!(
                "{} Sample configuration written to {}",
                style("✅").green(),
                style(sample.display()).cyan()
            ))?;
        }
    }

    Ok(())
}
