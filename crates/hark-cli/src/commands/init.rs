use anyhow::{Context, Result};
use hark_core::config::{config_path, get_data_dir};
use hark_core::AssistantConfig;
use hark_storage::Database;
use std::fs;
use std::path::Path;

/// Write the starter config (unless one exists) and create the database
///
/// # Errors
///
/// Returns an error if the data directory, config file or database cannot be created
pub fn init_command(force: bool) -> Result<()> {
    println!("Initializing hark...\n");

    let data_dir = get_data_dir()?;
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;

    println!("Step 1/2: Configuration");
    println!("{}", "-".repeat(40));
    write_config(&config_path()?, force)?;

    println!("\nStep 2/2: State Database");
    println!("{}", "-".repeat(40));
    let db = Database::new(None)?;
    drop(db);
    println!("Database ready at {}", Database::default_db_path().display());

    println!("\nhark is ready. Start it with: hark run");
    Ok(())
}

fn write_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Keeping it. Use 'hark init --force' to overwrite.");
        return Ok(());
    }

    let template = AssistantConfig::template();
    // Never write a starter file we could not load back
    AssistantConfig::from_toml_str(&template)?;
    fs::write(path, template).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Config written to {}", path.display());
    println!("Add your important senders under [filters] priority_senders.");
    Ok(())
}
