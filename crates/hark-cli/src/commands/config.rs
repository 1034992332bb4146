/// Configuration inspection command handlers
use anyhow::{Context, Result};
use hark_core::config::config_path;
use hark_core::AssistantConfig;

pub fn handle_config_path() -> Result<()> {
    println!("{}", config_path()?.display());
    Ok(())
}

/// Print the effective configuration, defaults filled in
pub fn handle_config_show() -> Result<()> {
    let path = config_path()?;
    let config = AssistantConfig::load(&path)
        .with_context(|| format!("No usable config at {}. Run 'hark init' first", path.display()))?;

    println!("Configuration ({})", path.display());
    println!("{}", "=".repeat(40));
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &AssistantConfig) {
    let quiet = &config.quiet_hours;
    println!("\n[filters]");
    if config.filters.priority_senders.is_empty() {
        println!("  priority senders: none");
    } else {
        println!("  priority senders: {}", config.filters.priority_senders.join(", "));
    }
    println!("  ignore rules: {}", config.filters.ignore_senders.len());

    println!("\n[quiet_hours]");
    if quiet.enabled {
        println!(
            "  {} - {}",
            quiet.start.format("%H:%M"),
            quiet.end.format("%H:%M")
        );
    } else {
        println!("  disabled");
    }

    println!("\n[rate_limit]");
    println!(
        "  {} interrupts per {}s",
        config.rate_limit.max_interrupts, config.rate_limit.window_secs
    );

    let session = &config.session;
    println!("\n[session]");
    println!("  history depth: {} turns", session.history_depth);
    println!("  turn idle timeout: {}s", session.turn_idle_timeout_secs);
    println!("  context reset after: {}s", session.context_reset_after_secs);
    println!("  unclear attempts: {}", session.unclear_attempt_limit);
    println!("  interrupt nesting: {}", session.max_interrupt_depth);

    let connectivity = &config.connectivity;
    println!("\n[connectivity]");
    println!("  probe interval: {}s", connectivity.probe_interval_secs);
    println!(
        "  backoff: {}s up to {}s",
        connectivity.base_backoff_secs, connectivity.max_backoff_secs
    );
    println!("  retries before lost: {}", connectivity.max_retries);

    println!("\n[effects]");
    println!("  ack timeout: {}ms", config.effects.ack_timeout_ms);

    println!("\n[mail]");
    println!("  poll interval: {}s", config.mail.poll_interval_secs);
    println!("  ledger capacity: {}", config.mail.ledger_capacity);
}
