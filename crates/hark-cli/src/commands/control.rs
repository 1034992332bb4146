/// Commands that talk to a running assistant over its socket
use anyhow::Result;
use hark_core::ipc::{IpcClient, IpcRequest, IpcResponse, StatusSnapshot, SOCKET_NAME};
use std::path::Path;

pub async fn show_status(data_dir: &Path) -> Result<()> {
    let sock_path = data_dir.join(SOCKET_NAME);

    if !sock_path.exists() {
        println!("Assistant Status: Not running");
        return Ok(());
    }

    let client = IpcClient::new(&sock_path);
    match client.send_command(IpcRequest::Status).await {
        Ok(IpcResponse::Status(status)) => print_status(&status),
        Ok(resp) => anyhow::bail!("Unexpected response from assistant: {resp:?}"),
        Err(e) => {
            log::error!("Failed to get status: {e}");
            println!("Assistant Status: Not running (or not responding)");
        }
    }
    Ok(())
}

pub async fn stop_assistant(data_dir: &Path) -> Result<()> {
    let sock_path = data_dir.join(SOCKET_NAME);

    if !sock_path.exists() {
        log::info!("Assistant is not running (no socket).");
        return Ok(());
    }

    let client = IpcClient::new(&sock_path);
    match client.send_command(IpcRequest::Shutdown).await {
        Ok(IpcResponse::Shutdown) => log::info!("Shutdown signal sent."),
        Ok(resp) => log::error!("Received unexpected response from assistant: {resp:?}"),
        Err(e) => {
            log::error!("Failed to send shutdown command: {e}. Removing stale socket.");
            std::fs::remove_file(&sock_path)?;
        }
    }
    Ok(())
}

fn print_status(status: &StatusSnapshot) {
    let uptime = (status.updated_at - status.started_at).num_seconds().max(0);
    let hours = uptime / 3600;
    let minutes = (uptime % 3600) / 60;
    let seconds = uptime % 60;

    println!("Assistant Status: Running");
    println!("  Uptime: {hours:02}:{minutes:02}:{seconds:02}");
    match status.turn_origin {
        Some(origin) => println!(
            "  Conversation: {:?}, {origin:?} turn ({} paused)",
            status.session_state, status.paused_turns
        ),
        None => println!("  Conversation: {:?}", status.session_state),
    }
    println!(
        "  Connectivity: {}{}",
        status.connectivity,
        if status.auth_expired { ", sign-in expired" } else { "" }
    );
    println!(
        "  Quiet hours: {}",
        if status.quiet_hours_active { "active" } else { "inactive" }
    );
    println!(
        "\nPending email: {} priority, {} regular, {} filtered",
        status.pending_priority, status.pending_regular, status.pending_filtered
    );
    println!("Pending reminders: {}", status.pending_reminders);
    println!("Interrupts in current window: {}", status.interrupts_in_window);
}
