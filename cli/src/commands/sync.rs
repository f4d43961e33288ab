use anyhow::{Context, Result};
use chrono::Local;
use std::process;

use buzz_core::service::BuzzService;
use buzz_core::sync::{SettingsSync, SyncPhase};

use crate::cloud::HttpCloud;
use crate::config::{REMOTE_URL_ENV, RemoteConfig};

pub(crate) fn cmd_sync(svc: &BuzzService, remote: &RemoteConfig, json: bool) -> Result<()> {
    let url = remote.url.as_deref().with_context(|| {
        format!("No remote configured. Set [remote] url in config.toml or {REMOTE_URL_ENV}")
    })?;
    let cloud = HttpCloud::new(url, remote.api_key.clone(), remote.user.clone())?;

    // HttpCloud blocks on the runtime, so leave the async worker first.
    let report = tokio::task::block_in_place(|| svc.sync(&cloud))
        .with_context(|| format!("Sync with {url} failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.phase == SyncPhase::LoggedOut {
        eprintln!("The remote has no identity for this client; staying local-only");
        process::exit(2);
    }

    if report.migrated {
        println!("Merged your local log into {url}");
    }
    println!(
        "Synced {} intakes ({} pushed, {} removals sent)",
        report.intakes, report.pushed, report.removed
    );
    if report.dropped > 0 {
        println!("  {} removed on another device", report.dropped);
    }
    match report.settings {
        SettingsSync::Pushed => println!("  Settings pushed to the remote"),
        SettingsSync::Pulled => println!("  Settings updated from the remote"),
        SettingsSync::Unchanged => {}
    }
    Ok(())
}

pub(crate) fn cmd_sync_status(svc: &BuzzService, json: bool) -> Result<()> {
    let session = svc.sync_session()?;
    let pending = svc.pending_removals()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session": session,
                "pendingRemovals": pending,
            }))?
        );
        return Ok(());
    }

    println!("Phase: {}", session.phase.as_str());
    println!(
        "Local log merged into remote: {}",
        if session.migrated { "yes" } else { "no" }
    );
    match session.last_synced_at {
        Some(at) => println!(
            "Last sync: {}",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ),
        None => println!("Last sync: never"),
    }
    println!("Removals waiting to sync: {pending}");
    Ok(())
}

pub(crate) fn cmd_sync_logout(svc: &BuzzService, json: bool) -> Result<()> {
    svc.sign_out()?;
    if json {
        println!("{}", serde_json::json!({ "phase": SyncPhase::LoggedOut }));
    } else {
        println!("Signed out of sync; local data kept");
    }
    Ok(())
}
