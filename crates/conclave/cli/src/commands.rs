//! Command handlers.
//!
//! Every handler returns `KernelError` unchanged so the caller can hand it
//! to the boundary handler.

use std::path::PathBuf;

use conclave_kernel::{inspect, open_ledger, KernelConfig, KernelError, KernelResult, KernelStatus, KeyDirectory, VerifyReport};
use conclave_ledger::LedgerError;
use conclave_types::{Event, KeyId};
use tracing::debug;

use crate::output::{to_json, OutputFormat};
use crate::Commands;

pub async fn execute(command: Commands, config: &KernelConfig, format: OutputFormat) -> KernelResult<()> {
    match command {
        Commands::Verify { from, to } => verify(config, from, to, format).await,
        Commands::Head => head(config, format).await,
        Commands::Replay { from, limit } => replay(config, from, limit, format).await,
        Commands::Status => status(config, format).await,
        Commands::Keygen { key_id, key_dir } => keygen(config, key_id, key_dir, format),
    }
}

async fn verify(config: &KernelConfig, from: u64, to: Option<u64>, format: OutputFormat) -> KernelResult<()> {
    let report = inspect::verify(config, from, to).await?;
    match format {
        OutputFormat::Text => print_verify(&report),
        OutputFormat::Json => println!("{}", to_json(&report)),
    }

    if let Some(first) = report.chain.breaks.first() {
        return Err(LedgerError::BrokenChain {
            sequence: first.sequence,
            reason: first.reason.clone(),
        }
        .into());
    }
    if let Some(wal) = report.chain.wal.as_ref().filter(|w| !w.is_clean()) {
        return Err(LedgerError::Corruption {
            offset: wal.corrupted_offsets.first().map(|(_, offset)| *offset).unwrap_or(0),
            reason: format!("{} corrupt WAL record(s)", wal.corrupted_entries),
        }
        .into());
    }
    Ok(())
}

fn print_verify(report: &VerifyReport) {
    println!("Head:      {}", report.head);
    println!(
        "Checked:   {} event(s) in {}..={}",
        report.chain.checked, report.chain.from, report.chain.to
    );
    if let Some(tip) = &report.chain.tip {
        println!("Tip:       {tip}");
    }
    match report.audit_records {
        Some(n) => println!("Audit log: {n} record(s) verified"),
        None => println!("Audit log: not persisted"),
    }
    for b in &report.chain.breaks {
        println!("BREAK at {}: {}", b.sequence, b.reason);
    }
    if report.is_intact() {
        println!("Chain intact");
    }
}

async fn head(config: &KernelConfig, format: OutputFormat) -> KernelResult<()> {
    let (store, _) = open_ledger(config).await?;
    let head = store.head().await;
    match format {
        OutputFormat::Text => println!("{head}"),
        OutputFormat::Json => println!("{}", to_json(&head)),
    }
    Ok(())
}

async fn replay(config: &KernelConfig, from: u64, limit: Option<u64>, format: OutputFormat) -> KernelResult<()> {
    let (store, _) = open_ledger(config).await?;
    let head = store.head().await;
    let from = from.max(1);
    if head.sequence < from {
        debug!(from, head = head.sequence, "Nothing to replay");
        return Ok(());
    }
    let to = match limit {
        Some(0) => return Ok(()),
        Some(n) => head.sequence.min(from.saturating_add(n - 1)),
        None => head.sequence,
    };
    for event in store.read(from, to).await? {
        match format {
            OutputFormat::Text => println!("{}", event_line(&event)),
            OutputFormat::Json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => return Err(KernelError::Config(format!("event {}: {e}", event.sequence))),
            },
        }
    }
    Ok(())
}

fn event_line(event: &Event) -> String {
    format!(
        "{:>8}  {}  {:<24} key={}  {}",
        event.sequence,
        event.timestamp.to_rfc3339(),
        event.event_type.to_string(),
        event.signing_key_id,
        event.content_hash
    )
}

async fn status(config: &KernelConfig, format: OutputFormat) -> KernelResult<()> {
    let status = inspect::status(config).await?;
    match format {
        OutputFormat::Text => print_status(&status),
        OutputFormat::Json => println!("{}", to_json(&status)),
    }
    Ok(())
}

fn print_status(status: &KernelStatus) {
    println!("Head:       {}", status.head);
    match status.halt.record() {
        Some(record) => println!(
            "Halt:       HALTED since {} ({}, source {}){}",
            record.triggered_at.to_rfc3339(),
            record.reason,
            record.source,
            if record.escalated { " [escalated]" } else { "" }
        ),
        None => println!("Halt:       running"),
    }
    println!("Writer key: {}", status.writer_key);

    println!("\nKeys:");
    for key in &status.keys {
        println!(
            "  {:<16} {:<9} activated {}",
            key.key_id.to_string(),
            format!("{:?}", key.status),
            key.activated_at.to_rfc3339()
        );
    }

    println!("\nActive ceremonies:");
    if status.active_ceremonies.is_empty() {
        println!("  (none)");
    }
    for c in &status.active_ceremonies {
        println!(
            "  {} {} {} {} approvals {}/{} witnesses {}/{}",
            c.id, c.ceremony_type, c.tier, c.state, c.approvals, c.required_approvals, c.witnesses, c.required_witnesses
        );
    }

    if !status.parameters.is_empty() {
        println!("\nParameters:");
        for (name, value) in &status.parameters {
            println!("  {name} = {value}");
        }
    }
}

fn keygen(config: &KernelConfig, key_id: String, key_dir: Option<PathBuf>, format: OutputFormat) -> KernelResult<()> {
    let dir = KeyDirectory::new(key_dir.unwrap_or_else(|| config.key_dir()));
    let key_id = KeyId::new(&key_id);
    let public_key = dir.generate(&key_id)?;
    match format {
        OutputFormat::Text => {
            println!("# key written to {}", dir.path().display());
            println!("[[trust_anchors]]");
            println!("key_id = \"{key_id}\"");
            println!("public_key = \"{public_key}\"");
        }
        OutputFormat::Json => println!(
            "{}",
            to_json(&serde_json::json!({ "key_id": key_id, "public_key": public_key }))
        ),
    }
    Ok(())
}
