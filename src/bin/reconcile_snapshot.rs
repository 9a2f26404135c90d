use image_inventory_core::{InventoryConfig, InventoryEntry};
use std::env;
use std::fs;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        eprintln!("Usage: {} <account> <inventory_type> <snapshot.json>", args[0]);
        eprintln!();
        eprintln!("The snapshot file holds a JSON array of entries, e.g.");
        eprintln!(r#"  [{{"image_tag": "nginx:1.25", "image_repo_digest": "sha256:...", "last_updated": "2024-03-01T12:00:00Z"}}]"#);
        std::process::exit(1);
    }

    if let Err(e) = run(&args[1], &args[2], &args[3]).await {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(account: &str, inventory_type: &str, snapshot_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let raw = fs::read_to_string(snapshot_path)
        .map_err(|e| format!("Could not read {}: {}", snapshot_path, e))?;
    let snapshot: Vec<InventoryEntry> = serde_json::from_str(&raw)
        .map_err(|e| format!("Invalid snapshot {}: {}", snapshot_path, e))?;

    let config = InventoryConfig::from_env()?;
    image_inventory_core::initialize(&config).await?;

    log::info!("Reconciling {} entries for {}/{}", snapshot.len(), account, inventory_type);
    let summary = image_inventory_core::reconcile(account, inventory_type, snapshot).await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
