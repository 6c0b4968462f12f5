//! Example embedding the plugin manager in a host application
//!
//! This example shows how to:
//! - Answer permission prompts from the host
//! - Install a plugin together with a staged dependency
//! - Drive the module runtime through a custom `ModuleHost`
//! - Watch lifecycle events on the message bus

use async_trait::async_trait;
use sdk::errors::PluginError;
use sdk::types::Permission;
use serde_json::json;
use std::sync::Arc;
use warden_engine::config::Config;
use warden_engine::message_bus::{Event, EventType};
use warden_engine::{ModuleHost, PluginManager, PluginPackage};

/// Host that only prints what it is asked to do
struct PrintingHost;

#[async_trait]
impl ModuleHost for PrintingHost {
    async fn load(&self, plugin_id: &str) -> Result<(), PluginError> {
        println!("  host: load {}", plugin_id);
        Ok(())
    }
    async fn initialize(&self, plugin_id: &str) -> Result<(), PluginError> {
        println!("  host: initialize {}", plugin_id);
        Ok(())
    }
    async fn start(&self, plugin_id: &str) -> Result<(), PluginError> {
        println!("  host: start {}", plugin_id);
        Ok(())
    }
    async fn pause(&self, plugin_id: &str) -> Result<(), PluginError> {
        println!("  host: pause {}", plugin_id);
        Ok(())
    }
    async fn resume(&self, plugin_id: &str) -> Result<(), PluginError> {
        println!("  host: resume {}", plugin_id);
        Ok(())
    }
    async fn stop(&self, plugin_id: &str) -> Result<(), PluginError> {
        println!("  host: stop {}", plugin_id);
        Ok(())
    }
}

fn manifest(id: &str, version: &str, permissions: &[&str], deps: serde_json::Value) -> Vec<u8> {
    json!({
        "id": id,
        "name": id,
        "version": version,
        "description": "example plugin",
        "author": "example",
        "category": "productivity",
        "main": "main.js",
        "permissions": permissions,
        "dependencies": deps,
    })
    .to_string()
    .into_bytes()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Plugin Lifecycle Example ===\n");

    let manager =
        PluginManager::from_config(&Config::default())?.with_module_host(Arc::new(PrintingHost));

    let mut events = manager.bus().subscribe(EventType::StateChanged).await;
    tokio::spawn(async move {
        while let Some(Event::StateChanged(event)) = events.recv().await {
            println!(
                "  event: {} {} -> {}",
                event.plugin_id, event.old_state, event.new_state
            );
        }
    });

    // Grant network access, refuse everything else
    manager
        .permissions()
        .set_user_authorization_callback(|request| async move {
            println!(
                "  prompt: {} wants {} ({})",
                request.plugin_id, request.permission, request.reason
            );
            request.permission == Permission::Network
        });

    manager.stage_available(PluginPackage::new(
        "http_client",
        manifest("http_client", "1.3.0", &["network"], json!([])),
        b"export function get(url) {}".to_vec(),
    ))?;

    let report = manager
        .install(
            "weather",
            &manifest(
                "weather",
                "1.0.0",
                &["network", "storage"],
                json!([{"id": "http_client", "version": "^1.0.0"}]),
            ),
            b"import { get } from 'http_client';",
            Some("https://plugins.example.org/weather.js"),
        )
        .await?;
    println!("✓ Installed {:?}", report.installed);

    manager.enable("http_client").await?;
    manager.enable("weather").await?;
    manager.start_module("weather").await?;
    manager.pause_module("weather").await?;
    manager.resume_module("weather").await?;
    println!("✓ weather is {:?}", manager.runtime_state("weather"));

    // A plugin asking for the camera is refused by the prompt
    if let Err(e) = manager
        .install(
            "photo_booth",
            &manifest("photo_booth", "1.0.0", &["camera"], json!([])),
            b"snap()",
            None,
        )
        .await
    {
        println!("✗ photo_booth rejected: {}", e);
    }

    let report = manager.uninstall("weather").await;
    println!(
        "✓ Uninstalled weather ({} bytes freed, {} grants revoked)",
        report.freed_bytes, report.revoked_permissions
    );

    let stats = manager.get_statistics();
    println!("\nPlugins installed: {}", stats.total_plugins);
    println!("Active grants:     {}", stats.permissions.active_grants);

    Ok(())
}
