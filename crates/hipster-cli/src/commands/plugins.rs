use hipster_core::config::Config;
use hipster_plugins::registry::PluginRegistry;

pub async fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    let registry = PluginRegistry::load(config)?;
    let stop_function = format!("stop:{}", config.manager_identity());

    if registry.is_empty() {
        println!("No plugins configured.");
        println!("Run `hipster-worker config --init` to create a sample config.");
        return Ok(());
    }

    if json {
        let entries: Vec<serde_json::Value> = registry
            .registrations()
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.kind.as_str(),
                    "function": r.queue_function,
                    "datasets": r.catalog.len(),
                    "shutdown_after": r.config.shutdown_after,
                })
            })
            .collect();
        let listing = serde_json::json!({
            "plugins": entries,
            "stop_function": stop_function,
        });
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        println!("{:<18} {:<45} {:<9} {}", "NAME", "FUNCTION", "DATASETS", "SHUTDOWN-AFTER");
        println!("{}", "-".repeat(85));
        for r in registry.registrations() {
            println!(
                "{:<18} {:<45} {:<9} {}",
                r.kind,
                r.queue_function,
                r.catalog.len(),
                if r.config.shutdown_after { "yes" } else { "no" },
            );
        }
        println!();
        println!("Stop function: {}", stop_function);
    }

    Ok(())
}
