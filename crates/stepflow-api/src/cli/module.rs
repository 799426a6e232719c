//! `sflow modules` and `sflow config`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use stepflow_infra::config::resolve_database_url;
use stepflow_types::config::GuardConfig;

use super::print_json;
use crate::state::AppState;

pub fn handle_modules(state: &AppState, json: bool) -> Result<()> {
    let mut modules = state.modules.list();
    modules.sort_by(|a, b| a.path.cmp(&b.path));

    if json {
        return print_json(&modules);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Module").fg(Color::Cyan),
            Cell::new("Description"),
            Cell::new("Parameters"),
        ]);

    for module in &modules {
        let params = module
            .params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.clone()
                } else {
                    format!("{}?", p.name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(vec![
            Cell::new(&module.path),
            Cell::new(&module.description),
            Cell::new(params),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Effective guard settings of every category that has an override.
fn resolved_categories(state: &AppState) -> BTreeMap<String, GuardConfig> {
    let resilience = &state.config.resilience;
    resilience
        .categories
        .keys()
        .map(|category| (category.clone(), resilience.for_category(category)))
        .collect()
}

pub fn handle_config(state: &AppState, json: bool) -> Result<()> {
    let database_url = resolve_database_url(&state.config, &state.data_dir);
    let resolved = resolved_categories(state);

    if json {
        return print_json(&serde_json::json!({
            "dataDir": state.data_dir.display().to_string(),
            "databaseUrl": database_url,
            "config": state.config,
            "resolvedCategories": resolved,
        }));
    }

    let rendered = toml::to_string_pretty(&state.config).context("Failed to render config")?;

    println!();
    println!("  {} {}", style("Data dir:").bold(), state.data_dir.display());
    println!("  {} {database_url}", style("Database:").bold());
    println!();
    for line in rendered.lines() {
        println!("  {line}");
    }

    if !resolved.is_empty() {
        println!();
        println!("  {}", style("── Effective category guards ──").dim());
        for (category, guard) in &resolved {
            println!(
                "  {}: capacity={} refill={}/{}ms max_concurrent={} threshold={} cooldown={}ms timeout={}ms",
                style(category).cyan(),
                guard.capacity,
                guard.refill_amount,
                guard.refill_interval_ms,
                guard.max_concurrent,
                guard.failure_threshold,
                guard.cooldown_ms,
                guard.call_timeout_ms
            );
        }
    }
    println!();
    Ok(())
}
