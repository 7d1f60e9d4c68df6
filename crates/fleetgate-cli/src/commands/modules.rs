use super::{CommandContext, parse_module, parse_role};
use anyhow::Result;
use fleetgate_access::rbac::AppModule;
use serde_json::json;

pub fn list_modules(ctx: &CommandContext) -> Result<()> {
    if ctx.json() {
        let modules: Vec<_> = AppModule::ALL
            .iter()
            .map(|module| json!({ "module": module.as_str(), "route": module.route(), "label": module.label() }))
            .collect();
        return ctx.print_json(&modules);
    }

    println!("{:<18} {:<18} {:<20}", "Module", "Route", "Label");
    println!("{}", "-".repeat(56));
    for module in AppModule::ALL {
        println!("{:<18} {:<18} {:<20}", module.as_str(), module.route(), module.label());
    }

    Ok(())
}

pub fn show_navigation(ctx: &CommandContext, role: &str) -> Result<()> {
    let role = parse_role(role)?;
    let items = ctx.matrix.navigation_items(role);

    if ctx.json() {
        return ctx.print_json(&items);
    }

    if items.is_empty() {
        println!("No modules visible.");
        return Ok(());
    }

    for item in items {
        println!("{:<20} {}", item.label, item.route);
    }

    Ok(())
}

pub fn check_access(ctx: &CommandContext, role: &str, module: &str) -> Result<()> {
    let role = parse_role(role)?;
    let module = parse_module(module)?;
    let level = ctx.matrix.access_level(role, module);

    if ctx.json() {
        return ctx.print_json(&json!({
            "role": role,
            "module": module,
            "level": level,
            "can_view": level.allows_view(),
            "can_edit": level.allows_edit(),
        }));
    }

    let role_name = role.map(|role| role.as_str()).unwrap_or("none");
    println!("{} on {}: {}", role_name, module.as_str(), level);
    println!("  View: {}", level.allows_view());
    println!("  Edit: {}", level.allows_edit());

    Ok(())
}
