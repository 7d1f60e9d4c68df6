use super::CommandContext;
use crate::PolicyCommands;
use anyhow::{Context, Result};
use fleetgate_access::rbac::{AppModule, PermissionMatrix, Role};
use std::path::Path;

pub fn handle_policy_command(ctx: &CommandContext, command: PolicyCommands) -> Result<()> {
    match command {
        PolicyCommands::Show => show_policy(ctx),
        PolicyCommands::Export { output } => export_policy(ctx, output.as_deref()),
        PolicyCommands::Validate { path } => validate_policy(&path),
    }
}

fn show_policy(ctx: &CommandContext) -> Result<()> {
    if ctx.json() {
        return ctx.print_json(&ctx.matrix.to_document());
    }

    match &ctx.config.access.policy_path {
        Some(path) => println!("Policy: {}", path.display()),
        None => println!("Policy: built-in"),
    }
    println!();

    print!("{:<18}", "Module");
    for role in Role::ALL {
        print!(" {:<10}", role.as_str());
    }
    println!();
    println!("{}", "-".repeat(18 + Role::ALL.len() * 11));

    for module in AppModule::ALL {
        print!("{:<18}", module.as_str());
        for role in Role::ALL {
            print!(" {:<10}", ctx.matrix.access_level(Some(role), module).as_str());
        }
        println!();
    }

    Ok(())
}

fn export_policy(ctx: &CommandContext, output: Option<&Path>) -> Result<()> {
    let content = toml::to_string_pretty(&ctx.matrix.to_document())?;

    match output {
        Some(path) => {
            std::fs::write(path, content).with_context(|| format!("writing policy to {}", path.display()))?;
            println!("Policy written to {}", path.display());
        }
        None => print!("{}", content),
    }

    Ok(())
}

fn validate_policy(path: &Path) -> Result<()> {
    let matrix = PermissionMatrix::load_from_file(path).with_context(|| format!("invalid policy {}", path.display()))?;
    let grants: usize = Role::ALL.iter().map(|role| matrix.permissions_for(Some(*role)).modules().count()).sum();
    println!("Policy OK: {} grants", grants);
    Ok(())
}
