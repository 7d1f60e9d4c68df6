use super::{CommandContext, parse_module, parse_role};
use crate::SessionArgs;
use anyhow::Result;
use fleetgate_access::identity::{Identity, InMemoryRoleStore};
use fleetgate_access::rbac::{AccessSnapshot, GuardConfig, LandingGuard, NavigationLog, RoleResolver, RouteGuard};
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;

const CLI_USER: &str = "cli-user";

/// Report a decision with the navigations it triggered.
///
/// JSON mode emits a single document; navigations go into its `navigated` field.
fn report<D: Serialize + Debug>(ctx: &CommandContext, decision: &D, navigations: &NavigationLog) -> Result<()> {
    let navigated = navigations.entries();

    if ctx.json() {
        return ctx.print_json(&json!({
            "decision": decision,
            "navigated": navigated.last(),
        }));
    }

    for target in &navigated {
        println!("navigate -> {}", target);
    }
    println!("Decision: {:?}", decision);
    Ok(())
}

/// Run the session through the resolver so raw roles decode the way they do in production
async fn session_snapshot(ctx: &CommandContext, session: &SessionArgs) -> AccessSnapshot {
    if session.loading {
        return AccessSnapshot::initial();
    }

    let store = Arc::new(InMemoryRoleStore::new());
    if let Some(role) = &session.role {
        store.assign(CLI_USER, role.clone());
    }

    let resolver = RoleResolver::new(store, ctx.matrix.clone());
    let identity = (!session.signed_out).then(|| Identity::new(CLI_USER));
    resolver.resolve(identity).await
}

pub async fn evaluate_route(ctx: &CommandContext, session: &SessionArgs, module: Option<&str>, allow: &[String], redirect_to: Option<String>) -> Result<()> {
    let mut config = GuardConfig::new();
    if let Some(module) = module {
        config = config.require_module(parse_module(module)?);
    }

    let mut allowed = Vec::new();
    for role in allow {
        if let Some(role) = parse_role(role)? {
            allowed.push(role);
        }
    }
    config = config.allow_roles(allowed);

    if let Some(target) = redirect_to {
        config = config.redirect_to(target);
    }

    let snapshot = session_snapshot(ctx, session).await;
    let navigations = Arc::new(NavigationLog::new());
    let mut guard = RouteGuard::new(config, ctx.matrix.clone(), ctx.config.access.routes.clone(), navigations.clone());
    let decision = guard.render(&snapshot);

    report(ctx, &decision, &navigations)
}

pub async fn evaluate_landing(ctx: &CommandContext, session: &SessionArgs) -> Result<()> {
    let snapshot = session_snapshot(ctx, session).await;
    let navigations = Arc::new(NavigationLog::new());
    let mut landing = LandingGuard::new(ctx.config.access.routes.clone(), navigations.clone());
    let decision = landing.render(&snapshot);

    report(ctx, &decision, &navigations)
}
