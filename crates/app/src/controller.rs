//! Example controller: every Deployment gets a `<name>-meta` ConfigMap summarising it.

use serde_json::json;
use tether_api::Manager;
use tether_core::{new_object, DynamicObject, Gvk};
use tether_dispatch::{OutputPolicy, Request, Response, Route, RouteError};
use tracing::info;

pub const SET_ID: &str = "deployment-meta";
pub const FINALIZER: &str = "tether.dev/deployment-meta";

pub fn deployment() -> Gvk { Gvk::new("apps", "v1", "Deployment") }
pub fn config_map() -> Gvk { Gvk::new("", "v1", "ConfigMap") }

async fn summarise(req: Request, resp: Response) -> anyhow::Result<()> {
    let Some(obj) = req.object() else { return Ok(()) };
    let spec = &obj.data["spec"];
    let image = spec["template"]["spec"]["containers"][0]["image"].as_str().unwrap_or("");
    let mut cm = new_object(
        &config_map(),
        req.id.namespace(),
        &format!("{}-meta", req.id.name()),
        json!({
            "data": {
                "replicas": spec["replicas"].as_i64().unwrap_or(1).to_string(),
                "image": image,
            }
        }),
    );
    cm.metadata.labels = Some([("app.kubernetes.io/managed-by".to_string(), "tether".to_string())].into());
    resp.add(cm)?;
    Ok(())
}

async fn cleanup(req: Request, _resp: Response) -> anyhow::Result<()> {
    info!(key = %req.id, "deployment going away; pruning its meta");
    Ok(())
}

pub fn register(manager: &Manager) -> Result<(), RouteError> {
    let route = Route::builder(SET_ID, deployment())
        .error_prefix("deployment-meta")
        .outputs(OutputPolicy::set_id(SET_ID).with_prune_kinds([config_map()]))
        .handle(summarise)
        .finalize(FINALIZER, cleanup)
        .build()?;
    manager.register(route);
    manager.watch_owned(deployment(), config_map());
    manager.register_orphan_purger(config_map())?;
    Ok(())
}

/// Seed data for `--memory` runs.
pub fn demo_objects() -> Vec<DynamicObject> {
    ["web", "worker"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            new_object(
                &deployment(),
                Some("default"),
                name,
                json!({"spec": {"replicas": i + 1, "template": {"spec": {"containers": [{"name": name, "image": format!("example/{}:1", name)}]}}}}),
            )
        })
        .collect()
}
