//! Registry fixtures for end-to-end tests

use super::constants::*;
use anyhow::Result;
use operations_scheduler::registry::{Application, SqliteRegistryStore, Webhook, WebhookType};
use std::path::Path;

fn application(id: &str, template: Option<&str>) -> Application {
    Application {
        id: id.to_string(),
        name: format!("{} name", id),
        application_template_id: template.map(str::to_string),
    }
}

/// Creates registry.db under `dir` with:
/// - APP_WITH_WEBHOOK_ID and its own ORD webhook
/// - TEMPLATE_APP_ID created from TEMPLATE_ID, which has an ORD webhook
/// - STATIC_TEMPLATE_ID with a static ORD webhook
/// - APP_WITHOUT_WEBHOOK_ID with no webhook
pub fn create_test_registry(dir: &Path) -> Result<SqliteRegistryStore> {
    let registry = SqliteRegistryStore::new(dir.join("registry.db"))?;

    registry.insert_application(&application(APP_WITH_WEBHOOK_ID, None))?;
    registry.insert_application(&application(TEMPLATE_APP_ID, Some(TEMPLATE_ID)))?;
    registry.insert_application(&application(APP_WITHOUT_WEBHOOK_ID, None))?;

    registry.insert_webhook(&Webhook::for_application(
        WebhookType::OpenResourceDiscovery,
        "http://direct.example/ord",
        APP_WITH_WEBHOOK_ID,
    ))?;
    registry.insert_webhook(&Webhook::for_template(
        WebhookType::OpenResourceDiscovery,
        "http://template.example/ord",
        TEMPLATE_ID,
    ))?;
    registry.insert_webhook(&Webhook::for_template(
        WebhookType::OpenResourceDiscoveryStatic,
        "http://static.example/ord",
        STATIC_TEMPLATE_ID,
    ))?;

    Ok(registry)
}
