//! Applications and webhooks the scheduler derives its work from.

mod models;
mod store;

pub use models::{Application, ApplicationSource, Webhook, WebhookSource, WebhookType};
pub use store::{SqliteRegistryStore, REGISTRY_VERSIONED_SCHEMAS};
