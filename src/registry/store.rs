//! SQLite-backed registry of applications and their webhooks.

use super::models::{Application, ApplicationSource, Webhook, WebhookSource, WebhookType};
use crate::sqlite_column;
use crate::sqlite_persistence::{open_versioned, Column, SqlType, Table, VersionedSchema};
use anyhow::{anyhow, bail, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const APPLICATIONS_TABLE_V0: Table = Table {
    name: "applications",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("application_template_id", &SqlType::Text),
    ],
    indices: &[("idx_applications_template", "application_template_id")],
};

const WEBHOOKS_TABLE_V0: Table = Table {
    name: "webhooks",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("webhook_type", &SqlType::Text, non_null = true),
        sqlite_column!("url", &SqlType::Text, non_null = true),
        sqlite_column!("application_id", &SqlType::Text),
        sqlite_column!("application_template_id", &SqlType::Text),
    ],
    indices: &[("idx_webhooks_type", "webhook_type")],
};

pub const REGISTRY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[APPLICATIONS_TABLE_V0, WEBHOOKS_TABLE_V0],
    views: &[],
    migration: None,
}];

pub struct SqliteRegistryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistryStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, REGISTRY_VERSIONED_SCHEMAS, "registry")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = crate::sqlite_persistence::open_in_memory(REGISTRY_VERSIONED_SCHEMAS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("registry connection mutex poisoned"))
    }

    pub fn insert_application(&self, application: &Application) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO applications (id, name, application_template_id) VALUES (?1, ?2, ?3)",
            params![
                application.id,
                application.name,
                application.application_template_id
            ],
        )?;
        Ok(())
    }

    pub fn insert_webhook(&self, webhook: &Webhook) -> Result<()> {
        if webhook.application_id.is_some() == webhook.application_template_id.is_some() {
            bail!(
                "Webhook {} must target exactly one of an application or a template",
                webhook.id
            );
        }
        self.conn()?.execute(
            r#"INSERT INTO webhooks (id, webhook_type, url, application_id, application_template_id)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                webhook.id,
                webhook.webhook_type.as_str(),
                webhook.url,
                webhook.application_id,
                webhook.application_template_id
            ],
        )?;
        Ok(())
    }

    pub fn delete_webhook(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM webhooks WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }
}

fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<Application> {
    Ok(Application {
        id: row.get("id")?,
        name: row.get("name")?,
        application_template_id: row.get("application_template_id")?,
    })
}

fn row_to_webhook(row: &rusqlite::Row) -> rusqlite::Result<Webhook> {
    let raw_type: String = row.get("webhook_type")?;
    let webhook_type = WebhookType::from_str(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown webhook type {}", raw_type).into(),
        )
    })?;
    Ok(Webhook {
        id: row.get("id")?,
        webhook_type,
        url: row.get("url")?,
        application_id: row.get("application_id")?,
        application_template_id: row.get("application_template_id")?,
    })
}

impl WebhookSource for SqliteRegistryStore {
    fn list_webhooks_by_type(&self, webhook_type: WebhookType) -> Result<Vec<Webhook>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, webhook_type, url, application_id, application_template_id
               FROM webhooks WHERE webhook_type = ?1 ORDER BY rowid ASC"#,
        )?;
        let webhooks = stmt
            .query_map([webhook_type.as_str()], row_to_webhook)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(webhooks)
    }
}

impl ApplicationSource for SqliteRegistryStore {
    fn get_application(&self, id: &str) -> Result<Option<Application>> {
        let application = self
            .conn()?
            .query_row(
                "SELECT id, name, application_template_id FROM applications WHERE id = ?1",
                [id],
                row_to_application,
            )
            .optional()?;
        Ok(application)
    }

    fn list_applications_by_template(&self, template_id: &str) -> Result<Vec<Application>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, name, application_template_id FROM applications
               WHERE application_template_id = ?1 ORDER BY rowid ASC"#,
        )?;
        let applications = stmt
            .query_map([template_id], row_to_application)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(applications)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applications_by_template() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        let a = Application::new("a", Some("tpl".to_string()));
        let b = Application::new("b", Some("tpl".to_string()));
        let standalone = Application::new("c", None);
        for app in [&a, &b, &standalone] {
            store.insert_application(app).unwrap();
        }

        let listed = store.list_applications_by_template("tpl").unwrap();
        assert_eq!(listed, vec![a.clone(), b]);
        assert!(store.list_applications_by_template("other").unwrap().is_empty());

        assert_eq!(store.get_application(&a.id).unwrap(), Some(a));
        assert_eq!(store.get_application("missing").unwrap(), None);
    }

    #[test]
    fn test_webhooks_by_type() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        let ord = Webhook::for_application(WebhookType::OpenResourceDiscovery, "http://ord", "app");
        let other = Webhook::for_application(WebhookType::ConfigurationChanged, "http://cfg", "app");
        store.insert_webhook(&ord).unwrap();
        store.insert_webhook(&other).unwrap();

        assert_eq!(
            store
                .list_webhooks_by_type(WebhookType::OpenResourceDiscovery)
                .unwrap(),
            vec![ord.clone()]
        );

        assert!(store.delete_webhook(&ord.id).unwrap());
        assert!(!store.delete_webhook(&ord.id).unwrap());
        assert!(store
            .list_webhooks_by_type(WebhookType::OpenResourceDiscovery)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_webhook_must_target_one_side() {
        let store = SqliteRegistryStore::in_memory().unwrap();
        let mut webhook = Webhook::for_application(WebhookType::OpenResourceDiscovery, "http://x", "app");
        webhook.application_template_id = Some("tpl".to_string());
        assert!(store.insert_webhook(&webhook).is_err());

        webhook.application_id = None;
        webhook.application_template_id = None;
        assert!(store.insert_webhook(&webhook).is_err());
    }
}
