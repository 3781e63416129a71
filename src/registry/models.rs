use anyhow::Result;

/// What a webhook is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookType {
    /// Serves aggregation documents for an application or template.
    OpenResourceDiscovery,
    /// Serves the same aggregation documents for every application of a
    /// template, so the template is aggregated once.
    OpenResourceDiscoveryStatic,
    /// Notified when configuration of the target changes.
    ConfigurationChanged,
}

impl WebhookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookType::OpenResourceDiscovery => "OPEN_RESOURCE_DISCOVERY",
            WebhookType::OpenResourceDiscoveryStatic => "OPEN_RESOURCE_DISCOVERY_STATIC",
            WebhookType::ConfigurationChanged => "CONFIGURATION_CHANGED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "OPEN_RESOURCE_DISCOVERY" => Some(WebhookType::OpenResourceDiscovery),
            "OPEN_RESOURCE_DISCOVERY_STATIC" => Some(WebhookType::OpenResourceDiscoveryStatic),
            "CONFIGURATION_CHANGED" => Some(WebhookType::ConfigurationChanged),
            _ => None,
        }
    }
}

/// A webhook attached either to one application or to an application template.
#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
    pub id: String,
    pub webhook_type: WebhookType,
    pub url: String,
    pub application_id: Option<String>,
    pub application_template_id: Option<String>,
}

impl Webhook {
    pub fn for_application(
        webhook_type: WebhookType,
        url: impl Into<String>,
        application_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_type,
            url: url.into(),
            application_id: Some(application_id.into()),
            application_template_id: None,
        }
    }

    pub fn for_template(
        webhook_type: WebhookType,
        url: impl Into<String>,
        application_template_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            webhook_type,
            url: url.into(),
            application_id: None,
            application_template_id: Some(application_template_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub application_template_id: Option<String>,
}

impl Application {
    pub fn new(name: impl Into<String>, application_template_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            application_template_id,
        }
    }
}

/// Read access to registered webhooks.
pub trait WebhookSource: Send + Sync {
    fn list_webhooks_by_type(&self, webhook_type: WebhookType) -> Result<Vec<Webhook>>;
}

/// Read access to registered applications.
pub trait ApplicationSource: Send + Sync {
    fn get_application(&self, id: &str) -> Result<Option<Application>>;

    fn list_applications_by_template(&self, template_id: &str) -> Result<Vec<Application>>;
}
