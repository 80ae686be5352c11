//! Content Store - tenant profiles and message text
//!
//! Resolves which [`AntibanProfile`] governs a tenant and turns a template type
//! plus payload into the text to send. Templates come from configuration:
//! - `static`: one text
//! - `variations`: a base text and alternatives; an alternative is used with
//!   the tenant's `variation_probability`, so identical notifications do not
//!   produce byte-identical messages
//!
//! `{{field}}` placeholders are filled from the dispatch payload.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use wa_config::{AppConfig, TemplateSpec};

use crate::profile::AntibanProfile;
use crate::{DispatchError, Result};

/// Source of tenant profiles and message content
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Profile governing a tenant's dispatches
    async fn profile(&self, tenant_id: &str) -> Result<Arc<AntibanProfile>>;

    /// Final message text for a template type and payload
    async fn resolve(&self, tenant_id: &str, template_type: &str, payload: &serde_json::Value) -> Result<String>;
}

struct TenantContent {
    profile: Arc<AntibanProfile>,
    variation_probability: f64,
    templates: BTreeMap<String, TemplateSpec>,
}

#[derive(Default)]
struct ContentSnapshot {
    tenants: HashMap<String, TenantContent>,
}

impl ContentSnapshot {
    fn build(config: &AppConfig) -> Result<Self> {
        let mut tenants = HashMap::new();
        for tenant in &config.tenants {
            let profile_name = config.profile_name_for(tenant);
            let profile_config = config.antiban.profiles.get(profile_name).ok_or_else(|| {
                DispatchError::Config(format!("tenant {} references unknown profile {}", tenant.id, profile_name))
            })?;
            tenants.insert(
                tenant.id.clone(),
                TenantContent {
                    profile: Arc::new(AntibanProfile::from_config(profile_name, profile_config)),
                    variation_probability: tenant.variation_probability,
                    templates: tenant.templates.clone(),
                },
            );
        }
        Ok(Self { tenants })
    }
}

/// [`ContentStore`] backed by the loaded [`AppConfig`].
pub struct ConfigContentStore {
    snapshot: RwLock<Arc<ContentSnapshot>>,
    rng: Mutex<StdRng>,
}

impl ConfigContentStore {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic variant selection, for tests.
    pub fn with_seed(config: &AppConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &AppConfig, rng: StdRng) -> Result<Self> {
        let snapshot = ContentSnapshot::build(config)?;
        info!(tenants = snapshot.tenants.len(), "Content store loaded");
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            rng: Mutex::new(rng),
        })
    }

    /// Replace every tenant's profile and templates at once.
    pub fn reload(&self, config: &AppConfig) -> Result<()> {
        let snapshot = ContentSnapshot::build(config)?;
        let tenants = snapshot.tenants.len();
        *self.snapshot.write() = Arc::new(snapshot);
        info!(tenants, "Content store reloaded");
        Ok(())
    }

    /// Tenant ids with their current profile.
    pub fn profiles(&self) -> Vec<(String, Arc<AntibanProfile>)> {
        let snapshot = self.snapshot.read().clone();
        let mut profiles: Vec<_> = snapshot
            .tenants
            .iter()
            .map(|(id, t)| (id.clone(), t.profile.clone()))
            .collect();
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        profiles
    }

    fn choose_text<'a>(&self, spec: &'a TemplateSpec, variation_probability: f64) -> &'a str {
        match spec {
            TemplateSpec::Static { text } => text.as_str(),
            TemplateSpec::Variations { base, variants } => {
                let mut rng = self.rng.lock();
                if !variants.is_empty() && rng.random_bool(variation_probability.clamp(0.0, 1.0)) {
                    variants.choose(&mut *rng).map(String::as_str).unwrap_or(base.as_str())
                } else {
                    base.as_str()
                }
            }
        }
    }
}

#[async_trait]
impl ContentStore for ConfigContentStore {
    async fn profile(&self, tenant_id: &str) -> Result<Arc<AntibanProfile>> {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .tenants
            .get(tenant_id)
            .map(|t| t.profile.clone())
            .ok_or_else(|| DispatchError::UnknownTenant(tenant_id.to_string()))
    }

    async fn resolve(&self, tenant_id: &str, template_type: &str, payload: &serde_json::Value) -> Result<String> {
        let snapshot = self.snapshot.read().clone();
        let tenant = snapshot
            .tenants
            .get(tenant_id)
            .ok_or_else(|| DispatchError::UnknownTenant(tenant_id.to_string()))?;
        let spec = tenant.templates.get(template_type).ok_or_else(|| DispatchError::UnknownTemplate {
            tenant_id: tenant_id.to_string(),
            template_type: template_type.to_string(),
        })?;

        let text = self.choose_text(spec, tenant.variation_probability);
        let rendered = render(text, payload)?;
        debug!(tenant_id = %tenant_id, template_type = %template_type, "Content resolved");
        Ok(rendered)
    }
}

/// Fill `{{field}}` placeholders from a JSON object payload.
pub fn render(template: &str, payload: &serde_json::Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| DispatchError::Content(format!("unterminated placeholder in '{}'", template)))?;
        let key = after[..end].trim();

        match payload.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(serde_json::Value::Null) | None => {
                return Err(DispatchError::Content(format!("payload is missing field '{}'", key)));
            }
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wa_config::TenantConfig;

    fn config_with(spec: TemplateSpec, variation_probability: f64) -> AppConfig {
        let mut templates = BTreeMap::new();
        templates.insert("order_paid".to_string(), spec);
        let mut config = AppConfig::default();
        config.tenants.push(TenantConfig {
            id: "acme".into(),
            antiban_profile: Some("conservative".into()),
            variation_probability,
            instances: vec![],
            templates,
        });
        config
    }

    #[test]
    fn test_render_fills_placeholders() {
        let text = render("Hi {{ name }}, order {{order_id}} total {{total}}", &json!({
            "name": "Ana", "order_id": "A-17", "total": 42
        }))
        .unwrap();
        assert_eq!(text, "Hi Ana, order A-17 total 42");
    }

    #[test]
    fn test_render_missing_field() {
        let err = render("Hi {{name}}", &json!({})).unwrap_err();
        assert!(matches!(err, DispatchError::Content(_)));
    }

    #[tokio::test]
    async fn test_profile_resolution() {
        let store = ConfigContentStore::from_config(&config_with(
            TemplateSpec::Static { text: "Hi".into() },
            0.7,
        ))
        .unwrap();
        let profile = store.profile("acme").await.unwrap();
        assert_eq!(profile.strategy_name, "conservative");
        assert!(matches!(store.profile("other").await, Err(DispatchError::UnknownTenant(_))));
    }

    #[tokio::test]
    async fn test_zero_probability_always_uses_base() {
        let spec = TemplateSpec::Variations {
            base: "base {{name}}".into(),
            variants: vec!["alt {{name}}".into()],
        };
        let store = ConfigContentStore::with_seed(&config_with(spec, 0.0), 7).unwrap();
        for _ in 0..20 {
            let text = store.resolve("acme", "order_paid", &json!({"name": "Ana"})).await.unwrap();
            assert_eq!(text, "base Ana");
        }
    }

    #[tokio::test]
    async fn test_full_probability_always_varies() {
        let spec = TemplateSpec::Variations {
            base: "base".into(),
            variants: vec!["alt one".into(), "alt two".into()],
        };
        let store = ConfigContentStore::with_seed(&config_with(spec, 1.0), 7).unwrap();
        for _ in 0..20 {
            let text = store.resolve("acme", "order_paid", &json!({})).await.unwrap();
            assert!(text.starts_with("alt"));
        }
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let store = ConfigContentStore::from_config(&config_with(
            TemplateSpec::Static { text: "Hi".into() },
            0.7,
        ))
        .unwrap();
        let err = store.resolve("acme", "missing", &json!({})).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTemplate { .. }));
    }
}
