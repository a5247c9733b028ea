//! Billing provider client
//!
//! The provider is the sole source of truth for billing facts; this module
//! is the only place that talks to it. The client is an explicitly
//! constructed handle passed into the coordinator - no process-wide
//! singleton. Only the five calls the engine needs are exposed, all
//! bounded by a request timeout so synchronous callers never hang on the
//! provider.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::events::SubscriptionPayload;
use crate::plan::PlanTier;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Stripe configuration, loaded from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Absent means degraded unverified webhook mode
    pub webhook_secret: Option<String>,
    pub starter_price_id: String,
    pub pro_price_id: String,
    pub team_price_id: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
    /// Overridable for tests
    pub api_base: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::NotConfigured("STRIPE_SECRET_KEY".into()))?;

        Ok(Self {
            secret_key,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            starter_price_id: std::env::var("STRIPE_PRICE_STARTER").unwrap_or_default(),
            pro_price_id: std::env::var("STRIPE_PRICE_PRO").unwrap_or_default(),
            team_price_id: std::env::var("STRIPE_PRICE_TEAM").unwrap_or_default(),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/success".to_string()),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing".to_string()),
            portal_return_url: std::env::var("PORTAL_RETURN_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing".to_string()),
            api_base: DEFAULT_API_BASE.to_string(),
        })
    }

    /// The configured price-to-plan table, consumed by the Plan Resolver
    pub fn price_table(&self) -> HashMap<String, PlanTier> {
        let mut table = HashMap::new();
        for (price_id, tier) in [
            (&self.starter_price_id, PlanTier::Starter),
            (&self.pro_price_id, PlanTier::Pro),
            (&self.team_price_id, PlanTier::Team),
        ] {
            if !price_id.is_empty() {
                table.insert(price_id.clone(), tier);
            }
        }
        table
    }

    pub fn price_id_for_tier(&self, tier: PlanTier) -> Option<&str> {
        let id = match tier {
            PlanTier::Free => return None,
            PlanTier::Starter => &self.starter_price_id,
            PlanTier::Pro => &self.pro_price_id,
            PlanTier::Team => &self.team_price_id,
        };
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

/// A created checkout session to redirect the user to
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

/// A created billing portal session
#[derive(Debug, Clone, Deserialize)]
pub struct PortalSession {
    pub url: String,
}

/// The five provider operations the engine needs
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionPayload>;

    async fn create_checkout_session(
        &self,
        customer_id: Option<&str>,
        price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<CheckoutSession>;

    async fn create_portal_session(&self, customer_id: &str) -> BillingResult<PortalSession>;

    /// Patch the subscription's cancel-at-period-end flag
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionPayload>;

    /// Patch the subscription onto a different price (upgrade/downgrade)
    async fn change_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
        plan_hint: &str,
    ) -> BillingResult<SubscriptionPayload>;

    /// Cancel immediately (not at period end)
    async fn cancel_subscription(&self, subscription_id: &str)
        -> BillingResult<SubscriptionPayload>;
}

/// Stripe error envelope
#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// reqwest-backed Stripe client
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Internal(format!("http client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.api_base, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> BillingResult<T> {
        let response = self
            .http
            .get(self.url(path))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .form(form)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn delete_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> BillingResult<T> {
        let response = self
            .http
            .delete(self.url(path))
            .basic_auth(&self.config.secret_key, None::<&str>)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> BillingResult<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let detail = serde_json::from_str::<StripeErrorBody>(&body)
                .map(|b| {
                    format!(
                        "{} ({})",
                        b.error.message.unwrap_or_else(|| "unknown".to_string()),
                        b.error.kind.unwrap_or_else(|| "unknown".to_string())
                    )
                })
                .unwrap_or_else(|_| body.clone());
            tracing::error!(status = %status, detail = %detail, "Stripe API error");
            return Err(BillingError::ProviderApi(format!("{}: {}", status, detail)));
        }

        serde_json::from_str(&body)
            .map_err(|e| BillingError::ProviderApi(format!("unparseable response: {}", e)))
    }
}

#[async_trait]
impl ProviderClient for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionPayload> {
        self.get_json(&format!("subscriptions/{}", subscription_id))
            .await
    }

    async fn create_checkout_session(
        &self,
        customer_id: Option<&str>,
        price_id: &str,
        metadata: &HashMap<String, String>,
    ) -> BillingResult<CheckoutSession> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "subscription".into()),
            ("line_items[0][price]".into(), price_id.to_string()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "success_url".into(),
                self.config.checkout_success_url.clone(),
            ),
            ("cancel_url".into(), self.config.checkout_cancel_url.clone()),
        ];
        if let Some(customer) = customer_id {
            form.push(("customer".into(), customer.to_string()));
        }
        for (key, value) in metadata {
            form.push((format!("metadata[{}]", key), value.clone()));
            // Mirror onto the subscription so later subscription events
            // carry the same attribution
            form.push((
                format!("subscription_data[metadata][{}]", key),
                value.clone(),
            ));
        }
        self.post_form("checkout/sessions", &form).await
    }

    async fn create_portal_session(&self, customer_id: &str) -> BillingResult<PortalSession> {
        let form: Vec<(String, String)> = vec![
            ("customer".into(), customer_id.to_string()),
            ("return_url".into(), self.config.portal_return_url.clone()),
        ];
        self.post_form("billing_portal/sessions", &form).await
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<SubscriptionPayload> {
        let form: Vec<(String, String)> =
            vec![("cancel_at_period_end".into(), cancel.to_string())];
        self.post_form(&format!("subscriptions/{}", subscription_id), &form)
            .await
    }

    async fn change_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
        plan_hint: &str,
    ) -> BillingResult<SubscriptionPayload> {
        // The line item id is required to swap the price in place
        let current: SubscriptionPayload = self
            .retrieve_subscription(subscription_id)
            .await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.clone())
            .ok_or_else(|| {
                BillingError::ProviderApi("subscription has no line items".to_string())
            })?;

        let form: Vec<(String, String)> = vec![
            ("items[0][id]".into(), item_id),
            ("items[0][price]".into(), new_price_id.to_string()),
            ("proration_behavior".into(), "create_prorations".into()),
            ("metadata[plan]".into(), plan_hint.to_string()),
        ];
        self.post_form(&format!("subscriptions/{}", subscription_id), &form)
            .await
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<SubscriptionPayload> {
        self.delete_json(&format!("subscriptions/{}", subscription_id))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_config(api_base: String) -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: Some("whsec_test".to_string()),
            starter_price_id: "price_starter".to_string(),
            pro_price_id: "price_pro".to_string(),
            team_price_id: "price_team".to_string(),
            checkout_success_url: "https://app.test/success".to_string(),
            checkout_cancel_url: "https://app.test/cancel".to_string(),
            portal_return_url: "https://app.test/billing".to_string(),
            api_base,
        }
    }

    #[test]
    fn price_table_from_config() {
        let config = test_config(DEFAULT_API_BASE.to_string());
        let table = config.price_table();
        assert_eq!(table.get("price_pro"), Some(&PlanTier::Pro));
        assert_eq!(table.len(), 3);
        assert_eq!(config.price_id_for_tier(PlanTier::Team), Some("price_team"));
        assert_eq!(config.price_id_for_tier(PlanTier::Free), None);
    }

    #[tokio::test]
    async fn retrieve_subscription_parses_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/subscriptions/sub_123")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "sub_123",
                    "customer": "cus_9",
                    "status": "active",
                    "cancel_at_period_end": false,
                    "current_period_end": 1_760_000_000,
                    "items": {"data": [{"id": "si_1", "price": {
                        "id": "price_pro",
                        "unit_amount": 1500,
                        "currency": "usd",
                        "recurring": {"interval": "month", "interval_count": 1}
                    }}]}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = StripeClient::new(test_config(server.url())).unwrap();
        let payload = client.retrieve_subscription("sub_123").await.unwrap();
        mock.assert_async().await;

        assert_eq!(payload.id, "sub_123");
        assert_eq!(payload.status, "active");
        assert_eq!(payload.price_id(), Some("price_pro"));
        assert_eq!(payload.current_period_end, Some(1_760_000_000));
    }

    #[tokio::test]
    async fn provider_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/subscriptions/sub_missing")
            .with_status(404)
            .with_body(r#"{"error": {"message": "No such subscription", "type": "invalid_request_error"}}"#)
            .create_async()
            .await;

        let client = StripeClient::new(test_config(server.url())).unwrap();
        let err = client.retrieve_subscription("sub_missing").await.unwrap_err();
        match err {
            BillingError::ProviderApi(msg) => assert!(msg.contains("No such subscription")),
            other => panic!("expected ProviderApi, got {:?}", other),
        }
    }
}
