//! Postcard Billing Server
//!
//! Axum service around the batch billing engine: manual trigger, charge
//! intake, provider webhooks and the daily scheduler.

mod config;
mod handlers;
mod scheduler;
mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billing_core::{BillingConfig, BillingEngine, BillingStore, MemoryBillingStore, MockPaymentProcessor, PaymentProcessor};
use billing_payments::{PostcardWebhookVerifier, StripeClient};

use crate::config::ServerConfig;
use crate::handlers::{enqueue_charge, health_check, postcard_webhook, run_billing, stripe_webhook};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;
    let billing_config = BillingConfig::from_env()?;

    let store = build_store(&config).await?;
    tracing::info!(store = store.name(), "Ledger store ready");

    let stripe = match StripeClient::from_env() {
        Ok(client) => {
            tracing::info!("Stripe configured");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Stripe not configured - charges are simulated by the mock processor");
            None
        }
    };

    let processor: Arc<dyn PaymentProcessor> = match &stripe {
        Some(client) => client.clone(),
        None => Arc::new(MockPaymentProcessor::new()),
    };

    let postcards = PostcardWebhookVerifier::from_env().ok().map(Arc::new);
    if postcards.is_none() {
        tracing::warn!("PRINT_MAIL_WEBHOOK_SECRET not set - postcard webhooks disabled");
    }

    let engine = Arc::new(BillingEngine::new(store.clone(), processor, billing_config));

    if config.schedule_enabled {
        scheduler::spawn(engine.clone(), config.schedule_hour_utc);
    } else {
        tracing::info!("Daily scheduler disabled");
    }

    let state = AppState {
        engine,
        store,
        stripe,
        postcards,
        cron_secret: config.cron_secret.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!(addr = %config.bind_addr, "Billing server listening");
    tracing::info!("  GET  /health            - Health check");
    tracing::info!("  POST /api/billing/run   - Run the batch now");
    tracing::info!("  POST /api/charges       - Enqueue a pending charge");
    tracing::info!("  POST /webhook/stripe    - Stripe events");
    tracing::info!("  POST /webhook/postcards - Print-mail events");

    axum::serve(listener, app(state)).await?;

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/billing/run", post(run_billing))
        .route("/api/charges", post(enqueue_charge))
        .route("/webhook/stripe", post(stripe_webhook))
        .route("/webhook/postcards", post(postcard_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(feature = "postgres")]
async fn build_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn BillingStore>> {
    if let Some(url) = &config.database_url {
        let store = billing_core::PostgresBillingStore::connect(url).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(MemoryBillingStore::new()))
}

#[cfg(not(feature = "postgres"))]
async fn build_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn BillingStore>> {
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL ignored: built without the `postgres` feature");
    }
    Ok(Arc::new(MemoryBillingStore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use billing_core::{Campaign, Customer, PaymentMethod};
    use billing_payments::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use hmac::{Hmac, Mac};
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::ServiceExt;
    use uuid::Uuid;

    const POSTCARD_SECRET: &str = "pm_whsec_test";

    fn test_state(store: Arc<MemoryBillingStore>, cron_secret: Option<&str>) -> AppState {
        let engine = BillingEngine::new(
            store.clone(),
            Arc::new(MockPaymentProcessor::new()),
            BillingConfig::default(),
        );
        AppState {
            engine: Arc::new(engine),
            store,
            stripe: None,
            postcards: Some(Arc::new(PostcardWebhookVerifier::new(POSTCARD_SECRET))),
            cron_secret: cron_secret.map(String::from),
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state(Arc::new(MemoryBillingStore::new()), None);
        let (status, body) = send(app(state), Request::get("/health").body(Body::empty()).unwrap()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "memory");
        assert_eq!(body["stripe_configured"], false);
    }

    #[tokio::test]
    async fn test_empty_run() {
        let state = test_state(Arc::new(MemoryBillingStore::new()), None);
        let (status, body) = send(app(state), post_json("/api/billing/run", &json!({}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "success": true,
                "processed": 0,
                "results": { "total": 0, "succeeded": 0, "failed": 0, "errors": [] }
            })
        );
    }

    #[tokio::test]
    async fn test_run_requires_bearer_when_configured() {
        let state = test_state(Arc::new(MemoryBillingStore::new()), Some("cron-token"));

        let (status, body) = send(app(state.clone()), post_json("/api/billing/run", &json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");

        let request = Request::post("/api/billing/run")
            .header("authorization", "Bearer cron-token")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(state), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_then_run_bills_campaign() {
        let store = Arc::new(MemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        let mut campaign = Campaign::new(user_id, "Spring movers");
        campaign.total_cost = dec!(10.00);
        let campaign_id = campaign.id;
        store.insert_campaign(campaign).await;
        store
            .insert_customer(Customer {
                user_id,
                stripe_customer_id: "cus_1".into(),
            })
            .await;
        store
            .insert_payment_method(PaymentMethod {
                stripe_payment_method_id: "pm_1".into(),
                stripe_customer_id: "cus_1".into(),
                is_default: true,
                last4: Some("4242".into()),
                brand: Some("visa".into()),
            })
            .await;

        let state = test_state(store.clone(), None);
        for (amount, movers) in [(300, 1), (500, 2)] {
            let (status, _) = send(
                app(state.clone()),
                post_json(
                    "/api/charges",
                    &json!({
                        "campaign_id": campaign_id,
                        "user_id": user_id,
                        "amount_cents": amount,
                        "new_mover_count": movers
                    }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = send(app(state), post_json("/api/billing/run", &json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processed"], 1);
        assert_eq!(body["results"]["succeeded"], 1);

        let campaign = store.campaign(campaign_id).await.unwrap();
        assert_eq!(campaign.total_cost, dec!(18.00));
        assert_eq!(campaign.postcards_sent, 3);
        assert_eq!(store.transactions().await[0].amount_cents, 800);
    }

    #[tokio::test]
    async fn test_negative_amount_rejected() {
        let state = test_state(Arc::new(MemoryBillingStore::new()), None);
        let (status, _) = send(
            app(state),
            post_json(
                "/api/charges",
                &json!({
                    "campaign_id": Uuid::new_v4(),
                    "user_id": Uuid::new_v4(),
                    "amount_cents": -5,
                    "new_mover_count": 1
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_stripe_webhook_disabled_without_client() {
        let state = test_state(Arc::new(MemoryBillingStore::new()), None);
        let request = Request::post("/webhook/stripe")
            .header("stripe-signature", "t=1,v1=00")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(app(state), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "PAYMENTS_DISABLED");
    }

    #[tokio::test]
    async fn test_postcard_webhook() {
        let store = Arc::new(MemoryBillingStore::new());
        let state = test_state(store.clone(), None);
        let payload = json!({
            "id": "evt_1",
            "event_type": { "id": "postcard.mailed" },
            "body": { "id": "psc_9" }
        })
        .to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let mut mac = Hmac::<Sha256>::new_from_slice(POSTCARD_SECRET.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let request = |signature: &str| {
            Request::post("/webhook/postcards")
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp.as_str())
                .body(Body::from(payload.clone()))
                .unwrap()
        };

        let (status, _) = send(app(state.clone()), request("00ff")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(app(state), request(&signature)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
        assert_eq!(body["result"], "applied");
        assert_eq!(body["status"], "printed");

        let status = store.postcard("psc_9").await.unwrap();
        assert_eq!(status.status, billing_core::PostcardLifecycle::Printed);
    }
}
