//! Typed HTTP client for the storefront service
//!
//! One method per endpoint. Error bodies (`{"error", "message"}`) become
//! [`ClientError::Api`]; set a locale with [`StorefrontClient::with_locale`]
//! to receive Arabic messages.

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use storefront_rs::events::payloads::NotificationEvent;
use storefront_rs::models::{
    CartItem, Notification, NotificationView, Order, OrderStatus, PointsEntry, Product, Wallet,
    WalletTransaction,
};
use storefront_rs::routes::admin::{AdvanceOrderRequest, ImportReport};
use storefront_rs::routes::cart::{AddItemRequest, SetQuantityRequest};
use storefront_rs::routes::chat::ChatResponse;
use storefront_rs::routes::notifications::{ReadReceipt, UnreadCount};
use storefront_rs::routes::orders::PlaceOrderRequest;
use storefront_rs::routes::rewards::DailyGameRequest;
use storefront_rs::routes::wallet::{
    AddMoneyRequest, AddPointsRequest, MoneyResponse, PointsResponse, StatsResponse,
};
use storefront_rs::routes::ErrorResponse;
use storefront_rs::services::chat_service::ChatRequest;
use storefront_rs::services::checkout_service::CartSummary;
use storefront_rs::services::notification_service::CreateNotification;
use storefront_rs::services::reward_service::{DailyGameStatus, RewardGrant};
use storefront_rs::services::wallet_service::Reconciliation;

use crate::error::ClientError;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct StorefrontClient {
    base_url: Url,
    http_client: Client,
    locale: Option<String>,
}

impl StorefrontClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Config(format!("invalid base url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Config(format!(
                "base url cannot carry a path: {}",
                base_url
            )));
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            http_client,
            locale: None,
        })
    }

    /// Send `Accept-Language` on every request (`"ar"` for Arabic errors)
    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    // ========================================================================
    // WALLET
    // ========================================================================

    pub async fn health(&self) -> Result<Value, ClientError> {
        self.send(self.get(&["api", "health"])?).await
    }

    pub async fn wallet(&self, user_id: &str) -> Result<Wallet, ClientError> {
        self.send(self.get(&["api", "wallets", user_id])?).await
    }

    pub async fn add_money(
        &self,
        user_id: &str,
        request: &AddMoneyRequest,
        idempotency_key: Option<&str>,
    ) -> Result<MoneyResponse, ClientError> {
        let mut builder = self.post(&["api", "wallets", user_id, "money"], request)?;
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        self.send(builder).await
    }

    pub async fn add_points(
        &self,
        user_id: &str,
        request: &AddPointsRequest,
        idempotency_key: Option<&str>,
    ) -> Result<PointsResponse, ClientError> {
        let mut builder = self.post(&["api", "wallets", user_id, "points"], request)?;
        if let Some(key) = idempotency_key {
            builder = builder.header(IDEMPOTENCY_HEADER, key);
        }
        self.send(builder).await
    }

    pub async fn transactions(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<WalletTransaction>, ClientError> {
        let builder = self.get(&["api", "wallets", user_id, "transactions"])?;
        self.send(with_limit(builder, limit)).await
    }

    pub async fn points_history(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<PointsEntry>, ClientError> {
        let builder = self.get(&["api", "wallets", user_id, "points", "history"])?;
        self.send(with_limit(builder, limit)).await
    }

    /// `month` is `YYYY-MM`; `None` means the current ledger month
    pub async fn monthly_stats(
        &self,
        user_id: &str,
        month: Option<&str>,
    ) -> Result<StatsResponse, ClientError> {
        let mut builder = self.get(&["api", "wallets", user_id, "stats"])?;
        if let Some(month) = month {
            builder = builder.query(&[("month", month)]);
        }
        self.send(builder).await
    }

    pub async fn reconcile(&self, user_id: &str) -> Result<Reconciliation, ClientError> {
        self.send(self.get(&["api", "wallets", user_id, "reconcile"])?)
            .await
    }

    // ========================================================================
    // REWARDS
    // ========================================================================

    pub async fn daily_game_status(&self, user_id: &str) -> Result<DailyGameStatus, ClientError> {
        self.send(self.get(&["api", "rewards", user_id, "daily-game"])?)
            .await
    }

    pub async fn play_daily_game(
        &self,
        user_id: &str,
        caught_items: i64,
    ) -> Result<RewardGrant, ClientError> {
        let body = DailyGameRequest { caught_items };
        self.send(self.post(&["api", "rewards", user_id, "daily-game"], &body)?)
            .await
    }

    // ========================================================================
    // CART & ORDERS
    // ========================================================================

    pub async fn cart(&self, user_id: &str) -> Result<CartSummary, ClientError> {
        self.send(self.get(&["api", "cart", user_id])?).await
    }

    pub async fn add_to_cart(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> Result<CartItem, ClientError> {
        let body = AddItemRequest {
            product_id: product_id.to_string(),
            quantity,
        };
        self.send(self.post(&["api", "cart", user_id, "items"], &body)?)
            .await
    }

    /// `None` when a zero quantity removed the line
    pub async fn set_cart_quantity(
        &self,
        user_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> Result<Option<CartItem>, ClientError> {
        let body = SetQuantityRequest { quantity };
        let url = self.url(&["api", "cart", user_id, "items", product_id])?;
        let response = self
            .prepare(self.http_client.put(url).json(&body))
            .send()
            .await?;
        let response = check(response).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    pub async fn remove_from_cart(&self, user_id: &str, product_id: &str) -> Result<(), ClientError> {
        let url = self.url(&["api", "cart", user_id, "items", product_id])?;
        self.send_empty(self.http_client.delete(url)).await
    }

    pub async fn place_order(&self, request: &PlaceOrderRequest) -> Result<Order, ClientError> {
        self.send(self.post(&["api", "orders"], request)?).await
    }

    pub async fn order(&self, order_id: Uuid) -> Result<Order, ClientError> {
        self.send(self.get(&["api", "orders", &order_id.to_string()])?)
            .await
    }

    pub async fn user_orders(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Order>, ClientError> {
        let builder = self.get(&["api", "users", user_id, "orders"])?;
        self.send(with_limit(builder, limit)).await
    }

    // ========================================================================
    // CATALOG & ADMIN
    // ========================================================================

    pub async fn product(&self, product_id: &str) -> Result<Product, ClientError> {
        self.send(self.get(&["api", "products", product_id])?).await
    }

    /// `records` is a JSON array (or `{"products": [...]}`) in any upstream shape
    pub async fn import_products(&self, records: &Value) -> Result<ImportReport, ClientError> {
        self.send(self.post(&["api", "admin", "products", "import"], records)?)
            .await
    }

    pub async fn advance_order(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<Order, ClientError> {
        let body = AdvanceOrderRequest { status };
        let order_id = order_id.to_string();
        self.send(self.post(&["api", "admin", "orders", &order_id, "status"], &body)?)
            .await
    }

    pub async fn create_notification(
        &self,
        request: &CreateNotification,
    ) -> Result<Notification, ClientError> {
        self.send(self.post(&["api", "admin", "notifications"], request)?)
            .await
    }

    pub async fn delete_notification(&self, notification_id: Uuid) -> Result<(), ClientError> {
        let url = self.url(&["api", "admin", "notifications", &notification_id.to_string()])?;
        self.send_empty(self.http_client.delete(url)).await
    }

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    pub async fn notifications(
        &self,
        user_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<NotificationView>, ClientError> {
        let builder = self.get(&["api", "notifications", user_id])?;
        self.send(with_limit(builder, limit)).await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<UnreadCount, ClientError> {
        self.send(self.get(&["api", "notifications", user_id, "unread-count"])?)
            .await
    }

    pub async fn mark_notification_read(
        &self,
        user_id: &str,
        notification_id: Uuid,
    ) -> Result<ReadReceipt, ClientError> {
        let url = self.url(&[
            "api",
            "notifications",
            user_id,
            &notification_id.to_string(),
            "read",
        ])?;
        self.send(self.prepare(self.http_client.post(url))).await
    }

    /// Live `created`/`deleted` events for the user. The stream ends when
    /// the connection drops; callers re-list and reconnect.
    pub async fn notification_stream(
        &self,
        user_id: &str,
    ) -> Result<BoxStream<'static, Result<NotificationEvent, ClientError>>, ClientError> {
        let url = self.url(&["api", "notifications", user_id, "stream"])?;
        let response = self
            .prepare(self.http_client.get(url))
            .timeout(Duration::from_secs(24 * 60 * 60))
            .send()
            .await?;
        let response = check(response).await?;
        let mut chunks = response.bytes_stream();

        let events = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ClientError::Http(e));
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(block) = take_sse_block(&mut buffer) {
                    if let Some(data) = sse_data(&block) {
                        yield serde_json::from_str::<NotificationEvent>(&data)
                            .map_err(|e| ClientError::Parse(e.to_string()));
                    }
                }
            }
        };

        Ok(events.boxed())
    }

    // ========================================================================
    // ASSISTANT
    // ========================================================================

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        self.send(self.post(&["api", "chat"], request)?).await
    }

    // ========================================================================
    // PLUMBING
    // ========================================================================

    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("base url cannot carry a path: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn prepare(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.locale {
            Some(locale) => builder.header(reqwest::header::ACCEPT_LANGUAGE, locale),
            None => builder,
        }
    }

    fn get(&self, segments: &[&str]) -> Result<RequestBuilder, ClientError> {
        Ok(self.prepare(self.http_client.get(self.url(segments)?)))
    }

    fn post<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<RequestBuilder, ClientError> {
        Ok(self.prepare(self.http_client.post(self.url(segments)?).json(body)))
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let response = builder.send().await?;
        decode(check(response).await?).await
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), ClientError> {
        let response = self.prepare(builder).send().await?;
        check(response).await?;
        Ok(())
    }
}

fn with_limit(builder: RequestBuilder, limit: Option<i64>) -> RequestBuilder {
    match limit {
        Some(limit) => builder.query(&[("limit", limit)]),
        None => builder,
    }
}

/// Turn a non-2xx response into [`ClientError::Api`]
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(body) => (body.error, body.message),
        Err(_) => ("http_error".to_string(), text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Parse(e.to_string()))
}

/// Remove and return the next complete event block (terminated by a blank line)
fn take_sse_block(buffer: &mut Vec<u8>) -> Option<String> {
    let normalized_end = buffer
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| (i, 2))
        .or_else(|| buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4)))?;

    let (end, separator) = normalized_end;
    let block: Vec<u8> = buffer.drain(..end + separator).take(end).collect();
    Some(String::from_utf8_lossy(&block).into_owned())
}

/// Joined `data:` lines of an event block; comments and keep-alives yield `None`
fn sse_data(block: &str) -> Option<String> {
    let lines: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_segments_are_escaped() {
        let client = StorefrontClient::new("http://localhost:8095/").unwrap();
        let url = client.url(&["api", "wallets", "user 1/x"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8095/api/wallets/user%201%2Fx");
    }

    #[test]
    fn test_sse_blocks_split_on_blank_line() {
        let mut buffer = b"event: created\ndata: {\"a\":1}\n\n: keep-alive\n\nevent: del".to_vec();

        let first = take_sse_block(&mut buffer).unwrap();
        assert_eq!(sse_data(&first).as_deref(), Some("{\"a\":1}"));

        let second = take_sse_block(&mut buffer).unwrap();
        assert_eq!(sse_data(&second), None);

        assert!(take_sse_block(&mut buffer).is_none());
        assert_eq!(buffer, b"event: del".to_vec());
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            StorefrontClient::new("not a url"),
            Err(ClientError::Config(_))
        ));
    }
}
