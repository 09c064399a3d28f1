use std::{fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::{
    config::{Config, GatewayConfig},
    coupon::{self, Rejection, discounted_amount},
    error::{Error, Result},
    progress::{self, LearnerProgress},
    utils::now,
};

type HmacSha256 = Hmac<Sha256>;

/// Order as acknowledged by the gateway. `amount` is in the smallest currency unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: u64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Open an order for `amount_minor` (paise for INR).
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder>;

    /// Public key handed to the checkout widget.
    fn key_id(&self) -> &str;
}

pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayGateway {
    pub fn new(config: &GatewayConfig, key_secret: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: key_secret.to_string(),
        })
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder> {
        let url = format!("{}/v1/orders", self.base_url);
        debug!("creating gateway order of {} {}", amount_minor, currency);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&serde_json::json!({
                "amount": amount_minor,
                "currency": currency,
                "receipt": receipt,
            }))
            .send()
            .await
            .map_err(|e| Error::dependency(format!("payment gateway unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("payment gateway answered {}: {}", status, body);
            return Err(Error::Dependency {
                message: format!("payment gateway rejected the order ({status})"),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }
        response
            .json::<GatewayOrder>()
            .await
            .map_err(|e| Error::dependency(format!("unexpected payment gateway response: {e}")))
    }

    fn key_id(&self) -> &str {
        &self.key_id
    }
}

/// Hex HMAC-SHA256 of `"{order_id}|{payment_id}"`, the checkout confirmation signature.
pub fn sign(order_id: &str, payment_id: &str, secret: &str) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Fatal(anyhow::anyhow!("invalid gateway secret: {e}")))?;
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a checkout signature.
pub fn verify_signature(order_id: &str, payment_id: &str, signature: &str, secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{order_id}|{payment_id}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Paid,
    /// Paid at the gateway but the coupon ran out before confirmation; needs an operator.
    CouponConflict,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrderStatus::Created => "created",
            OrderStatus::Paid => "paid",
            OrderStatus::CouponConflict => "coupon_conflict",
        })
    }
}

impl FromStr for OrderStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(OrderStatus::Created),
            "paid" => Ok(OrderStatus::Paid),
            "coupon_conflict" => Ok(OrderStatus::CouponConflict),
            other => Err(Error::Fatal(anyhow::anyhow!("unknown order status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    pub order_id: String,
    pub user_id: String,
    /// Charged amount in whole currency units.
    pub amount: u64,
    pub original_amount: u64,
    pub currency: String,
    pub status: OrderStatus,
    pub coupon_id: Option<String>,
    pub coupon_code: Option<String>,
    pub discount_percentage: u8,
    pub full_name: Option<String>,
    pub payment_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    user_id: String,
    amount: i64,
    original_amount: i64,
    currency: String,
    status: String,
    coupon_id: Option<String>,
    coupon_code: Option<String>,
    discount_percentage: i64,
    full_name: Option<String>,
    payment_id: Option<String>,
    created_at: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
}

impl TryFrom<OrderRow> for PaymentOrder {
    type Error = Error;
    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(PaymentOrder {
            order_id: row.id,
            user_id: row.user_id,
            amount: row.amount as u64,
            original_amount: row.original_amount as u64,
            currency: row.currency,
            status: row.status.parse()?,
            coupon_id: row.coupon_id,
            coupon_code: row.coupon_code,
            discount_percentage: row.discount_percentage.clamp(0, 100) as u8,
            full_name: row.full_name,
            payment_id: row.payment_id,
            created_at: row.created_at,
            paid_at: row.paid_at,
        })
    }
}

pub async fn find_order(database: &SqlitePool, order_id: &str) -> Result<Option<PaymentOrder>> {
    let row = sqlx::query_as::<_, OrderRow>(
        "SELECT id, user_id, amount, original_amount, currency, status, coupon_id, coupon_code, \
         discount_percentage, full_name, payment_id, created_at, paid_at FROM payment_order WHERE id = ?",
    )
    .bind(order_id)
    .fetch_optional(database)
    .await?;
    row.map(PaymentOrder::try_from).transpose()
}

/// What the checkout widget needs to collect the payment.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub order_id: String,
    /// Smallest currency unit, as sent to the gateway.
    pub amount: u64,
    pub currency: String,
    pub key_id: String,
    pub original_amount: u64,
    pub discount_percentage: u8,
}

/// Open a gateway order for the course price, discounted by an optional partial coupon.
/// The coupon is only counted when the payment is confirmed.
pub async fn create_order(
    database: &SqlitePool,
    config: &Config,
    gateway: &dyn PaymentGateway,
    user_id: &str,
    coupon_code: Option<&str>,
    full_name: &str,
) -> Result<Checkout> {
    let full_name = full_name.trim();
    if full_name.is_empty() {
        return Err(Error::validation("full name is required"));
    }
    coupon::payable_progress(database, config, user_id).await?;

    let coupon = match coupon_code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => {
            let coupon = coupon::find_by_code(database, code)
                .await?
                .ok_or_else(|| Rejection::Unknown.into_error())?;
            coupon.check(now()).map_err(Rejection::into_error)?;
            if coupon.is_full_discount() {
                return Err(Error::validation(
                    "Coupon covers the full price; redeem it instead of paying",
                ));
            }
            Some(coupon)
        }
        None => None,
    };
    let original_amount = config.course_price;
    let discount_percentage = coupon.as_ref().map_or(0, |c| c.discount_percentage);
    let amount = discounted_amount(original_amount, discount_percentage);

    let receipt = format!("rcpt_{}", uuid::Uuid::new_v4().simple());
    let order = gateway
        .create_order(amount * 100, &config.currency, &receipt)
        .await?;
    sqlx::query(
        "INSERT INTO payment_order (id, user_id, amount, original_amount, currency, status, coupon_id, \
         coupon_code, discount_percentage, full_name, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&order.id)
    .bind(user_id)
    .bind(amount as i64)
    .bind(original_amount as i64)
    .bind(&config.currency)
    .bind(OrderStatus::Created.to_string())
    .bind(coupon.as_ref().map(|c| c.id.as_str()))
    .bind(coupon.as_ref().map(|c| c.code.as_str()))
    .bind(i64::from(discount_percentage))
    .bind(full_name)
    .bind(now())
    .execute(database)
    .await?;
    info!(
        "order {} for {}: {} {} ({}% off)",
        order.id, user_id, amount, config.currency, discount_percentage
    );
    Ok(Checkout {
        order_id: order.id,
        amount: order.amount,
        currency: order.currency,
        key_id: gateway.key_id().to_string(),
        original_amount,
        discount_percentage,
    })
}

/// Settle an order after the checkout widget reports success.
///
/// The signature must match the shared secret. The order moves to `paid`, the coupon (if
/// any) is counted and payment is marked completed in one transaction. Confirming the same
/// payment again is a no-op.
pub async fn confirm_payment(
    database: &SqlitePool,
    config: &Config,
    gateway_secret: &str,
    user_id: &str,
    order_id: &str,
    payment_id: &str,
    signature: &str,
) -> Result<LearnerProgress> {
    if order_id.trim().is_empty() || payment_id.trim().is_empty() || signature.trim().is_empty() {
        return Err(Error::validation(
            "order id, payment id and signature are required",
        ));
    }
    if !verify_signature(order_id, payment_id, signature, gateway_secret) {
        warn!("signature mismatch for order {} from {}", order_id, user_id);
        return Err(Error::unauthorized("payment signature verification failed"));
    }
    let order = find_order(database, order_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("order {order_id} not found")))?;
    if order.user_id != user_id {
        warn!("{} tried to confirm order {} of {}", user_id, order_id, order.user_id);
        return Err(Error::unauthorized("order belongs to another user"));
    }
    match order.status {
        OrderStatus::Paid if order.payment_id.as_deref() == Some(payment_id) => {
            debug!("order {} already settled", order_id);
            return progress::load(database, user_id, config.chapter_count).await;
        }
        OrderStatus::Paid => return Err(Error::conflict("order was paid with another payment")),
        OrderStatus::CouponConflict => {
            return Err(Error::conflict(
                "order could not be settled because its coupon ran out",
            ));
        }
        OrderStatus::Created => {}
    }
    let coupon = match &order.coupon_id {
        Some(id) => coupon::find_by_id(database, id).await?,
        None => None,
    };

    let mut tx = database.begin().await?;
    let settled = sqlx::query(
        "UPDATE payment_order SET status = 'paid', payment_id = ?, paid_at = ? \
         WHERE id = ? AND status = 'created'",
    )
    .bind(payment_id)
    .bind(now())
    .bind(order_id)
    .execute(&mut *tx)
    .await?;
    if settled.rows_affected() == 0 {
        // a concurrent confirmation got there first
        drop(tx);
        return match find_order(database, order_id).await? {
            Some(o) if o.status == OrderStatus::Paid && o.payment_id.as_deref() == Some(payment_id) => {
                progress::load(database, user_id, config.chapter_count).await
            }
            _ => Err(Error::conflict("order is no longer awaiting payment")),
        };
    }
    if let Some(coupon) = &coupon {
        if let Err(e) = coupon::consume_use(&mut tx, coupon, user_id).await {
            tx.rollback().await?;
            if matches!(e, Error::Conflict(_)) {
                sqlx::query("UPDATE payment_order SET status = 'coupon_conflict', payment_id = ? WHERE id = ?")
                    .bind(payment_id)
                    .bind(order_id)
                    .execute(database)
                    .await?;
                error!(
                    reconcile = true,
                    "payment {} for order {} captured but coupon {} is exhausted",
                    payment_id, order_id, coupon.code
                );
            }
            return Err(e);
        }
    }
    progress::mark_payment_completed(
        &mut tx,
        user_id,
        "razorpay",
        order.coupon_code.as_deref(),
        order.full_name.as_deref(),
    )
    .await?;
    tx.commit().await?;
    info!("{} paid order {} with {}", user_id, order_id, payment_id);
    progress::load(database, user_id, config.chapter_count).await
}
