use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{
    config::Config,
    db::is_unique_violation,
    error::{Error, Result},
    progress::{self, LearnerProgress},
    utils::now,
};

/// Characters used in generated codes; 0/O and 1/I are left out.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 8;
const MAX_CODE_ATTEMPTS: usize = 10;
const MAX_BATCH: u32 = 1000;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub id: String,
    pub code: String,
    pub discount_percentage: u8,
    /// 0 means unlimited.
    pub max_uses: u32,
    pub used_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
}

/// Why a coupon cannot be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unknown,
    Expired,
    Exhausted,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Rejection::Unknown => "Invalid coupon code",
            Rejection::Expired => "Coupon has expired",
            Rejection::Exhausted => "Coupon has reached its usage limit",
        }
    }

    /// Running out of uses is a lost race with other redemptions, the rest are bad input.
    pub fn into_error(self) -> Error {
        match self {
            Rejection::Exhausted => Error::conflict(self.message()),
            _ => Error::validation(self.message()),
        }
    }
}

impl Coupon {
    pub fn is_exhausted(&self) -> bool {
        self.max_uses != 0 && self.used_count >= self.max_uses
    }

    pub fn is_expired(&self, at: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires| expires < at)
    }

    pub fn check(&self, at: OffsetDateTime) -> std::result::Result<(), Rejection> {
        if self.is_expired(at) {
            Err(Rejection::Expired)
        } else if self.is_exhausted() {
            Err(Rejection::Exhausted)
        } else {
            Ok(())
        }
    }

    pub fn is_full_discount(&self) -> bool {
        self.discount_percentage == 100
    }
}

/// Price after applying `discount_percentage`, never below 1 currency unit.
pub fn discounted_amount(base: u64, discount_percentage: u8) -> u64 {
    let pct = u64::from(discount_percentage.min(100));
    ((base * (100 - pct) + 50) / 100).max(1)
}

#[derive(sqlx::FromRow)]
struct CouponRow {
    id: String,
    code: String,
    discount_percentage: i64,
    max_uses: i64,
    used_count: i64,
    expires_at: Option<OffsetDateTime>,
    created_by: String,
    created_at: OffsetDateTime,
    last_used_at: Option<OffsetDateTime>,
}

impl From<CouponRow> for Coupon {
    fn from(row: CouponRow) -> Self {
        Coupon {
            id: row.id,
            code: row.code,
            discount_percentage: row.discount_percentage.clamp(0, 100) as u8,
            max_uses: row.max_uses as u32,
            used_count: row.used_count as u32,
            expires_at: row.expires_at,
            created_by: row.created_by,
            created_at: row.created_at,
            last_used_at: row.last_used_at,
        }
    }
}

const COUPON_COLUMNS: &str = "id, code, discount_percentage, max_uses, used_count, expires_at, \
                              created_by, created_at, last_used_at";

/// Case-insensitive lookup.
pub async fn find_by_code(database: &SqlitePool, code: &str) -> Result<Option<Coupon>> {
    let row = sqlx::query_as::<_, CouponRow>(&format!(
        "SELECT {COUPON_COLUMNS} FROM coupon WHERE code = ?"
    ))
    .bind(code.trim())
    .fetch_optional(database)
    .await?;
    Ok(row.map(Coupon::from))
}

pub async fn find_by_id(database: &SqlitePool, id: &str) -> Result<Option<Coupon>> {
    let row = sqlx::query_as::<_, CouponRow>(&format!(
        "SELECT {COUPON_COLUMNS} FROM coupon WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(database)
    .await?;
    Ok(row.map(Coupon::from))
}

pub async fn list_coupons(database: &SqlitePool) -> Result<Vec<Coupon>> {
    let rows = sqlx::query_as::<_, CouponRow>(&format!(
        "SELECT {COUPON_COLUMNS} FROM coupon ORDER BY created_at DESC, code"
    ))
    .fetch_all(database)
    .await?;
    Ok(rows.into_iter().map(Coupon::from).collect())
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NewCoupon {
    pub code: String,
    pub discount_percentage: u8,
    #[serde(default)]
    pub max_uses: u32,
    pub expires_in_days: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub count: u32,
    pub prefix: Option<String>,
    pub discount_percentage: Option<u8>,
    pub max_uses: Option<u32>,
    pub expires_in_days: Option<u32>,
}

async fn insert(
    database: &SqlitePool,
    code: &str,
    discount_percentage: u8,
    max_uses: u32,
    expires_in_days: Option<u32>,
    created_by: &str,
) -> std::result::Result<Coupon, sqlx::Error> {
    let created_at = now();
    let coupon = Coupon {
        id: uuid::Uuid::new_v4().to_string(),
        code: code.to_string(),
        discount_percentage,
        max_uses,
        used_count: 0,
        expires_at: expires_in_days.map(|days| created_at + Duration::days(i64::from(days))),
        created_by: created_by.to_string(),
        created_at,
        last_used_at: None,
    };
    sqlx::query(
        "INSERT INTO coupon (id, code, discount_percentage, max_uses, used_count, expires_at, created_by, created_at) \
         VALUES (?, ?, ?, ?, 0, ?, ?, ?)",
    )
    .bind(&coupon.id)
    .bind(&coupon.code)
    .bind(i64::from(coupon.discount_percentage))
    .bind(i64::from(coupon.max_uses))
    .bind(coupon.expires_at)
    .bind(&coupon.created_by)
    .bind(coupon.created_at)
    .execute(database)
    .await?;
    Ok(coupon)
}

pub async fn create_coupon(
    database: &SqlitePool,
    new: &NewCoupon,
    created_by: &str,
) -> Result<Coupon> {
    let code = new.code.trim().to_uppercase();
    if code.is_empty() || code.chars().any(char::is_whitespace) {
        return Err(Error::validation("coupon code must be a single non-empty word"));
    }
    if !(1..=100).contains(&new.discount_percentage) {
        return Err(Error::validation("discount percentage must be between 1 and 100"));
    }
    match insert(
        database,
        &code,
        new.discount_percentage,
        new.max_uses,
        new.expires_in_days,
        created_by,
    )
    .await
    {
        Ok(coupon) => {
            info!("{} created coupon {}", created_by, coupon.code);
            Ok(coupon)
        }
        Err(e) if is_unique_violation(&e) => {
            Err(Error::conflict(format!("coupon code {code} already exists")))
        }
        Err(e) => Err(e.into()),
    }
}

/// `PREFIX-XXXXXXXX` with characters drawn from [`CODE_ALPHABET`].
pub fn generate_code(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}-{suffix}")
}

pub async fn generate_batch(
    database: &SqlitePool,
    request: &BatchRequest,
    created_by: &str,
) -> Result<Vec<Coupon>> {
    if !(1..=MAX_BATCH).contains(&request.count) {
        return Err(Error::validation(format!(
            "count must be between 1 and {MAX_BATCH}"
        )));
    }
    let prefix = request
        .prefix
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or("CSG")
        .to_uppercase();
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::validation("prefix must be alphanumeric"));
    }
    let discount = request.discount_percentage.unwrap_or(100);
    if !(1..=100).contains(&discount) {
        return Err(Error::validation("discount percentage must be between 1 and 100"));
    }
    let max_uses = request.max_uses.unwrap_or(1);

    let mut coupons = Vec::with_capacity(request.count as usize);
    for _ in 0..request.count {
        let mut created = None;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(&prefix);
            match insert(
                database,
                &code,
                discount,
                max_uses,
                request.expires_in_days,
                created_by,
            )
            .await
            {
                Ok(coupon) => {
                    created = Some(coupon);
                    break;
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let Some(coupon) = created else {
            warn!(
                "gave up on a unique {} code after {} attempts",
                prefix, MAX_CODE_ATTEMPTS
            );
            return Err(Error::conflict("could not generate a unique coupon code"));
        };
        coupons.push(coupon);
    }
    info!(
        "{} generated {} coupons with prefix {}",
        created_by,
        coupons.len(),
        prefix
    );
    Ok(coupons)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponUsage {
    pub id: i64,
    pub coupon_id: String,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
    pub discount_percentage: u8,
}

pub async fn coupon_usage(database: &SqlitePool, code: &str) -> Result<Vec<CouponUsage>> {
    let coupon = find_by_code(database, code)
        .await?
        .ok_or_else(|| Error::not_found(format!("coupon {code} not found")))?;
    let rows: Vec<(i64, String, String, OffsetDateTime, i64)> = sqlx::query_as(
        "SELECT id, coupon_id, user_id, used_at, discount_percentage FROM coupon_usage \
         WHERE coupon_id = ? ORDER BY used_at, id",
    )
    .bind(&coupon.id)
    .fetch_all(database)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(id, coupon_id, user_id, used_at, discount)| CouponUsage {
                id,
                coupon_id,
                user_id,
                used_at,
                discount_percentage: discount.clamp(0, 100) as u8,
            },
        )
        .collect())
}

/// Count one use of `coupon` by `user_id` and write its usage record.
/// The increment is a single conditional statement so `used_count` never passes `max_uses`.
pub(crate) async fn consume_use(
    conn: &mut SqliteConnection,
    coupon: &Coupon,
    user_id: &str,
) -> Result<()> {
    let used_at = now();
    let updated = sqlx::query(
        "UPDATE coupon SET used_count = used_count + 1, last_used_at = ? \
         WHERE id = ? AND (max_uses = 0 OR used_count < max_uses)",
    )
    .bind(used_at)
    .bind(&coupon.id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(Error::conflict(format!(
            "coupon {} has reached its usage limit",
            coupon.code
        )));
    }
    sqlx::query(
        "INSERT INTO coupon_usage (coupon_id, user_id, used_at, discount_percentage) VALUES (?, ?, ?, ?)",
    )
    .bind(&coupon.id)
    .bind(user_id)
    .bind(used_at)
    .bind(i64::from(coupon.discount_percentage))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Learner state every coupon or payment operation requires.
pub(crate) async fn payable_progress(
    database: &SqlitePool,
    config: &Config,
    user_id: &str,
) -> Result<LearnerProgress> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("user id is required"));
    }
    let progress = progress::load(database, user_id, config.chapter_count).await?;
    if !progress.final_test_unlocked() {
        return Err(Error::forbidden(
            "You need to complete all chapters before paying or using a coupon",
        ));
    }
    if progress.payment_completed {
        return Err(Error::conflict("Payment has already been completed"));
    }
    Ok(progress)
}

/// Result of checking a coupon against the course price. Nothing is consumed.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CouponQuote {
    pub valid: bool,
    pub message: String,
    pub code: Option<String>,
    pub discount_percentage: Option<u8>,
    pub original_amount: u64,
    pub final_amount: u64,
    /// A full discount is settled by redeeming the coupon, without the payment gateway.
    pub full_discount: bool,
}

pub async fn verify_coupon(
    database: &SqlitePool,
    config: &Config,
    user_id: &str,
    code: &str,
) -> Result<CouponQuote> {
    if code.trim().is_empty() {
        return Err(Error::validation("coupon code is required"));
    }
    payable_progress(database, config, user_id).await?;
    let base = config.course_price;
    let rejected = |rejection: Rejection| CouponQuote {
        valid: false,
        message: rejection.message().to_string(),
        code: None,
        discount_percentage: None,
        original_amount: base,
        final_amount: base,
        full_discount: false,
    };
    let Some(coupon) = find_by_code(database, code).await? else {
        return Ok(rejected(Rejection::Unknown));
    };
    if let Err(rejection) = coupon.check(now()) {
        return Ok(rejected(rejection));
    }
    let full_discount = coupon.is_full_discount();
    Ok(CouponQuote {
        valid: true,
        message: if full_discount {
            "Coupon covers the full price".to_string()
        } else {
            format!("{}% discount applied", coupon.discount_percentage)
        },
        final_amount: discounted_amount(base, coupon.discount_percentage),
        code: Some(coupon.code),
        discount_percentage: Some(coupon.discount_percentage),
        original_amount: base,
        full_discount,
    })
}

/// Settle the course price with a 100% coupon: one use is counted, one usage record is
/// written and payment is marked completed, all in one transaction.
pub async fn redeem_full_discount(
    database: &SqlitePool,
    config: &Config,
    user_id: &str,
    code: &str,
    full_name: Option<&str>,
) -> Result<LearnerProgress> {
    if code.trim().is_empty() {
        return Err(Error::validation("coupon code is required"));
    }
    payable_progress(database, config, user_id).await?;
    let coupon = find_by_code(database, code)
        .await?
        .ok_or_else(|| Rejection::Unknown.into_error())?;
    coupon.check(now()).map_err(Rejection::into_error)?;
    if !coupon.is_full_discount() {
        return Err(Error::validation(
            "Coupon does not cover the full price; continue to payment",
        ));
    }
    let full_name = full_name.map(str::trim).filter(|n| !n.is_empty());

    let mut tx = database.begin().await?;
    progress::mark_payment_completed(&mut tx, user_id, "coupon", Some(&coupon.code), full_name)
        .await?;
    consume_use(&mut tx, &coupon, user_id).await?;
    tx.commit().await?;
    info!("{} redeemed coupon {}", user_id, coupon.code);
    progress::load(database, user_id, config.chapter_count).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::tests::test_database,
        gating::tests::{complete_all_chapters, small_course},
    };

    fn new_coupon(code: &str, discount: u8, max_uses: u32) -> NewCoupon {
        NewCoupon {
            code: code.to_string(),
            discount_percentage: discount,
            max_uses,
            expires_in_days: None,
        }
    }

    #[test]
    fn discount_math() {
        assert_eq!(discounted_amount(999, 0), 999);
        assert_eq!(discounted_amount(999, 50), 500);
        assert_eq!(discounted_amount(999, 10), 899);
        assert_eq!(discounted_amount(999, 100), 1);
    }

    #[test]
    fn generated_codes_use_the_alphabet() {
        let code = generate_code("CSG");
        let (prefix, suffix) = code.split_once('-').unwrap();
        assert_eq!(prefix, "CSG");
        assert_eq!(suffix.len(), CODE_LENGTH);
        assert!(suffix.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn admin_creation_and_batches() {
        let (_dir, db) = test_database().await;
        let coupon = create_coupon(&db, &new_coupon("welcome10", 10, 0), "admin")
            .await
            .unwrap();
        assert_eq!(coupon.code, "WELCOME10");
        let dup = create_coupon(&db, &new_coupon("Welcome10", 20, 0), "admin").await;
        assert!(matches!(dup, Err(Error::Conflict(_))));
        let bad = create_coupon(&db, &new_coupon("ZERO", 0, 0), "admin").await;
        assert!(matches!(bad, Err(Error::Validation(_))));

        let batch = BatchRequest {
            count: 5,
            prefix: None,
            discount_percentage: None,
            max_uses: None,
            expires_in_days: Some(30),
        };
        let coupons = generate_batch(&db, &batch, "admin").await.unwrap();
        assert_eq!(coupons.len(), 5);
        assert!(coupons.iter().all(|c| c.code.starts_with("CSG-")
            && c.discount_percentage == 100
            && c.max_uses == 1
            && c.expires_at.is_some()));
        assert_eq!(list_coupons(&db).await.unwrap().len(), 6);
        assert!(find_by_code(&db, "welcome10").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn verification_requires_finished_chapters() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        create_coupon(&db, &new_coupon("HALF", 50, 0), "admin")
            .await
            .unwrap();
        progress::get_or_create(&db, "u1", None, None, config.chapter_count)
            .await
            .unwrap();
        let early = verify_coupon(&db, &config, "u1", "HALF").await;
        assert!(matches!(early, Err(Error::Forbidden(_))));

        complete_all_chapters(&db, &config, "u1").await;
        let quote = verify_coupon(&db, &config, "u1", "half").await.unwrap();
        assert!(quote.valid);
        assert!(!quote.full_discount);
        assert_eq!(quote.final_amount, 500);
        let unknown = verify_coupon(&db, &config, "u1", "NOPE").await.unwrap();
        assert!(!unknown.valid);
        assert_eq!(unknown.message, Rejection::Unknown.message());

        // a partial discount never settles payment
        let partial = redeem_full_discount(&db, &config, "u1", "HALF", None).await;
        assert!(matches!(partial, Err(Error::Validation(_))));
        let progress = progress::load(&db, "u1", config.chapter_count).await.unwrap();
        assert!(!progress.payment_completed);
    }

    #[tokio::test]
    async fn expired_and_exhausted_coupons_are_rejected() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        complete_all_chapters(&db, &config, "u1").await;
        let coupon = create_coupon(&db, &new_coupon("OLD", 100, 1), "admin")
            .await
            .unwrap();
        sqlx::query("UPDATE coupon SET expires_at = ? WHERE id = ?")
            .bind(now() - Duration::days(1))
            .bind(&coupon.id)
            .execute(&db)
            .await
            .unwrap();
        let quote = verify_coupon(&db, &config, "u1", "OLD").await.unwrap();
        assert_eq!(quote.message, Rejection::Expired.message());

        create_coupon(&db, &new_coupon("USED", 100, 1), "admin")
            .await
            .unwrap();
        sqlx::query("UPDATE coupon SET used_count = 1 WHERE code = 'USED'")
            .execute(&db)
            .await
            .unwrap();
        let quote = verify_coupon(&db, &config, "u1", "USED").await.unwrap();
        assert_eq!(quote.message, Rejection::Exhausted.message());
    }

    #[tokio::test]
    async fn single_use_coupon_under_concurrent_redemption() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        create_coupon(&db, &new_coupon("ONCE", 100, 1), "admin")
            .await
            .unwrap();
        let users = ["u1", "u2", "u3", "u4"];
        for user in users {
            complete_all_chapters(&db, &config, user).await;
        }
        let handles: Vec<_> = users
            .iter()
            .map(|user| {
                let db = db.clone();
                let config = config.clone();
                let user = user.to_string();
                tokio::spawn(async move {
                    redeem_full_discount(&db, &config, &user, "ONCE", None).await
                })
            })
            .collect();
        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(progress) => {
                    assert!(progress.payment_completed);
                    succeeded += 1;
                }
                Err(e) => assert!(matches!(e, Error::Conflict(_)), "{e:?}"),
            }
        }
        assert_eq!(succeeded, 1);
        let coupon = find_by_code(&db, "ONCE").await.unwrap().unwrap();
        assert_eq!(coupon.used_count, 1);
        assert_eq!(coupon_usage(&db, "ONCE").await.unwrap().len(), 1);
        let mut paid = 0;
        for user in users {
            if progress::load(&db, user, 3).await.unwrap().payment_completed {
                paid += 1;
            }
        }
        assert_eq!(paid, 1);
    }

    #[tokio::test]
    async fn redeeming_twice_is_a_conflict() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        create_coupon(&db, &new_coupon("MANY", 100, 0), "admin")
            .await
            .unwrap();
        complete_all_chapters(&db, &config, "u1").await;
        let progress = redeem_full_discount(&db, &config, "u1", "many", Some("Asha Rao"))
            .await
            .unwrap();
        assert_eq!(progress.payment_method.as_deref(), Some("coupon"));
        assert_eq!(progress.coupon_code.as_deref(), Some("MANY"));
        assert_eq!(progress.name.as_deref(), Some("Asha Rao"));
        let again = redeem_full_discount(&db, &config, "u1", "MANY", None).await;
        assert!(matches!(again, Err(Error::Conflict(_))));
        assert_eq!(find_by_code(&db, "MANY").await.unwrap().unwrap().used_count, 1);
    }
}
