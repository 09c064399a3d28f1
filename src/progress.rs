use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize, ser::SerializeStruct};
use sqlx::{SqliteConnection, SqlitePool};
use time::OffsetDateTime;

use crate::{
    chapter::ChapterId,
    error::{Error, Result},
    utils::now,
};

/// Sequential chapter unlocking as a single frontier.
///
/// Chapters `1..=frontier` are completed and chapter `frontier + 1` (if it exists) is the
/// only unlocked-but-incomplete one, so "k+1 unlocked iff k completed" holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progression {
    frontier: u32,
    chapter_count: u32,
}

impl Progression {
    pub fn new(frontier: u32, chapter_count: u32) -> Self {
        Self {
            frontier: frontier.min(chapter_count),
            chapter_count,
        }
    }

    pub fn frontier(&self) -> u32 {
        self.frontier
    }

    pub fn chapter_count(&self) -> u32 {
        self.chapter_count
    }

    pub fn exists(&self, chapter: ChapterId) -> bool {
        chapter.number() <= self.chapter_count
    }

    pub fn is_completed(&self, chapter: ChapterId) -> bool {
        chapter.number() <= self.frontier
    }

    pub fn is_unlocked(&self, chapter: ChapterId) -> bool {
        chapter.number() <= (self.frontier + 1).min(self.chapter_count)
    }

    pub fn completed(&self) -> BTreeSet<ChapterId> {
        (1..=self.frontier).filter_map(ChapterId::new).collect()
    }

    pub fn unlocked(&self) -> BTreeSet<ChapterId> {
        (1..=(self.frontier + 1).min(self.chapter_count))
            .filter_map(ChapterId::new)
            .collect()
    }

    pub fn final_test_unlocked(&self) -> bool {
        self.frontier >= self.chapter_count
    }

    /// Mark `chapter` as passed. Returns whether the frontier moved.
    pub fn complete(&mut self, chapter: ChapterId) -> Result<bool> {
        if !self.exists(chapter) {
            return Err(Error::not_found(format!("chapter {chapter} does not exist")));
        }
        if !self.is_unlocked(chapter) {
            return Err(Error::forbidden(format!("chapter {chapter} is locked")));
        }
        if chapter.number() == self.frontier + 1 {
            self.frontier += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl Serialize for Progression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Progression", 3)?;
        s.serialize_field("completedChapters", &self.completed())?;
        s.serialize_field("unlockedChapters", &self.unlocked())?;
        s.serialize_field("finalTestUnlocked", &self.final_test_unlocked())?;
        s.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizScore {
    pub score: u32,
    pub total: u32,
}

/// A learner's whole progression record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerProgress {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    #[serde(flatten)]
    pub progression: Progression,
    pub chapter_quiz_scores: BTreeMap<ChapterId, QuizScore>,
    pub final_test_completed: bool,
    pub final_test_score: Option<u32>,
    pub final_test_total: Option<u32>,
    pub payment_completed: bool,
    pub payment_method: Option<String>,
    pub certificate_unlocked: bool,
    pub coupon_code: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl LearnerProgress {
    pub fn final_test_unlocked(&self) -> bool {
        self.progression.final_test_unlocked()
    }

    /// Latest final-test result, when one exists.
    pub fn final_test_result(&self) -> Option<QuizScore> {
        match (self.final_test_completed, self.final_test_score, self.final_test_total) {
            (true, Some(score), Some(total)) => Some(QuizScore { score, total }),
            _ => None,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    user_id: String,
    email: Option<String>,
    name: Option<String>,
    frontier: i64,
    final_test_completed: bool,
    final_test_score: Option<i64>,
    final_test_total: Option<i64>,
    payment_completed: bool,
    payment_method: Option<String>,
    certificate_unlocked: bool,
    coupon_code: Option<String>,
    last_updated: OffsetDateTime,
}

pub async fn find(
    database: &SqlitePool,
    user_id: &str,
    chapter_count: u32,
) -> Result<Option<LearnerProgress>> {
    let Some(row) = sqlx::query_as::<_, ProgressRow>(
        "SELECT user_id, email, name, frontier, final_test_completed, final_test_score, final_test_total, \
         payment_completed, payment_method, certificate_unlocked, coupon_code, last_updated \
         FROM learner_progress WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(database)
    .await?
    else {
        return Ok(None);
    };
    let scores: Vec<(i64, i64, i64)> = sqlx::query_as(
        "SELECT chapter, score, total FROM chapter_quiz_score WHERE user_id = ? ORDER BY chapter",
    )
    .bind(user_id)
    .fetch_all(database)
    .await?;
    let chapter_quiz_scores = scores
        .into_iter()
        .filter_map(|(chapter, score, total)| {
            let chapter = ChapterId::new(chapter as u32)?;
            Some((
                chapter,
                QuizScore {
                    score: score as u32,
                    total: total as u32,
                },
            ))
        })
        .collect();
    Ok(Some(LearnerProgress {
        user_id: row.user_id,
        email: row.email,
        name: row.name,
        progression: Progression::new(row.frontier as u32, chapter_count),
        chapter_quiz_scores,
        final_test_completed: row.final_test_completed,
        final_test_score: row.final_test_score.map(|s| s as u32),
        final_test_total: row.final_test_total.map(|t| t as u32),
        payment_completed: row.payment_completed,
        payment_method: row.payment_method,
        certificate_unlocked: row.certificate_unlocked,
        coupon_code: row.coupon_code,
        last_updated: row.last_updated,
    }))
}

pub async fn load(
    database: &SqlitePool,
    user_id: &str,
    chapter_count: u32,
) -> Result<LearnerProgress> {
    find(database, user_id, chapter_count)
        .await?
        .ok_or_else(|| Error::not_found(format!("progress for user {user_id} not found")))
}

/// Fetch progress, creating it with only chapter 1 unlocked on first access.
/// Email and name are recorded when supplied and not already known.
pub async fn get_or_create(
    database: &SqlitePool,
    user_id: &str,
    email: Option<&str>,
    name: Option<&str>,
    chapter_count: u32,
) -> Result<LearnerProgress> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("user id is required"));
    }
    let now = now();
    sqlx::query(
        "INSERT INTO learner_progress (user_id, email, name, last_updated) VALUES (?, ?, ?, ?) \
         ON CONFLICT (user_id) DO UPDATE SET \
         email = COALESCE(learner_progress.email, excluded.email), \
         name = COALESCE(learner_progress.name, excluded.name)",
    )
    .bind(user_id)
    .bind(email)
    .bind(name)
    .bind(now)
    .execute(database)
    .await?;
    load(database, user_id, chapter_count).await
}

/// Store a chapter score and, when passed, advance the frontier past `chapter`.
/// Returns whether a new chapter was unlocked.
pub async fn record_chapter_result(
    database: &SqlitePool,
    user_id: &str,
    chapter: ChapterId,
    result: QuizScore,
    passed: bool,
) -> Result<bool> {
    let now = now();
    let number = chapter.number() as i64;
    let mut tx = database.begin().await?;
    // frontier >= number - 1 keeps locked chapters from being scored at all
    let scored = sqlx::query(
        "INSERT INTO chapter_quiz_score (user_id, chapter, score, total, updated_at) \
         SELECT ?1, ?2, ?3, ?4, ?5 FROM learner_progress WHERE user_id = ?1 AND frontier >= ?2 - 1 \
         ON CONFLICT (user_id, chapter) DO UPDATE SET score = excluded.score, total = excluded.total, \
         updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(number)
    .bind(result.score as i64)
    .bind(result.total as i64)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    if scored.rows_affected() == 0 {
        return Err(Error::forbidden(format!("chapter {chapter} is locked")));
    }
    let advanced = if passed {
        sqlx::query(
            "UPDATE learner_progress SET frontier = ?2, last_updated = ?3 \
             WHERE user_id = ?1 AND frontier = ?2 - 1",
        )
        .bind(user_id)
        .bind(number)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0
    } else {
        false
    };
    if !advanced {
        sqlx::query("UPDATE learner_progress SET last_updated = ? WHERE user_id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(advanced)
}

/// Store the latest final-test result. Only accepted once payment is completed;
/// `certificate_unlocked` can be set here but never cleared.
pub async fn record_final_test(
    database: &SqlitePool,
    user_id: &str,
    result: QuizScore,
    passed: bool,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE learner_progress SET final_test_completed = 1, final_test_score = ?, final_test_total = ?, \
         certificate_unlocked = (certificate_unlocked OR ?), last_updated = ? \
         WHERE user_id = ? AND payment_completed = 1",
    )
    .bind(result.score as i64)
    .bind(result.total as i64)
    .bind(passed)
    .bind(now())
    .bind(user_id)
    .execute(database)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(Error::forbidden(
            "payment must be completed before taking the final test",
        ));
    }
    Ok(())
}

/// The single writer of `payment_completed`. Only the payment resolver calls this,
/// inside the transaction that also settles the order or coupon.
/// A learner can be settled once; a second settlement is a `Conflict`.
pub(crate) async fn mark_payment_completed(
    conn: &mut SqliteConnection,
    user_id: &str,
    method: &str,
    coupon_code: Option<&str>,
    name: Option<&str>,
) -> Result<()> {
    let updated = sqlx::query(
        "UPDATE learner_progress SET payment_completed = 1, payment_method = ?, \
         coupon_code = COALESCE(?, coupon_code), name = COALESCE(?, name), last_updated = ? \
         WHERE user_id = ? AND payment_completed = 0",
    )
    .bind(method)
    .bind(coupon_code)
    .bind(name)
    .bind(now())
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() == 0 {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM learner_progress WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await?;
        return Err(match exists {
            Some(_) => Error::conflict("payment has already been completed"),
            None => Error::not_found(format!("progress for user {user_id} not found")),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_database;

    fn ch(n: u32) -> ChapterId {
        ChapterId::new(n).unwrap()
    }

    #[test]
    fn progression_sets() {
        let mut p = Progression::new(0, 3);
        assert!(p.completed().is_empty());
        assert_eq!(p.unlocked(), BTreeSet::from([ch(1)]));
        assert!(p.complete(ch(2)).is_err());
        assert!(p.complete(ch(1)).unwrap());
        assert!(!p.complete(ch(1)).unwrap());
        assert!(p.complete(ch(2)).unwrap());
        assert!(p.completed().is_subset(&p.unlocked()));
        assert!(!p.final_test_unlocked());
        assert!(p.complete(ch(3)).unwrap());
        assert_eq!(p.unlocked().len(), 3);
        assert!(p.final_test_unlocked());
        assert!(matches!(p.complete(ch(4)), Err(Error::NotFound(_))));
    }

    #[test]
    fn progress_json_shape() {
        let progress = LearnerProgress {
            user_id: "u1".into(),
            email: None,
            name: None,
            progression: Progression::new(1, 70),
            chapter_quiz_scores: BTreeMap::from([(ch(1), QuizScore { score: 7, total: 10 })]),
            final_test_completed: false,
            final_test_score: None,
            final_test_total: None,
            payment_completed: false,
            payment_method: None,
            certificate_unlocked: false,
            coupon_code: None,
            last_updated: now(),
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["completedChapters"], serde_json::json!(["CH-001"]));
        assert_eq!(json["unlockedChapters"], serde_json::json!(["CH-001", "CH-002"]));
        assert_eq!(json["finalTestUnlocked"], false);
        assert_eq!(json["chapterQuizScores"]["CH-001"]["score"], 7);
    }

    #[tokio::test]
    async fn bootstrap_fills_missing_identity_only() {
        let (_dir, db) = test_database().await;
        let p = get_or_create(&db, "u1", None, Some("Asha"), 70).await.unwrap();
        assert_eq!(p.progression.unlocked(), BTreeSet::from([ch(1)]));
        assert_eq!(p.email, None);
        let p = get_or_create(&db, "u1", Some("a@x.org"), Some("Other"), 70)
            .await
            .unwrap();
        assert_eq!(p.email.as_deref(), Some("a@x.org"));
        assert_eq!(p.name.as_deref(), Some("Asha"));
    }

    #[tokio::test]
    async fn chapter_results_are_monotonic() {
        let (_dir, db) = test_database().await;
        get_or_create(&db, "u1", None, None, 3).await.unwrap();
        let pass = QuizScore { score: 8, total: 10 };
        let fail = QuizScore { score: 1, total: 10 };

        let locked = record_chapter_result(&db, "u1", ch(2), pass, true).await;
        assert!(matches!(locked, Err(Error::Forbidden(_))));

        assert!(record_chapter_result(&db, "u1", ch(1), pass, true).await.unwrap());
        // failing retake keeps the unlock and overwrites the score
        assert!(!record_chapter_result(&db, "u1", ch(1), fail, false).await.unwrap());
        let p = load(&db, "u1", 3).await.unwrap();
        assert_eq!(p.progression.frontier(), 1);
        assert_eq!(p.chapter_quiz_scores[&ch(1)], fail);

        assert!(record_chapter_result(&db, "u1", ch(2), pass, true).await.unwrap());
        assert!(record_chapter_result(&db, "u1", ch(3), pass, true).await.unwrap());
        let p = load(&db, "u1", 3).await.unwrap();
        assert!(p.final_test_unlocked());
    }

    #[tokio::test]
    async fn final_test_requires_payment() {
        let (_dir, db) = test_database().await;
        get_or_create(&db, "u1", None, None, 1).await.unwrap();
        let result = QuizScore { score: 20, total: 30 };
        let err = record_final_test(&db, "u1", result, true).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let mut conn = db.acquire().await.unwrap();
        mark_payment_completed(&mut conn, "u1", "coupon", Some("CSG-1"), None)
            .await
            .unwrap();
        let again = mark_payment_completed(&mut conn, "u1", "coupon", None, None).await;
        assert!(matches!(again, Err(Error::Conflict(_))));
        drop(conn);
        record_final_test(&db, "u1", result, true).await.unwrap();
        // a failed retake overwrites the score but keeps the certificate unlocked
        let retake = QuizScore { score: 2, total: 30 };
        record_final_test(&db, "u1", retake, false).await.unwrap();
        let p = load(&db, "u1", 1).await.unwrap();
        assert!(p.certificate_unlocked);
        assert_eq!(p.final_test_result(), Some(retake));
        assert_eq!(p.coupon_code.as_deref(), Some("CSG-1"));
    }
}
