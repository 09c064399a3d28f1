use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::info;
use utoipa::ToSchema;

use crate::{
    chapter::{ChapterId, QuizRef},
    config::Config,
    error::{Error, Result},
    progress::{self, LearnerProgress, QuizScore},
    quiz::{self, QuizSubmission},
};

/// Share of questions (in percent, rounded up) that must be correct to pass any quiz.
pub const PASS_PERCENT: u32 = 30;

/// Minimum correct answers out of `total` questions.
pub fn passing_threshold(total: u32) -> u32 {
    (total * PASS_PERCENT).div_ceil(100)
}

/// The threshold is taken over at least `expected` questions so that answering
/// only a handful of questions cannot pass a quiz.
pub fn is_passing(score: u32, attempted: u32, expected: u32) -> bool {
    score >= passing_threshold(attempted.max(expected))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterOutcome {
    #[serde(flatten)]
    pub submission: QuizSubmission,
    pub passed: bool,
    pub unlocked_next_chapter: bool,
    pub next_chapter_id: Option<ChapterId>,
    pub progress: LearnerProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalTestOutcome {
    #[serde(flatten)]
    pub submission: QuizSubmission,
    pub passed: bool,
    pub certificate_unlocked: bool,
    pub progress: LearnerProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilityReason {
    FinalTestPassed,
    PaymentCompleted,
    ChaptersIncomplete,
    PaymentRequired,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: EligibilityReason,
    pub message: String,
}

pub async fn submit_chapter_quiz(
    database: &SqlitePool,
    config: &Config,
    user_id: &str,
    chapter: ChapterId,
    answers: &Value,
) -> Result<ChapterOutcome> {
    let progress =
        progress::get_or_create(database, user_id, None, None, config.chapter_count).await?;
    let progression = progress.progression;
    if !progression.exists(chapter) {
        return Err(Error::not_found(format!("chapter {chapter} does not exist")));
    }
    if !progression.is_unlocked(chapter) {
        return Err(Error::forbidden(format!("chapter {chapter} is locked")));
    }

    let submission = quiz::submit(database, user_id, QuizRef::Chapter(chapter), answers).await?;
    let evaluation = &submission.evaluation;
    let passed = is_passing(
        evaluation.score,
        evaluation.total_questions_attempted,
        config.chapter_quiz_questions,
    );
    let result = QuizScore {
        score: evaluation.score,
        total: evaluation.total_questions_attempted,
    };
    let advanced =
        progress::record_chapter_result(database, user_id, chapter, result, passed).await?;
    let next = chapter.next();
    let unlocked_next_chapter = advanced && progression.exists(next);
    if advanced {
        info!("{} completed chapter {}", user_id, chapter);
    }
    let progress = progress::load(database, user_id, config.chapter_count).await?;
    if advanced && progress.final_test_unlocked() {
        info!("{} unlocked the final test", user_id);
    }
    Ok(ChapterOutcome {
        submission,
        passed,
        unlocked_next_chapter,
        next_chapter_id: unlocked_next_chapter.then_some(next),
        progress,
    })
}

pub async fn submit_final_test(
    database: &SqlitePool,
    config: &Config,
    user_id: &str,
    answers: &Value,
) -> Result<FinalTestOutcome> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("user id is required"));
    }
    let progress = progress::load(database, user_id, config.chapter_count).await?;
    if !progress.final_test_unlocked() {
        return Err(Error::forbidden(
            "all chapters must be completed before the final test",
        ));
    }
    if !progress.payment_completed {
        return Err(Error::forbidden(
            "payment must be completed before taking the final test",
        ));
    }

    let submission = quiz::submit(database, user_id, QuizRef::FinalTest, answers).await?;
    let evaluation = &submission.evaluation;
    let passed = is_passing(
        evaluation.score,
        evaluation.total_questions_attempted,
        config.final_test_questions,
    );
    let result = QuizScore {
        score: evaluation.score,
        total: evaluation.total_questions_attempted,
    };
    progress::record_final_test(database, user_id, result, passed).await?;
    info!(
        "{} final test {}/{} passed={}",
        user_id, result.score, result.total, passed
    );
    let progress = progress::load(database, user_id, config.chapter_count).await?;
    Ok(FinalTestOutcome {
        submission,
        passed,
        certificate_unlocked: progress.certificate_unlocked,
        progress,
    })
}

pub fn eligibility(progress: &LearnerProgress) -> Eligibility {
    let (eligible, reason, message) = if progress.certificate_unlocked {
        (
            true,
            EligibilityReason::FinalTestPassed,
            "You have already passed the final test",
        )
    } else if !progress.final_test_unlocked() {
        (
            false,
            EligibilityReason::ChaptersIncomplete,
            "You need to complete all chapters before the final test",
        )
    } else if progress.payment_completed {
        (
            true,
            EligibilityReason::PaymentCompleted,
            "You are eligible to take the final test",
        )
    } else {
        (
            false,
            EligibilityReason::PaymentRequired,
            "You need to apply a valid coupon or complete payment to take the final test",
        )
    };
    Eligibility {
        eligible,
        reason,
        message: message.to_string(),
    }
}

pub async fn check_final_test_eligibility(
    database: &SqlitePool,
    config: &Config,
    user_id: &str,
) -> Result<Eligibility> {
    let progress = progress::load(database, user_id, config.chapter_count).await?;
    Ok(eligibility(&progress))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::db::tests::test_database;

    pub(crate) async fn seed_key(database: &SqlitePool, quiz: QuizRef, questions: u32) {
        let key: BTreeMap<String, String> = (1..=questions)
            .map(|i| (format!("Q{i}"), "A".to_string()))
            .collect();
        quiz::store_answer_key(database, quiz, &key).await.unwrap();
    }

    /// `correct` right answers out of `questions` submitted.
    pub(crate) fn answers(correct: u32, questions: u32) -> Value {
        let map: serde_json::Map<String, Value> = (1..=questions)
            .map(|i| {
                let letter = if i <= correct { "A" } else { "B" };
                (format!("Q{i}"), json!(letter))
            })
            .collect();
        Value::Object(map)
    }

    pub(crate) fn small_course() -> Config {
        Config {
            chapter_count: 3,
            ..Config::default()
        }
    }

    /// Walk `user_id` through every chapter of `config`.
    pub(crate) async fn complete_all_chapters(
        database: &SqlitePool,
        config: &Config,
        user_id: &str,
    ) {
        for n in 1..=config.chapter_count {
            let chapter = ChapterId::new(n).unwrap();
            seed_key(database, QuizRef::Chapter(chapter), 10).await;
            let outcome = submit_chapter_quiz(database, config, user_id, chapter, &answers(10, 10))
                .await
                .unwrap();
            assert!(outcome.passed);
        }
    }

    pub(crate) async fn pay(database: &SqlitePool, user_id: &str) {
        let mut conn = database.acquire().await.unwrap();
        progress::mark_payment_completed(&mut conn, user_id, "test", None, None)
            .await
            .unwrap();
    }

    /// A learner with the certificate unlocked after a final test of `score`/30.
    pub(crate) async fn certified_learner(
        database: &SqlitePool,
        config: &Config,
        user_id: &str,
        score: u32,
    ) {
        progress::get_or_create(
            database,
            user_id,
            Some(&format!("{user_id}@example.org")),
            Some("Asha Rao"),
            config.chapter_count,
        )
        .await
        .unwrap();
        complete_all_chapters(database, config, user_id).await;
        pay(database, user_id).await;
        seed_key(database, QuizRef::FinalTest, 30).await;
        let outcome = submit_final_test(database, config, user_id, &answers(score, 30))
            .await
            .unwrap();
        assert!(outcome.certificate_unlocked);
    }

    #[test]
    fn threshold_is_thirty_percent_rounded_up() {
        assert_eq!(passing_threshold(30), 9);
        assert_eq!(passing_threshold(10), 3);
        assert_eq!(passing_threshold(50), 15);
        assert_eq!(passing_threshold(0), 0);
        assert!(!is_passing(1, 1, 10));
    }

    #[tokio::test]
    async fn sets_never_shrink() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        for n in 1..=3 {
            seed_key(&db, QuizRef::Chapter(ChapterId::new(n).unwrap()), 10).await;
        }
        // (chapter, correct answers)
        let sequence = [(1, 2), (1, 9), (2, 1), (1, 0), (2, 3), (3, 10), (2, 0), (3, 1)];
        let mut previous = progress::get_or_create(&db, "u1", None, None, 3).await.unwrap();
        for (chapter, correct) in sequence {
            let chapter = ChapterId::new(chapter).unwrap();
            let outcome = submit_chapter_quiz(&db, &config, "u1", chapter, &answers(correct, 10))
                .await
                .unwrap();
            let current = outcome.progress;
            assert!(previous.progression.completed().is_subset(&current.progression.completed()));
            assert!(previous.progression.unlocked().is_subset(&current.progression.unlocked()));
            assert!(current.progression.completed().is_subset(&current.progression.unlocked()));
            previous = current;
        }
        assert!(previous.final_test_unlocked());
        assert_eq!(previous.chapter_quiz_scores[&ChapterId::new(3).unwrap()].score, 1);
    }

    #[tokio::test]
    async fn locked_chapter_is_rejected_without_an_attempt() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        let chapter = ChapterId::new(2).unwrap();
        seed_key(&db, QuizRef::Chapter(chapter), 10).await;
        let err = submit_chapter_quiz(&db, &config, "u1", chapter, &answers(10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(quiz::quiz_analytics(&db, "u1").await.unwrap().is_empty());

        let missing = ChapterId::new(4).unwrap();
        let err = submit_chapter_quiz(&db, &config, "u1", missing, &answers(10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn final_test_unlocks_exactly_after_all_seventy_chapters() {
        let (_dir, db) = test_database().await;
        let config = Config::default();
        assert_eq!(config.chapter_count, 70);
        for n in 1..=70 {
            let chapter = ChapterId::new(n).unwrap();
            seed_key(&db, QuizRef::Chapter(chapter), 10).await;
            let outcome = submit_chapter_quiz(&db, &config, "u1", chapter, &answers(10, 10))
                .await
                .unwrap();
            let all_done = outcome.progress.progression.completed().len() == 70;
            assert_eq!(all_done, outcome.progress.final_test_unlocked());
            assert_eq!(outcome.progress.final_test_unlocked(), n == 70);
            assert_eq!(outcome.unlocked_next_chapter, n < 70);
        }
    }

    #[tokio::test]
    async fn final_test_nine_of_thirty() {
        let (_dir, db) = test_database().await;
        let config = small_course();
        complete_all_chapters(&db, &config, "u1").await;
        seed_key(&db, QuizRef::FinalTest, 30).await;

        let err = submit_final_test(&db, &config, "u1", &answers(9, 30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert_eq!(
            check_final_test_eligibility(&db, &config, "u1").await.unwrap().reason,
            EligibilityReason::PaymentRequired
        );

        pay(&db, "u1").await;
        let fail = submit_final_test(&db, &config, "u1", &answers(8, 30))
            .await
            .unwrap();
        assert!(!fail.certificate_unlocked);
        assert!(fail.progress.final_test_completed);

        let outcome = submit_final_test(&db, &config, "u1", &answers(9, 30))
            .await
            .unwrap();
        assert_eq!(outcome.submission.evaluation.score, 9);
        assert_eq!(outcome.certificate_unlocked, 9 >= passing_threshold(30));
        assert!(outcome.certificate_unlocked);
        assert_eq!(
            check_final_test_eligibility(&db, &config, "u1").await.unwrap().reason,
            EligibilityReason::FinalTestPassed
        );
    }
}
