use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::debug;
use utoipa::ToSchema;

use crate::{
    chapter::QuizRef,
    error::{Error, Result},
    utils::now,
};

/// Submitted answers: question id -> chosen option letter.
pub type Answers = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct AnswerKey {
    pub quiz: QuizRef,
    pub answers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerEvaluation {
    pub user_answer: String,
    /// `N/A` when the key has no entry for the question.
    pub correct_answer: String,
    pub is_correct: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub score: u32,
    pub total_questions_attempted: u32,
    pub evaluation_details: BTreeMap<String, AnswerEvaluation>,
}

/// Immutable record of one submission.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub id: i64,
    /// Chapter id (`CH-001`) or `final-test`.
    pub chapter_id: String,
    pub user_id: String,
    pub score: u32,
    pub total_questions_attempted: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizSubmission {
    #[serde(flatten)]
    pub evaluation: Evaluation,
    pub analytics: QuizAttempt,
}

/// Read a loosely typed answers payload into a map of question id to option letter.
pub fn parse_answers(value: &Value) -> Result<Answers> {
    let Value::Object(map) = value else {
        return Err(Error::validation("user answers must be an object"));
    };
    map.iter()
        .map(|(question, answer)| match answer {
            Value::String(answer) => Ok((question.clone(), answer.clone())),
            _ => Err(Error::validation(format!(
                "answer for question {question} must be a string"
            ))),
        })
        .collect()
}

/// Score `answers` against `key`. Questions missing from the key never count as correct.
pub fn evaluate(answers: &Answers, key: &AnswerKey) -> Evaluation {
    let mut score = 0;
    let mut evaluation_details = BTreeMap::new();
    for (question, user_answer) in answers {
        let correct = key.answers.get(question);
        let is_correct =
            correct.is_some_and(|c| c.trim().eq_ignore_ascii_case(user_answer.trim()));
        if is_correct {
            score += 1;
        }
        evaluation_details.insert(
            question.clone(),
            AnswerEvaluation {
                user_answer: user_answer.clone(),
                correct_answer: correct.cloned().unwrap_or_else(|| "N/A".to_string()),
                is_correct,
            },
        );
    }
    Evaluation {
        score,
        total_questions_attempted: answers.len() as u32,
        evaluation_details,
    }
}

pub async fn load_answer_key(database: &SqlitePool, quiz: QuizRef) -> Result<AnswerKey> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT question_id, answer FROM answer_key WHERE quiz_id = ?")
            .bind(quiz.answer_key_id())
            .fetch_all(database)
            .await?;
    if rows.is_empty() {
        return Err(Error::not_found(format!("answer key not found for {quiz}")));
    }
    Ok(AnswerKey {
        quiz,
        answers: rows.into_iter().collect(),
    })
}

/// Replace the whole answer key of a quiz.
pub async fn store_answer_key(
    database: &SqlitePool,
    quiz: QuizRef,
    answers: &BTreeMap<String, String>,
) -> Result<usize> {
    if answers.is_empty() {
        return Err(Error::validation("answer key is empty"));
    }
    let quiz_id = quiz.answer_key_id();
    let mut tx = database.begin().await?;
    sqlx::query("DELETE FROM answer_key WHERE quiz_id = ?")
        .bind(&quiz_id)
        .execute(&mut *tx)
        .await?;
    for (question, answer) in answers {
        sqlx::query("INSERT INTO answer_key (quiz_id, question_id, answer) VALUES (?, ?, ?)")
            .bind(&quiz_id)
            .bind(question)
            .bind(answer.trim())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(answers.len())
}

pub async fn record_attempt(
    database: &SqlitePool,
    user_id: &str,
    quiz: QuizRef,
    evaluation: &Evaluation,
) -> Result<QuizAttempt> {
    let submitted_at = now();
    let chapter_id = quiz.to_string();
    let id = sqlx::query(
        "INSERT INTO quiz_attempt (quiz_id, user_id, score, total_attempted, submitted_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&chapter_id)
    .bind(user_id)
    .bind(evaluation.score as i64)
    .bind(evaluation.total_questions_attempted as i64)
    .bind(submitted_at)
    .execute(database)
    .await?
    .last_insert_rowid();
    Ok(QuizAttempt {
        id,
        chapter_id,
        user_id: user_id.to_string(),
        score: evaluation.score,
        total_questions_attempted: evaluation.total_questions_attempted,
        submitted_at,
    })
}

/// Evaluate a submission and append it to the attempt log. Progress is left untouched.
pub async fn submit(
    database: &SqlitePool,
    user_id: &str,
    quiz: QuizRef,
    answers: &Value,
) -> Result<QuizSubmission> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("user id is required"));
    }
    let answers = parse_answers(answers)?;
    let key = load_answer_key(database, quiz).await?;
    let evaluation = evaluate(&answers, &key);
    debug!(
        "{} scored {}/{} on {}",
        user_id, evaluation.score, evaluation.total_questions_attempted, quiz
    );
    let analytics = record_attempt(database, user_id, quiz, &evaluation).await?;
    Ok(QuizSubmission {
        evaluation,
        analytics,
    })
}

/// All attempts of a user, newest first.
pub async fn quiz_analytics(database: &SqlitePool, user_id: &str) -> Result<Vec<QuizAttempt>> {
    let rows: Vec<(i64, String, String, i64, i64, OffsetDateTime)> = sqlx::query_as(
        "SELECT id, quiz_id, user_id, score, total_attempted, submitted_at FROM quiz_attempt \
         WHERE user_id = ? ORDER BY submitted_at DESC, id DESC",
    )
    .bind(user_id)
    .fetch_all(database)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(id, chapter_id, user_id, score, total, submitted_at)| QuizAttempt {
                id,
                chapter_id,
                user_id,
                score: score as u32,
                total_questions_attempted: total as u32,
                submitted_at,
            },
        )
        .collect())
}
