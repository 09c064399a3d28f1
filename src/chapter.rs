use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

use crate::error::Error;

/// A chapter number, 1-based, rendered as `CH-001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[schema(value_type = String, example = "CH-001")]
pub struct ChapterId(u32);

impl ChapterId {
    pub const FIRST: ChapterId = ChapterId(1);

    pub fn new(number: u32) -> Option<Self> {
        (number >= 1).then_some(Self(number))
    }
    pub fn number(self) -> u32 {
        self.0
    }
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ChapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH-{:03}", self.0)
    }
}

impl FromStr for ChapterId {
    type Err = Error;
    /// Accepts `CH-007`, `ch-7` and a bare `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = match s.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("CH-") => &s[3..],
            _ => s,
        };
        digits
            .parse::<u32>()
            .ok()
            .and_then(ChapterId::new)
            .ok_or_else(|| Error::validation(format!("invalid chapter id: {s}")))
    }
}

impl Serialize for ChapterId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChapterId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Which quiz an answer set belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuizRef {
    Chapter(ChapterId),
    FinalTest,
}

impl QuizRef {
    /// Key under which the quiz's answer key is stored.
    pub fn answer_key_id(&self) -> String {
        match self {
            QuizRef::Chapter(chapter) => chapter.to_string(),
            QuizRef::FinalTest => "FINAL".to_string(),
        }
    }
}

impl fmt::Display for QuizRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuizRef::Chapter(chapter) => chapter.fmt(f),
            QuizRef::FinalTest => f.write_str("final-test"),
        }
    }
}

impl FromStr for QuizRef {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("final-test") || s.eq_ignore_ascii_case("FINAL") {
            Ok(QuizRef::FinalTest)
        } else {
            s.parse().map(QuizRef::Chapter)
        }
    }
}
