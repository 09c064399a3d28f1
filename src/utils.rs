use std::path::PathBuf;

use time::{Date, Duration, OffsetDateTime, macros::format_description};
use tracing_subscriber::EnvFilter;

/// 获取当前时间
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Format a date as `DD Month YYYY`, e.g. `21 May 2025`.
pub fn format_long_date(date: Date) -> String {
    let format = format_description!("[day] [month repr:long] [year]");
    date.format(&format).unwrap_or_else(|_| date.to_string())
}

pub fn parse_long_date(s: &str) -> Option<Date> {
    let format = format_description!("[day] [month repr:long] [year]");
    Date::parse(s, &format).ok()
}

/// One calendar year later, plus one day. 29 February maps to 28 February.
pub fn one_year_and_a_day(from: OffsetDateTime) -> OffsetDateTime {
    let year = from.year() + 1;
    let next_year = from
        .replace_year(year)
        .or_else(|_| from.replace_day(28).and_then(|d| d.replace_year(year)))
        .unwrap_or(from + Duration::days(365));
    next_year + Duration::days(1)
}

/// 初始化日志
pub fn init_log(log: Option<PathBuf>) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber_builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true);
    let (non_blocking, guard) = if let Some(log) = log {
        // output to file，daily rotate, non-blocking
        if !log.is_dir() {
            anyhow::bail!("log path {} is not a directory", log.display());
        }
        let file_appender = tracing_appender::rolling::daily(log, "cert_server.log");
        tracing_appender::non_blocking(file_appender)
    } else {
        // output to stdout
        tracing_appender::non_blocking(std::io::stdout())
    };
    tracing::subscriber::set_global_default(
        subscriber_builder.with_writer(non_blocking).finish(),
    )?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn long_date_round_trip() {
        let date = time::macros::date!(2025 - 05 - 21);
        let s = format_long_date(date);
        assert_eq!(s, "21 May 2025");
        assert_eq!(parse_long_date(&s), Some(date));
    }

    #[test]
    fn expiry_is_a_year_and_a_day() {
        assert_eq!(
            one_year_and_a_day(datetime!(2025-05-21 10:00 UTC)),
            datetime!(2026-05-22 10:00 UTC)
        );
        assert_eq!(
            one_year_and_a_day(datetime!(2024-02-29 00:00 UTC)),
            datetime!(2025-03-01 00:00 UTC)
        );
    }
}
