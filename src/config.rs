use std::env;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;

use crate::progress::DEFAULT_MAX_TESTS_COUNTED;

#[derive(Debug, Clone)]
pub struct Config {
  pub bot_token: String,
  pub database_url: Option<String>,
  pub course_path: Option<PathBuf>,
  pub max_tests_counted: u32,
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let bot_token = env::var("BOT_TOKEN")
      .or_else(|_| env::var("TELOXIDE_TOKEN"))
      .context("BOT_TOKEN or TELOXIDE_TOKEN must be set")?;
    let database_url = non_empty_var("DATABASE_URL");
    let course_path = non_empty_var("COURSE_PATH").map(PathBuf::from);
    let max_tests_counted = parse_max_tests(non_empty_var("MAX_TESTS_COUNTED").as_deref());
    Ok(Self {
      bot_token,
      database_url,
      course_path,
      max_tests_counted,
    })
  }
}

fn non_empty_var(name: &str) -> Option<String> {
  env::var(name)
    .ok()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
}

fn parse_max_tests(raw: Option<&str>) -> u32 {
  let Some(raw) = raw else {
    return DEFAULT_MAX_TESTS_COUNTED;
  };
  match raw.parse::<u32>() {
    Ok(value) if value > 0 => value,
    Ok(_) => {
      tracing::warn!(value = raw, "MAX_TESTS_COUNTED must be positive, using default");
      DEFAULT_MAX_TESTS_COUNTED
    },
    Err(err) => {
      tracing::warn!(value = raw, error = %err, "invalid MAX_TESTS_COUNTED, using default");
      DEFAULT_MAX_TESTS_COUNTED
    },
  }
}
