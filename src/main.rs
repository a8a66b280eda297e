mod app;
mod bot;
mod config;
mod course;
mod engine;
mod history;
mod models;
mod progress;
mod quiz;
mod store;
mod telemetry;
mod util;

use anyhow::Context;
use anyhow::Result;
use teloxide::prelude::Bot;
use tracing::info;

use crate::course::Catalog;
use crate::engine::ProgressEngine;
use crate::progress::ProgressRules;
use crate::store::MemoryStore;
use crate::store::PgUserStore;
use crate::store::UserStore;

#[tokio::main]
async fn main() -> Result<()> {
  telemetry::init()?;
  let config = config::Config::from_env()?;

  let catalog = match &config.course_path {
    Some(path) => Catalog::from_path(path).with_context(|| format!("failed to load course from {}", path.display()))?,
    None => Catalog::builtin().context("built-in course is invalid")?,
  };
  let rules = ProgressRules::new(catalog.chapter_count(), config.max_tests_counted)?;
  info!(
    chapters = catalog.chapter_count(),
    questions = catalog.quiz.len(),
    persistent = config.database_url.is_some(),
    "starting bot"
  );

  let store: Box<dyn UserStore> = match &config.database_url {
    Some(url) => Box::new(PgUserStore::connect(url).await?),
    None => Box::new(MemoryStore::new()),
  };
  let engine = ProgressEngine::new(store, catalog, rules);

  let bot = Bot::new(config.bot_token.clone());
  let app = app::App::new(bot, engine);
  app.run().await
}
