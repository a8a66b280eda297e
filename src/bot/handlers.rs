use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use teloxide::ApiError;
use teloxide::RequestError;
use teloxide::dispatching::UpdateHandler;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::CallbackQuery;
use teloxide::types::ChatId;
use teloxide::types::InlineKeyboardButton;
use teloxide::types::InlineKeyboardMarkup;
use teloxide::types::Message;
use teloxide::types::MessageId;
use teloxide::types::User;
use teloxide::utils::command::BotCommands;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::bot::Command;
use crate::bot::HandlerResult;
use crate::bot::context::AppContext;
use crate::course::Catalog;
use crate::course::Chapter;
use crate::course::QuizQuestion;
use crate::engine::AnswerOutcome;
use crate::engine::EngineError;
use crate::history::HISTORY_LIMIT;
use crate::history::HistoryEntry;
use crate::history::Role;
use crate::models::NavigationState;
use crate::models::StatsSummary;
use crate::models::UserRecord;
use crate::quiz::QuizPhase;
use crate::quiz::QuizResult;
use crate::util::format_progress_bar;
use crate::util::option_letter;

type SharedContext = Arc<AppContext>;

const MAIN_MENU_TEXT: &str = "💚 Bonvenon! What would you like to do?";
const QUIZ_INTRO_TEXT: &str =
  "📝 Quiz time!\n\nAnswer each question with the buttons or by typing the option letter. Your result counts towards your progress.";
const TUTOR_LOG_TEXT: &str =
  "✍️ Tutor log is open. Everything you send is saved for your next lesson review. Use /history to read it back and /cancel to leave.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CallbackAction {
  MainMenu,
  Chapters,
  Stats,
  Chapter(u32),
  Section { chapter: u32, section: u32 },
  Complete(u32),
  QuizIntro,
  QuizStart,
  Answer { question: usize, choice: String },
}

impl CallbackAction {
  fn parse(data: &str) -> Option<Self> {
    let (prefix, value) = data.split_once(':')?;
    match prefix {
      "menu" => match value {
        "root" => Some(Self::MainMenu),
        "chapters" => Some(Self::Chapters),
        "stats" => Some(Self::Stats),
        _ => None,
      },
      "chapter" => value.parse().ok().map(Self::Chapter),
      "section" => {
        let (chapter, section) = value.split_once(':')?;
        Some(Self::Section {
          chapter: chapter.parse().ok()?,
          section: section.parse().ok()?,
        })
      },
      "complete" => value.parse().ok().map(Self::Complete),
      "quiz" => match value {
        "intro" => Some(Self::QuizIntro),
        "start" => Some(Self::QuizStart),
        _ => None,
      },
      "answer" => {
        let (question, choice) = value.split_once(':')?;
        if choice.is_empty() {
          return None;
        }
        Some(Self::Answer {
          question: question.parse().ok()?,
          choice: choice.to_string(),
        })
      },
      _ => None,
    }
  }
}

pub fn build_schema() -> UpdateHandler<anyhow::Error> {
  let message_handler = Update::filter_message()
    .branch(command_branch())
    .branch(dptree::endpoint(handle_text));

  let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

  dptree::entry().branch(message_handler).branch(callback_handler)
}

fn command_branch() -> UpdateHandler<anyhow::Error> {
  dptree::entry()
    .filter_command::<Command>()
    .branch(dptree::case![Command::Start].endpoint(handle_start))
    .branch(dptree::case![Command::Help].endpoint(handle_help))
    .branch(dptree::case![Command::Chapters].endpoint(handle_chapters))
    .branch(dptree::case![Command::Quiz].endpoint(handle_quiz))
    .branch(dptree::case![Command::Stats].endpoint(handle_stats))
    .branch(dptree::case![Command::Ask].endpoint(handle_ask))
    .branch(dptree::case![Command::History].endpoint(handle_history))
    .branch(dptree::case![Command::Cancel].endpoint(handle_cancel))
}

fn sender_id(msg: &Message) -> anyhow::Result<i64> {
  let user: &User = msg.from.as_ref().context("message missing sender")?;
  Ok(user.id.0 as i64)
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_start(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user = msg.from.as_ref().context("message missing sender")?;
  let user_id = user.id.0 as i64;
  let username = user.username.as_deref().unwrap_or("-");
  ctx
    .engine()
    .set_navigation(user_id, NavigationState::Browsing, None, None)
    .await?;
  info!(user_id, chat_id = %msg.chat.id, username, "received /start command");
  bot
    .send_message(msg.chat.id, MAIN_MENU_TEXT)
    .reply_markup(main_menu_keyboard())
    .await?;
  Ok(())
}

#[instrument(skip(bot, msg))]
async fn handle_help(bot: Bot, msg: Message) -> HandlerResult {
  info!(chat_id = %msg.chat.id, "received /help command");
  let mut text = Command::descriptions().to_string();
  text.push_str("\n\nPick chapters from the menu, mark them complete as you go, and take the quiz to level up.");
  bot.send_message(msg.chat.id, text).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_chapters(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg)?;
  let record = ctx
    .engine()
    .set_navigation(user_id, NavigationState::BrowsingChapters, None, None)
    .await?;
  bot
    .send_message(msg.chat.id, "📚 Chapters")
    .reply_markup(chapters_keyboard(
      ctx.engine().catalog(),
      record.stats.completed_chapter_ids(),
    ))
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_quiz(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg)?;
  open_quiz(&bot, &ctx, msg.chat.id, user_id).await
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_stats(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg)?;
  send_stats(&bot, &ctx, msg.chat.id, user_id).await
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_ask(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg)?;
  ctx
    .engine()
    .set_navigation(user_id, NavigationState::AiChat, None, None)
    .await?;
  info!(user_id, chat_id = %msg.chat.id, "opened tutor log");
  bot.send_message(msg.chat.id, TUTOR_LOG_TEXT).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_history(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg)?;
  let history = ctx.engine().get_history(user_id).await?;
  bot.send_message(msg.chat.id, render_history(&history)).await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_cancel(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let user_id = sender_id(&msg)?;
  let record = ctx
    .engine()
    .set_navigation(user_id, NavigationState::Browsing, None, None)
    .await?;
  let mut text = "❌ Left the current activity.".to_string();
  if record.quiz.is_active() {
    text.push_str(" Your quiz is paused, use /quiz to continue.");
  }
  bot.send_message(msg.chat.id, text).await?;
  bot
    .send_message(msg.chat.id, MAIN_MENU_TEXT)
    .reply_markup(main_menu_keyboard())
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, msg))]
async fn handle_text(bot: Bot, ctx: SharedContext, msg: Message) -> HandlerResult {
  let Some(text) = msg.text().map(str::trim).filter(|text| !text.is_empty()) else {
    return Ok(());
  };
  if text.starts_with('/') {
    // unknown command, ignore to let telegram handle
    return Ok(());
  }

  let user_id = sender_id(&msg)?;
  let chat_id = msg.chat.id;
  let record = ctx.engine().get_or_create(user_id).await?;
  match record.navigation.state {
    NavigationState::Quiz => {
      let answered = ctx.engine().answer_current(user_id, text).await;
      process_answer(&bot, &ctx, chat_id, user_id, answered).await
    },
    NavigationState::AiChat => record_tutor_note(&bot, &ctx, chat_id, user_id, text).await,
    state => {
      info!(user_id, chat_id = %chat_id, ?state, "received text outside of quiz or tutor log");
      bot
        .send_message(chat_id, "I did not understand that. Use the menu buttons or /help.")
        .await?;
      Ok(())
    },
  }
}

#[instrument(skip(bot, ctx, query))]
async fn handle_callback_query(bot: Bot, ctx: SharedContext, query: CallbackQuery) -> HandlerResult {
  let user_id = query.from.id.0 as i64;
  let message_ctx = query.message.as_ref().map(|message| (message.chat().id, message.id()));
  let callback_data = query.data.as_deref().unwrap_or("<empty>");
  info!(user_id, callback = callback_data, "handling callback query");

  let callback_text = match query.data.as_deref().and_then(CallbackAction::parse) {
    Some(action) => match run_callback_action(&bot, &ctx, user_id, message_ctx, action).await {
      Ok(text) => text,
      Err(err) => match err.downcast::<EngineError>() {
        Ok(engine_err) if engine_err.is_recoverable() => Some(engine_err.user_message()),
        Ok(engine_err) => return Err(engine_err.into()),
        Err(other) => return Err(other),
      },
    },
    None => {
      warn!(user_id, callback = callback_data, "unrecognized callback data");
      None
    },
  };

  if let Some(text) = callback_text {
    bot.answer_callback_query(query.id).text(text).await?;
  } else {
    bot.answer_callback_query(query.id).await?;
  }
  Ok(())
}

async fn run_callback_action(
  bot: &Bot,
  ctx: &SharedContext,
  user_id: i64,
  message_ctx: Option<(ChatId, MessageId)>,
  action: CallbackAction,
) -> anyhow::Result<Option<String>> {
  let engine = ctx.engine();
  let Some((chat_id, message_id)) = message_ctx else {
    return Ok(Some("⌛ This menu has expired, use /start.".to_string()));
  };

  match action {
    CallbackAction::MainMenu => {
      engine
        .set_navigation(user_id, NavigationState::Browsing, None, None)
        .await?;
      edit_menu(bot, chat_id, message_id, MAIN_MENU_TEXT.to_string(), main_menu_keyboard()).await?;
    },
    CallbackAction::Chapters => {
      let record = engine
        .set_navigation(user_id, NavigationState::BrowsingChapters, None, None)
        .await?;
      let keyboard = chapters_keyboard(engine.catalog(), record.stats.completed_chapter_ids());
      edit_menu(bot, chat_id, message_id, "📚 Chapters".to_string(), keyboard).await?;
    },
    CallbackAction::Stats => {
      send_stats(bot, ctx, chat_id, user_id).await?;
    },
    CallbackAction::Chapter(chapter_id) => {
      let record = engine
        .set_navigation(user_id, NavigationState::BrowsingSections, Some(chapter_id), None)
        .await?;
      let chapter = engine
        .catalog()
        .chapter(chapter_id)
        .ok_or(EngineError::UnknownChapter(chapter_id))?;
      let completed = record.stats.completed_chapter_ids().contains(&chapter_id);
      edit_menu(
        bot,
        chat_id,
        message_id,
        render_chapter_heading(chapter, completed),
        sections_keyboard(chapter, completed),
      )
      .await?;
    },
    CallbackAction::Section { chapter, section } => {
      let record = engine
        .set_navigation(user_id, NavigationState::ViewingSection, Some(chapter), Some(section))
        .await?;
      let catalog = engine.catalog();
      let found = catalog.chapter(chapter).ok_or(EngineError::UnknownChapter(chapter))?;
      let entry = catalog.section(chapter, section).ok_or(EngineError::UnknownSection {
        chapter: Some(chapter),
        section,
      })?;
      let completed = record.stats.completed_chapter_ids().contains(&chapter);
      edit_menu(
        bot,
        chat_id,
        message_id,
        format!("📖 {} · {}\n\n{}", found.title, entry.title, entry.body),
        section_keyboard(found, section, completed),
      )
      .await?;
    },
    CallbackAction::Complete(chapter_id) => {
      let completion = engine.complete_chapter(user_id, chapter_id).await?;
      if !completion.newly_completed {
        return Ok(Some("✅ Already completed.".to_string()));
      }
      let after = completion.record.stats.summary();
      if after.level != completion.previous.level {
        bot
          .send_message(chat_id, format!("🎉 You reached the {} level!", after.level))
          .await?;
      }
      if let Some(chapter) = engine.catalog().chapter(chapter_id) {
        let request = bot
          .edit_message_reply_markup(chat_id, message_id)
          .reply_markup(sections_keyboard(chapter, true));
        if let Err(err) = request.await
          && !matches!(err, RequestError::Api(ApiError::MessageNotModified))
        {
          return Err(err.into());
        }
      }
      return Ok(Some(format!("✅ Chapter complete! Progress: {}%", after.progress)));
    },
    CallbackAction::QuizIntro => {
      open_quiz(bot, ctx, chat_id, user_id).await?;
    },
    CallbackAction::QuizStart => {
      let first = engine.start_quiz(user_id).await?;
      send_question(bot, engine.catalog(), chat_id, first).await?;
    },
    CallbackAction::Answer { question, choice } => {
      let answered = engine.answer_question(user_id, question, &choice).await;
      if let Err(err @ EngineError::AlreadyAnswered { .. }) = &answered {
        info!(user_id, question, "ignoring answer for a question already answered");
        return Ok(Some(err.user_message()));
      }
      process_answer(bot, ctx, chat_id, user_id, answered).await?;
    },
  }
  Ok(None)
}

async fn open_quiz(bot: &Bot, ctx: &SharedContext, chat: ChatId, user_id: i64) -> HandlerResult {
  let record = ctx.engine().open_quiz_intro(user_id).await?;
  if record.quiz.is_active() {
    info!(user_id, question = record.quiz.current_question(), "resuming quiz");
    bot.send_message(chat, "▶️ Continuing your quiz.").await?;
    return send_question(bot, ctx.engine().catalog(), chat, record.quiz.current_question()).await;
  }
  bot
    .send_message(chat, QUIZ_INTRO_TEXT)
    .reply_markup(quiz_intro_keyboard())
    .await?;
  Ok(())
}

#[instrument(skip(bot, ctx, answered))]
async fn process_answer(
  bot: &Bot,
  ctx: &SharedContext,
  chat: ChatId,
  user_id: i64,
  answered: Result<AnswerOutcome, EngineError>,
) -> HandlerResult {
  let engine = ctx.engine();
  let outcome = match answered {
    Ok(outcome) => outcome,
    Err(err) if err.is_recoverable() => {
      bot.send_message(chat, err.user_message()).await?;
      return Ok(());
    },
    Err(err) => return Err(err.into()),
  };
  info!(user_id, correct = outcome.is_correct, question = outcome.next_question, "answer recorded");
  bot.send_message(chat, render_feedback(&outcome)).await?;

  let finish = engine.finish_quiz_if_due(user_id).await?;
  if finish.finished {
    info!(user_id, progress = finish.stats.progress, level = %finish.stats.level, "quiz wrapped up");
  }
  match finish.result {
    Some(result) => {
      bot
        .send_message(chat, render_quiz_result(&result, &finish.stats))
        .reply_markup(main_menu_keyboard())
        .await?;
    },
    None => send_question(bot, engine.catalog(), chat, outcome.next_question).await?,
  }
  Ok(())
}

async fn record_tutor_note(bot: &Bot, ctx: &SharedContext, chat: ChatId, user_id: i64, text: &str) -> HandlerResult {
  let engine = ctx.engine();
  engine.append_message(user_id, Role::User, text).await?;
  let reply = "📝 Saved to your tutor log.";
  engine.append_message(user_id, Role::Assistant, reply).await?;
  info!(user_id, chat_id = %chat, "stored tutor log entry");
  bot.send_message(chat, reply).await?;
  Ok(())
}

async fn send_question(bot: &Bot, catalog: &Catalog, chat: ChatId, index: usize) -> HandlerResult {
  let Some(question) = catalog.question(index) else {
    warn!(index, "question index outside of quiz");
    return Ok(());
  };
  bot
    .send_message(chat, render_question(index, catalog.quiz.len(), question))
    .reply_markup(question_keyboard(index, question))
    .await?;
  Ok(())
}

async fn send_stats(bot: &Bot, ctx: &SharedContext, chat: ChatId, user_id: i64) -> HandlerResult {
  let record = ctx.engine().get_or_create(user_id).await?;
  let text = render_stats(&record, ctx.engine().rules().total_chapters());
  bot.send_message(chat, text).await?;
  Ok(())
}

async fn edit_menu(
  bot: &Bot,
  chat: ChatId,
  message_id: MessageId,
  text: String,
  keyboard: InlineKeyboardMarkup,
) -> HandlerResult {
  let request = bot.edit_message_text(chat, message_id, text).reply_markup(keyboard);
  match request.await {
    Ok(_) => info!(chat_id = %chat, message_id = %message_id, "updated menu message"),
    Err(RequestError::Api(ApiError::MessageNotModified)) => {
      info!(chat_id = %chat, message_id = %message_id, "menu message already current");
    },
    Err(err) => return Err(err.into()),
  }
  Ok(())
}

fn main_menu_keyboard() -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![
    vec![InlineKeyboardButton::callback("📚 Chapters", "menu:chapters".to_string())],
    vec![
      InlineKeyboardButton::callback("📝 Quiz", "quiz:intro".to_string()),
      InlineKeyboardButton::callback("📊 My progress", "menu:stats".to_string()),
    ],
  ])
}

fn back_to_menu_row() -> Vec<InlineKeyboardButton> {
  vec![InlineKeyboardButton::callback("⬅️ Main menu", "menu:root".to_string())]
}

fn chapters_keyboard(catalog: &Catalog, completed: &BTreeSet<u32>) -> InlineKeyboardMarkup {
  let mut rows: Vec<Vec<InlineKeyboardButton>> = catalog
    .chapters
    .iter()
    .map(|chapter| {
      let mark = if completed.contains(&chapter.id) { "✅" } else { "📘" };
      vec![InlineKeyboardButton::callback(
        format!("{mark} {}. {}", chapter.id, chapter.title),
        format!("chapter:{}", chapter.id),
      )]
    })
    .collect();
  rows.push(back_to_menu_row());
  InlineKeyboardMarkup::new(rows)
}

fn sections_keyboard(chapter: &Chapter, completed: bool) -> InlineKeyboardMarkup {
  let mut rows: Vec<Vec<InlineKeyboardButton>> = chapter
    .sections
    .iter()
    .map(|section| {
      vec![InlineKeyboardButton::callback(
        format!("{}. {}", section.id, section.title),
        format!("section:{}:{}", chapter.id, section.id),
      )]
    })
    .collect();
  if !completed {
    rows.push(vec![InlineKeyboardButton::callback(
      "✅ Mark chapter complete",
      format!("complete:{}", chapter.id),
    )]);
  }
  rows.push(vec![InlineKeyboardButton::callback(
    "⬅️ Chapters",
    "menu:chapters".to_string(),
  )]);
  InlineKeyboardMarkup::new(rows)
}

fn section_keyboard(chapter: &Chapter, section_id: u32, completed: bool) -> InlineKeyboardMarkup {
  let position = chapter.sections.iter().position(|section| section.id == section_id);
  let mut nav = Vec::new();
  if let Some(previous) = position.and_then(|i| i.checked_sub(1)).and_then(|i| chapter.sections.get(i)) {
    nav.push(InlineKeyboardButton::callback(
      "◀️ Previous",
      format!("section:{}:{}", chapter.id, previous.id),
    ));
  }
  if let Some(next) = position.and_then(|i| chapter.sections.get(i + 1)) {
    nav.push(InlineKeyboardButton::callback(
      "Next ▶️",
      format!("section:{}:{}", chapter.id, next.id),
    ));
  }

  let mut rows = Vec::new();
  if !nav.is_empty() {
    rows.push(nav);
  }
  let is_last = position.is_some_and(|i| i + 1 == chapter.sections.len());
  if is_last && !completed {
    rows.push(vec![InlineKeyboardButton::callback(
      "✅ Mark chapter complete",
      format!("complete:{}", chapter.id),
    )]);
  }
  rows.push(vec![InlineKeyboardButton::callback(
    "⬅️ Sections",
    format!("chapter:{}", chapter.id),
  )]);
  InlineKeyboardMarkup::new(rows)
}

fn quiz_intro_keyboard() -> InlineKeyboardMarkup {
  InlineKeyboardMarkup::new(vec![
    vec![InlineKeyboardButton::callback("▶️ Start quiz", "quiz:start".to_string())],
    back_to_menu_row(),
  ])
}

fn question_keyboard(question_index: usize, question: &QuizQuestion) -> InlineKeyboardMarkup {
  let buttons: Vec<InlineKeyboardButton> = (0 .. question.options.len())
    .map(|index| {
      let letter = option_letter(index);
      InlineKeyboardButton::callback(letter.to_string(), format!("answer:{question_index}:{letter}"))
    })
    .collect();
  InlineKeyboardMarkup::new(buttons.chunks(4).map(<[_]>::to_vec).collect::<Vec<_>>())
}

fn render_chapter_heading(chapter: &Chapter, completed: bool) -> String {
  let status = if completed { "\n\n✅ Completed" } else { "" };
  format!("📘 Chapter {}: {}{status}", chapter.id, chapter.title)
}

fn render_question(index: usize, total: usize, question: &QuizQuestion) -> String {
  let mut text = format!("❓ Question {}/{}\n\n{}\n", index + 1, total, question.question);
  for (i, option) in question.options.iter().enumerate() {
    text.push_str(&format!("\n{}) {}", option_letter(i), option));
  }
  text
}

fn render_feedback(outcome: &AnswerOutcome) -> String {
  if outcome.is_correct {
    "✅ Correct!".to_string()
  } else {
    format!(
      "❌ Not quite. You picked {}, the right answer was {}.",
      option_letter(outcome.chosen_index),
      outcome.correct_letter()
    )
  }
}

fn render_quiz_result(result: &QuizResult, stats: &StatsSummary) -> String {
  format!(
    "🏁 Quiz finished: {}/{} correct.\n\n📊 Progress: {}\n🎓 Level: {}",
    result.score,
    result.total_questions,
    format_progress_bar(stats.progress),
    stats.level
  )
}

fn render_stats(record: &UserRecord, total_chapters: u32) -> String {
  let stats = &record.stats;
  let mut text = format!(
    "📊 Your progress\n\n{}\n🎓 Level: {}\n📚 Chapters: {}/{}\n📝 Quizzes taken: {}",
    format_progress_bar(stats.progress()),
    stats.level(),
    stats.chapters_completed(),
    total_chapters,
    stats.tests_completed()
  );
  if record.quiz.phase() == QuizPhase::InProgress {
    text.push_str(&format!(
      "\n▶️ Quiz in progress: question {}/{}, {} of {} correct so far",
      record.quiz.current_question() + 1,
      record.quiz.question_count(),
      record.quiz.score(),
      record.quiz.answers().len()
    ));
  }
  if let Some(last) = stats.quiz_results().last() {
    text.push_str(&format!(
      "\n🏁 Last quiz: {}/{} on {}",
      last.score,
      last.total_questions,
      last.completed_at.format("%Y-%m-%d")
    ));
  }
  text.push_str(&format!(
    "\n📅 Learning since {}",
    stats.registration_date.format("%Y-%m-%d")
  ));
  text
}

fn render_history(entries: &[HistoryEntry]) -> String {
  if entries.is_empty() {
    return "🗒️ Your tutor log is empty. Use /ask to start writing.".to_string();
  }
  let mut text = format!("🗒️ Tutor log (last {} of up to {HISTORY_LIMIT}):\n", entries.len());
  for entry in entries {
    let who = match entry.role {
      Role::User => "🧑",
      Role::Assistant => "🤖",
    };
    text.push_str(&format!("\n{} {} {}", entry.timestamp.format("%H:%M"), who, entry.content));
  }
  text
}
