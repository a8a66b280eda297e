use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::course::Catalog;
use crate::history::HistoryEntry;
use crate::history::Role;
use crate::models::Navigation;
use crate::models::NavigationState;
use crate::models::StatsSummary;
use crate::models::UserRecord;
use crate::progress::ProgressRules;
use crate::quiz::QuizError;
use crate::quiz::QuizResult;
use crate::store::StoreError;
use crate::store::UserStore;
use crate::util::option_letter;
use crate::util::parse_answer_choice;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("answer {input:?} does not name one of the options")]
  InvalidAnswer { input: String },
  #[error("no quiz is in progress")]
  NoActiveQuiz,
  #[error("the quiz has no questions")]
  NoQuestions,
  #[error("question {question} was already answered")]
  AlreadyAnswered { question: usize },
  #[error("correct option {correct_index} is outside of {option_count} options")]
  InvalidQuestion { correct_index: usize, option_count: usize },
  #[error("chapter {0} does not exist")]
  UnknownChapter(u32),
  #[error("section {section} does not exist in chapter {chapter:?}")]
  UnknownSection { chapter: Option<u32>, section: u32 },
  #[error(transparent)]
  Store(#[from] StoreError),
}

impl From<QuizError> for EngineError {
  fn from(err: QuizError) -> Self {
    match err {
      QuizError::NoActiveQuiz => Self::NoActiveQuiz,
      QuizError::Empty => Self::NoQuestions,
    }
  }
}

impl EngineError {
  /// Text shown to the learner for recoverable errors.
  pub fn user_message(&self) -> String {
    match self {
      Self::InvalidAnswer { .. } => "⚠️ Please answer with one of the option letters (A, B, C, ...).".to_string(),
      Self::NoActiveQuiz => "ℹ️ There is no quiz in progress. Use /quiz to start one.".to_string(),
      Self::NoQuestions => "ℹ️ The quiz is not available right now.".to_string(),
      Self::AlreadyAnswered { .. } => "✔️ That question is already answered.".to_string(),
      Self::InvalidQuestion { .. } => "ℹ️ This question is broken, please try another one.".to_string(),
      Self::UnknownChapter(id) => format!("❓ Chapter {id} does not exist."),
      Self::UnknownSection { section, .. } => format!("❓ Section {section} does not exist."),
      Self::Store(_) => "Temporary error, try again later.".to_string(),
    }
  }

  pub fn is_recoverable(&self) -> bool {
    !matches!(self, Self::Store(_) | Self::InvalidQuestion { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerOutcome {
  pub is_correct: bool,
  pub chosen_index: usize,
  pub correct_index: usize,
  /// Index of the question to ask next; equals `question_count` once the
  /// last question has been answered.
  pub next_question: usize,
  pub question_count: usize,
}

impl AnswerOutcome {
  pub fn correct_letter(&self) -> char {
    option_letter(self.correct_index)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterCompletion {
  pub record: UserRecord,
  /// `false` when the chapter had already been recorded.
  pub newly_completed: bool,
  pub previous: StatsSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishOutcome {
  pub finished: bool,
  pub result: Option<QuizResult>,
  pub stats: StatsSummary,
}

/// Owns learner state and applies learning commands to it.
///
/// Each command runs under a per-learner lock: the record is loaded, the
/// command is applied to that copy, and the copy is saved only if the command
/// succeeded.
pub struct ProgressEngine {
  store: Box<dyn UserStore>,
  catalog: Catalog,
  rules: ProgressRules,
  // Entries live only while a command for that learner is running or queued.
  locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ProgressEngine {
  pub fn new(store: Box<dyn UserStore>, catalog: Catalog, rules: ProgressRules) -> Self {
    Self {
      store,
      catalog,
      rules,
      locks: DashMap::new(),
    }
  }

  pub fn catalog(&self) -> &Catalog {
    &self.catalog
  }

  pub fn rules(&self) -> &ProgressRules {
    &self.rules
  }

  #[instrument(skip(self))]
  pub async fn get_or_create(&self, user_id: i64) -> Result<UserRecord, EngineError> {
    let lock = self.lock_for(user_id);
    let result = {
      let _guard = lock.lock().await;
      self.load_or_create(user_id).await
    };
    self.release_lock(user_id, lock);
    result
  }

  #[instrument(skip(self))]
  pub async fn set_navigation(
    &self,
    user_id: i64,
    state: NavigationState,
    chapter_id: Option<u32>,
    section_id: Option<u32>,
  ) -> Result<UserRecord, EngineError> {
    self.validate_position(chapter_id, section_id)?;
    let (record, ()) = self
      .update(user_id, |record| {
        record.navigation = Navigation {
          state,
          current_chapter: chapter_id,
          current_section: section_id,
        };
        Ok(())
      })
      .await?;
    debug!(user_id, ?state, ?chapter_id, ?section_id, "navigation updated");
    Ok(record)
  }

  #[instrument(skip(self))]
  pub async fn open_quiz_intro(&self, user_id: i64) -> Result<UserRecord, EngineError> {
    let (record, ()) = self
      .update(user_id, |record| {
        record.open_quiz_intro();
        Ok(())
      })
      .await?;
    Ok(record)
  }

  #[instrument(skip(self))]
  pub async fn start_quiz(&self, user_id: i64) -> Result<usize, EngineError> {
    let question_count = self.catalog.quiz.len();
    let (_, first) = self
      .update(user_id, |record| Ok(record.start_quiz(question_count)?))
      .await?;
    info!(user_id, question_count, "quiz started");
    Ok(first)
  }

  /// Checks `raw_input` against `correct_index` for the current question.
  #[instrument(skip(self))]
  pub async fn submit_answer(
    &self,
    user_id: i64,
    raw_input: &str,
    correct_index: usize,
    option_count: usize,
  ) -> Result<AnswerOutcome, EngineError> {
    if correct_index >= option_count {
      return Err(EngineError::InvalidQuestion {
        correct_index,
        option_count,
      });
    }
    let (_, outcome) = self
      .update(user_id, |record| {
        apply_answer(record, raw_input, correct_index, option_count)
      })
      .await?;
    Ok(outcome)
  }

  /// Like [`Self::submit_answer`], taking the question from the catalog.
  #[instrument(skip(self))]
  pub async fn answer_current(&self, user_id: i64, raw_input: &str) -> Result<AnswerOutcome, EngineError> {
    self.answer_from_catalog(user_id, None, raw_input).await
  }

  /// Answers question `question_index` only if it is still the current one,
  /// so a repeated or late reply cannot land on the next question.
  #[instrument(skip(self))]
  pub async fn answer_question(
    &self,
    user_id: i64,
    question_index: usize,
    raw_input: &str,
  ) -> Result<AnswerOutcome, EngineError> {
    self.answer_from_catalog(user_id, Some(question_index), raw_input).await
  }

  async fn answer_from_catalog(
    &self,
    user_id: i64,
    expected: Option<usize>,
    raw_input: &str,
  ) -> Result<AnswerOutcome, EngineError> {
    let (_, outcome) = self
      .update(user_id, |record| {
        if !record.quiz.is_active() {
          return Err(EngineError::NoActiveQuiz);
        }
        let current = record.quiz.current_question();
        if let Some(question) = expected
          && question != current
        {
          return Err(EngineError::AlreadyAnswered { question });
        }
        let question = self.catalog.question(current).ok_or(EngineError::NoQuestions)?;
        apply_answer(record, raw_input, question.correct_answer, question.options.len())
      })
      .await?;
    Ok(outcome)
  }

  #[instrument(skip(self))]
  pub async fn finish_quiz_if_due(&self, user_id: i64) -> Result<FinishOutcome, EngineError> {
    let rules = self.rules;
    let (record, result) = self
      .update(user_id, |record| {
        if !record.quiz.is_due()? {
          return Ok(None);
        }
        Ok(Some(record.complete_quiz(Utc::now(), &rules)?))
      })
      .await?;
    if let Some(result) = &result {
      info!(
        user_id,
        score = result.score,
        total = result.total_questions,
        tests_completed = record.stats.tests_completed(),
        "quiz completed"
      );
    }
    Ok(FinishOutcome {
      finished: result.is_some(),
      result,
      stats: record.stats.summary(),
    })
  }

  #[instrument(skip(self))]
  pub async fn complete_chapter(&self, user_id: i64, chapter_id: u32) -> Result<ChapterCompletion, EngineError> {
    if self.catalog.chapter(chapter_id).is_none() {
      return Err(EngineError::UnknownChapter(chapter_id));
    }
    let rules = self.rules;
    let (record, (inserted, previous)) = self
      .update(user_id, |record| {
        let previous = record.stats.summary();
        Ok((record.complete_chapter(chapter_id, &rules), previous))
      })
      .await?;
    if inserted {
      info!(
        user_id,
        chapter_id,
        progress = record.stats.progress(),
        level = %record.stats.level(),
        "chapter completed"
      );
    } else {
      debug!(user_id, chapter_id, "chapter already completed");
    }
    Ok(ChapterCompletion {
      record,
      newly_completed: inserted,
      previous,
    })
  }

  #[instrument(skip(self))]
  pub async fn get_stats(&self, user_id: i64) -> Result<StatsSummary, EngineError> {
    Ok(self.get_or_create(user_id).await?.stats.summary())
  }

  #[instrument(skip(self, content))]
  pub async fn append_message(&self, user_id: i64, role: Role, content: &str) -> Result<(), EngineError> {
    self
      .update(user_id, |record| {
        record.append_message(role, content, Utc::now());
        Ok(())
      })
      .await?;
    Ok(())
  }

  #[instrument(skip(self))]
  pub async fn get_history(&self, user_id: i64) -> Result<Vec<HistoryEntry>, EngineError> {
    let record = self.get_or_create(user_id).await?;
    Ok(record.conversation_history.entries().cloned().collect())
  }

  fn lock_for(&self, user_id: i64) -> Arc<Mutex<()>> {
    self.locks.entry(user_id).or_default().value().clone()
  }

  // Drops the map entry once no other command holds or waits on it. New
  // handles are only cloned under the same shard lock, so none can slip in
  // between the count check and the removal.
  fn release_lock(&self, user_id: i64, lock: Arc<Mutex<()>>) {
    drop(lock);
    self
      .locks
      .remove_if(&user_id, |_, entry| Arc::strong_count(entry) == 1);
  }

  async fn load_or_create(&self, user_id: i64) -> Result<UserRecord, EngineError> {
    if let Some(record) = self.store.load(user_id).await? {
      return Ok(record);
    }
    let record = UserRecord::new(user_id, Utc::now());
    self.store.save(&record).await?;
    info!(user_id, "registered new learner");
    Ok(record)
  }

  async fn update<T, F>(&self, user_id: i64, command: F) -> Result<(UserRecord, T), EngineError>
  where
    F: FnOnce(&mut UserRecord) -> Result<T, EngineError> + Send,
    T: Send,
  {
    let lock = self.lock_for(user_id);
    let result = {
      let _guard = lock.lock().await;
      self.apply(user_id, command).await
    };
    self.release_lock(user_id, lock);
    result
  }

  async fn apply<T, F>(&self, user_id: i64, command: F) -> Result<(UserRecord, T), EngineError>
  where
    F: FnOnce(&mut UserRecord) -> Result<T, EngineError> + Send,
    T: Send,
  {
    let mut record = self.load_or_create(user_id).await?;
    let value = command(&mut record)?;
    record.touch(Utc::now());
    self.store.save(&record).await?;
    Ok((record, value))
  }

  fn validate_position(&self, chapter_id: Option<u32>, section_id: Option<u32>) -> Result<(), EngineError> {
    match (chapter_id, section_id) {
      (None, None) => Ok(()),
      (None, Some(section)) => Err(EngineError::UnknownSection { chapter: None, section }),
      (Some(chapter), section) => {
        let found = self
          .catalog
          .chapter(chapter)
          .ok_or(EngineError::UnknownChapter(chapter))?;
        match section {
          Some(section) if found.section(section).is_none() => Err(EngineError::UnknownSection {
            chapter: Some(chapter),
            section,
          }),
          _ => Ok(()),
        }
      },
    }
  }
}

fn apply_answer(
  record: &mut UserRecord,
  raw_input: &str,
  correct_index: usize,
  option_count: usize,
) -> Result<AnswerOutcome, EngineError> {
  if !record.quiz.is_active() {
    return Err(EngineError::NoActiveQuiz);
  }
  let chosen_index = parse_answer_choice(raw_input, option_count).ok_or_else(|| EngineError::InvalidAnswer {
    input: raw_input.to_string(),
  })?;
  let is_correct = chosen_index == correct_index;
  record.quiz.answer(is_correct)?;
  Ok(AnswerOutcome {
    is_correct,
    chosen_index,
    correct_index,
    next_question: record.quiz.current_question(),
    question_count: record.quiz.question_count(),
  })
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::EngineError;
  use super::ProgressEngine;
  use crate::course::Catalog;
  use crate::history::Role;
  use crate::models::NavigationState;
  use crate::progress::Level;
  use crate::progress::ProgressRules;
  use crate::quiz::QuizPhase;
  use crate::store::MemoryStore;
  use crate::util::option_letter;

  fn engine() -> ProgressEngine {
    let catalog = Catalog::builtin().unwrap();
    let rules = ProgressRules::new(catalog.chapter_count(), 10).unwrap();
    ProgressEngine::new(Box::new(MemoryStore::new()), catalog, rules)
  }

  fn answer_for(engine: &ProgressEngine, index: usize, correct: bool) -> String {
    let question = engine.catalog().question(index).unwrap();
    let choice = if correct {
      question.correct_answer
    } else {
      (question.correct_answer + 1) % question.options.len()
    };
    option_letter(choice).to_string()
  }

  #[tokio::test]
  async fn get_or_create_is_idempotent() {
    let engine = engine();
    let first = engine.get_or_create(1).await.unwrap();
    engine.complete_chapter(1, 2).await.unwrap();
    let second = engine.get_or_create(1).await.unwrap();
    assert_eq!(first.stats.registration_date, second.stats.registration_date);
    assert_eq!(second.stats.chapters_completed(), 1);
  }

  #[tokio::test]
  async fn full_quiz_flow_records_result() {
    let engine = engine();
    let count = engine.catalog().quiz.len();
    assert_eq!(engine.start_quiz(1).await.unwrap(), 0);

    let correct_answers = 7;
    for index in 0 .. count {
      let raw = answer_for(&engine, index, index < correct_answers);
      let outcome = engine.answer_current(1, &raw).await.unwrap();
      assert_eq!(outcome.is_correct, index < correct_answers);
      assert_eq!(outcome.next_question, index + 1);

      let finish = engine.finish_quiz_if_due(1).await.unwrap();
      assert_eq!(finish.finished, index + 1 == count);
    }

    let record = engine.get_or_create(1).await.unwrap();
    assert_eq!(record.stats.tests_completed(), 1);
    assert_eq!(record.stats.quiz_results().len(), 1);
    assert_eq!(record.stats.quiz_results()[0].score, correct_answers as u32);
    assert_eq!(record.stats.quiz_results()[0].total_questions, count as u32);
    assert_eq!(record.quiz.phase(), QuizPhase::Idle);
    assert_eq!(record.navigation.state, NavigationState::Browsing);
  }

  #[tokio::test]
  async fn invalid_answer_leaves_state_unchanged() {
    let engine = engine();
    engine.start_quiz(1).await.unwrap();
    let before = engine.get_or_create(1).await.unwrap();

    let err = engine.submit_answer(1, "E", 0, 4).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidAnswer { .. }));

    let after = engine.get_or_create(1).await.unwrap();
    assert_eq!(after.quiz, before.quiz);
    assert_eq!(after.quiz.current_question(), 0);
  }

  #[tokio::test]
  async fn submit_answer_scores_against_given_index() {
    let engine = engine();
    engine.start_quiz(1).await.unwrap();
    let outcome = engine.submit_answer(1, "b", 1, 4).await.unwrap();
    assert!(outcome.is_correct);
    let outcome = engine.submit_answer(1, "b", 2, 4).await.unwrap();
    assert!(!outcome.is_correct);
    assert_eq!(outcome.correct_letter(), 'C');

    let record = engine.get_or_create(1).await.unwrap();
    assert_eq!(record.quiz.score(), 1);
    assert_eq!(record.quiz.answers(), &[true, false]);
  }

  #[tokio::test]
  async fn repeated_answer_for_same_question_is_rejected() {
    let engine = engine();
    engine.start_quiz(1).await.unwrap();
    let raw = answer_for(&engine, 0, true);

    let outcome = engine.answer_question(1, 0, &raw).await.unwrap();
    assert!(outcome.is_correct);
    assert_eq!(outcome.next_question, 1);

    let err = engine.answer_question(1, 0, &raw).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyAnswered { question: 0 }));
    assert!(err.is_recoverable());

    let record = engine.get_or_create(1).await.unwrap();
    assert_eq!(record.quiz.answers().len(), 1);
    assert_eq!(record.quiz.score(), 1);
    assert_eq!(record.quiz.current_question(), 1);
  }

  #[tokio::test]
  async fn rejects_correct_index_outside_options() {
    let engine = engine();
    engine.start_quiz(1).await.unwrap();
    let err = engine.submit_answer(1, "a", 4, 4).await.unwrap_err();
    assert!(matches!(
      err,
      EngineError::InvalidQuestion {
        correct_index: 4,
        option_count: 4
      }
    ));
    let record = engine.get_or_create(1).await.unwrap();
    assert!(record.quiz.answers().is_empty());
  }

  #[tokio::test]
  async fn lock_entries_are_released_after_commands() {
    let engine = engine();
    engine.get_or_create(1).await.unwrap();
    engine.complete_chapter(2, 1).await.unwrap();
    assert!(engine.submit_answer(3, "a", 0, 4).await.is_err());
    assert!(engine.locks.is_empty());
  }

  #[tokio::test]
  async fn quiz_operations_require_active_quiz() {
    let engine = engine();
    assert!(matches!(
      engine.submit_answer(1, "a", 0, 4).await,
      Err(EngineError::NoActiveQuiz)
    ));
    assert!(matches!(engine.answer_current(1, "a").await, Err(EngineError::NoActiveQuiz)));
    assert!(matches!(engine.finish_quiz_if_due(1).await, Err(EngineError::NoActiveQuiz)));

    engine.open_quiz_intro(1).await.unwrap();
    assert!(matches!(engine.finish_quiz_if_due(1).await, Err(EngineError::NoActiveQuiz)));
    let record = engine.get_or_create(1).await.unwrap();
    assert_eq!(record.navigation.state, NavigationState::QuizIntro);
    assert_eq!(record.stats.tests_completed(), 0);
  }

  #[tokio::test]
  async fn completing_chapter_twice_changes_state_once() {
    let engine = engine();
    let first = engine.complete_chapter(1, 6).await.unwrap();
    assert!(first.newly_completed);
    assert_eq!(first.previous.chapters_completed, 0);
    let second = engine.complete_chapter(1, 6).await.unwrap();
    assert!(!second.newly_completed);
    assert_eq!(second.previous, first.record.stats.summary());
    let (first, second) = (first.record, second.record);
    assert_eq!(first.stats, {
      let mut stats = second.stats.clone();
      stats.last_active = first.stats.last_active;
      stats
    });
    assert_eq!(second.stats.chapters_completed(), 1);
  }

  #[tokio::test]
  async fn rejects_unknown_chapters_and_sections() {
    let engine = engine();
    assert!(matches!(
      engine.complete_chapter(1, 42).await,
      Err(EngineError::UnknownChapter(42))
    ));
    assert!(matches!(
      engine
        .set_navigation(1, NavigationState::ViewingSection, Some(1), Some(99))
        .await,
      Err(EngineError::UnknownSection {
        chapter: Some(1),
        section: 99
      })
    ));
    assert!(matches!(
      engine
        .set_navigation(1, NavigationState::ViewingSection, None, Some(1))
        .await,
      Err(EngineError::UnknownSection { chapter: None, .. })
    ));

    let record = engine
      .set_navigation(1, NavigationState::ViewingSection, Some(1), Some(2))
      .await
      .unwrap();
    assert_eq!(record.navigation.current_chapter, Some(1));
    assert_eq!(record.navigation.current_section, Some(2));
  }

  #[tokio::test]
  async fn stats_follow_completed_chapters() {
    let engine = engine();
    assert_eq!(engine.get_stats(3).await.unwrap().level, Level::Beginner);
    for chapter in 1 ..= 14 {
      engine.complete_chapter(3, chapter).await.unwrap();
    }
    let stats = engine.get_stats(3).await.unwrap();
    assert_eq!(stats.progress, 80);
    assert_eq!(stats.level, Level::Advanced);
    assert_eq!(stats.chapters_completed, 14);
  }

  #[tokio::test]
  async fn history_keeps_last_twenty() {
    let engine = engine();
    assert!(engine.get_history(1).await.unwrap().is_empty());
    for i in 0 .. 25 {
      engine.append_message(1, Role::User, &format!("saluton {i}")).await.unwrap();
    }
    let history = engine.get_history(1).await.unwrap();
    assert_eq!(history.len(), 20);
    assert_eq!(history[0].content, "saluton 5");
    assert_eq!(history[19].content, "saluton 24");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_answers_keep_score_consistent() {
    let engine = Arc::new(engine());
    engine.start_quiz(1).await.unwrap();
    let count = engine.catalog().quiz.len();

    let tasks: Vec<_> = (0 .. count)
      .map(|i| {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
          let raw = if i % 2 == 0 { "a" } else { "b" };
          engine.submit_answer(1, raw, 0, 4).await
        })
      })
      .collect();
    for task in tasks {
      task.await.unwrap().unwrap();
    }

    let record = engine.get_or_create(1).await.unwrap();
    let correct = record.quiz.answers().iter().filter(|answer| **answer).count();
    assert_eq!(record.quiz.answers().len(), count);
    assert_eq!(record.quiz.score() as usize, correct);
    assert_eq!(correct, count.div_ceil(2));
    assert_eq!(record.quiz.phase(), QuizPhase::Finished);
    assert!(engine.locks.is_empty());
  }
}
