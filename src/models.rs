use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::history::ConversationHistory;
use crate::history::Role;
use crate::progress::Level;
use crate::progress::ProgressRules;
use crate::progress::compute_progress;
use crate::quiz::QuizError;
use crate::quiz::QuizProgress;
use crate::quiz::QuizResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NavigationState {
  #[default]
  Browsing,
  BrowsingChapters,
  BrowsingSections,
  ViewingSection,
  QuizIntro,
  Quiz,
  AiChat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Navigation {
  pub state: NavigationState,
  pub current_chapter: Option<u32>,
  pub current_section: Option<u32>,
}

impl Navigation {
  pub fn at(state: NavigationState) -> Self {
    Self {
      state,
      current_chapter: None,
      current_section: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
  chapters_completed: u32,
  completed_chapter_ids: BTreeSet<u32>,
  tests_completed: u32,
  quiz_results: Vec<QuizResult>,
  progress: u8,
  level: Level,
  pub last_active: DateTime<Utc>,
  pub registration_date: DateTime<Utc>,
}

impl Stats {
  fn new(now: DateTime<Utc>) -> Self {
    Self {
      chapters_completed: 0,
      completed_chapter_ids: BTreeSet::new(),
      tests_completed: 0,
      quiz_results: Vec::new(),
      progress: 0,
      level: Level::Beginner,
      last_active: now,
      registration_date: now,
    }
  }

  pub fn chapters_completed(&self) -> u32 {
    self.chapters_completed
  }

  pub fn completed_chapter_ids(&self) -> &BTreeSet<u32> {
    &self.completed_chapter_ids
  }

  pub fn tests_completed(&self) -> u32 {
    self.tests_completed
  }

  pub fn quiz_results(&self) -> &[QuizResult] {
    &self.quiz_results
  }

  pub fn progress(&self) -> u8 {
    self.progress
  }

  pub fn level(&self) -> Level {
    self.level
  }

  pub fn summary(&self) -> StatsSummary {
    StatsSummary {
      level: self.level,
      progress: self.progress,
      chapters_completed: self.chapters_completed,
      tests_completed: self.tests_completed,
    }
  }

  // Only place progress and level are written.
  fn refresh(&mut self, rules: &ProgressRules) {
    let snapshot = compute_progress(self.chapters_completed, self.tests_completed, rules);
    self.progress = snapshot.progress;
    self.level = snapshot.level;
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSummary {
  pub level: Level,
  pub progress: u8,
  pub chapters_completed: u32,
  pub tests_completed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
  pub user_id: i64,
  pub navigation: Navigation,
  pub quiz: QuizProgress,
  pub stats: Stats,
  pub conversation_history: ConversationHistory,
}

impl UserRecord {
  pub fn new(user_id: i64, now: DateTime<Utc>) -> Self {
    Self {
      user_id,
      navigation: Navigation::default(),
      quiz: QuizProgress::default(),
      stats: Stats::new(now),
      conversation_history: ConversationHistory::default(),
    }
  }

  pub fn touch(&mut self, now: DateTime<Utc>) {
    self.stats.last_active = now;
  }

  /// Marks a chapter done. Returns `false` when it was already recorded.
  pub fn complete_chapter(&mut self, chapter_id: u32, rules: &ProgressRules) -> bool {
    if !self.stats.completed_chapter_ids.insert(chapter_id) {
      return false;
    }
    self.stats.chapters_completed = self.stats.completed_chapter_ids.len() as u32;
    self.stats.refresh(rules);
    true
  }

  /// Shows the quiz intro, or keeps the learner in a quiz already underway.
  pub fn open_quiz_intro(&mut self) {
    self.quiz.open_intro();
    let state = if self.quiz.is_active() {
      NavigationState::Quiz
    } else {
      NavigationState::QuizIntro
    };
    self.navigation = Navigation::at(state);
  }

  pub fn start_quiz(&mut self, question_count: usize) -> Result<usize, QuizError> {
    let first = self.quiz.start(question_count)?;
    self.navigation = Navigation::at(NavigationState::Quiz);
    Ok(first)
  }

  /// Stores a finished attempt and sends the learner back to browsing.
  pub fn complete_quiz(&mut self, now: DateTime<Utc>, rules: &ProgressRules) -> Result<QuizResult, QuizError> {
    let result = self.quiz.complete(now)?;
    self.stats.quiz_results.push(result.clone());
    self.stats.tests_completed += 1;
    self.stats.refresh(rules);
    self.navigation = Navigation::at(NavigationState::Browsing);
    Ok(result)
  }

  pub fn append_message(&mut self, role: Role, content: impl Into<String>, now: DateTime<Utc>) {
    self.conversation_history.push(role, content, now);
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::NavigationState;
  use super::UserRecord;
  use crate::progress::Level;
  use crate::progress::ProgressRules;
  use crate::quiz::QuizError;
  use crate::quiz::QuizPhase;

  #[test]
  fn new_record_starts_empty() {
    let record = UserRecord::new(7, Utc::now());
    assert_eq!(record.stats.chapters_completed(), 0);
    assert_eq!(record.stats.tests_completed(), 0);
    assert_eq!(record.stats.progress(), 0);
    assert_eq!(record.stats.level(), Level::Beginner);
    assert!(record.stats.completed_chapter_ids().is_empty());
    assert_eq!(record.navigation.state, NavigationState::Browsing);
    assert_eq!(record.stats.registration_date, record.stats.last_active);
  }

  #[test]
  fn completing_chapter_twice_counts_once() {
    let rules = ProgressRules::default();
    let mut record = UserRecord::new(1, Utc::now());
    assert!(record.complete_chapter(3, &rules));
    let after_first = record.clone();
    assert!(!record.complete_chapter(3, &rules));
    assert_eq!(record, after_first);
    assert_eq!(record.stats.chapters_completed(), 1);
    assert_eq!(record.stats.progress(), 6);
  }

  #[test]
  fn chapters_may_be_completed_out_of_order() {
    let rules = ProgressRules::default();
    let mut record = UserRecord::new(1, Utc::now());
    for chapter in [14, 2, 9, 1, 5, 7, 11] {
      record.complete_chapter(chapter, &rules);
    }
    assert_eq!(record.stats.chapters_completed(), 7);
    assert_eq!(record.stats.progress(), 40);
    assert_eq!(record.stats.level(), Level::Intermediate);
  }

  #[test]
  fn finished_quiz_updates_stats() {
    let rules = ProgressRules::default();
    let mut record = UserRecord::new(1, Utc::now());
    record.start_quiz(3).unwrap();
    assert_eq!(record.navigation.state, NavigationState::Quiz);
    for correct in [true, true, false] {
      record.quiz.answer(correct).unwrap();
    }

    let result = record.complete_quiz(Utc::now(), &rules).unwrap();
    assert_eq!(result.score, 2);
    assert_eq!(record.stats.tests_completed(), 1);
    assert_eq!(record.stats.quiz_results().len(), 1);
    assert_eq!(record.stats.quiz_results()[0].score, 2);
    assert_eq!(record.stats.progress(), 2);
    assert_eq!(record.quiz.phase(), QuizPhase::Idle);
    assert_eq!(record.navigation.state, NavigationState::Browsing);
  }

  #[test]
  fn unfinished_quiz_cannot_be_completed() {
    let rules = ProgressRules::default();
    let mut record = UserRecord::new(1, Utc::now());
    record.start_quiz(2).unwrap();
    record.quiz.answer(true).unwrap();
    assert_eq!(record.complete_quiz(Utc::now(), &rules), Err(QuizError::NoActiveQuiz));
    assert_eq!(record.stats.tests_completed(), 0);
  }
}
