use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuizPhase {
  #[default]
  Idle,
  Intro,
  InProgress,
  Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuizError {
  #[error("no quiz is in progress")]
  NoActiveQuiz,
  #[error("quiz has no questions")]
  Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizResult {
  pub score: u32,
  pub total_questions: u32,
  pub completed_at: DateTime<Utc>,
}

/// Transient state of a single quiz attempt.
///
/// `score` always equals the number of `true` entries in `answers`; both are
/// only touched by [`QuizProgress::answer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QuizProgress {
  phase: QuizPhase,
  answers: Vec<bool>,
  score: u32,
  current_question: usize,
  question_count: usize,
}

impl QuizProgress {
  pub fn phase(&self) -> QuizPhase {
    self.phase
  }

  pub fn answers(&self) -> &[bool] {
    &self.answers
  }

  pub fn score(&self) -> u32 {
    self.score
  }

  pub fn current_question(&self) -> usize {
    self.current_question
  }

  pub fn question_count(&self) -> usize {
    self.question_count
  }

  pub fn is_active(&self) -> bool {
    self.phase == QuizPhase::InProgress
  }

  /// Shows the quiz intro. An attempt already underway is left alone.
  pub fn open_intro(&mut self) {
    if matches!(self.phase, QuizPhase::Idle | QuizPhase::Finished) {
      self.reset(QuizPhase::Intro, 0);
    }
  }

  pub fn start(&mut self, question_count: usize) -> Result<usize, QuizError> {
    if question_count == 0 {
      return Err(QuizError::Empty);
    }
    self.reset(QuizPhase::InProgress, question_count);
    Ok(self.current_question)
  }

  /// Records one answer and moves to the next question, switching to
  /// `Finished` once the last question has been answered.
  pub fn answer(&mut self, is_correct: bool) -> Result<(), QuizError> {
    if !self.is_active() {
      return Err(QuizError::NoActiveQuiz);
    }
    self.answers.push(is_correct);
    if is_correct {
      self.score += 1;
    }
    self.current_question += 1;
    if self.current_question >= self.question_count {
      self.phase = QuizPhase::Finished;
    }
    Ok(())
  }

  /// Whether a finished attempt is waiting to be recorded. Fails when no
  /// attempt was started.
  pub fn is_due(&self) -> Result<bool, QuizError> {
    match self.phase {
      QuizPhase::Finished => Ok(true),
      QuizPhase::InProgress => Ok(false),
      QuizPhase::Idle | QuizPhase::Intro => Err(QuizError::NoActiveQuiz),
    }
  }

  pub fn complete(&mut self, now: DateTime<Utc>) -> Result<QuizResult, QuizError> {
    if self.phase != QuizPhase::Finished {
      return Err(QuizError::NoActiveQuiz);
    }
    let result = QuizResult {
      score: self.score,
      total_questions: self.answers.len() as u32,
      completed_at: now,
    };
    self.reset(QuizPhase::Idle, 0);
    Ok(result)
  }

  fn reset(&mut self, phase: QuizPhase, question_count: usize) {
    self.phase = phase;
    self.answers.clear();
    self.score = 0;
    self.current_question = 0;
    self.question_count = question_count;
  }
}
