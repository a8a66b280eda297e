use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_TOTAL_CHAPTERS: u32 = 14;
pub const DEFAULT_MAX_TESTS_COUNTED: u32 = 10;

const CHAPTER_WEIGHT: f64 = 0.8;
const TEST_WEIGHT: f64 = 0.2;
const ADVANCED_THRESHOLD: u8 = 80;
const INTERMEDIATE_THRESHOLD: u8 = 40;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Level {
  #[default]
  Beginner,
  Intermediate,
  Advanced,
}

impl Level {
  /// Thresholds are inclusive and checked highest-first.
  pub fn from_progress(progress: u8) -> Self {
    if progress >= ADVANCED_THRESHOLD {
      Self::Advanced
    } else if progress >= INTERMEDIATE_THRESHOLD {
      Self::Intermediate
    } else {
      Self::Beginner
    }
  }
}

impl fmt::Display for Level {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Beginner => "Beginner",
      Self::Intermediate => "Intermediate",
      Self::Advanced => "Advanced",
    };
    f.write_str(label)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("total chapter count must be greater than zero")]
  NoChapters,
  #[error("counted test limit must be greater than zero")]
  NoCountedTests,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRules {
  total_chapters: u32,
  max_tests_counted: u32,
}

impl ProgressRules {
  pub fn new(total_chapters: u32, max_tests_counted: u32) -> Result<Self, ConfigError> {
    if total_chapters == 0 {
      return Err(ConfigError::NoChapters);
    }
    if max_tests_counted == 0 {
      return Err(ConfigError::NoCountedTests);
    }
    Ok(Self {
      total_chapters,
      max_tests_counted,
    })
  }

  pub fn total_chapters(&self) -> u32 {
    self.total_chapters
  }
}

impl Default for ProgressRules {
  fn default() -> Self {
    Self {
      total_chapters: DEFAULT_TOTAL_CHAPTERS,
      max_tests_counted: DEFAULT_MAX_TESTS_COUNTED,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
  pub progress: u8,
  pub level: Level,
}

/// Blends chapter completion (80%) with test activity (20%) into a 0..=100
/// percentage. Tests beyond `max_tests_counted` add nothing.
pub fn compute_progress(chapters_completed: u32, tests_completed: u32, rules: &ProgressRules) -> ProgressSnapshot {
  let chapter_progress = f64::from(chapters_completed) / f64::from(rules.total_chapters) * 100.0;
  let test_progress = (f64::from(tests_completed) / f64::from(rules.max_tests_counted)).min(1.0) * 100.0;
  let blended = (chapter_progress * CHAPTER_WEIGHT + test_progress * TEST_WEIGHT).round();
  let progress = blended.clamp(0.0, 100.0) as u8;
  ProgressSnapshot {
    progress,
    level: Level::from_progress(progress),
  }
}
