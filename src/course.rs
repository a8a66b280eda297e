use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

const BUILTIN_COURSE: &str = include_str!("../content/course.json");
const MAX_OPTIONS: usize = 26;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
  pub id: u32,
  pub title: String,
  pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chapter {
  pub id: u32,
  pub title: String,
  pub sections: Vec<Section>,
}

impl Chapter {
  pub fn section(&self, section_id: u32) -> Option<&Section> {
    self.sections.iter().find(|section| section.id == section_id)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuizQuestion {
  pub question: String,
  pub options: Vec<String>,
  pub correct_answer: usize,
}

#[derive(Debug, Error)]
pub enum CatalogError {
  #[error("failed to read course file: {0}")]
  Io(#[from] std::io::Error),
  #[error("malformed course data: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("course has no chapters")]
  NoChapters,
  #[error("chapter id {0} is zero or duplicated")]
  BadChapterId(u32),
  #[error("chapter {chapter} has a zero or duplicated section id {section}")]
  BadSectionId { chapter: u32, section: u32 },
  #[error("question {0} needs between 2 and 26 options and a valid correct answer")]
  BadQuestion(usize),
}

/// Course content: ordered chapters with their sections, plus the quiz.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
  pub chapters: Vec<Chapter>,
  pub quiz: Vec<QuizQuestion>,
}

impl Catalog {
  pub fn builtin() -> Result<Self, CatalogError> {
    Self::from_json(BUILTIN_COURSE)
  }

  pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
    let raw = std::fs::read_to_string(path)?;
    Self::from_json(&raw)
  }

  pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
    let catalog: Self = serde_json::from_str(raw)?;
    catalog.validate()?;
    Ok(catalog)
  }

  pub fn chapter(&self, chapter_id: u32) -> Option<&Chapter> {
    self.chapters.iter().find(|chapter| chapter.id == chapter_id)
  }

  pub fn section(&self, chapter_id: u32, section_id: u32) -> Option<&Section> {
    self.chapter(chapter_id).and_then(|chapter| chapter.section(section_id))
  }

  pub fn question(&self, index: usize) -> Option<&QuizQuestion> {
    self.quiz.get(index)
  }

  pub fn chapter_count(&self) -> u32 {
    self.chapters.len() as u32
  }

  fn validate(&self) -> Result<(), CatalogError> {
    if self.chapters.is_empty() {
      return Err(CatalogError::NoChapters);
    }

    let mut chapter_ids = HashSet::new();
    for chapter in &self.chapters {
      if chapter.id == 0 || !chapter_ids.insert(chapter.id) {
        return Err(CatalogError::BadChapterId(chapter.id));
      }
      let mut section_ids = HashSet::new();
      for section in &chapter.sections {
        if section.id == 0 || !section_ids.insert(section.id) {
          return Err(CatalogError::BadSectionId {
            chapter: chapter.id,
            section: section.id,
          });
        }
      }
    }

    for (index, question) in self.quiz.iter().enumerate() {
      let options = question.options.len();
      if !(2 ..= MAX_OPTIONS).contains(&options) || question.correct_answer >= options {
        return Err(CatalogError::BadQuestion(index));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::Catalog;
  use super::CatalogError;

  #[test]
  fn builtin_course_has_fourteen_chapters() {
    let catalog = Catalog::builtin().unwrap();
    assert_eq!(catalog.chapter_count(), 14);
    assert!(!catalog.quiz.is_empty());
    assert!(catalog.chapters.iter().all(|chapter| !chapter.sections.is_empty()));
  }

  #[test]
  fn looks_up_sections() {
    let catalog = Catalog::builtin().unwrap();
    assert!(catalog.section(1, 1).is_some());
    assert!(catalog.section(1, 99).is_none());
    assert!(catalog.chapter(99).is_none());
  }

  #[test]
  fn rejects_duplicate_chapters() {
    let raw = r#"{
      "chapters": [
        {"id": 1, "title": "A", "sections": []},
        {"id": 1, "title": "B", "sections": []}
      ],
      "quiz": []
    }"#;
    assert!(matches!(Catalog::from_json(raw), Err(CatalogError::BadChapterId(1))));
  }

  #[test]
  fn rejects_out_of_range_correct_answer() {
    let raw = r#"{
      "chapters": [{"id": 1, "title": "A", "sections": []}],
      "quiz": [{"question": "?", "options": ["a", "b"], "correct_answer": 2}]
    }"#;
    assert!(matches!(Catalog::from_json(raw), Err(CatalogError::BadQuestion(0))));
  }

  #[test]
  fn rejects_empty_course() {
    let raw = r#"{"chapters": [], "quiz": []}"#;
    assert!(matches!(Catalog::from_json(raw), Err(CatalogError::NoChapters)));
  }
}
