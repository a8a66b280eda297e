use once_cell::sync::Lazy;
use regex::Regex;

static CHOICE_PATTERN: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^\s*(?:(?P<letter>[A-Za-z])|(?P<number>\d+))").expect("valid regex"));

const PROGRESS_BAR_CELLS: usize = 10;

/// Maps a learner's reply to a 0-based option index. Accepts a leading letter
/// (`a`, `B) ...`) or a leading 1-based number. `None` when the reply does not
/// name one of the `option_count` options.
pub fn parse_answer_choice(input: &str, option_count: usize) -> Option<usize> {
  let captures = CHOICE_PATTERN.captures(input)?;
  let index = if let Some(letter) = captures.name("letter") {
    let first = letter.as_str().chars().next()?.to_ascii_uppercase();
    (first as usize).checked_sub('A' as usize)?
  } else {
    let number = captures.name("number")?.as_str().parse::<usize>().ok()?;
    number.checked_sub(1)?
  };
  (index < option_count).then_some(index)
}

pub fn option_letter(index: usize) -> char {
  u8::try_from(index)
    .ok()
    .filter(|value| *value < 26)
    .map(|value| char::from(b'A' + value))
    .unwrap_or('?')
}

pub fn format_progress_bar(progress: u8) -> String {
  let filled = usize::from(progress.min(100)) * PROGRESS_BAR_CELLS / 100;
  format!(
    "{}{} {progress}%",
    "▓".repeat(filled),
    "░".repeat(PROGRESS_BAR_CELLS - filled)
  )
}

#[cfg(test)]
mod tests {
  use super::format_progress_bar;
  use super::option_letter;
  use super::parse_answer_choice;

  #[test]
  fn parses_letters_case_insensitively() {
    assert_eq!(parse_answer_choice("a", 4), Some(0));
    assert_eq!(parse_answer_choice("  C", 4), Some(2));
    assert_eq!(parse_answer_choice("d) la hundoj", 4), Some(3));
  }

  #[test]
  fn parses_one_based_numbers() {
    assert_eq!(parse_answer_choice("1", 4), Some(0));
    assert_eq!(parse_answer_choice("4.", 4), Some(3));
  }

  #[test]
  fn rejects_out_of_range_choices() {
    assert_eq!(parse_answer_choice("e", 4), None);
    assert_eq!(parse_answer_choice("0", 4), None);
    assert_eq!(parse_answer_choice("5", 4), None);
    assert_eq!(parse_answer_choice("", 4), None);
    assert_eq!(parse_answer_choice("?", 4), None);
    assert_eq!(parse_answer_choice("ĉu", 4), None);
  }

  #[test]
  fn labels_options() {
    assert_eq!(option_letter(0), 'A');
    assert_eq!(option_letter(3), 'D');
    assert_eq!(option_letter(30), '?');
  }

  #[test]
  fn renders_progress_bar() {
    assert_eq!(format_progress_bar(0), "░░░░░░░░░░ 0%");
    assert_eq!(format_progress_bar(34), "▓▓▓░░░░░░░ 34%");
    assert_eq!(format_progress_bar(100), "▓▓▓▓▓▓▓▓▓▓ 100%");
  }
}
