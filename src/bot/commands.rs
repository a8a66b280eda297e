use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
  /// Open the main menu
  Start,
  /// Show the help text
  Help,
  /// Browse the course chapters
  Chapters,
  /// Take the quiz
  Quiz,
  /// Show your level and progress
  Stats,
  /// Write notes and questions to your tutor log
  Ask,
  /// Show your recent tutor log
  History,
  /// Leave the current activity
  Cancel,
}
