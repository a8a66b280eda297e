use crate::engine::ProgressEngine;

pub struct AppContext {
  engine: ProgressEngine,
}

impl AppContext {
  pub fn new(engine: ProgressEngine) -> Self {
    Self { engine }
  }

  pub fn engine(&self) -> &ProgressEngine {
    &self.engine
  }
}
