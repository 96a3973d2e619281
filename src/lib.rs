pub mod core;

pub use crate::core::config::{CachePaths, Config, YearMonth};
pub use crate::core::hash::{HashFunction, ImageHasher, PerceptualHash};
pub use crate::core::presenter::{Decision, HeadlessPresenter, Presenter, TerminalPresenter};
pub use crate::core::session::{Session, SessionSummary};
