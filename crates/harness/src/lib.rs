pub mod browser;
pub mod fixtures;
pub mod tab;

pub use browser::TestBrowser;
pub use fixtures::{ManualClock, Product, ScriptedSubmitter, init_tracing};
pub use tab::{TabStore, TestTab};
