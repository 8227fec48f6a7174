#[macro_use]
pub mod macros;

pub mod file_utils;
pub mod log_setup;
pub mod stage_timer;

pub use log_setup::setup_logging;
pub use stage_timer::StageTimer;
pub use uuid;

pub fn is_debug() -> bool {
    cfg!(debug_assertions)
}
