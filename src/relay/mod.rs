pub mod date;
pub mod shortcut;
pub mod stream;

pub use date::ResolvedDate;
pub use shortcut::find_shortcut;
pub use stream::{RelayContext, RelayOutcome, RelaySummary, pump};
