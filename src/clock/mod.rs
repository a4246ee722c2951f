//! Master-clock divider configuration and the recovered clock output

mod app_pll;
mod output;
mod table;

pub use app_pll::{AppPllSettings, Fraction};
pub use output::RecoveredClockOutput;
pub use table::{DividerEntry, FractionalDividerTable, TableGenerator, TableStats};
