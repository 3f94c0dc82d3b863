mod check;
mod run;
mod serve;

pub use check::cmd_check;
pub use run::cmd_run;
pub use serve::cmd_serve;
