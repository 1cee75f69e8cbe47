mod parser;
mod recoder;
mod runloops;
pub use parser::{Learner, WhichDType};
pub use recoder::{build_log_config, run_dir};
pub use runloops::{count_size, count_size_human, run};
