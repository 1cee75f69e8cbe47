use clap::Parser;
use clip_video_adapter::core::{build_log_config, run, Learner};

fn main() -> anyhow::Result<()> {
    let lnr = Learner::parse();
    let _log_handle = log4rs::init_config(build_log_config(&lnr)?)?;
    log::debug!("{:?}", lnr);

    run(&lnr)?;
    Ok(())
}
