#![allow(clippy::missing_errors_doc)]
#![allow(missing_docs)]

mod estimate;
mod helpers;
mod info;
mod init_metaparams;
mod optimize;
mod prune;

use anyhow::Result;
use clap::Parser;
use enum_dispatch::enum_dispatch;
use floatlm::sort::MemSize;
use std::process::ExitCode;

#[derive(Parser)]
pub struct GlobalConfiguration {
    /// Memory budget for sorting, e.g. `500M` or `20%`; sorts spill to the
    /// temporary directory beyond it.
    #[arg(long, value_name = "SIZE")]
    pub max_memory: Option<MemSize>,
}

#[enum_dispatch]
pub trait Subcommand {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode>;
}

#[enum_dispatch(Subcommand)]
#[derive(Parser)]
pub enum SubcommandEnum {
    Estimate(estimate::Opts),
    Info(info::Opts),
    InitMetaparams(init_metaparams::Opts),
    Optimize(optimize::Opts),
    Prune(prune::Opts),
}

#[derive(Parser)]
#[command(
    arg_required_else_help = true,
    author,
    about,
    disable_help_subcommand = true,
    name = "floatlm",
    version
)]
pub struct Opts {
    #[command(flatten)]
    pub configuration: GlobalConfiguration,
    #[command(subcommand)]
    pub subcommand: SubcommandEnum,
}
