use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Parser, Debug, Clone)]
pub enum SubCmd {
    /// Judge a single submission against a problem definition, using the
    /// local Docker daemon as the sandbox
    #[clap(name = "run")]
    Run(RunSubCmd),
}

#[derive(Parser, Debug, Clone)]
pub struct RunSubCmd {
    /// Path of the problem definition JSON
    #[clap(long, short)]
    pub problem: PathBuf,

    /// Path of the submitted source file
    #[clap(long, short)]
    pub code: PathBuf,

    /// Language tag of the submission (python, c, cpp)
    #[clap(long, short)]
    pub language: String,

    /// User the submission is attributed to
    #[clap(long, default_value = "local")]
    pub user: String,

    /// Pull sandbox base images before judging
    #[clap(long)]
    pub pull_images: bool,
}
