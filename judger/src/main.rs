use std::{
    process::exit,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use anyhow::Context;
use arbiter_judger::{
    coordinator::{Coordinator, JudgeConfig},
    model::{Language, Problem, Submission, SubmissionId, UserId},
    prelude::CancellationTokenHandle,
    sandbox::{DockerSandbox, DockerSandboxConfig},
    scoring::FirstAcceptedPolicy,
};
use chrono::Utc;
use clap::Parser;
use once_cell::sync::Lazy;

mod opt;

static CTRL_C: AtomicBool = AtomicBool::new(false);
static ABORT: Lazy<CancellationTokenHandle> = Lazy::new(CancellationTokenHandle::new);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = opt::Opts::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    ctrlc::set_handler(handle_ctrl_c).context("Failed to set termination handler")?;

    match opts.cmd {
        opt::SubCmd::Run(cmd) => run(cmd).await,
    }
}

async fn run(cmd: opt::RunSubCmd) -> anyhow::Result<()> {
    let problem: Problem = serde_json::from_slice(
        &tokio::fs::read(&cmd.problem)
            .await
            .context("Reading problem definition")?,
    )
    .context("Parsing problem definition")?;
    let code = tokio::fs::read_to_string(&cmd.code)
        .await
        .context("Reading submission source")?;
    let language: Language = cmd.language.parse()?;

    let sandbox = Arc::new(
        DockerSandbox::connect_local(DockerSandboxConfig::default())
            .context("Connecting to the local Docker daemon")?,
    );
    if cmd.pull_images {
        sandbox.prepare_images(&[language]).await?;
    }

    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }
    });

    let coordinator = Coordinator::new(
        sandbox,
        Arc::new(FirstAcceptedPolicy::default()),
        JudgeConfig::default(),
        events_tx,
    );

    // First Ctrl-C press cancels the judging tree.
    let abort = coordinator.abort_handle();
    tokio::spawn(async move {
        ABORT.cancelled().await;
        abort.cancel();
    });

    let submission = Arc::new(Submission {
        id: SubmissionId::new(format!("local-{}", Utc::now().timestamp_millis())),
        user_id: UserId::new(&cmd.user),
        problem_id: problem.id.clone(),
        code,
        language,
        submitted_at: Utc::now(),
    });

    coordinator.submit(Arc::new(problem), submission).await?;
    coordinator.drain().await;
    drop(coordinator);
    printer.await.context("Event printer task failed")?;
    Ok(())
}

fn handle_ctrl_c() {
    if !CTRL_C.load(Ordering::SeqCst) {
        log::warn!("Cancelling running jobs... Press Ctrl-C again to force quit.");
        CTRL_C.store(true, Ordering::SeqCst);
        ABORT.cancel();
    } else {
        log::error!("Force quit!");
        exit(101);
    }
}
