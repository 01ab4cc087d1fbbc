//! Docker-backed [`Sandbox`] implementation.
//!
//! Every compile and every test case run gets its own throwaway container:
//! no network, no host mounts, a hard memory ceiling, a capped pid count and
//! a capped CPU share. The container is force-removed as soon as the run
//! finishes, so nothing survives between invocations.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        RemoveContainerOptions, StartContainerOptions, StatsOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions},
    models::HostConfig,
    Docker,
};
use bytes::{Bytes, BytesMut};
use derive_builder::Builder;
use futures::stream::StreamExt;
use names::{Generator, Name};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use super::util::{
    exit_signal, is_recoverable_error, signal_name, tail_excerpt, tar_with_files, CappedBuffer,
};
use super::{Artifact, CompileOutcome, ExecutionOutcome, ResourceLimits, Sandbox, SandboxFault};
use crate::model::Language;

/// Working directory inside every scratch container.
const SANDBOX_WORKDIR: &str = "/box";
/// Name of the build output for compiled languages.
const BINARY_NAME: &str = "prog";
/// Wall-clock slack granted on top of the declared time limit before the run
/// is cut off. Keeps reported times at most this far above the limit.
const TIME_LIMIT_GRACE_MS: u64 = 50;
/// Cap on stderr kept for diagnostics.
const STDERR_CAP_BYTES: usize = 64 * 1024;
/// Length of the stderr tail shown to submitters.
const STDERR_EXCERPT_BYTES: usize = 2048;
/// Time limit for sandbox housekeeping commands.
const HOUSEKEEPING_TIMEOUT_MS: u64 = 10_000;

/// Host-level tuning for the Docker sandbox, analogous to a judger's
/// machine-local config file.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[serde(default)]
#[builder(setter(into, strip_option), default)]
pub struct DockerSandboxConfig {
    /// CPU share available while running user code, as a fraction of one
    /// core.
    pub run_cpu_share: f64,
    /// CPU share available to compilers.
    pub compile_cpu_share: f64,
    /// User to run containers as. `None` keeps the image default.
    pub docker_user: Option<String>,
    /// Hard cap on processes inside a container. Blunts fork bombs.
    pub pids_limit: i64,
}

impl Default for DockerSandboxConfig {
    fn default() -> Self {
        DockerSandboxConfig {
            run_cpu_share: 1.0,
            compile_cpu_share: 1.0,
            docker_user: None,
            pids_limit: 64,
        }
    }
}

struct LanguageSpec {
    image: &'static str,
    compile: Option<&'static [&'static str]>,
    run: &'static [&'static str],
}

fn language_spec(language: Language) -> LanguageSpec {
    match language {
        Language::Python => LanguageSpec {
            image: "python:3.10-slim",
            compile: None,
            run: &["python3", "main.py"],
        },
        Language::C => LanguageSpec {
            image: "gcc:11",
            compile: Some(&["gcc", "-O2", "-o", BINARY_NAME, "main.c"]),
            run: &["./prog"],
        },
        Language::Cpp => LanguageSpec {
            image: "gcc:11",
            compile: Some(&["g++", "-O2", "-std=c++17", "-o", BINARY_NAME, "main.cpp"]),
            run: &["./prog"],
        },
    }
}

fn random_tag() -> String {
    Generator::with_naming(Name::Plain)
        .next()
        .unwrap_or_else(|| "scratch".into())
}

pub struct DockerSandbox {
    docker: Docker,
    cfg: DockerSandboxConfig,
}

impl DockerSandbox {
    pub fn new(docker: Docker, cfg: DockerSandboxConfig) -> DockerSandbox {
        DockerSandbox { docker, cfg }
    }

    /// Connect to the local Docker daemon with default settings.
    pub fn connect_local(cfg: DockerSandboxConfig) -> Result<DockerSandbox, SandboxFault> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(DockerSandbox::new(docker, cfg))
    }

    /// Pull the base images for the given languages ahead of time, so that
    /// the first judged submission does not pay the pull cost inside its
    /// time budget.
    pub async fn prepare_images(&self, languages: &[Language]) -> Result<(), SandboxFault> {
        let mut images: Vec<&str> = languages
            .iter()
            .map(|&l| language_spec(l).image)
            .collect();
        images.sort_unstable();
        images.dedup();

        for image in images {
            tracing::info!(%image, "Pulling sandbox base image");
            let results = self
                .docker
                .create_image(
                    Some(bollard::image::CreateImageOptions {
                        from_image: image,
                        ..Default::default()
                    }),
                    None,
                    None,
                )
                .collect::<Vec<_>>()
                .await;
            results
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(SandboxFault::Docker)?;
        }
        Ok(())
    }

    async fn scratch_container(
        &self,
        image: &str,
        limits: &ResourceLimits,
        cpu_share: f64,
    ) -> Result<ScratchContainer<'_>, SandboxFault> {
        let mem_bytes = (limits.memory_limit_kb * 1024) as i64;
        let name = format!("arbiter-box-{}", random_tag());
        let res = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name: name.as_str() }),
                Config::<String> {
                    image: Some(image.to_owned()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    user: self.cfg.docker_user.clone(),
                    entrypoint: Some(vec!["sh".into()]),
                    // Untrusted code gets no network, ever.
                    network_disabled: Some(true),
                    host_config: Some(HostConfig {
                        memory: Some(mem_bytes),
                        // Same value for swap, so the limit is a hard ceiling
                        // instead of a spill point.
                        memory_swap: Some(mem_bytes),
                        nano_cpus: Some((cpu_share * 1e9) as i64),
                        pids_limit: Some(self.cfg.pids_limit),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        let container = ScratchContainer {
            docker: &self.docker,
            id: res.id,
        };
        self.docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await?;
        container.ensure_workdir().await?;
        Ok(container)
    }

    async fn compile_in(
        &self,
        container: &ScratchContainer<'_>,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<CompileOutcome, SandboxFault> {
        let spec = language_spec(language);
        let compile_cmd = spec
            .compile
            .expect("compile_in called for a language without a compile step");

        container
            .upload_files(vec![(
                language.source_file_name().to_owned(),
                Bytes::from(code.to_owned()),
            )])
            .await?;

        let run = container.exec(compile_cmd, None, limits).await?;

        if run.timed_out {
            return Ok(CompileOutcome::Error {
                message: "compilation timed out".into(),
            });
        }
        match run.exit_code {
            Some(0) => {
                let archive = container
                    .download_archive(&format!("{}/{}", SANDBOX_WORKDIR, BINARY_NAME))
                    .await?;
                Ok(CompileOutcome::Success(Artifact::Binary {
                    language,
                    archive,
                }))
            }
            Some(_) => Ok(CompileOutcome::Error {
                message: tail_excerpt(&run.stderr, STDERR_EXCERPT_BYTES),
            }),
            None => Err(SandboxFault::Internal(
                "compile step reported no exit code".into(),
            )),
        }
    }

    async fn run_in(
        &self,
        container: &ScratchContainer<'_>,
        artifact: &Artifact,
        input: &str,
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome, SandboxFault> {
        let spec = language_spec(artifact.language());

        match artifact {
            Artifact::Source { language, code } => {
                container
                    .upload_files(vec![(
                        language.source_file_name().to_owned(),
                        Bytes::from(code.clone()),
                    )])
                    .await?;
            }
            Artifact::Binary { archive, .. } => {
                container.upload_archive(archive.clone()).await?;
            }
        }

        let run = container.exec(spec.run, Some(input), limits).await?;

        if run.timed_out {
            let time_ms = run.wall_ms.min(limits.time_limit_ms + TIME_LIMIT_GRACE_MS);
            return Ok(ExecutionOutcome::TimeLimitExceeded { time_ms });
        }
        if run.stdout_overflowed {
            return Ok(ExecutionOutcome::OutputLimitExceeded);
        }

        let memory_kb = container.max_memory_kb().await;
        let exit_code = match run.exit_code {
            Some(code) => code,
            None => {
                return Err(SandboxFault::Internal(
                    "run step reported no exit code".into(),
                ))
            }
        };

        if exit_code == 0 {
            return Ok(ExecutionOutcome::Completed {
                stdout: run.stdout,
                exit_code,
                time_ms: run.wall_ms,
                memory_kb,
            });
        }

        if let Some(signal) = exit_signal(exit_code) {
            // A SIGKILL together with memory pressure near the ceiling is the
            // cgroup OOM killer at work.
            let oom = container.oom_killed().await
                || memory_kb.saturating_mul(100) >= limits.memory_limit_kb.saturating_mul(95);
            if signal == 9 && oom {
                return Ok(ExecutionOutcome::MemoryLimitExceeded {
                    memory_kb: memory_kb.max(limits.memory_limit_kb),
                });
            }
            let stderr_excerpt = if run.stderr.is_empty() {
                format!("killed by {} (signal {})", signal_name(signal), signal)
            } else {
                tail_excerpt(&run.stderr, STDERR_EXCERPT_BYTES)
            };
            return Ok(ExecutionOutcome::RuntimeError {
                exit_code,
                stderr_excerpt,
            });
        }

        Ok(ExecutionOutcome::RuntimeError {
            exit_code,
            stderr_excerpt: tail_excerpt(&run.stderr, STDERR_EXCERPT_BYTES),
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn compile(
        &self,
        code: &str,
        language: Language,
        limits: &ResourceLimits,
    ) -> Result<CompileOutcome, SandboxFault> {
        if !language.requires_compilation() {
            return Ok(CompileOutcome::Success(Artifact::Source {
                language,
                code: code.to_owned(),
            }));
        }

        let spec = language_spec(language);
        let container = self
            .scratch_container(spec.image, limits, self.cfg.compile_cpu_share)
            .await?;
        tracing::debug!(container = %container.id, %language, "Compiling submission");
        let result = self.compile_in(&container, code, language, limits).await;
        container.remove().await;
        result
    }

    async fn execute(
        &self,
        artifact: &Artifact,
        input: &str,
        limits: &ResourceLimits,
    ) -> Result<ExecutionOutcome, SandboxFault> {
        let spec = language_spec(artifact.language());
        let container = self
            .scratch_container(spec.image, limits, self.cfg.run_cpu_share)
            .await?;
        tracing::debug!(container = %container.id, "Running test case");
        let result = self.run_in(&container, artifact, input, limits).await;
        container.remove().await;
        result
    }
}

/// One throwaway container. Created started, removed by force when done.
struct ScratchContainer<'a> {
    docker: &'a Docker,
    id: String,
}

struct ExecRun {
    exit_code: Option<i64>,
    stdout: String,
    stdout_overflowed: bool,
    stderr: String,
    timed_out: bool,
    wall_ms: u64,
}

impl ScratchContainer<'_> {
    /// The workdir must exist before uploads and execs can target it.
    async fn ensure_workdir(&self) -> Result<(), SandboxFault> {
        let limits = ResourceLimits {
            time_limit_ms: HOUSEKEEPING_TIMEOUT_MS,
            memory_limit_kb: u64::MAX / 1024,
            output_limit_bytes: 1024,
        };
        let run = self
            .exec_at(&["mkdir", "-p", SANDBOX_WORKDIR], None, &limits, None)
            .await?;
        match run.exit_code {
            Some(0) => Ok(()),
            _ => Err(SandboxFault::Internal(
                "failed to set up container workdir".into(),
            )),
        }
    }

    async fn upload_files(&self, files: Vec<(String, Bytes)>) -> Result<(), SandboxFault> {
        let (tar, archiving) = tar_with_files(files.into_iter());
        self.docker
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: SANDBOX_WORKDIR,
                    no_overwrite_dir_non_dir: "false",
                }),
                hyper::Body::wrap_stream(tar),
            )
            .await?;
        archiving
            .await
            .map_err(|e| SandboxFault::Internal(format!("tar task failed: {}", e)))??;
        Ok(())
    }

    async fn upload_archive(&self, archive: Bytes) -> Result<(), SandboxFault> {
        self.docker
            .upload_to_container(
                &self.id,
                Some(UploadToContainerOptions {
                    path: SANDBOX_WORKDIR,
                    no_overwrite_dir_non_dir: "false",
                }),
                hyper::Body::from(archive),
            )
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        argv: &[&str],
        stdin: Option<&str>,
        limits: &ResourceLimits,
    ) -> Result<ExecRun, SandboxFault> {
        self.exec_at(argv, stdin, limits, Some(SANDBOX_WORKDIR)).await
    }

    async fn exec_at(
        &self,
        argv: &[&str],
        stdin: Option<&str>,
        limits: &ResourceLimits,
        working_dir: Option<&str>,
    ) -> Result<ExecRun, SandboxFault> {
        let exec = self
            .docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: working_dir.map(str::to_owned),
                    env: Some(vec!["JUDGE=1".to_owned(), "CI=1".to_owned()]),
                    cmd: Some(argv.iter().map(|s| s.to_string()).collect()),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions { detach: false }))
            .await?;

        let (mut output, input) = match started {
            bollard::exec::StartExecResults::Attached { output, input } => (output, input),
            bollard::exec::StartExecResults::Detached => {
                return Err(SandboxFault::Internal(
                    "exec unexpectedly started detached".into(),
                ))
            }
        };

        // Feed stdin on its own task so a program that floods stdout before
        // reading its input cannot deadlock the judge.
        let stdin_bytes = stdin.map(|s| {
            let mut bytes = s.as_bytes().to_vec();
            if !bytes.ends_with(b"\n") {
                bytes.push(b'\n');
            }
            bytes
        });
        let writer = tokio::spawn(async move {
            let mut input = input;
            if let Some(bytes) = stdin_bytes {
                let _ = input.write_all(&bytes).await;
            }
            let _ = input.shutdown().await;
        });

        let mut stdout = CappedBuffer::new(limits.output_limit_bytes as usize);
        let mut stderr = CappedBuffer::new(STDERR_CAP_BYTES);

        let started_at = Instant::now();
        let deadline = Duration::from_millis(limits.time_limit_ms + TIME_LIMIT_GRACE_MS);
        let drained = tokio::time::timeout(deadline, async {
            while let Some(chunk) = output.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) if is_recoverable_error(&e) => continue,
                    Err(e) => return Err(SandboxFault::Docker(e)),
                };
                match chunk {
                    bollard::container::LogOutput::StdOut { message } => stdout.append(&message),
                    bollard::container::LogOutput::StdErr { message } => stderr.append(&message),
                    bollard::container::LogOutput::StdIn { .. } => {}
                    bollard::container::LogOutput::Console { .. } => {}
                }
            }
            Ok(())
        })
        .await;
        let wall_ms = started_at.elapsed().as_millis() as u64;

        let timed_out = match drained {
            Ok(result) => {
                result?;
                false
            }
            Err(_elapsed) => {
                writer.abort();
                true
            }
        };

        let exit_code = if timed_out {
            None
        } else {
            self.docker.inspect_exec(&exec.id).await?.exit_code
        };

        Ok(ExecRun {
            exit_code,
            stdout_overflowed: stdout.overflowed(),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            timed_out,
            wall_ms,
        })
    }

    async fn download_archive(&self, path: &str) -> Result<Bytes, SandboxFault> {
        let mut stream = self.docker.download_from_container(
            &self.id,
            Some(DownloadFromContainerOptions { path }),
        );
        let mut archive = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive.freeze())
    }

    async fn oom_killed(&self) -> bool {
        self.docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|c| c.state)
            .and_then(|s| s.oom_killed)
            .unwrap_or(false)
    }

    /// Peak memory use of the container's cgroup, in KiB. Returns 0 when
    /// stats are unavailable; callers treat that as "unknown", not "none".
    async fn max_memory_kb(&self) -> u64 {
        let mut stream = self.docker.stats(
            &self.id,
            Some(StatsOptions {
                stream: false,
                ..Default::default()
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => stats
                .memory_stats
                .max_usage
                .or(stats.memory_stats.usage)
                .unwrap_or(0)
                .saturating_div(1024),
            _ => 0,
        }
    }

    /// Force-remove the container; the environment is disposable and errors
    /// here only matter to operators.
    async fn remove(self) {
        let res = self
            .docker
            .remove_container(
                &self.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = res {
            tracing::warn!(container = %self.id, "Failed to remove scratch container: {}", e);
        }
    }
}
