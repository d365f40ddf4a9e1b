/// Docker-based sandbox: one disposable container per compile or run
///
/// **Container Rules:**
/// 1. Network disabled, read-only root filesystem, small tmpfs at /tmp
/// 2. Hard memory cap (swap disabled), CPU quota, pid limit
/// 3. Artifact directory mounted at /code, stdin file at /input
/// 4. Run containers drop every capability and mount /code read-only
/// 5. Wall-clock timeout kills the container
/// 6. The container is force-removed on every exit path, including a run
///    whose future is dropped part way
use super::{
    bytes_to_mb, Artifact, CompileOutput, ExitStatus, RunRequest, RunResult, Sandbox,
    SandboxError,
};
use arbiter_common::LanguageProfile;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, Stats, StatsOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Label carried by every container this sandbox creates
pub const SANDBOX_LABEL: &str = "arbiter.sandbox";

const CODE_MOUNT: &str = "/code";
const INPUT_MOUNT: &str = "/input";
const STDIN_FILE: &str = "stdin.txt";
const CPU_PERIOD: i64 = 100_000;
// Docker rejects quotas below 1ms
const MIN_CPU_QUOTA: i64 = 1_000;
const PIDS_LIMIT: i64 = 128;
const COMPILE_MEMORY_FLOOR_MB: u64 = 512;
const MAX_CAPTURED_BYTES: usize = 1 << 20;
const MAX_MEMORY_LIMIT_MB: u64 = 64 * 1024;
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(5);

/// What to launch and under which limits
struct ContainerSpec {
    image: String,
    cmd: Vec<String>,
    binds: Vec<String>,
    memory_limit_mb: u64,
    cpu_share: f64,
    drop_capabilities: bool,
    timeout: Duration,
}

/// Raw facts about one finished container
#[derive(Debug)]
struct ContainerRun {
    exit_code: Option<i64>,
    timed_out: bool,
    oom_killed: bool,
    stdout: String,
    stderr: String,
    wall_time_ms: u64,
    peak_memory_mb: f64,
}

pub struct DockerSandbox {
    docker: Docker,
    workdir_root: PathBuf,
}

impl DockerSandbox {
    /// Connect to the local daemon (socket or DOCKER_HOST)
    pub fn connect(workdir_root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::with_client(docker, workdir_root))
    }

    pub fn with_client(docker: Docker, workdir_root: impl Into<PathBuf>) -> Self {
        Self {
            docker,
            workdir_root: workdir_root.into(),
        }
    }

    pub async fn ping(&self) -> Result<(), SandboxError> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Force-remove containers left behind by a crashed process
    pub async fn remove_orphans(&self) -> Result<usize, SandboxError> {
        let filters = HashMap::from([("label", vec![SANDBOX_LABEL])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            force_remove(&self.docker, &id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "Pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result?;
        }
        Ok(())
    }

    async fn run_container(&self, spec: ContainerSpec) -> Result<ContainerRun, SandboxError> {
        self.ensure_image(&spec.image).await?;

        let name = format!("arbiter-{}", Uuid::new_v4());
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: Some(CODE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            labels: Some(HashMap::from([(SANDBOX_LABEL.to_string(), "true".to_string())])),
            host_config: Some(host_config(&spec)),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;

        let guard = ContainerGuard::new(self.docker.clone(), container.id.clone());
        let outcome = self.drive(&container.id, spec.timeout).await;

        // Teardown runs whatever drive() returned
        if let Err(e) = guard.remove().await {
            warn!(container_id = %container.id, error = %e, "Failed to remove sandbox container");
        }

        outcome
    }

    /// Start the container and collect its output until exit or timeout
    async fn drive(&self, id: &str, timeout: Duration) -> Result<ContainerRun, SandboxError> {
        let start_time = Instant::now();

        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut peak_bytes: u64 = 0;

        let collect = async {
            let logs = self.docker.logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let stats = self.docker.stats(
                id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );
            futures_util::pin_mut!(logs);
            futures_util::pin_mut!(stats);
            let mut sampling = true;

            // The log stream closes when the process exits; stats may not
            loop {
                tokio::select! {
                    item = logs.next() => match item {
                        Some(Ok(LogOutput::StdOut { message })) => push_capped(&mut stdout, &message),
                        Some(Ok(LogOutput::StdErr { message })) => push_capped(&mut stderr, &message),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(container_id = id, error = %e, "Log stream ended with error");
                            break;
                        }
                        None => break,
                    },
                    sample = stats.next(), if sampling => match sample {
                        Some(Ok(snapshot)) => peak_bytes = peak_bytes.max(memory_usage(&snapshot)),
                        _ => sampling = false,
                    },
                }
            }
        };

        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();
        let wall_time_ms = start_time.elapsed().as_millis() as u64;

        if timed_out {
            debug!(container_id = id, timeout_ms = timeout.as_millis() as u64, "Killing timed out container");
            let _ = self
                .docker
                .kill_container(id, None::<KillContainerOptions<String>>)
                .await;
        }

        let exit_code = self.exit_code(id).await;
        let oom_killed = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?
            .state
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        Ok(ContainerRun {
            exit_code,
            timed_out,
            oom_killed,
            stdout: decode_output(stdout),
            stderr: decode_output(stderr),
            wall_time_ms,
            peak_memory_mb: bytes_to_mb(peak_bytes),
        })
    }

    async fn exit_code(&self, id: &str) -> Option<i64> {
        let wait = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        futures_util::pin_mut!(wait);

        match tokio::time::timeout(EXIT_STATUS_GRACE, wait.next()).await {
            Ok(Some(Ok(response))) => Some(response.status_code),
            // bollard reports non-zero exits as errors
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                Some(code)
            }
            Ok(Some(Err(e))) => {
                debug!(container_id = id, error = %e, "Wait for container failed");
                None
            }
            Ok(None) | Err(_) => None,
        }
    }
}

async fn force_remove(docker: &Docker, id: &str) -> Result<(), SandboxError> {
    docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await?;
    Ok(())
}

/// Owns a created container until it is removed
///
/// Dropped without `remove` (a run future cancelled by an outer timeout or
/// an aborted task), it spawns the removal onto the current runtime.
struct ContainerGuard {
    docker: Docker,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id: Some(id),
        }
    }

    async fn remove(mut self) -> Result<(), SandboxError> {
        match self.id.take() {
            Some(id) => force_remove(&self.docker, &id).await,
            None => Ok(()),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(container_id = %id, "Removing container of an abandoned run");
                let docker = self.docker.clone();
                runtime.spawn(async move {
                    if let Err(e) = force_remove(&docker, &id).await {
                        warn!(container_id = %id, error = %e, "Failed to remove abandoned sandbox container");
                    }
                });
            }
            Err(_) => {
                warn!(container_id = %id, "No runtime left to remove abandoned sandbox container");
            }
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare(&self, profile: &LanguageProfile) -> Result<(), SandboxError> {
        self.ensure_image(&profile.image).await
    }

    async fn compile(
        &self,
        profile: &LanguageProfile,
        artifact: &Artifact,
        timeout: Duration,
    ) -> Result<CompileOutput, SandboxError> {
        let Some(cmd) = profile.compile_argv() else {
            return Ok(CompileOutput::success());
        };

        // Compilers write into /code, so this container keeps its default
        // capabilities and a writable mount
        let run = self
            .run_container(ContainerSpec {
                image: profile.image.clone(),
                cmd,
                binds: vec![bind(&artifact.dir, CODE_MOUNT, false)],
                memory_limit_mb: profile.memory_limit_mb.max(COMPILE_MEMORY_FLOOR_MB),
                cpu_share: profile.cpu_share.max(1.0),
                drop_capabilities: false,
                timeout,
            })
            .await?;

        if run.timed_out {
            return Ok(CompileOutput::failure(format!(
                "compilation timed out after {}ms",
                timeout.as_millis()
            )));
        }

        match run.exit_code {
            Some(0) => Ok(CompileOutput::success()),
            code => {
                let mut diagnostics = run.stderr;
                diagnostics.push_str(&run.stdout);
                if diagnostics.trim().is_empty() {
                    diagnostics = format!("compiler exited with status {:?}", code);
                }
                Ok(CompileOutput::failure(diagnostics.trim_end()))
            }
        }
    }

    async fn run(
        &self,
        profile: &LanguageProfile,
        artifact: &Artifact,
        request: &RunRequest<'_>,
    ) -> Result<RunResult, SandboxError> {
        // Separate input directory per run keeps concurrent runs apart;
        // TempDir removes it on drop
        let input_dir = tempfile::Builder::new()
            .prefix("arbiter-run-")
            .tempdir_in(&self.workdir_root)?;
        tokio::fs::write(input_dir.path().join(STDIN_FILE), request.stdin).await?;
        make_world_readable(input_dir.path(), 0o755).await?;
        make_world_readable(&input_dir.path().join(STDIN_FILE), 0o644).await?;

        let run = self
            .run_container(ContainerSpec {
                image: profile.image.clone(),
                cmd: with_stdin(&profile.run),
                binds: vec![
                    bind(&artifact.dir, CODE_MOUNT, true),
                    bind(input_dir.path(), INPUT_MOUNT, true),
                ],
                memory_limit_mb: request.limits.memory_limit_mb,
                cpu_share: profile.cpu_share,
                drop_capabilities: true,
                timeout: Duration::from_millis(request.limits.timeout_ms),
            })
            .await?;

        let exit_status = if run.timed_out {
            ExitStatus::TimedOut
        } else if run.oom_killed {
            ExitStatus::MemoryLimitExceeded
        } else {
            match run.exit_code {
                Some(code) => ExitStatus::Exited(code),
                None => {
                    return Err(SandboxError::Unavailable(
                        "container exit status could not be determined".to_string(),
                    ))
                }
            }
        };

        Ok(RunResult {
            exit_status,
            stdout: run.stdout,
            stderr: run.stderr,
            wall_time_ms: run.wall_time_ms,
            peak_memory_mb: run.peak_memory_mb,
            judge_accepted: None,
        })
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let memory = (spec.memory_limit_mb.clamp(1, MAX_MEMORY_LIMIT_MB) as i64) * 1024 * 1024;
    let cpu_quota = ((CPU_PERIOD as f64) * spec.cpu_share).round() as i64;

    HostConfig {
        binds: Some(spec.binds.clone()),
        memory: Some(memory),
        memory_swap: Some(memory),
        cpu_period: Some(CPU_PERIOD),
        cpu_quota: Some(cpu_quota.max(MIN_CPU_QUOTA)),
        pids_limit: Some(PIDS_LIMIT),
        network_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            "rw,size=64m".to_string(),
        )])),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        cap_drop: spec.drop_capabilities.then(|| vec!["ALL".to_string()]),
        ..Default::default()
    }
}

fn bind(host: &Path, container: &str, read_only: bool) -> String {
    let mode = if read_only { "ro" } else { "rw" };
    format!("{}:{}:{}", host.display(), container, mode)
}

/// Wrap a run command so the process reads the mounted stdin file
fn with_stdin(run: &[String]) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("exec {} < {}/{}", run.join(" "), INPUT_MOUNT, STDIN_FILE),
    ]
}

fn memory_usage(stats: &Stats) -> u64 {
    stats
        .memory_stats
        .max_usage
        .or(stats.memory_stats.usage)
        .unwrap_or(0)
}

/// Log frames split output at arbitrary byte offsets, so raw bytes are
/// collected and decoded once the stream has ended
fn push_capped(buffer: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_CAPTURED_BYTES.saturating_sub(buffer.len());
    buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

fn decode_output(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(unix)]
pub(crate) async fn make_world_readable(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
pub(crate) async fn make_world_readable(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn spec(drop_capabilities: bool, cpu_share: f64) -> ContainerSpec {
        ContainerSpec {
            image: "python:3.11-slim".to_string(),
            cmd: vec!["python3".to_string(), "main.py".to_string()],
            binds: vec!["/tmp/work:/code:ro".to_string()],
            memory_limit_mb: 256,
            cpu_share,
            drop_capabilities,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_host_config_limits() {
        let config = host_config(&spec(true, 0.25));

        assert_eq!(config.memory, Some(256 * 1024 * 1024));
        assert_eq!(config.memory_swap, config.memory);
        assert_eq!(config.cpu_period, Some(100_000));
        assert_eq!(config.cpu_quota, Some(25_000));
        assert_eq!(config.network_mode.as_deref(), Some("none"));
        assert_eq!(config.readonly_rootfs, Some(true));
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(config.binds, Some(vec!["/tmp/work:/code:ro".to_string()]));
    }

    #[test]
    fn test_host_config_keeps_capabilities_for_compile() {
        let config = host_config(&spec(false, 1.0));
        assert_eq!(config.cap_drop, None);
        assert_eq!(config.cpu_quota, Some(100_000));
    }

    #[test]
    fn test_cpu_quota_floor() {
        let config = host_config(&spec(true, 0.001));
        assert_eq!(config.cpu_quota, Some(MIN_CPU_QUOTA));
    }

    #[test]
    fn test_bind_modes() {
        assert_eq!(bind(Path::new("/srv/a"), "/code", true), "/srv/a:/code:ro");
        assert_eq!(bind(Path::new("/srv/a"), "/code", false), "/srv/a:/code:rw");
    }

    #[test]
    fn test_with_stdin_redirects_input_file() {
        let cmd = with_stdin(&["python3".to_string(), "main.py".to_string()]);
        assert_eq!(
            cmd,
            vec!["sh", "-c", "exec python3 main.py < /input/stdin.txt"]
        );
    }

    #[test]
    fn test_memory_limit_is_clamped() {
        let mut huge = spec(true, 0.25);
        huge.memory_limit_mb = u64::MAX;
        let config = host_config(&huge);
        assert_eq!(config.memory, Some((MAX_MEMORY_LIMIT_MB as i64) * 1024 * 1024));

        let mut zero = spec(true, 0.25);
        zero.memory_limit_mb = 0;
        assert_eq!(host_config(&zero).memory, Some(1024 * 1024));
    }

    #[test]
    fn test_push_capped_truncates() {
        let mut buffer = vec![b'x'; MAX_CAPTURED_BYTES - 2];
        push_capped(&mut buffer, b"abcdef");
        assert_eq!(buffer.len(), MAX_CAPTURED_BYTES);
        assert!(buffer.ends_with(b"ab"));

        push_capped(&mut buffer, b"more");
        assert_eq!(buffer.len(), MAX_CAPTURED_BYTES);
    }

    #[test]
    fn test_character_split_across_frames_survives() {
        let mut buffer = Vec::new();
        push_capped(&mut buffer, b"caf\xC3");
        push_capped(&mut buffer, b"\xA9\n");
        assert_eq!(decode_output(buffer), "café\n");
    }

    #[test]
    fn test_invalid_utf8_is_replaced_once() {
        assert_eq!(decode_output(b"ok\xFF".to_vec()), "ok\u{FFFD}");
    }

    #[tokio::test]
    async fn test_dropped_guard_removes_container() {
        let mut server = mockito::Server::new_async().await;
        let removal = server
            .mock("DELETE", Matcher::Regex(r"/containers/abandoned-1".to_string()))
            .match_query(Matcher::Any)
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let docker =
            Docker::connect_with_http(&server.url(), 5, bollard::API_DEFAULT_VERSION).unwrap();

        drop(ContainerGuard::new(docker, "abandoned-1".to_string()));

        for _ in 0..200 {
            if removal.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        removal.assert_async().await;
    }

    #[tokio::test]
    async fn test_removed_guard_does_not_remove_twice() {
        let mut server = mockito::Server::new_async().await;
        let removal = server
            .mock("DELETE", Matcher::Regex(r"/containers/finished-1".to_string()))
            .match_query(Matcher::Any)
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let docker =
            Docker::connect_with_http(&server.url(), 5, bollard::API_DEFAULT_VERSION).unwrap();

        ContainerGuard::new(docker, "finished-1".to_string())
            .remove()
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        removal.assert_async().await;
    }
}
