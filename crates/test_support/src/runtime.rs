use anyhow::{Result, bail};
use std::{
    env,
    fs,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Make sure testcontainers can reach a Docker-compatible API.
///
/// An explicit `DOCKER_HOST` wins. Otherwise the Docker socket is tried, then
/// a rootless or system Podman socket, which is exported as `DOCKER_HOST`.
///
/// # Errors
/// Returns an error describing what was tried when nothing answers.
pub fn ensure_container_runtime() -> Result<()> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    match INIT.get_or_init(detect) {
        Ok(()) => Ok(()),
        Err(message) => bail!("{message}"),
    }
}

fn detect() -> Result<(), String> {
    if let Ok(docker_host) = env::var("DOCKER_HOST") {
        return match socket_path(&docker_host) {
            Some(path) if !wait_for_socket(path, SOCKET_WAIT_TIMEOUT) => Err(format!(
                "`DOCKER_HOST` points to `{docker_host}`, but the socket is not accepting connections"
            )),
            // TCP hosts are left for testcontainers to dial.
            _ => Ok(()),
        };
    }

    if wait_for_socket(Path::new(DOCKER_SOCKET), SOCKET_WAIT_TIMEOUT) {
        return Ok(());
    }

    let candidates = podman_sockets();
    if let Some(path) = candidates
        .iter()
        .find(|path| wait_for_socket(path, SOCKET_WAIT_TIMEOUT))
    {
        let docker_host = format!("unix://{}", path.display());
        // SAFETY: set once, before any container is started.
        unsafe {
            env::set_var("DOCKER_HOST", docker_host);
        }
        return Ok(());
    }

    let tried: Vec<String> = std::iter::once(PathBuf::from(DOCKER_SOCKET))
        .chain(candidates)
        .map(|path| path.display().to_string())
        .collect();
    Err(format!(
        "No container runtime reachable (tried {}). Start Docker or `podman.socket`, or set `DOCKER_HOST`.",
        tried.join(", ")
    ))
}

fn socket_path(docker_host: &str) -> Option<&Path> {
    if let Some(path) = docker_host.strip_prefix("unix://") {
        return Some(Path::new(path));
    }
    docker_host.starts_with('/').then(|| Path::new(docker_host))
}

fn podman_sockets() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        candidates.push(PathBuf::from(runtime_dir).join("podman/podman.sock"));
    }
    if let Some(uid) = read_uid() {
        candidates.push(PathBuf::from(format!("/run/user/{uid}/podman/podman.sock")));
    }
    candidates.push(PathBuf::from("/run/podman/podman.sock"));
    candidates.dedup();
    candidates
}

fn wait_for_socket(path: &Path, timeout: Duration) -> bool {
    if !path.exists() {
        return false;
    }
    let start = Instant::now();
    while start.elapsed() < timeout {
        if UnixStream::connect(path).is_ok() {
            return true;
        }
        thread::sleep(Duration::from_millis(200));
    }
    false
}

fn read_uid() -> Option<u32> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("Uid:"))?;
    line.trim_start_matches("Uid:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_accepts_unix_and_absolute_hosts() {
        assert_eq!(
            socket_path("unix:///run/podman/podman.sock"),
            Some(Path::new("/run/podman/podman.sock"))
        );
        assert_eq!(
            socket_path("/var/run/docker.sock"),
            Some(Path::new("/var/run/docker.sock"))
        );
        assert!(socket_path("tcp://127.0.0.1:2375").is_none());
    }

    #[test]
    fn missing_socket_is_not_waited_on() {
        let start = Instant::now();
        assert!(!wait_for_socket(
            Path::new("/nonexistent/shiftgate.sock"),
            SOCKET_WAIT_TIMEOUT
        ));
        assert!(start.elapsed() < SOCKET_WAIT_TIMEOUT);
    }
}
