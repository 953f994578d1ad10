use std::collections::BTreeMap;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use sandfs_protocol::SandboxError;
use sandfs_protocol::SandboxResult;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::process_group;

/// Shell used when the caller does not name one explicitly.
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// The result of one `exec` call, either through a [`Session`] or the
/// one-shot [`exec_once`] helper.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub duration: Duration,
}

/// A persistent shell process attached to a sandbox's mount root. Commands
/// sent through repeated `exec` calls share one underlying shell, so `cd`
/// and `export` persist the way a real interactive shell would.
///
/// Each `exec` call appends a sentinel `printf` after the caller's command
/// so the reader loop knows where the command's output ends; this is a
/// plain-text protocol rather than a full pty, so a command that leaves
/// background jobs writing to stdout/stderr after it "completes" can blur
/// into the next call's output.
pub struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stderr_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    closed: bool,
}

impl Session {
    pub async fn spawn(
        shell_path: &Path,
        cwd: &Path,
        env: BTreeMap<String, String>,
    ) -> SandboxResult<Self> {
        let mut cmd = Command::new(shell_path);
        cmd.current_dir(cwd);
        cmd.env_clear();
        cmd.envs(&env);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(process_group::set_process_group);
        }

        let mut child = cmd.spawn().map_err(SandboxError::Io)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::invalid("session", "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::invalid("session", "child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::invalid("session", "child stderr unavailable"))?;

        Ok(Self {
            child,
            stdin,
            stdout_rx: spawn_reader(stdout),
            stderr_rx: spawn_reader(stderr),
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            closed: false,
        })
    }

    /// Runs one command in this session's shell. `env_overrides` are
    /// exported before the command and persist in the shell afterward,
    /// same as `stdin`/`cwd` changes the command itself makes.
    pub async fn exec(
        &mut self,
        cmd: &str,
        stdin_data: Option<&[u8]>,
        env_overrides: BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutcome> {
        if self.closed {
            return Err(SandboxError::invalid("session", "session is already closed"));
        }

        let start = Instant::now();
        let marker = format!("__sandfs_end_{}__", Uuid::new_v4().simple());
        let marker_bytes = marker.clone().into_bytes();

        // A command's stdin has to reach the command itself, not the shell
        // reading the session's script: bytes written straight to `self.stdin`
        // after the command land behind the sentinel lines in the shell's own
        // input stream, where a stdin-reading command either blocks on them
        // forever or a stdin-ignoring command has them parsed as its next
        // command. Stage the payload in a temp file and redirect the
        // command's stdin from it instead.
        let stdin_file = stdin_data.map(write_stdin_tempfile).transpose()?;
        let stdin_path = stdin_file.as_ref().map(|file| file.path().to_path_buf());

        let run = async {
            write_input(&mut self.stdin, cmd, &env_overrides, &marker, stdin_path.as_deref()).await?;
            let (stdout_result, stderr_result) = tokio::join!(
                read_until_marker_line(&mut self.stdout_rx, &mut self.stdout_buf, &marker_bytes),
                read_until_marker_line(&mut self.stderr_rx, &mut self.stderr_buf, &marker_bytes),
            );
            let (stdout, status_text) = stdout_result?;
            let (stderr, _) = stderr_result?;
            let exit_code = status_text
                .and_then(|text| text.parse::<i32>().ok())
                .unwrap_or(-1);
            Ok::<_, SandboxError>(ExecOutcome {
                stdout,
                stderr,
                exit_code,
                duration: start.elapsed(),
            })
        };

        match timeout {
            Some(duration) => match tokio::time::timeout(duration, run).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    self.closed = true;
                    if let Some(pid) = self.child.id() {
                        let _ = process_group::kill_process_group_by_pid(pid);
                    }
                    let _ = self.child.start_kill();
                    Err(SandboxError::Timeout)
                }
            },
            None => run.await,
        }
    }

    /// Terminates the session's shell and waits for it to exit.
    pub async fn close(mut self) -> SandboxResult<()> {
        if !self.closed {
            if let Some(pid) = self.child.id() {
                let _ = process_group::kill_process_group_by_pid(pid);
            }
            let _ = self.child.start_kill();
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// Runs a single command in a fresh shell that is discarded afterward, so
/// it shares no cwd or environment with any [`Session`].
pub async fn exec_once(
    shell_path: &Path,
    cwd: &Path,
    env: BTreeMap<String, String>,
    cmd: &str,
    stdin_data: Option<&[u8]>,
    timeout: Option<Duration>,
) -> SandboxResult<ExecOutcome> {
    let mut session = Session::spawn(shell_path, cwd, env).await?;
    let outcome = session.exec(cmd, stdin_data, BTreeMap::new(), timeout).await;
    let _ = session.close().await;
    outcome
}

fn spawn_reader<R>(mut reader: R) -> mpsc::UnboundedReceiver<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("session output reader error: {err}");
                    break;
                }
            }
        }
    });
    rx
}

async fn write_input(
    stdin: &mut ChildStdin,
    cmd: &str,
    env_overrides: &BTreeMap<String, String>,
    marker: &str,
    stdin_path: Option<&Path>,
) -> SandboxResult<()> {
    let mut script = String::new();
    for (key, value) in env_overrides {
        script.push_str("export ");
        script.push_str(key);
        script.push('=');
        script.push_str(&shell_quote(value));
        script.push('\n');
    }
    match stdin_path {
        Some(path) => {
            // Brace-group the command so the redirection applies to it (and
            // everything it runs), not just to us staging the script.
            script.push_str("{\n");
            script.push_str(cmd);
            if !cmd.ends_with('\n') {
                script.push('\n');
            }
            script.push_str("} < ");
            script.push_str(&shell_quote(&path.to_string_lossy()));
            script.push('\n');
        }
        None => {
            script.push_str(cmd);
            if !cmd.ends_with('\n') {
                script.push('\n');
            }
        }
    }
    script.push_str("__sandfs_status=$?\n");
    script.push_str(&format!("printf '%s %d\\n' '{marker}' \"$__sandfs_status\"\n"));
    script.push_str(&format!("printf '%s\\n' '{marker}' 1>&2\n"));

    stdin
        .write_all(script.as_bytes())
        .await
        .map_err(SandboxError::Io)?;
    stdin.flush().await.map_err(SandboxError::Io)?;
    Ok(())
}

/// Stages an `exec` call's stdin payload on disk so the session's shell can
/// redirect the command's stdin from it, rather than the bytes having to
/// flow through the same pipe the shell reads its own script from.
fn write_stdin_tempfile(data: &[u8]) -> SandboxResult<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new().map_err(SandboxError::Io)?;
    file.write_all(data).map_err(SandboxError::Io)?;
    file.flush().map_err(SandboxError::Io)?;
    Ok(file)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

async fn read_until_marker_line(
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    buffer: &mut Vec<u8>,
    marker: &[u8],
) -> SandboxResult<(Vec<u8>, Option<String>)> {
    loop {
        if let Some(marker_pos) = find_subslice(buffer, marker) {
            if let Some(newline_rel) = find_subslice(&buffer[marker_pos..], b"\n") {
                let newline_pos = marker_pos + newline_rel;
                let output = buffer[..marker_pos].to_vec();
                let trailer_bytes = &buffer[marker_pos + marker.len()..newline_pos];
                let trailer = String::from_utf8_lossy(trailer_bytes).trim().to_string();
                let remaining = buffer[newline_pos + 1..].to_vec();
                *buffer = remaining;
                return Ok((output, if trailer.is_empty() { None } else { Some(trailer) }));
            }
        }
        match rx.recv().await {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => {
                return Err(SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "session shell closed its output stream before the command completed",
                )));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh() -> std::path::PathBuf {
        std::path::PathBuf::from(DEFAULT_SHELL)
    }

    #[tokio::test]
    async fn exec_delivers_stdin_data_to_the_command() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut session = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();

        let outcome = session
            .exec(
                "cat",
                Some(b"hello from stdin"),
                BTreeMap::new(),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.stdout, b"hello from stdin");
        assert_eq!(outcome.exit_code, 0);

        // A later exec on the same session must not see the prior payload
        // reinterpreted as a stray command.
        let after = session
            .exec("echo still-alive", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(after.stdout, b"still-alive\n");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn exec_runs_a_command_and_captures_stdout() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut session = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();

        let outcome = session
            .exec("echo hello", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(outcome.stdout, b"hello\n");
        assert_eq!(outcome.exit_code, 0);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn exec_reports_nonzero_exit_code() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut session = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();

        let outcome = session
            .exec("exit 7", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 7);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn session_persists_cwd_and_env_across_execs() {
        let tempdir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tempdir.path().join("output")).unwrap();
        let mut session = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();

        session
            .exec("cd output", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let pwd = session
            .exec("pwd", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(pwd.stdout.ends_with(b"/output\n"));

        session
            .exec("export X=1", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let echoed = session
            .exec("echo $X", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(echoed.stdout, b"1\n");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn a_fresh_session_does_not_see_a_previous_sessions_state() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut first = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();
        first
            .exec("export X=1", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        first.close().await.unwrap();

        let mut second = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();
        let echoed = second
            .exec("echo $X", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(echoed.stdout, b"\n");
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn exec_timeout_kills_the_command_and_closes_the_session() {
        let tempdir = tempfile::tempdir().unwrap();
        let mut session = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();

        let result = session
            .exec("sleep 5", None, BTreeMap::new(), Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout)));

        let after = session
            .exec("echo too-late", None, BTreeMap::new(), Some(Duration::from_secs(1)))
            .await;
        assert!(matches!(after, Err(SandboxError::Invalid { .. })));
    }

    #[tokio::test]
    async fn exec_once_does_not_leak_state_into_a_later_session() {
        let tempdir = tempfile::tempdir().unwrap();
        exec_once(
            &sh(),
            tempdir.path(),
            BTreeMap::new(),
            "export X=1",
            None,
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        let mut session = Session::spawn(&sh(), tempdir.path(), BTreeMap::new())
            .await
            .unwrap();
        let echoed = session
            .exec("echo $X", None, BTreeMap::new(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(echoed.stdout, b"\n");
        session.close().await.unwrap();
    }
}
