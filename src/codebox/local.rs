//! Local code box - runs code in a host interpreter process
//!
//! Each context is a scratch directory under `root` plus one long-lived
//! `python3` process (the kernel) started on first execution. Requests go to
//! the kernel's stdin as JSON lines; each reply comes back on stdout after a
//! per-kernel sentinel, so variables and imports persist between executions
//! and stray writes to the real stdout are still captured.
//!
//! Open matplotlib figures are rendered to PNG at the end of every execution
//! and returned inline; files the code writes to the working directory come
//! back as artifacts.
//!
//! A kernel whose previous execution was abandoned (the caller timed out) is
//! killed and replaced, losing its state. A kernel that exits on its own is
//! reported as dead and replaced on the next execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{CodeBox, CodeBoxOutput, CodeBoxStatus, SessionHandle};
use crate::error::CodeBoxError;
use crate::types::{Artifact, ExecutionStatus};

/// Request loop run by every kernel; `sys.argv[1]` is the reply sentinel
const KERNEL_SOURCE: &str = r#"
import base64, contextlib, importlib, io, json, sys, traceback

_sentinel = sys.argv[1]
_requests = sys.stdin
_replies = sys.stdout
sys.stdin = io.StringIO()
_namespace = {"__name__": "__main__", "__builtins__": __builtins__}


def _figures():
    plt = sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return []
    images = []
    for number in plt.get_fignums():
        buffer = io.BytesIO()
        plt.figure(number).savefig(buffer, format="png", bbox_inches="tight")
        images.append(base64.b64encode(buffer.getvalue()).decode("ascii"))
    plt.close("all")
    return images


for _line in _requests:
    _code = json.loads(_line)["code"]
    _out, _err = io.StringIO(), io.StringIO()
    _ok = True
    _images = []
    importlib.invalidate_caches()
    with contextlib.redirect_stdout(_out), contextlib.redirect_stderr(_err):
        try:
            exec(compile(_code, "<cell>", "exec"), _namespace)
        except BaseException:
            _ok = False
            _type, _value, _tb = sys.exc_info()
            traceback.print_exception(_type, _value, _tb.tb_next if _tb else None)
        try:
            _images = _figures()
        except Exception:
            traceback.print_exc()
    _reply = {"ok": _ok, "stdout": _out.getvalue(), "stderr": _err.getvalue(), "images": _images}
    _replies.write("\n" + _sentinel + json.dumps(_reply) + "\n")
    _replies.flush()
"#;

#[derive(Serialize)]
struct KernelRequest<'a> {
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct KernelReply {
    ok: bool,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    /// Base64 PNGs of the figures open when the execution finished
    #[serde(default)]
    images: Vec<String>,
}

/// One long-lived interpreter process
struct Kernel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    sentinel: String,
    /// Set while a request is outstanding; still set if the caller gave up
    busy: bool,
}

impl Kernel {
    fn spawn(python: &str, dir: &Path) -> Result<Self, CodeBoxError> {
        let sentinel = format!("__codebox_reply_{}__", uuid::Uuid::new_v4().simple());
        let mut child = Command::new(python)
            .arg("-u")
            .arg("-c")
            .arg(KERNEL_SOURCE)
            .arg(&sentinel)
            .current_dir(dir)
            .env("MPLBACKEND", "Agg")
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodeBoxError::Unavailable(format!("failed to spawn {}: {}", python, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CodeBoxError::Unavailable("kernel stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CodeBoxError::Unavailable("kernel stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        debug!(pid = ?child.id(), dir = %dir.display(), "Kernel started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            sentinel,
            busy: false,
        })
    }

    /// Run one request; `None` when the process went away mid-request
    async fn run(&mut self, code: &str) -> Option<KernelReply> {
        let mut request = serde_json::to_vec(&KernelRequest { code }).ok()?;
        request.push(b'\n');

        self.busy = true;
        self.stdin.write_all(&request).await.ok()?;
        self.stdin.flush().await.ok()?;

        let mut stray = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match self.stdout.read_until(b'\n', &mut line).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
            let text = String::from_utf8_lossy(&line);
            match text.find(self.sentinel.as_str()) {
                Some(pos) => {
                    stray.push_str(&text[..pos]);
                    let payload = text[pos + self.sentinel.len()..].trim_end();
                    let mut reply: KernelReply = serde_json::from_str(payload).ok()?;
                    self.busy = false;
                    // The reply is preceded by a newline of its own
                    if stray.ends_with('\n') {
                        stray.pop();
                    }
                    if !stray.is_empty() {
                        reply.stdout.insert_str(0, &stray);
                    }
                    return Some(reply);
                }
                None => stray.push_str(&text),
            }
        }
    }

    /// Kill the process and describe how it ended
    async fn shut_down(mut self) -> String {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Kernel already exited");
        }
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        }
    }
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line = %line, "Kernel stderr");
    }
}

/// One allocated context
struct Context {
    dir: PathBuf,
    kernel: tokio::sync::Mutex<Option<Kernel>>,
}

/// Subprocess-backed code box
pub struct LocalCodeBox {
    root: PathBuf,
    python: String,
    contexts: Mutex<HashMap<String, Arc<Context>>>,
}

impl LocalCodeBox {
    /// Create a backend that allocates contexts under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            python: "python3".to_string(),
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Use a specific interpreter binary
    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    fn context(&self, handle: &SessionHandle) -> Result<Arc<Context>, CodeBoxError> {
        let contexts = self
            .contexts
            .lock()
            .map_err(|_| CodeBoxError::Unavailable("context table poisoned".to_string()))?;
        contexts
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| CodeBoxError::Transport(format!("context {} not found", handle.id)))
    }

    fn context_dir(&self, handle: &SessionHandle) -> Result<PathBuf, CodeBoxError> {
        Ok(self.context(handle)?.dir.clone())
    }

    async fn run(
        &self,
        dir: &Path,
        program: &str,
        args: &[&str],
    ) -> Result<std::process::Output, CodeBoxError> {
        Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CodeBoxError::Unavailable(format!("failed to spawn {}: {}", program, e)))
    }
}

/// Reject names that would escape the context directory
fn checked_name(name: &str) -> Result<&str, CodeBoxError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
    {
        return Err(CodeBoxError::Rejected(format!("invalid file name: {:?}", name)));
    }
    Ok(name)
}

/// Regular files in `dir` with their modification times
async fn snapshot(dir: &Path) -> HashMap<String, SystemTime> {
    let mut files = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        files.insert(entry.file_name().to_string_lossy().into_owned(), modified);
    }
    files
}

/// Names present in `after` that are new or modified relative to `before`
fn changed_files(
    before: &HashMap<String, SystemTime>,
    after: &HashMap<String, SystemTime>,
) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(name, modified)| before.get(*name).map_or(true, |prev| prev != *modified))
        .map(|(name, _)| name.clone())
        .collect();
    changed.sort();
    changed
}

fn output_from_reply(reply: KernelReply) -> CodeBoxOutput {
    let mut output = if reply.ok {
        CodeBoxOutput {
            stderr: reply.stderr,
            ..CodeBoxOutput::text(reply.stdout)
        }
    } else {
        CodeBoxOutput {
            stdout: reply.stdout,
            ..CodeBoxOutput::error(reply.stderr)
        }
    };
    for encoded in reply.images {
        match BASE64.decode(encoded.as_bytes()) {
            Ok(png) => output
                .artifacts
                .push(Artifact::with_content_type("", "image/png", png)),
            Err(e) => warn!(error = %e, "Dropping undecodable figure"),
        }
    }
    output
}

#[async_trait]
impl CodeBox for LocalCodeBox {
    async fn open(&self) -> Result<SessionHandle, CodeBoxError> {
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(format!("codebox-{}", id));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            CodeBoxError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;

        info!(session_id = %id, dir = %dir.display(), "Local code box context created");
        let context = Arc::new(Context {
            dir,
            kernel: tokio::sync::Mutex::new(None),
        });
        self.contexts
            .lock()
            .map_err(|_| CodeBoxError::Unavailable("context table poisoned".to_string()))?
            .insert(id.clone(), context);
        Ok(SessionHandle::new(id))
    }

    async fn execute(
        &self,
        handle: &SessionHandle,
        code: &str,
    ) -> Result<CodeBoxOutput, CodeBoxError> {
        let context = self.context(handle)?;
        let mut slot = context.kernel.lock().await;

        if slot.as_ref().is_some_and(|k| k.busy) {
            warn!(session_id = %handle.id, "Previous execution abandoned; restarting kernel");
            if let Some(stale) = slot.take() {
                stale.shut_down().await;
            }
        }
        if slot.is_none() {
            *slot = Some(Kernel::spawn(&self.python, &context.dir)?);
        }

        let before = snapshot(&context.dir).await;
        let reply = match slot.as_mut() {
            Some(kernel) => kernel.run(code).await,
            None => None,
        };

        let mut output = match reply {
            Some(reply) => output_from_reply(reply),
            None => {
                let status = match slot.take() {
                    Some(dead) => dead.shut_down().await,
                    None => "unknown".to_string(),
                };
                warn!(session_id = %handle.id, status = %status, "Kernel exited during execution");
                CodeBoxOutput::error(format!(
                    "The kernel died unexpectedly ({}); variables and imports were lost",
                    status
                ))
            }
        };
        drop(slot);

        let after = snapshot(&context.dir).await;
        for name in changed_files(&before, &after) {
            match Artifact::from_path(context.dir.join(&name)).await {
                Ok(artifact) => output.artifacts.push(artifact),
                Err(e) => debug!(file = %name, error = %e, "Skipping unreadable output file"),
            }
        }
        debug!(
            session_id = %handle.id,
            ok = output.status == ExecutionStatus::Ok,
            artifacts = output.artifacts.len(),
            "Local execution complete"
        );
        Ok(output)
    }

    async fn upload(
        &self,
        handle: &SessionHandle,
        name: &str,
        content: &[u8],
    ) -> Result<(), CodeBoxError> {
        let dir = self.context_dir(handle)?;
        let name = checked_name(name)?;
        tokio::fs::write(dir.join(name), content)
            .await
            .map_err(|e| CodeBoxError::Rejected(format!("cannot write {}: {}", name, e)))
    }

    async fn download(&self, handle: &SessionHandle, name: &str) -> Result<Vec<u8>, CodeBoxError> {
        let dir = self.context_dir(handle)?;
        let name = checked_name(name)?;
        tokio::fs::read(dir.join(name))
            .await
            .map_err(|e| CodeBoxError::Rejected(format!("cannot read {}: {}", name, e)))
    }

    async fn install(&self, handle: &SessionHandle, package: &str) -> Result<(), CodeBoxError> {
        let dir = self.context_dir(handle)?;
        let valid = !package.is_empty()
            && package
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c));
        if !valid {
            return Err(CodeBoxError::Rejected(format!("invalid package name: {:?}", package)));
        }

        info!(package, "Installing package");
        let output = self
            .run(&dir, &self.python, &["-m", "pip", "install", "--quiet", package])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CodeBoxError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    async fn status(&self, handle: &SessionHandle) -> Result<CodeBoxStatus, CodeBoxError> {
        let dir = self.context_dir(handle)?;
        Ok(if tokio::fs::metadata(&dir).await.is_ok() {
            CodeBoxStatus::Running
        } else {
            CodeBoxStatus::Stopped
        })
    }

    async fn close(&self, handle: &SessionHandle) -> Result<(), CodeBoxError> {
        let context = self
            .contexts
            .lock()
            .map_err(|_| CodeBoxError::Unavailable("context table poisoned".to_string()))?
            .remove(&handle.id);

        let Some(context) = context else {
            return Ok(());
        };
        if let Some(kernel) = context.kernel.lock().await.take() {
            let status = kernel.shut_down().await;
            debug!(session_id = %handle.id, status = %status, "Kernel stopped");
        }
        tokio::fs::remove_dir_all(&context.dir).await.map_err(|e| {
            CodeBoxError::Transport(format!("cannot remove {}: {}", context.dir.display(), e))
        })?;
        info!(session_id = %handle.id, "Local code box context removed");
        Ok(())
    }
}
