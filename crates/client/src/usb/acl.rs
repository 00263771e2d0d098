//! Access-control helper client
//!
//! On systems where raw device nodes are not writable by the user, a
//! privileged helper grants access to one device at a time. The exchange is
//! line based:
//!
//! ```text
//! client -> helper   "<bus> <addr>\n"
//! helper -> client   "SUCCESS\n" | "CANCELED\n" | "<error message>\n"
//! ```
//!
//! The client may send `CANCEL\n` while waiting. After `SUCCESS` the helper
//! keeps the grant until its stdin is closed, so the returned [`AclGrant`]
//! must live as long as the device stays open.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AclError {
    #[error("Error spawning ACL helper: {0}")]
    Spawn(String),

    #[error("Error talking to ACL helper: {0}")]
    Io(String),

    #[error("Unexpected EOF reading from ACL helper")]
    UnexpectedEof,

    #[error("Access denied: {0}")]
    Denied(String),

    #[error("ACL request cancelled")]
    Cancelled,
}

/// Access grant held by a running helper process
///
/// Dropping it closes the helper's stdin, which revokes the grant.
#[derive(Debug)]
pub struct AclGrant {
    _child: Child,
    _stdin: ChildStdin,
}

/// Launches the helper for each access request
#[derive(Debug, Clone)]
pub struct AclHelper {
    program: PathBuf,
    args: Vec<OsString>,
}

impl AclHelper {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Helper started through an interpreter or wrapper
    pub fn with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Ask the helper for access to the device at `bus`/`address`
    ///
    /// Cancelling `cancel` sends `CANCEL` and waits for the helper to answer;
    /// the result is then [`AclError::Cancelled`] whatever the answer was.
    pub async fn acquire(
        &self,
        bus: u8,
        address: u8,
        cancel: &CancellationToken,
    ) -> Result<AclGrant, AclError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| AclError::Spawn(e.to_string()))?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(AclError::Spawn("helper pipes unavailable".to_string()));
        };

        debug!("Requesting device access for {}-{}", bus, address);
        let request = format!("{} {}\n", bus, address);
        stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| AclError::Io(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| AclError::Io(e.to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let response = tokio::select! {
            line = lines.next_line() => Some(line),
            _ = cancel.cancelled() => None,
        };

        let Some(line) = response else {
            debug!("Cancelling access request for {}-{}", bus, address);
            if let Err(e) = stdin.write_all(b"CANCEL\n").await {
                warn!("Failed to send CANCEL to ACL helper: {}", e);
            }
            let _ = lines.next_line().await;
            return Err(AclError::Cancelled);
        };

        match line {
            Err(e) => Err(AclError::Io(e.to_string())),
            Ok(None) => Err(AclError::UnexpectedEof),
            Ok(Some(reply)) => match reply.trim() {
                "SUCCESS" => {
                    info!("Access granted for {}-{}", bus, address);
                    Ok(AclGrant {
                        _child: child,
                        _stdin: stdin,
                    })
                }
                "CANCELED" => Err(AclError::Cancelled),
                reason => Err(AclError::Denied(reason.to_string())),
            },
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn script(body: &str) -> (tempfile::NamedTempFile, AclHelper) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", body).unwrap();
        let helper = AclHelper::with_args("/bin/sh", [file.path().as_os_str().to_owned()]);
        (file, helper)
    }

    #[tokio::test]
    async fn test_success_keeps_grant() {
        let (_file, helper) = script(
            r#"read req
if [ "$req" = "3 7" ]; then echo SUCCESS; else echo "bad request $req"; fi
cat > /dev/null"#,
        );
        let grant = helper.acquire(3, 7, &CancellationToken::new()).await;
        assert!(grant.is_ok(), "{:?}", grant);
    }

    #[tokio::test]
    async fn test_error_line_is_denial() {
        let (_file, helper) = script("read req\necho 'Not authorized'");
        let result = helper.acquire(1, 2, &CancellationToken::new()).await;
        assert_eq!(result.unwrap_err(), AclError::Denied("Not authorized".to_string()));
    }

    #[tokio::test]
    async fn test_eof_without_reply() {
        let (_file, helper) = script("read req\nexit 0");
        let result = helper.acquire(1, 2, &CancellationToken::new()).await;
        assert_eq!(result.unwrap_err(), AclError::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_late_success() {
        let (_file, helper) = script("read req\nread cancel\necho SUCCESS");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = helper.acquire(1, 2, &token).await;
        assert_eq!(result.unwrap_err(), AclError::Cancelled);
    }

    #[tokio::test]
    async fn test_helper_reports_canceled() {
        let (_file, helper) = script("read req\necho CANCELED");
        let result = helper.acquire(1, 2, &CancellationToken::new()).await;
        assert_eq!(result.unwrap_err(), AclError::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_helper() {
        let helper = AclHelper::new("/nonexistent/usb-acl-helper");
        let result = helper.acquire(1, 2, &CancellationToken::new()).await;
        assert!(matches!(result, Err(AclError::Spawn(_))));
    }
}
