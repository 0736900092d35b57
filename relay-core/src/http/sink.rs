//! The body-sink collaborator: an external command that receives decoded
//! response bodies on stdin, with range metadata in its environment.

use std::io::Write;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

pub struct BodySink {
    stdin: Option<ChildStdin>,
    child: Option<Child>,
}

impl BodySink {
    /// Spawn the sink command with `<host> <target>` arguments. When the
    /// response carried a valid `Content-Range`, the `start`/`end`/`full`
    /// environment variables describe it (`full` is omitted for `*`).
    /// Spawn failures are logged and disable the sink for this response.
    pub fn spawn(
        cmd: &Path,
        host: &[u8],
        target: &[u8],
        range: Option<(u64, u64, Option<u64>)>,
    ) -> Option<BodySink> {
        let mut command = Command::new(cmd);
        command
            .arg(String::from_utf8_lossy(host).into_owned())
            .arg(String::from_utf8_lossy(target).into_owned())
            .stdin(Stdio::piped());
        if let Some((start, end, full)) = range {
            command.env("start", start.to_string());
            command.env("end", end.to_string());
            if let Some(full) = full {
                command.env("full", full.to_string());
            }
        }
        match command.spawn() {
            Ok(mut child) => {
                let stdin = child.stdin.take();
                Some(BodySink {
                    stdin,
                    child: Some(child),
                })
            }
            Err(e) => {
                log::warn!("failed to spawn body sink {}: {}", cmd.display(), e);
                None
            }
        }
    }

    /// Stream one decoded chunk. A broken pipe disables further writes
    /// without failing the interception.
    pub fn write(&mut self, chunk: &[u8]) {
        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(e) = stdin.write_all(chunk) {
                log::warn!("body sink write failed: {}", e);
                self.stdin = None;
            }
        }
    }
}

impl Drop for BodySink {
    fn drop(&mut self) {
        // closing stdin signals end of body; reap the child off-thread
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_streams_body_to_command() {
        let dir = std::env::temp_dir().join(format!("relay-sink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("sink.sh");
        let out = dir.join("body.out");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat > {}\n", out.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut sink = BodySink::spawn(&script, b"example.com", b"/file", None).unwrap();
        sink.write(b"hello ");
        sink.write(b"body");
        drop(sink);

        // the child is reaped asynchronously; poll briefly
        for _ in 0..50 {
            if out.exists() && std::fs::read(&out).map(|v| v == b"hello body").unwrap_or(false)
            {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(std::fs::read(&out).unwrap(), b"hello body");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
