//! Line protocol between the controller and worker processes.
//!
//! One JSON object per line in each direction. Requests are
//! `{"cmd":"backupFile","param":[<context>,<params>]}`; successful
//! responses carry the positional result in `out`, failures an `err`
//! code with a message. A `noop` command keeps idle connections alive
//! through long local-only phases.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{unbounded, Receiver};
use log::debug;
use serde_json::{json, Value};

use crate::backup::{backup_file, CopyContext, CopyParams, CopyResult, CopyResultKind, CryptConfig, PageVerifyResult};
use crate::error::BackupError;

fn result_to_out(result: &CopyResult) -> Value {
    json!([
        result.kind.as_str(),
        result.copy_size,
        result.repo_size,
        result.checksum,
        result.page_result.as_ref().map(|p| p.to_json()),
    ])
}

fn result_from_out(out: &Value) -> Result<CopyResult, Error> {
    let list = out
        .as_array()
        .ok_or_else(|| format_err!("malformed protocol result"))?;
    if list.len() != 5 {
        bail!("malformed protocol result (length {})", list.len());
    }
    let kind = match list[0].as_str() {
        Some("copied") => CopyResultKind::Copied,
        Some("skipped") => CopyResultKind::Skipped,
        Some("noop") => CopyResultKind::NoOp,
        Some("recopied") => CopyResultKind::ReCopied,
        Some("checksum-match") => CopyResultKind::ChecksumMatch,
        other => bail!("unknown copy result tag {:?}", other),
    };
    Ok(CopyResult {
        kind,
        copy_size: list[1]
            .as_u64()
            .ok_or_else(|| format_err!("malformed copy size"))?,
        repo_size: list[2]
            .as_u64()
            .ok_or_else(|| format_err!("malformed repo size"))?,
        checksum: list[3].as_str().map(String::from),
        page_result: match &list[4] {
            Value::Null => None,
            value => Some(
                PageVerifyResult::from_json(value)
                    .ok_or_else(|| format_err!("malformed page result"))?,
            ),
        },
    })
}

fn error_envelope(err: &Error) -> Value {
    let code = err
        .downcast_ref::<BackupError>()
        .map(|e| e.code())
        .unwrap_or(99);
    json!({ "err": code, "message": err.to_string() })
}

/// Serve requests until the peer sends `exit` or closes the stream.
///
/// A failing command is reported in-band; the connection stays usable.
pub fn serve<R: BufRead, W: Write>(reader: R, mut writer: W) -> Result<(), Error> {
    // the crypt config is derived once and reused across requests
    let mut crypt: Option<(String, CryptConfig)> = None;

    for line in reader.lines() {
        let line = line.map_err(|err| format_err!("protocol read failed - {}", err))?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let err = format_err!("unparseable protocol request - {}", err);
                writeln!(writer, "{}", error_envelope(&err))?;
                continue;
            }
        };

        match request["cmd"].as_str() {
            Some("noop") => {
                writeln!(writer, "{}", json!({ "out": [] }))?;
            }
            Some("exit") => {
                writeln!(writer, "{}", json!({ "out": [] }))?;
                writer.flush()?;
                break;
            }
            Some("backupFile") => {
                let response = handle_backup_file(&request["param"], &mut crypt);
                match response {
                    Ok(result) => {
                        writeln!(writer, "{}", json!({ "out": result_to_out(&result) }))?
                    }
                    Err(err) => writeln!(writer, "{}", error_envelope(&err))?,
                }
            }
            other => {
                let err = format_err!("unknown protocol command {:?}", other);
                writeln!(writer, "{}", error_envelope(&err))?;
            }
        }
        writer.flush()?;
    }
    Ok(())
}

fn handle_backup_file(
    param: &Value,
    crypt: &mut Option<(String, CryptConfig)>,
) -> Result<CopyResult, Error> {
    let list = param
        .as_array()
        .ok_or_else(|| format_err!("backupFile parameters must be positional"))?;
    if list.len() != 2 {
        bail!("backupFile expects 2 parameters, got {}", list.len());
    }
    let ctx: CopyContext = serde_json::from_value(list[0].clone())
        .map_err(|err| format_err!("bad copy context - {}", err))?;
    let params: CopyParams = serde_json::from_value(list[1].clone())
        .map_err(|err| format_err!("bad copy params - {}", err))?;

    if let Some(pass) = &ctx.cipher_pass {
        let stale = match crypt {
            Some((cached_pass, _)) => cached_pass != pass,
            None => true,
        };
        if stale {
            *crypt = ctx.crypt_config()?.map(|config| (pass.clone(), config));
        }
    } else {
        *crypt = None;
    }

    backup_file(&ctx, crypt.as_ref().map(|(_, config)| config), &params)
}

/// Client side of one worker connection.
pub struct RemoteClient {
    writer: Box<dyn Write + Send>,
    lines: Receiver<std::io::Result<String>>,
    timeout: Duration,
    /// Reaped on drop when the peer is a child process.
    child: Option<std::process::Child>,
}

impl RemoteClient {
    /// Attach to an already-open stream pair (tests, pipes).
    pub fn attach<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: std::io::Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = unbounded();
        std::thread::Builder::new()
            .name("protocol reader".to_string())
            .spawn(move || {
                let reader = std::io::BufReader::new(reader);
                for line in reader.lines() {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
            })
            .expect("unable to spawn protocol reader thread");

        Self {
            writer: Box::new(writer),
            lines: rx,
            timeout,
            child: None,
        }
    }

    /// Spawn a worker process and speak the protocol over its stdio.
    pub fn spawn(program: &str, args: &[String], timeout: Duration) -> Result<Self, Error> {
        use std::process::{Command, Stdio};

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|err| {
                BackupError::HostConnect(format!("unable to spawn '{}' - {}", program, err))
            })?;

        let stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");
        let mut client = Self::attach(stdout, stdin, timeout);
        client.child = Some(child);
        Ok(client)
    }

    fn roundtrip(&mut self, request: Value) -> Result<Value, Error> {
        debug!("protocol request: {}", request);
        writeln!(self.writer, "{}", request)
            .map_err(|err| format_err!("protocol write failed - {}", err))?;
        self.writer
            .flush()
            .map_err(|err| format_err!("protocol flush failed - {}", err))?;

        let line = match self.lines.recv_timeout(self.timeout) {
            Ok(Ok(line)) => line,
            Ok(Err(err)) => bail!("protocol read failed - {}", err),
            Err(_) => {
                return Err(BackupError::ProtocolTimeout(format!(
                    "no response within {} seconds",
                    self.timeout.as_secs()
                ))
                .into())
            }
        };

        let response: Value = serde_json::from_str(&line)
            .map_err(|err| format_err!("unparseable protocol response - {}", err))?;

        if let Some(message) = response["message"].as_str() {
            let code = response["err"].as_u64().unwrap_or(99) as u32;
            if code == BackupError::FileMissing(String::new()).code() {
                return Err(BackupError::FileMissing(message.to_string()).into());
            }
            bail!("remote error {}: {}", code, message);
        }
        Ok(response["out"].clone())
    }

    pub fn backup_file(
        &mut self,
        ctx: &CopyContext,
        params: &CopyParams,
    ) -> Result<CopyResult, Error> {
        let out = self.roundtrip(json!({
            "cmd": "backupFile",
            "param": [serde_json::to_value(ctx)?, serde_json::to_value(params)?],
        }))?;
        result_from_out(&out)
    }

    /// Keep-alive; also proves the peer is still responsive.
    pub fn noop(&mut self) -> Result<(), Error> {
        self.roundtrip(json!({ "cmd": "noop" }))?;
        Ok(())
    }

    pub fn exit(&mut self) -> Result<(), Error> {
        self.roundtrip(json!({ "cmd": "exit" }))?;
        Ok(())
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = writeln!(self.writer, "{}", json!({ "cmd": "exit" }));
            let _ = self.writer.flush();
            let _ = child.wait();
        }
    }
}

/// Remote connections cached per (host, role) so repeated dispatch
/// does not pay process startup again.
#[derive(Default)]
pub struct RemoteClientPool {
    entries: HashMap<(String, String), RemoteClient>,
}

impl RemoteClientPool {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get_or_spawn<F>(
        &mut self,
        host_id: &str,
        role: &str,
        spawn: F,
    ) -> Result<&mut RemoteClient, Error>
    where
        F: FnOnce() -> Result<RemoteClient, Error>,
    {
        let key = (host_id.to_string(), role.to_string());
        if !self.entries.contains_key(&key) {
            let client = spawn()?;
            self.entries.insert(key.clone(), client);
        }
        Ok(self.entries.get_mut(&key).expect("entry was just inserted"))
    }

    /// Ping every cached connection.
    pub fn keepalive(&mut self) {
        for ((host, role), client) in self.entries.iter_mut() {
            if let Err(err) = client.noop() {
                debug!("keepalive to {}/{} failed: {}", host, role, err);
            }
        }
    }
}
