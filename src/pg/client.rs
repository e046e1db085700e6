//! Database client seam.
//!
//! The wire-protocol client lives outside this crate. The backup core
//! only sees the [`PgClient`] trait, one connection per role, owned
//! exclusively by the controller. [`ScriptedPgClient`] replays a canned
//! request/response script and is what the tests drive.

use std::collections::VecDeque;

use anyhow::{bail, format_err, Error};
use serde_json::Value;

use super::Lsn;

/// Result of the start-backup call.
#[derive(Clone, Debug)]
pub struct StartBackupResult {
    pub lsn: Lsn,
    pub wal_segment: String,
    pub timeline: u32,
}

/// Result of the stop-backup call. The label and map blobs are only
/// returned by the non-exclusive protocol.
#[derive(Clone, Debug)]
pub struct StopBackupResult {
    pub lsn: Lsn,
    pub wal_segment: String,
    pub backup_label: Option<String>,
    pub tablespace_map: Option<String>,
    pub timestamp: i64,
}

/// One tablespace as enumerated from the catalog.
#[derive(Clone, Debug)]
pub struct TablespaceInfo {
    pub oid: u64,
    pub name: String,
    pub path: std::path::PathBuf,
}

/// The queries the backup core issues against a cluster.
pub trait PgClient: Send {
    /// Server version number, e.g. 90600.
    fn version(&mut self) -> Result<u32, Error>;

    /// Whether the connection is to a cluster in recovery.
    fn is_standby(&mut self) -> Result<bool, Error>;

    /// Cluster time of day, seconds since epoch.
    fn time(&mut self) -> Result<i64, Error>;

    /// Take the stanza advisory lock; false when already held.
    fn advisory_lock(&mut self) -> Result<bool, Error>;

    fn start_backup(
        &mut self,
        label: &str,
        start_fast: bool,
        exclusive: bool,
    ) -> Result<StartBackupResult, Error>;

    fn stop_backup(&mut self, exclusive: bool) -> Result<StopBackupResult, Error>;

    /// Replay location of a standby.
    fn replay_lsn(&mut self) -> Result<Lsn, Error>;

    fn tablespace_list(&mut self) -> Result<Vec<TablespaceInfo>, Error>;
}

/// Scripted client: a sequence of (expected request, canned response)
/// pairs. A call formats its request, pops the head of the script,
/// asserts the request matches and decodes the canned response.
pub struct ScriptedPgClient {
    script: VecDeque<(String, Value)>,
}

impl ScriptedPgClient {
    pub fn new<S: Into<String>>(script: Vec<(S, Value)>) -> Self {
        Self {
            script: script
                .into_iter()
                .map(|(req, resp)| (req.into(), resp))
                .collect(),
        }
    }

    fn exchange(&mut self, request: &str) -> Result<Value, Error> {
        let (expected, response) = self
            .script
            .pop_front()
            .ok_or_else(|| format_err!("unscripted database request '{}'", request))?;
        if expected != request {
            bail!(
                "database request mismatch: got '{}', script expects '{}'",
                request,
                expected
            );
        }
        Ok(response)
    }

    /// All scripted exchanges must have been consumed.
    pub fn finished(&self) -> bool {
        self.script.is_empty()
    }
}

fn str_field(value: &Value, name: &str) -> Result<String, Error> {
    value[name]
        .as_str()
        .map(String::from)
        .ok_or_else(|| format_err!("missing field '{}' in scripted response", name))
}

impl PgClient for ScriptedPgClient {
    fn version(&mut self) -> Result<u32, Error> {
        let resp = self.exchange("version")?;
        resp.as_u64()
            .map(|v| v as u32)
            .ok_or_else(|| format_err!("scripted version is not a number"))
    }

    fn is_standby(&mut self) -> Result<bool, Error> {
        let resp = self.exchange("is-standby")?;
        resp.as_bool()
            .ok_or_else(|| format_err!("scripted is-standby is not a bool"))
    }

    fn time(&mut self) -> Result<i64, Error> {
        let resp = self.exchange("time")?;
        resp.as_i64()
            .ok_or_else(|| format_err!("scripted time is not a number"))
    }

    fn advisory_lock(&mut self) -> Result<bool, Error> {
        let resp = self.exchange("advisory-lock")?;
        resp.as_bool()
            .ok_or_else(|| format_err!("scripted advisory-lock is not a bool"))
    }

    fn start_backup(
        &mut self,
        label: &str,
        start_fast: bool,
        exclusive: bool,
    ) -> Result<StartBackupResult, Error> {
        let request = format!(
            "start-backup label={} fast={} exclusive={}",
            label, start_fast, exclusive
        );
        let resp = self.exchange(&request)?;
        Ok(StartBackupResult {
            lsn: str_field(&resp, "lsn")?.parse()?,
            wal_segment: str_field(&resp, "wal-segment")?,
            timeline: resp["timeline"].as_u64().unwrap_or(1) as u32,
        })
    }

    fn stop_backup(&mut self, exclusive: bool) -> Result<StopBackupResult, Error> {
        let request = format!("stop-backup exclusive={}", exclusive);
        let resp = self.exchange(&request)?;
        Ok(StopBackupResult {
            lsn: str_field(&resp, "lsn")?.parse()?,
            wal_segment: str_field(&resp, "wal-segment")?,
            backup_label: resp["backup-label"].as_str().map(String::from),
            tablespace_map: resp["tablespace-map"].as_str().map(String::from),
            timestamp: resp["timestamp"]
                .as_i64()
                .ok_or_else(|| format_err!("missing stop-backup timestamp"))?,
        })
    }

    fn replay_lsn(&mut self) -> Result<Lsn, Error> {
        let resp = self.exchange("replay-lsn")?;
        resp.as_str()
            .ok_or_else(|| format_err!("scripted replay-lsn is not a string"))?
            .parse()
    }

    fn tablespace_list(&mut self) -> Result<Vec<TablespaceInfo>, Error> {
        let resp = self.exchange("tablespace-list")?;
        let list = resp
            .as_array()
            .ok_or_else(|| format_err!("scripted tablespace-list is not an array"))?;
        let mut result = Vec::new();
        for item in list {
            result.push(TablespaceInfo {
                oid: item["oid"]
                    .as_u64()
                    .ok_or_else(|| format_err!("tablespace oid missing"))?,
                name: str_field(item, "name")?,
                path: str_field(item, "path")?.into(),
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scripted_client() -> Result<(), Error> {
        let mut client = ScriptedPgClient::new(vec![
            ("version", json!(90600)),
            (
                "start-backup label=test fast=false exclusive=false",
                json!({"lsn": "0/4000028", "wal-segment": "000000010000000000000004"}),
            ),
        ]);

        assert_eq!(client.version()?, 90600);
        let start = client.start_backup("test", false, false)?;
        assert_eq!(start.lsn.to_string(), "0/4000028");
        assert!(client.finished());
        Ok(())
    }

    #[test]
    fn test_scripted_client_rejects_mismatch() {
        let mut client = ScriptedPgClient::new(vec![("time", json!(0))]);
        assert!(client.version().is_err());
    }
}
