//! Backup labels.
//!
//! A label encodes the backup start time and type:
//! `YYYYMMDD-HHMMSSF` for a full backup,
//! `<full>_YYYYMMDD-HHMMSSD` for a differential and
//! `<full>_YYYYMMDD-HHMMSSI` for an incremental. Lexicographic order
//! of labels equals creation order within a stanza.

use anyhow::{bail, Error};
use chrono::{TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::config::BackupType;
use crate::error::BackupError;

lazy_static! {
    static ref LABEL_REGEX: Regex = Regex::new(
        r"^(\d{8})-(\d{6})F(?:_(\d{8})-(\d{6})(D|I))?$"
    )
    .unwrap();
}

fn format_time(time: i64) -> Result<String, Error> {
    match Utc.timestamp_opt(time, 0).single() {
        Some(dt) => Ok(dt.format("%Y%m%d-%H%M%S").to_string()),
        None => bail!("timestamp {} out of range for a backup label", time),
    }
}

/// Build a label for a backup starting at `time`.
///
/// Differential and incremental labels embed the label of the full
/// backup they descend from.
pub fn backup_label(
    backup_type: BackupType,
    prior_full: Option<&str>,
    time: i64,
) -> Result<String, Error> {
    let stamp = format_time(time)?;
    match backup_type {
        BackupType::Full => {
            if prior_full.is_some() {
                return Err(
                    BackupError::Assert("full label cannot have a prior".to_string()).into(),
                );
            }
            Ok(format!("{}F", stamp))
        }
        BackupType::Diff | BackupType::Incr => {
            let prior = prior_full.ok_or_else(|| {
                BackupError::Assert("dependent label requires a prior full".to_string())
            })?;
            let suffix = if backup_type == BackupType::Diff { "D" } else { "I" };
            Ok(format!("{}_{}{}", prior, stamp, suffix))
        }
    }
}

/// Whether a string is a well-formed backup label.
pub fn is_backup_label(label: &str) -> bool {
    LABEL_REGEX.is_match(label)
}

/// The type a label encodes.
pub fn label_type(label: &str) -> Result<BackupType, Error> {
    let captures = LABEL_REGEX
        .captures(label)
        .ok_or_else(|| BackupError::Format(format!("invalid backup label '{}'", label)))?;
    Ok(match captures.get(5).map(|m| m.as_str()) {
        None => BackupType::Full,
        Some("D") => BackupType::Diff,
        Some("I") => BackupType::Incr,
        Some(_) => unreachable!(),
    })
}

/// The full-backup label a dependent label descends from; the label
/// itself if it is a full.
pub fn label_full(label: &str) -> Result<String, Error> {
    let captures = LABEL_REGEX
        .captures(label)
        .ok_or_else(|| BackupError::Format(format!("invalid backup label '{}'", label)))?;
    Ok(format!("{}-{}F", &captures[1], &captures[2]))
}

/// Pick a unique label: advance the start time one second past a
/// collision with any existing label. A collision persisting after the
/// advance is a fatal format error (the clock cannot have produced it).
pub fn unique_label(
    backup_type: BackupType,
    prior_full: Option<&str>,
    time: i64,
    existing: &[String],
) -> Result<(String, i64), Error> {
    let label = backup_label(backup_type, prior_full, time)?;
    if !existing.iter().any(|l| l == &label) {
        return Ok((label, time));
    }

    let advanced = time + 1;
    let label = backup_label(backup_type, prior_full, advanced)?;
    if existing.iter().any(|l| l == &label) {
        return Err(BackupError::Format(format!(
            "backup label '{}' collides even after advancing the start time",
            label
        ))
        .into());
    }
    Ok((label, advanced))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_label_format() -> Result<(), Error> {
        // 2019-10-02 07:06:40 UTC
        let time = 1570000000;
        let full = backup_label(BackupType::Full, None, time)?;
        assert_eq!(full, "20191002-070640F");

        let incr = backup_label(BackupType::Incr, Some(&full), time + 60)?;
        assert_eq!(incr, "20191002-070640F_20191002-070740I");

        let diff = backup_label(BackupType::Diff, Some(&full), time + 120)?;
        assert_eq!(diff, "20191002-070640F_20191002-070840D");

        assert!(backup_label(BackupType::Diff, None, time).is_err());
        Ok(())
    }

    #[test]
    fn test_label_parse() -> Result<(), Error> {
        assert!(is_backup_label("20191002-070640F"));
        assert!(is_backup_label("20191002-070640F_20191003-070640D"));
        assert!(!is_backup_label("20191002-070640X"));
        assert!(!is_backup_label("latest"));

        assert_eq!(label_type("20191002-070640F")?, BackupType::Full);
        assert_eq!(
            label_type("20191002-070640F_20191003-070640I")?,
            BackupType::Incr
        );
        assert_eq!(
            label_full("20191002-070640F_20191003-070640D")?,
            "20191002-070640F"
        );
        Ok(())
    }

    #[test]
    fn test_label_order_matches_time_order() -> Result<(), Error> {
        let mut by_time = Vec::new();
        for offset in [0i64, 59, 61, 3600, 86400, 86401] {
            by_time.push(backup_label(BackupType::Full, None, 1569999600 + offset)?);
        }
        let mut sorted = by_time.clone();
        sorted.sort();
        assert_eq!(by_time, sorted);
        Ok(())
    }

    #[test]
    fn test_unique_label_advances_on_collision() -> Result<(), Error> {
        let time = 1570000000;
        let first = backup_label(BackupType::Full, None, time)?;

        let (label, advanced) =
            unique_label(BackupType::Full, None, time, &[first.clone()])?;
        assert_eq!(advanced, time + 1);
        assert_ne!(label, first);

        let second = backup_label(BackupType::Full, None, time + 1)?;
        let result = unique_label(BackupType::Full, None, time, &[first, second]);
        assert!(result.is_err());
        Ok(())
    }
}
