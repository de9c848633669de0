//! ROA validation against a VRPs (Validated ROA Payloads) snapshot.
//!
//! The dataset is cached on disk and refreshed when its build time is
//! older than 7 days. A refresh failure keeps serving the stale data; a
//! missing dataset that cannot be downloaded is fatal at startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde_json::Value;
use thiserror::Error;

/// Default on-disk cache for the fetched dataset.
pub const VRPS_FILENAME: &str = "vrps.json";
/// Default source for the dataset.
pub const VRPS_URL: &str = "https://console.rpki-client.org/vrps.json";
/// Age at which the dataset is considered stale.
const VRPS_EXPIRE_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum RpkiError {
    #[error("vrps download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("vrps file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vrps data malformed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("vrps data carries no roas list")]
    MissingRoas,
}

/// In-memory view of the VRPs list: the set of (ASN, prefix) tuples.
pub struct RoaChecker {
    valid: HashSet<(String, String)>,
}

impl RoaChecker {
    /// Load the cached dataset if fresh; otherwise (re)download from
    /// `url` and persist to `path` (write-then-rename, so a concurrent
    /// load never sees a partial file).
    pub async fn load(path: &Path, url: &str, http: &reqwest::Client) -> Result<Self, RpkiError> {
        if path.exists() {
            tracing::info!(target: "path_traceroute.rpki", path = %path.display(), "loading VRPS data");
            match read_dataset(path) {
                Ok((checker, buildtime)) => {
                    if is_fresh(buildtime, chrono::Utc::now().naive_utc()) {
                        return Ok(checker);
                    }
                    tracing::info!(target: "path_traceroute.rpki", "VRPS data expired, downloading again");
                    match Self::download(path, url, http).await {
                        Ok(fresh) => return Ok(fresh),
                        Err(e) => {
                            tracing::warn!(
                                target: "path_traceroute.rpki",
                                error = %e,
                                "VRPS refresh failed, serving stale dataset"
                            );
                            return Ok(checker);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "path_traceroute.rpki",
                        error = %e,
                        "cached VRPS data unreadable, downloading"
                    );
                }
            }
        }
        Self::download(path, url, http).await
    }

    async fn download(path: &Path, url: &str, http: &reqwest::Client) -> Result<Self, RpkiError> {
        tracing::info!(target: "path_traceroute.rpki", url, "downloading VRPS data");
        let data: Value = http.get(url).send().await?.error_for_status()?.json().await?;
        tracing::info!(target: "path_traceroute.rpki", path = %path.display(), "storing VRPS data");
        persist_atomic(path, &data)?;
        let (checker, _) = Self::from_value(&data)?;
        Ok(checker)
    }

    /// Build the membership set from a parsed dataset; returns the
    /// build time alongside when present.
    pub fn from_value(data: &Value) -> Result<(Self, Option<NaiveDateTime>), RpkiError> {
        let roas = data
            .get("roas")
            .and_then(Value::as_array)
            .ok_or(RpkiError::MissingRoas)?;
        let valid = roas
            .iter()
            .filter_map(|roa| Some((value_to_string(roa.get("asn")?), value_to_string(roa.get("prefix")?))))
            .collect();
        let buildtime = data
            .get("metadata")
            .and_then(|m| m.get("buildtime"))
            .and_then(Value::as_str)
            .and_then(parse_buildtime);
        Ok((Self { valid }, buildtime))
    }

    /// True iff the (ASN, prefix) tuple appears in the loaded list.
    /// Empty or `*` arguments are never valid.
    pub fn roa_valid(&self, asn: &str, prefix: &str) -> bool {
        if asn.is_empty() || asn == "*" || prefix.is_empty() || prefix == "*" {
            return false;
        }
        self.valid.contains(&(asn.to_string(), prefix.to_string()))
    }

    pub fn len(&self) -> usize {
        self.valid.len()
    }
}

fn read_dataset(path: &Path) -> Result<(RoaChecker, Option<NaiveDateTime>), RpkiError> {
    let raw = std::fs::read_to_string(path)?;
    let data: Value = serde_json::from_str(&raw)?;
    RoaChecker::from_value(&data)
}

fn persist_atomic(path: &Path, data: &Value) -> Result<(), RpkiError> {
    let mut tmp: PathBuf = path.to_path_buf();
    tmp.set_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(data)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn parse_buildtime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ").ok()
}

/// A dataset with no parseable build time counts as stale.
fn is_fresh(buildtime: Option<NaiveDateTime>, now: NaiveDateTime) -> bool {
    match buildtime {
        Some(t) => t + chrono::Duration::days(VRPS_EXPIRE_DAYS) > now,
        None => false,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dataset() -> Value {
        serde_json::json!({
            "metadata": { "buildtime": "2026-01-01T00:00:00Z" },
            "roas": [
                { "asn": "AS1140", "prefix": "185.49.140.0/22", "maxLength": 22, "ta": "ripe" },
                { "asn": 15169, "prefix": "8.8.8.0/24", "maxLength": 24, "ta": "arin" }
            ]
        })
    }

    #[test]
    fn membership_is_literal() {
        let (checker, _) = RoaChecker::from_value(&sample_dataset()).unwrap();
        assert!(checker.roa_valid("AS1140", "185.49.140.0/22"));
        assert!(!checker.roa_valid("1140", "185.49.140.0/22"));
        assert!(!checker.roa_valid("AS1140", "185.49.140.0/21"));
    }

    #[test]
    fn numeric_asns_are_stringified() {
        let (checker, _) = RoaChecker::from_value(&sample_dataset()).unwrap();
        assert!(checker.roa_valid("15169", "8.8.8.0/24"));
    }

    #[test]
    fn star_and_empty_are_never_valid() {
        let (checker, _) = RoaChecker::from_value(&sample_dataset()).unwrap();
        assert!(!checker.roa_valid("*", "8.8.8.0/24"));
        assert!(!checker.roa_valid("15169", "*"));
        assert!(!checker.roa_valid("", "8.8.8.0/24"));
        assert!(!checker.roa_valid("15169", ""));
    }

    #[test]
    fn buildtime_freshness() {
        let build = parse_buildtime("2026-01-01T00:00:00Z").unwrap();
        let now = parse_buildtime("2026-01-05T00:00:00Z").unwrap();
        assert!(is_fresh(Some(build), now));
        let later = parse_buildtime("2026-01-09T00:00:01Z").unwrap();
        assert!(!is_fresh(Some(build), later));
        assert!(!is_fresh(None, now));
    }

    #[test]
    fn persist_is_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vrps.json");
        persist_atomic(&path, &sample_dataset()).unwrap();
        let (checker, buildtime) = read_dataset(&path).unwrap();
        assert_eq!(checker.len(), 2);
        assert!(buildtime.is_some());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn malformed_dataset_is_an_error() {
        assert!(RoaChecker::from_value(&serde_json::json!({ "metadata": {} })).is_err());
    }
}
