//! dnsmasq query-log tailer.
//!
//! Follows a dnsmasq log (with `log-queries` enabled), reconstructs
//! multi-line answers per query id, and feeds (address, CNAME chain)
//! pairs into the reverse-name store. Runs on its own OS thread and
//! communicates only by writing to the store.
//!
//! Log lines look like:
//! ```text
//! Apr 12 15:31:41 dnsmasq[1234]: 7 10.0.0.5/51223 query[A] www.example.nl from 10.0.0.5
//! Apr 12 15:31:41 dnsmasq[1234]: 7 10.0.0.5/51223 reply www.example.nl is <CNAME>
//! Apr 12 15:31:41 dnsmasq[1234]: 7 10.0.0.5/51223 reply example.nl is 94.198.159.35
//! ```

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, Utc};

use crate::reverse_names::ReverseNameStore;

/// Answers that never name a real address.
const NON_ANSWERS: [&str; 8] = [
    "NXDOMAIN",
    "NODATA",
    "NODATA-IPv6",
    "NODATA-IPv4",
    "SERVFAIL",
    "0.0.0.0",
    "<HTTPS>",
    "duplicate",
];

/// How long an unanswered query id is kept before eviction, seconds.
const OPEN_QUERY_TTL_SECS: i64 = 10;

/// Stateful multi-line parser. Pure with respect to I/O: push lines in,
/// get (address, [cname chain..., queried name]) pairs out.
#[derive(Default)]
pub struct LogParser {
    open_queries: HashMap<u64, Vec<Vec<String>>>,
    request_times: Vec<(NaiveDateTime, u64)>,
}

impl LogParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one log line; returns a resolution when the line completes one.
    pub fn push_line(&mut self, line: &str) -> Option<(String, Vec<String>)> {
        let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if parts.len() < 5 {
            return None;
        }
        let query_id: u64 = parts[4].parse().ok()?;
        let stamp = parse_log_datetime(&parts)?;

        if !self.open_queries.contains_key(&query_id) {
            self.open_queries.insert(query_id, Vec::new());
            self.request_times.push((stamp, query_id));
        }

        let mut resolved = None;
        if parts.len() >= 10 && matches!(parts[6].as_str(), "cached" | "reply") {
            let answer = parts[9].as_str();
            if !NON_ANSWERS.contains(&answer) && answer != "<CNAME>" {
                let mut chain = self.cname_chain(query_id);
                chain.push(parts[7].clone());
                resolved = Some((answer.to_string(), chain));
            }
            if let Some(lines) = self.open_queries.get_mut(&query_id) {
                lines.push(parts.clone());
            }
        }

        self.evict_stale(stamp);
        resolved
    }

    /// CNAMEs collected so far for this query id, in log order.
    fn cname_chain(&self, query_id: u64) -> Vec<String> {
        let mut chain = Vec::new();
        for parts in self.open_queries.get(&query_id).into_iter().flatten() {
            if parts.get(9).map(String::as_str) == Some("<CNAME>") {
                if let Some(name) = parts.get(7) {
                    chain.push(name.clone());
                }
            }
        }
        chain
    }

    fn evict_stale(&mut self, now: NaiveDateTime) {
        let ttl = chrono::Duration::seconds(OPEN_QUERY_TTL_SECS);
        let open_queries = &mut self.open_queries;
        self.request_times.retain(|(stamp, query_id)| {
            if *stamp + ttl < now {
                open_queries.remove(query_id);
                false
            } else {
                true
            }
        });
    }
}

/// Parse the syslog-style timestamp (month day time); dnsmasq logs carry
/// no year, so the current one is assumed.
fn parse_log_datetime(parts: &[String]) -> Option<NaiveDateTime> {
    let datestr = format!("{} {} {} {}", Utc::now().year(), parts[0], parts[1], parts[2]);
    NaiveDateTime::parse_from_str(&datestr, "%Y %b %d %H:%M:%S").ok()
}

/// Follow `logfile` forever on a dedicated thread, feeding the store.
pub fn spawn_reader(logfile: PathBuf, store: ReverseNameStore) {
    std::thread::Builder::new()
        .name("dnsmasq-tailer".into())
        .spawn(move || {
            if let Err(e) = follow(&logfile, &store) {
                tracing::error!(
                    target: "path_traceroute.reverse_names",
                    logfile = %logfile.display(),
                    error = %e,
                    "dnsmasq log tailer stopped"
                );
            }
        })
        .ok();
}

fn follow(logfile: &PathBuf, store: &ReverseNameStore) -> std::io::Result<()> {
    let file = std::fs::File::open(logfile)?;
    let mut reader = BufReader::new(file);
    let mut parser = LogParser::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }
        if let Some((ip, names)) = parser.push_line(&line) {
            store.record(&ip, names);
            tracing::trace!(
                target: "path_traceroute.reverse_names",
                ip = %ip,
                entries = store.len(),
                "recorded forward resolution"
            );
        }
    }
}
