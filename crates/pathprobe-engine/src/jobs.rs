//! Reference job sources: plain hostname lists and `ip,port,hostname`
//! CSV files.

use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

use tracing::warn;

use crate::error::EngineError;
use crate::probe::Job;

/// Load jobs from a newline-separated hostname file.
///
/// If any line contains a comma the file is treated as `rank,hostname`
/// (Alexa-style) and only the second column is used. Hostnames are
/// resolved here; unresolvable entries are skipped with a warning.
pub fn jobs_from_hostname_file(path: &Path, port: u16) -> Result<Vec<Job>, EngineError> {
    let content = std::fs::read_to_string(path)?;
    let ranked = content.lines().any(|line| line.contains(','));

    let mut jobs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let hostname = if ranked {
            line.split(',').nth(1).unwrap_or("").trim()
        } else {
            line
        };
        if hostname.is_empty() {
            continue;
        }
        match resolve(hostname, port) {
            Some(ip) => jobs.push(Job::new(ip, port, hostname)),
            None => warn!("cannot resolve '{hostname}', skipping"),
        }
    }
    Ok(jobs)
}

fn resolve(hostname: &str, port: u16) -> Option<IpAddr> {
    (hostname, port)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip())
}

/// Load jobs from a CSV file with columns `ip,port,hostname`. An empty
/// hostname column is replaced by the address itself.
pub fn jobs_from_csv_file(path: &Path) -> Result<Vec<Job>, EngineError> {
    let content = std::fs::read_to_string(path)?;
    let name = path.display().to_string();

    let mut jobs = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut columns = line.splitn(3, ',');
        let (Some(ip), Some(port)) = (columns.next(), columns.next()) else {
            return Err(EngineError::JobFile(
                name,
                format!("line {}: expected ip,port,hostname", lineno + 1),
            ));
        };

        let ip: IpAddr = ip.trim().parse().map_err(|e| {
            EngineError::JobFile(name.clone(), format!("line {}: {e}", lineno + 1))
        })?;
        let port: u16 = port.trim().parse().map_err(|e| {
            EngineError::JobFile(name.clone(), format!("line {}: {e}", lineno + 1))
        })?;

        let hostname = columns.next().unwrap_or("").trim();
        let hostname = if hostname.is_empty() {
            ip.to_string()
        } else {
            hostname.to_string()
        };

        jobs.push(Job::new(ip, port, hostname));
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn csv_jobs_parse_all_columns() {
        let file = write_temp("198.51.100.7,80,example.test\n203.0.113.9,443,\n");
        let jobs = jobs_from_csv_file(file.path()).unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].remote_ip, "198.51.100.7".parse::<IpAddr>().unwrap());
        assert_eq!(jobs[0].remote_port, 80);
        assert_eq!(jobs[0].hostname, "example.test");
        // empty hostname column falls back to the address
        assert_eq!(jobs[1].hostname, "203.0.113.9");
    }

    #[test]
    fn csv_rejects_malformed_lines() {
        let file = write_temp("not-an-ip,80,example.test\n");
        assert!(jobs_from_csv_file(file.path()).is_err());

        let file = write_temp("198.51.100.7\n");
        assert!(jobs_from_csv_file(file.path()).is_err());
    }

    #[test]
    fn hostname_file_detects_rank_prefix() {
        // "localhost" resolves everywhere the tests run
        let file = write_temp("1,localhost\n2,localhost\n");
        let jobs = jobs_from_hostname_file(file.path(), 80).unwrap();

        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.hostname == "localhost"));
        assert!(jobs.iter().all(|j| j.remote_port == 80));
    }

    #[test]
    fn hostname_file_plain_lines() {
        let file = write_temp("localhost\n\nlocalhost\n");
        let jobs = jobs_from_hostname_file(file.path(), 443).unwrap();
        assert_eq!(jobs.len(), 2);
    }
}
