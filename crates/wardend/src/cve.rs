//! Known-vulnerability scanning via debsecan.
//!
//! Best effort: hosts without debsecan simply report no findings.

use chrono::{DateTime, Utc};
use std::process::Command;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CveSeverity {
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

impl CveSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

/// One CVE affecting an installed package.
#[derive(Debug, Clone, PartialEq)]
pub struct CveFinding {
    pub cve_id: String,
    pub package: String,
    pub severity: CveSeverity,
    /// Version carrying the fix, when debsecan reports one. None while
    /// no fixed version is known.
    pub fixed_version: Option<String>,
    pub remotely_exploitable: bool,
}

impl std::fmt::Display for CveFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.cve_id, self.package, self.severity.as_str())
    }
}

/// Cached scanner over the debsecan report.
#[derive(Default)]
pub struct CveScanner {
    cached: Mutex<Vec<CveFinding>>,
    last_scan: Mutex<Option<DateTime<Utc>>>,
}

impl CveScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a scan and refresh the cache. Slow; the monitor subsamples it.
    pub fn scan(&self) -> Vec<CveFinding> {
        debug!("Running CVE scan");
        let output = Command::new("debsecan").arg("--suite").arg("stable").output();

        let findings = match output {
            Ok(o) if o.status.success() => {
                parse_debsecan_output(&String::from_utf8_lossy(&o.stdout))
            }
            Ok(o) => {
                warn!(
                    "debsecan failed: {}",
                    String::from_utf8_lossy(&o.stderr).trim()
                );
                Vec::new()
            }
            Err(e) => {
                debug!("debsecan not available: {}", e);
                Vec::new()
            }
        };

        if !findings.is_empty() {
            info!("CVE scan found {} vulnerabilities", findings.len());
        }

        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = findings.clone();
        *self.last_scan.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        findings
    }

    pub fn get_cached(&self) -> Vec<CveFinding> {
        self.cached.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Findings worth alerting on: critical or high severity.
    pub fn urgent_findings(&self) -> Vec<CveFinding> {
        self.cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|f| matches!(f.severity, CveSeverity::Critical | CveSeverity::High))
            .cloned()
            .collect()
    }

    pub fn last_scan_time(&self) -> Option<DateTime<Utc>> {
        *self.last_scan.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn set_cached(&self, findings: Vec<CveFinding>) {
        *self.cached.lock().unwrap() = findings;
    }
}

/// debsecan line format:
/// `CVE-2021-1234 libssl1.1 (remotely exploitable, high urgency)`
/// with an optional `fixed in <version>` flag.
fn parse_debsecan_output(output: &str) -> Vec<CveFinding> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let cve_id = parts.next()?;
            if !cve_id.starts_with("CVE-") {
                return None;
            }
            let package = parts.next()?.to_string();

            let flags = line.find('(').map(|i| &line[i..]).unwrap_or("");
            let severity = if flags.contains("critical urgency") {
                CveSeverity::Critical
            } else if flags.contains("high urgency") {
                CveSeverity::High
            } else if flags.contains("medium urgency") {
                CveSeverity::Medium
            } else if flags.contains("low urgency") {
                CveSeverity::Low
            } else {
                CveSeverity::Unknown
            };

            Some(CveFinding {
                cve_id: cve_id.to_string(),
                package,
                severity,
                fixed_version: parse_fixed_version(flags),
                remotely_exploitable: flags.contains("remotely exploitable"),
            })
        })
        .collect()
}

/// Pull the version out of a `fixed in 1.1.1n-0+deb10u1` flag.
fn parse_fixed_version(flags: &str) -> Option<String> {
    let rest = &flags[flags.find("fixed in ")? + "fixed in ".len()..];
    let version = rest
        .split(|c| c == ',' || c == ')')
        .next()?
        .trim();
    (!version.is_empty()).then(|| version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_debsecan_sample() {
        let output = "\
CVE-2021-3711 libssl1.1 (remotely exploitable, high urgency)
CVE-2022-0001 linux-image-amd64 (low urgency)
CVE-2023-4863 libwebp7 (remotely exploitable, critical urgency, fixed in 1.2.4-0.2+deb12u1)
not a finding line
";
        let findings = parse_debsecan_output(output);
        assert_eq!(findings.len(), 3);

        assert_eq!(findings[0].cve_id, "CVE-2021-3711");
        assert_eq!(findings[0].package, "libssl1.1");
        assert_eq!(findings[0].severity, CveSeverity::High);
        assert!(findings[0].remotely_exploitable);
        assert!(findings[0].fixed_version.is_none());

        assert_eq!(findings[1].severity, CveSeverity::Low);
        assert!(!findings[1].remotely_exploitable);

        assert_eq!(findings[2].severity, CveSeverity::Critical);
        assert_eq!(
            findings[2].fixed_version.as_deref(),
            Some("1.2.4-0.2+deb12u1")
        );

        assert_eq!(
            findings[0].to_string(),
            "CVE-2021-3711 libssl1.1 (high)"
        );
    }

    #[test]
    fn parse_fixed_version_variants() {
        assert_eq!(
            parse_fixed_version("(fixed in 1.1.1n-0+deb10u1, high urgency)").as_deref(),
            Some("1.1.1n-0+deb10u1")
        );
        assert_eq!(
            parse_fixed_version("(low urgency, fixed in 2.0)").as_deref(),
            Some("2.0")
        );
        assert!(parse_fixed_version("(high urgency)").is_none());
        assert!(parse_fixed_version("(fixed in )").is_none());
    }

    #[test]
    fn parse_debsecan_empty() {
        assert!(parse_debsecan_output("").is_empty());
    }

    #[test]
    fn urgent_findings_are_critical_or_high() {
        let scanner = CveScanner::new();
        scanner.set_cached(vec![
            CveFinding {
                cve_id: "CVE-1".to_string(),
                package: "a".to_string(),
                severity: CveSeverity::High,
                fixed_version: None,
                remotely_exploitable: false,
            },
            CveFinding {
                cve_id: "CVE-2".to_string(),
                package: "b".to_string(),
                severity: CveSeverity::Critical,
                fixed_version: Some("2.0".to_string()),
                remotely_exploitable: true,
            },
            CveFinding {
                cve_id: "CVE-3".to_string(),
                package: "c".to_string(),
                severity: CveSeverity::Low,
                fixed_version: None,
                remotely_exploitable: true,
            },
        ]);
        let urgent = scanner.urgent_findings();
        assert_eq!(urgent.len(), 2);
        assert!(urgent.iter().all(|f| matches!(
            f.severity,
            CveSeverity::Critical | CveSeverity::High
        )));
    }
}
