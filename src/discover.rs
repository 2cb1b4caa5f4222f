//! Test discovery and timeout derivation.
//!
//! Walks the test tree for `*_test.sh` files, reads each script's header
//! for `TEST_TIMEOUT:` and `SKIP=` annotations, and combines the authored
//! timeout with the historical expected duration into an effective timeout.
//! Filters (name regex, streak cap, skip modes) and the seeded shuffle
//! happen here so the client driver only sees the final ordered list.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;

use crate::constants::{
    DEFAULT_TEST_TIMEOUT, DYNAMIC_TIMEOUT_FLOOR, DYNAMIC_TIMEOUT_MULTIPLIER,
};
use crate::dilation;
use crate::history::HistoryStore;

/// Lines of a script inspected for header annotations.
const HEADER_SCAN_LINES: usize = 50;

/// How skipped tests interact with the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipMode {
    /// Default: tests marked `SKIP=` are excluded.
    #[default]
    Exclude,
    /// `--run-skipped`: marked tests run like any other.
    Include,
    /// `--only-skipped`: only marked tests run.
    Only,
}

/// Selection and ordering options for one discovery pass.
#[derive(Debug, Default)]
pub struct DiscoveryOptions {
    /// Keep only tests whose name matches.
    pub filter: Option<Regex>,
    /// Exclude tests whose pass streak exceeds this.
    pub streak_max: Option<u32>,
    /// Skip-annotation handling.
    pub skip_mode: SkipMode,
    /// Shuffle the final order (seeded, reproducible per run id).
    pub shuffle: bool,
    /// Shuffle seed, derived from the run id.
    pub seed: u64,
}

/// One runnable test with its derived timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    /// Filesystem path of the script.
    pub path: PathBuf,
    /// Display name and history key (path relative to the project root).
    pub name: String,
    /// Authored (or default) timeout after dilation, seconds.
    pub static_timeout: u64,
    /// Effective timeout: max of static and dynamic, seconds.
    pub effective_timeout: u64,
    /// Skip annotation with optional reason.
    pub skip: Option<String>,
}

/// Header annotations parsed from a script.
#[derive(Debug, Default, PartialEq)]
struct Header {
    timeout_seconds: Option<u64>,
    skip: Option<String>,
}

/// Discover tests under `paths` (directories are walked recursively).
///
/// Timeouts use `history` for the dynamic component; filters and ordering
/// follow `opts`. The result is ready for submission.
pub fn discover(
    paths: &[PathBuf],
    project_root: &Path,
    history: &HistoryStore,
    opts: &DiscoveryOptions,
) -> Result<Vec<TestCase>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            collect_scripts(path, &mut files)
                .with_context(|| format!("Failed to walk {}", path.display()))?;
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            anyhow::bail!("No such test path: {}", path.display());
        }
    }
    files.sort();
    files.dedup();

    let factor = dilation::factor();
    let mut cases = Vec::new();
    for path in files {
        let name = display_name(&path, project_root);

        if let Some(re) = &opts.filter {
            if !re.is_match(&name) {
                continue;
            }
        }

        let header = parse_header(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        match (opts.skip_mode, &header.skip) {
            (SkipMode::Exclude, Some(reason)) => {
                log::debug!("[discover] Skipping {name}: {reason}");
                continue;
            }
            (SkipMode::Only, None) => continue,
            _ => {}
        }

        if let Some(cap) = opts.streak_max {
            let streak = history.streak(&name);
            if streak > cap {
                log::debug!("[discover] Excluding {name}: streak {streak} > {cap}");
                continue;
            }
        }

        let static_secs = header.timeout_seconds.unwrap_or(DEFAULT_TEST_TIMEOUT.as_secs());
        let expected = history.expected_duration(&name);
        let (static_timeout, effective_timeout) =
            effective_timeout(static_secs, expected, factor);

        cases.push(TestCase {
            path,
            name,
            static_timeout,
            effective_timeout,
            skip: header.skip,
        });
    }

    if opts.shuffle {
        let mut rng = rand::rngs::StdRng::seed_from_u64(opts.seed);
        cases.shuffle(&mut rng);
    }

    Ok(cases)
}

/// Combine the authored timeout with the history-derived dynamic timeout.
///
/// Returns `(static, effective)`, both in dilated seconds. The dynamic
/// component exists so a regressed test cannot hang for its whole authored
/// budget, while `max` with the static component still honours explicit
/// authorship.
fn effective_timeout(
    static_secs: u64,
    expected: Option<std::time::Duration>,
    factor: f64,
) -> (u64, u64) {
    let static_timeout = ((static_secs as f64) * factor).ceil() as u64;
    let dynamic = match expected {
        Some(d) if d > std::time::Duration::ZERO => {
            let scaled = d.as_secs_f64() * DYNAMIC_TIMEOUT_MULTIPLIER * factor;
            Some((scaled.ceil() as u64).max(DYNAMIC_TIMEOUT_FLOOR.as_secs()))
        }
        _ => None,
    };
    let effective = dynamic.map_or(static_timeout, |d| d.max(static_timeout));
    (static_timeout, effective)
}

/// Recursively collect `*_test.sh` files under `dir`, sorted walk order.
fn collect_scripts(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_scripts(&path, out)?;
        } else if is_test_script(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_test_script(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with("_test.sh"))
}

fn display_name(path: &Path, project_root: &Path) -> String {
    path.strip_prefix(project_root)
        .unwrap_or(path)
        .display()
        .to_string()
}

/// Parse the first [`HEADER_SCAN_LINES`] lines for annotations.
///
/// Recognised anywhere in a line:
/// - `TEST_TIMEOUT: N` — authored timeout in seconds.
/// - `SKIP=true|1|yes` — skip marker, with an optional `# reason` suffix.
fn parse_header(path: &Path) -> Result<Header> {
    let contents = fs::read_to_string(path)?;
    let mut header = Header::default();
    for line in contents.lines().take(HEADER_SCAN_LINES) {
        if header.timeout_seconds.is_none() {
            if let Some(rest) = line.split("TEST_TIMEOUT:").nth(1) {
                let digits: String = rest
                    .trim_start()
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .collect();
                if let Ok(n) = digits.parse() {
                    header.timeout_seconds = Some(n);
                }
            }
        }
        if header.skip.is_none() {
            if let Some(rest) = line.split("SKIP=").nth(1) {
                let value: String = rest
                    .chars()
                    .take_while(|c| !c.is_whitespace() && *c != '#')
                    .collect();
                if matches!(value.as_str(), "true" | "1" | "yes") {
                    // The reason comment follows the value, not the shell
                    // comment marker the line itself may start with.
                    let reason = rest
                        .split_once('#')
                        .map(|(_, r)| r.trim().to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "marked SKIP".to_string());
                    header.skip = Some(reason);
                }
            }
        }
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_script(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn empty_history(dir: &Path) -> HistoryStore {
        HistoryStore::load(dir.join("h.json"), 10)
    }

    #[test]
    fn test_collects_only_test_scripts() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "dns_test.sh", "#!/bin/sh\n");
        write_script(dir.path(), "helper.sh", "#!/bin/sh\n");
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_script(&dir.path().join("sub"), "dhcp_test.sh", "#!/bin/sh\n");

        let history = empty_history(dir.path());
        let cases = discover(
            &[dir.path().to_path_buf()],
            dir.path(),
            &history,
            &DiscoveryOptions::default(),
        )
        .unwrap();

        let names: Vec<&str> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["dns_test.sh", "sub/dhcp_test.sh"]);
    }

    #[test]
    fn test_header_timeout_and_skip() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "slow_test.sh",
            "#!/bin/sh\n# TEST_TIMEOUT: 90\n# SKIP=true # needs hardware nic\necho hi\n",
        );
        let header = parse_header(&path).unwrap();
        assert_eq!(header.timeout_seconds, Some(90));
        assert_eq!(header.skip.as_deref(), Some("needs hardware nic"));
    }

    #[test]
    fn test_header_skip_value_must_be_truthy() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "t_test.sh", "# SKIP=false\n");
        assert_eq!(parse_header(&path).unwrap().skip, None);

        let path = write_script(dir.path(), "u_test.sh", "# SKIP=yes\n");
        assert!(parse_header(&path).unwrap().skip.is_some());
    }

    #[test]
    fn test_header_beyond_scan_window_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut contents = String::from("#!/bin/sh\n");
        for _ in 0..60 {
            contents.push_str("true\n");
        }
        contents.push_str("# TEST_TIMEOUT: 500\n");
        let path = write_script(dir.path(), "deep_test.sh", &contents);
        assert_eq!(parse_header(&path).unwrap().timeout_seconds, None);
    }

    #[test]
    fn test_skip_modes() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "a_test.sh", "#!/bin/sh\n");
        write_script(dir.path(), "b_test.sh", "# SKIP=1\n");
        let history = empty_history(dir.path());

        let run = |mode| {
            let opts = DiscoveryOptions {
                skip_mode: mode,
                ..Default::default()
            };
            discover(&[dir.path().to_path_buf()], dir.path(), &history, &opts)
                .unwrap()
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(SkipMode::Exclude), vec!["a_test.sh"]);
        assert_eq!(run(SkipMode::Include), vec!["a_test.sh", "b_test.sh"]);
        assert_eq!(run(SkipMode::Only), vec!["b_test.sh"]);
    }

    #[test]
    fn test_filter_regex() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "dns_test.sh", "#!/bin/sh\n");
        write_script(dir.path(), "dhcp_test.sh", "#!/bin/sh\n");
        let history = empty_history(dir.path());

        let opts = DiscoveryOptions {
            filter: Some(Regex::new("dns").unwrap()),
            ..Default::default()
        };
        let cases =
            discover(&[dir.path().to_path_buf()], dir.path(), &history, &opts).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "dns_test.sh");
    }

    #[test]
    fn test_effective_timeout_prefers_larger_component() {
        // No history: static wins.
        assert_eq!(effective_timeout(30, None, 1.0), (30, 30));
        // Slow history: dynamic 2.5x average dominates.
        assert_eq!(
            effective_timeout(30, Some(Duration::from_secs(20)), 1.0),
            (30, 50)
        );
        // Fast history never shrinks below the authored value.
        assert_eq!(
            effective_timeout(30, Some(Duration::from_secs(1)), 1.0),
            (30, 30)
        );
        // Tiny history still floors at 5 s for the dynamic component.
        assert_eq!(
            effective_timeout(2, Some(Duration::from_millis(100)), 1.0),
            (2, 5)
        );
    }

    #[test]
    fn test_effective_timeout_applies_dilation() {
        let (static_t, effective) = effective_timeout(30, None, 2.0);
        assert_eq!((static_t, effective), (60, 60));
    }

    #[test]
    fn test_shuffle_is_seeded_and_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            write_script(dir.path(), &format!("t{i}_test.sh"), "#!/bin/sh\n");
        }
        let history = empty_history(dir.path());
        let run = |seed| {
            let opts = DiscoveryOptions {
                shuffle: true,
                seed,
                ..Default::default()
            };
            discover(&[dir.path().to_path_buf()], dir.path(), &history, &opts)
                .unwrap()
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
        // Different seeds should produce a different order for 8 items in
        // practice; equality here would be a 1-in-40320 fluke per pair.
        assert!(run(1) != run(2) || run(1) != run(3));
    }
}
