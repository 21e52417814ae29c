//! Judges a finished migration log.
//!
//! Migration tools print `N -> M... ` when a migration starts and `done`
//! when it ends. A start seen while another migration is still open, or an
//! open migration at end of file, means a migration did not complete.

use regex::Regex;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

fn migration_start() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]+) -> ([0-9]+)\.\.\. $").expect("valid regex"))
}

fn migration_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"done$").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogVerdict {
    Passed,
    /// A migration started before the previous one finished.
    Overlapping { line: usize, from: u64, to: u64 },
    /// The log ended inside a migration.
    Unterminated { from: u64, to: u64 },
}

impl LogVerdict {
    pub fn passed(&self) -> bool {
        *self == LogVerdict::Passed
    }
}

impl fmt::Display for LogVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogVerdict::Passed => write!(f, "SUCCESS"),
            LogVerdict::Overlapping { line, from, to } => write!(
                f,
                "FAILURE: Did not find the end of a migration after a start \
                 (migration {} -> {} started at line {} before the previous one finished)",
                from, to, line
            ),
            LogVerdict::Unterminated { from, to } => write!(
                f,
                "FAILURE: Did not find the end of a migration (migration {} -> {} never finished)",
                from, to
            ),
        }
    }
}

/// Run the start/done state machine over `lines`.
pub fn check_log_lines<I, S>(lines: I) -> LogVerdict
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut open: Option<(u64, u64)> = None;

    for (index, line) in lines.into_iter().enumerate() {
        let line = line.as_ref().trim_end_matches(['\n', '\r']);
        if let Some(caps) = migration_start().captures(line) {
            let from = caps[1].parse().unwrap_or(0);
            let to = caps[2].parse().unwrap_or(0);
            if open.is_some() {
                return LogVerdict::Overlapping {
                    line: index + 1,
                    from,
                    to,
                };
            }
            open = Some((from, to));
        } else if migration_end().is_match(line) {
            open = None;
        }
    }

    match open {
        Some((from, to)) => LogVerdict::Unterminated { from, to },
        None => LogVerdict::Passed,
    }
}

/// Check a log file. Call only once the writer has exited and closed it,
/// or a half-written last line may be judged.
pub fn check_log_file(path: &Path) -> std::io::Result<LogVerdict> {
    let file = std::fs::File::open(path)?;
    let lines = std::io::BufReader::new(file)
        .split(b'\n')
        .map(|line| line.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok(check_log_lines(lines))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_migration_passes() {
        assert_eq!(check_log_lines(["5 -> 6... ", "done"]), LogVerdict::Passed);
    }

    #[test]
    fn overlapping_migration_fails() {
        let verdict = check_log_lines(["5 -> 6... ", "7 -> 8... ", "done"]);
        assert_eq!(
            verdict,
            LogVerdict::Overlapping {
                line: 2,
                from: 7,
                to: 8
            }
        );
        assert!(verdict.to_string().starts_with("FAILURE"));
    }

    #[test]
    fn unterminated_migration_fails() {
        assert_eq!(
            check_log_lines(["5 -> 6... "]),
            LogVerdict::Unterminated { from: 5, to: 6 }
        );
    }

    #[test]
    fn empty_log_passes() {
        assert!(check_log_lines(Vec::<String>::new()).passed());
    }

    #[test]
    fn done_without_start_is_ignored() {
        assert!(check_log_lines(["done", "1 -> 2... ", "done", "done"]).passed());
    }

    #[test]
    fn start_and_done_on_one_line_is_not_a_start() {
        assert!(check_log_lines(["133 -> 134... done", "134 -> 135... done"]).passed());
    }

    #[test]
    fn any_line_ending_in_done_closes_a_migration() {
        let lines = [
            "5 -> 6... ",
            "[syslog] Oct 17 mysqld: InnoDB: done",
            "6 -> 7... ",
            "done",
        ];
        assert!(check_log_lines(lines).passed());
    }

    #[test]
    fn reads_lines_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.log");
        std::fs::write(&path, "Running migrations\n5 -> 6... \ndone\n6 -> 7... \n").unwrap();
        assert_eq!(
            check_log_file(&path).unwrap(),
            LogVerdict::Unterminated { from: 6, to: 7 }
        );
    }
}
