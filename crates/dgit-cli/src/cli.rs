use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dgit_store::{CommitRecord, Repository};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "dgit")]
#[command(about = "Version control for binary design files", long_about = None)]
pub struct Cli {
    /// Run as if started in this directory
    #[arg(short = 'C', long = "dir", global = true)]
    pub dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a repository in the current directory
    Init,
    /// Stage design files by path, directory, or glob
    Add {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Remove files from the staging area
    Rm {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Commit everything staged
    Commit {
        #[arg(short, long)]
        message: String,
    },
    /// Show commit history, newest first
    Log {
        #[arg(long)]
        oneline: bool,
        #[arg(short = 'n', long = "max-count")]
        max_count: Option<usize>,
        #[arg(long)]
        stats: bool,
    },
    /// Show staged files and the head commit
    Status,
    /// Restore files from a version (`v3`, `3`, or a hash prefix)
    Restore {
        reference: String,
        paths: Vec<String>,
        #[arg(long = "to")]
        to: Option<PathBuf>,
    },
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let cwd = std::env::current_dir()?;
        let base = match &self.dir {
            Some(dir) => cwd.join(dir),
            None => cwd,
        };
        match &self.command {
            Command::Init => self.init(&base),
            Command::Add { patterns } => self.add(&base, patterns),
            Command::Rm { paths } => self.rm(&base, paths),
            Command::Commit { message } => self.commit(&base, message),
            Command::Log {
                oneline,
                max_count,
                stats,
            } => self.log(&base, *oneline, *max_count, *stats),
            Command::Status => self.status(&base),
            Command::Restore {
                reference,
                paths,
                to,
            } => self.restore(&base, reference, paths, to.as_deref()),
        }
    }

    fn repo(base: &Path) -> Result<Repository> {
        Repository::discover(base).with_context(|| format!("opening repository at {}", base.display()))
    }

    fn init(&self, base: &Path) -> Result<()> {
        let repo = Repository::init(base)?;
        println!("Initialized empty DGit repository in {}", repo.dgit_dir().display());
        Ok(())
    }

    fn add(&self, base: &Path, patterns: &[String]) -> Result<()> {
        let mut repo = Self::repo(base)?;
        let base = std::fs::canonicalize(base)?;
        let prefix = base
            .strip_prefix(repo.work_dir())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut errors = 0usize;
        for pattern in patterns {
            // Patterns are relative to where dgit was invoked.
            let resolved = if prefix.as_os_str().is_empty() {
                pattern.clone()
            } else if pattern == "." {
                prefix.to_string_lossy().into_owned()
            } else {
                prefix.join(pattern).to_string_lossy().into_owned()
            };
            match repo.add(&resolved) {
                Ok(outcome) => {
                    for entry in &outcome.added {
                        println!(
                            "staged {} ({}, {} tier)",
                            entry.normalized_path,
                            human_bytes(entry.size),
                            entry.assigned_tier
                        );
                    }
                    for (path, reason) in &outcome.failed {
                        eprintln!("skipped {}: {}", path, reason);
                    }
                }
                Err(e) => {
                    eprintln!("error: {}: {}", pattern, e);
                    errors += 1;
                }
            }
        }
        if errors > 0 {
            bail!("{} pattern(s) could not be staged", errors);
        }
        Ok(())
    }

    fn rm(&self, base: &Path, paths: &[PathBuf]) -> Result<()> {
        let mut repo = Self::repo(base)?;
        for path in paths {
            repo.rm(&base.join(path))?;
            println!("unstaged {}", path.display());
        }
        Ok(())
    }

    fn commit(&self, base: &Path, message: &str) -> Result<()> {
        let mut repo = Self::repo(base)?;
        let record = repo.commit(message)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            println!("{}", repo.history().summary(&record));
            println!("commit {}", record.hash);
        }
        Ok(())
    }

    fn print_record(repo: &Repository, record: &CommitRecord, oneline: bool) {
        if oneline {
            println!("{} {}", record.hash, repo.history().summary(record));
            return;
        }
        println!("commit {} (v{})", record.hash, record.version);
        println!("Author: {}", record.author);
        println!("Date:   {}", record.timestamp.to_rfc2822());
        println!();
        println!("    {}", record.message);
        println!();
        println!(
            "    {} files via {}: {} -> {}",
            record.file_count,
            record.artifact.strategy,
            human_bytes(record.artifact.original_size),
            human_bytes(record.artifact.compressed_size)
        );
        for (path, entry) in &record.files {
            println!("      {} ({}) {}", path, human_bytes(entry.size), entry.metadata.describe());
        }
        println!();
    }

    fn log(&self, base: &Path, oneline: bool, max_count: Option<usize>, stats: bool) -> Result<()> {
        let repo = Self::repo(base)?;
        let records = repo.log(max_count)?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&records)?);
        } else if records.is_empty() {
            println!("No commits yet");
        } else {
            for record in &records {
                Self::print_record(&repo, record, oneline);
            }
        }

        if stats {
            let statistics = repo.history().statistics()?;
            let breakdown = repo.history().size_breakdown()?;
            if self.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "statistics": statistics,
                        "size_breakdown": breakdown,
                    }))?
                );
                return Ok(());
            }
            println!("Commits:       {}", statistics.total_commits);
            println!("Files:         {}", statistics.total_files);
            println!("Original:      {}", human_bytes(statistics.original_bytes));
            println!("Stored:        {}", human_bytes(statistics.stored_bytes));
            println!("Saved:         {}", human_bytes(statistics.bytes_saved));
            println!("Avg commit:    {:.1}ms", statistics.average_commit_ms);
            for (strategy, count) in &statistics.by_strategy {
                println!("  {:<16} {}", strategy, count);
            }
            println!(
                "On disk: snapshots {}, deltas {}, records {}, hot {}, warm {}, cold {} (total {})",
                human_bytes(breakdown.snapshots),
                human_bytes(breakdown.deltas),
                human_bytes(breakdown.records),
                human_bytes(breakdown.hot),
                human_bytes(breakdown.warm),
                human_bytes(breakdown.cold),
                human_bytes(breakdown.total)
            );
        }
        Ok(())
    }

    fn status(&self, base: &Path) -> Result<()> {
        let repo = Self::repo(base)?;
        let status = repo.status()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        match &status.head {
            Some(head) => {
                println!("On v{} ({})", head.version, head.hash);
                if let Some(plan) = &status.head_plan {
                    println!("Restore path: {}", plan.method);
                }
            }
            None => println!("No commits yet"),
        }

        if status.staged.is_empty() {
            println!("Nothing staged");
        } else {
            println!(
                "Staged ({} files, {}; hot {}, warm {}, cold {}):",
                status.staged.len(),
                human_bytes(status.staging.total_bytes),
                status.staging.hot,
                status.staging.warm,
                status.staging.cold
            );
            for entry in &status.staged {
                let marker = if entry.precompressed { "*" } else { " " };
                println!(
                    "  {}{} ({}, {})",
                    marker,
                    entry.normalized_path,
                    human_bytes(entry.size),
                    entry.assigned_tier
                );
            }
        }

        println!("Cache:");
        for (tier, usage) in &status.usage {
            println!("  {:<5} {} files, {}", tier.to_string(), usage.files, human_bytes(usage.bytes));
        }
        Ok(())
    }

    fn restore(&self, base: &Path, reference: &str, paths: &[String], to: Option<&Path>) -> Result<()> {
        let repo = Self::repo(base)?;
        let destination = to.map(|d| base.join(d));
        let report = repo.restore(reference, paths, destination.as_deref())?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "Restored v{} ({}) via {} into {} in {:.1}ms",
                report.version,
                report.hash,
                report.method,
                report.destination.display(),
                report.elapsed_ms
            );
            for path in &report.restored_files {
                println!("  restored {}", path);
            }
            for (path, kind) in &report.failed_files {
                println!("  failed {}: {:?}", path, kind);
            }
            if report.restored_files.is_empty() && report.failed_files.is_empty() {
                println!("  no files matched");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commit_message() {
        let cli = Cli::try_parse_from(["dgit", "commit", "-m", "Initial"]).unwrap();
        assert!(matches!(cli.command, Command::Commit { ref message } if message == "Initial"));
    }

    #[test]
    fn parses_log_flags() {
        let cli = Cli::try_parse_from(["dgit", "log", "--oneline", "-n", "3", "--stats"]).unwrap();
        match cli.command {
            Command::Log {
                oneline,
                max_count,
                stats,
            } => {
                assert!(oneline);
                assert_eq!(max_count, Some(3));
                assert!(stats);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_restore_with_paths_and_destination() {
        let cli =
            Cli::try_parse_from(["dgit", "restore", "v2", "logo.ai", "icons/", "--to", "out"]).unwrap();
        match cli.command {
            Command::Restore {
                reference,
                paths,
                to,
            } => {
                assert_eq!(reference, "v2");
                assert_eq!(paths, vec!["logo.ai", "icons/"]);
                assert_eq!(to, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn add_requires_a_pattern() {
        assert!(Cli::try_parse_from(["dgit", "add"]).is_err());
        assert!(Cli::try_parse_from(["dgit", "commit"]).is_err());
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn init_add_commit_restore() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let run = |args: &[&str]| {
            let mut full = vec!["dgit".to_string(), "-C".to_string(), root.display().to_string()];
            full.extend(args.iter().map(|a| a.to_string()));
            Cli::try_parse_from(full).unwrap()
        };

        run(&["init"]).run().await.unwrap();
        std::fs::write(root.join("a.ai"), vec![3u8; 10 * 1024]).unwrap();
        run(&["add", "a.ai"]).run().await.unwrap();
        run(&["commit", "-m", "Initial"]).run().await.unwrap();
        run(&["log", "--oneline"]).run().await.unwrap();
        run(&["restore", "v1", "--to", "out"]).run().await.unwrap();

        assert_eq!(std::fs::read(root.join("out/a.ai")).unwrap(), vec![3u8; 10 * 1024]);
        run(&["restore", "v1", "missing.psd", "--to", "out2"]).run().await.unwrap();
        assert!(!root.join("out2/a.ai").exists());
        assert!(run(&["restore", "v9", "--to", "out3"]).run().await.is_err());
    }
}
