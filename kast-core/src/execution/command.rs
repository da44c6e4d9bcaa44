use std::ffi::OsString;
use std::path::PathBuf;

use crate::types::{JobId, ScanJob, ScanMode, ScanOptions};

/// Everything the executor needs for one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Job the run belongs to.
    pub job_id: JobId,
    /// Passed as `-t`.
    pub target: String,
    /// Passed as `-m`.
    pub mode: ScanMode,
    /// Passed as `--run-only`; empty runs the tool's defaults.
    pub plugins: Vec<String>,
    /// Extra tool flags.
    pub options: ScanOptions,
    /// The job's artifact directory; created before the tool starts.
    pub output_dir: PathBuf,
}

impl ExecutionRequest {
    /// Build the request for a claimed job.
    pub fn from_job(job: &ScanJob) -> Self {
        Self {
            job_id: job.id,
            target: job.target.clone(),
            mode: job.mode,
            plugins: job.plugins.clone(),
            options: job.options.clone(),
            output_dir: job.artifact_dir.clone(),
        }
    }

    /// Tool arguments:
    /// `-t <target> -m <mode> --format both [--run-only a,b]
    /// [-p --max-workers N] [-v] [--dry-run] -o <dir>`.
    ///
    /// Each value is its own argument; nothing passes through a shell.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-t".into(),
            self.target.clone().into(),
            "-m".into(),
            self.mode.as_str().into(),
            "--format".into(),
            "both".into(),
        ];
        if !self.plugins.is_empty() {
            args.push("--run-only".into());
            args.push(self.plugins.join(",").into());
        }
        if self.options.parallel {
            args.push("-p".into());
            if let Some(workers) = self.options.max_workers {
                args.push("--max-workers".into());
                args.push(workers.to_string().into());
            }
        }
        if self.options.verbose {
            args.push("-v".into());
        }
        if self.options.dry_run {
            args.push("--dry-run".into());
        }
        args.push("-o".into());
        args.push(self.output_dir.clone().into_os_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            job_id: JobId::new(),
            target: "example.com".into(),
            mode: ScanMode::Active,
            plugins: Vec::new(),
            options: ScanOptions::default(),
            output_dir: PathBuf::from("/srv/out"),
        }
    }

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn minimal_invocation() {
        assert_eq!(
            strings(request().args()),
            ["-t", "example.com", "-m", "active", "--format", "both", "-o", "/srv/out"]
        );
    }

    #[test]
    fn all_options_in_order() {
        let mut req = request();
        req.plugins = vec!["subfinder".into(), "wafw00f".into()];
        req.options = ScanOptions {
            parallel: true,
            max_workers: Some(4),
            verbose: true,
            dry_run: true,
        };
        assert_eq!(
            strings(req.args()),
            [
                "-t", "example.com", "-m", "active", "--format", "both",
                "--run-only", "subfinder,wafw00f", "-p", "--max-workers", "4",
                "-v", "--dry-run", "-o", "/srv/out",
            ]
        );
    }

    #[test]
    fn hostile_targets_stay_one_argument() {
        let mut req = request();
        req.target = "example.com; rm -rf /".into();
        let args = strings(req.args());
        assert_eq!(args[1], "example.com; rm -rf /");
        assert_eq!(args.len(), 8);
    }
}
