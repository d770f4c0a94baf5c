//! Static-analysis subprocesses.
//!
//! A scan is two external commands run against a working copy: an optional
//! lint pass whose report is converted for the quality gate, then the main
//! scanner. Both are awaited to completion; stdout and stderr are each
//! drained to EOF by their own task so neither pipe can fill up and stall the
//! child. Output need not be UTF-8.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use repolens_common::RepositoryDescriptor;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{QualityGateConfig, ScannerConfig};
use crate::error::{AnalysisError, Result};
use crate::lint;
use crate::mirror::project_key;

/// Lint tools conventionally exit 4 when violations were found.
const LINT_VIOLATIONS_EXIT: i32 = 4;
const STDERR_TAIL: usize = 8;
const REDACTED: &str = "***";

/// What a finished scan produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    pub project_key: String,
    /// Converted external-issue report, when the lint pass ran
    pub external_report: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StaticAnalysisRunner {
    scanner: ScannerConfig,
    host_url: String,
    token: Option<String>,
    engine_id: String,
}

impl StaticAnalysisRunner {
    pub fn new(scanner: &ScannerConfig, quality_gate: &QualityGateConfig) -> Self {
        Self {
            scanner: scanner.clone(),
            host_url: quality_gate.scanner_host_url().to_string(),
            token: quality_gate.token.clone(),
            engine_id: quality_gate.lint_engine_id.clone(),
        }
    }

    pub fn lint_enabled(&self) -> bool {
        self.scanner
            .lint_cmd
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty())
    }

    pub fn report_dir(&self, key: &str) -> PathBuf {
        self.scanner.reports_dir.join(key)
    }

    pub fn lint_args(&self, workdir: &Path, raw_report: &Path) -> Vec<String> {
        vec![
            "check".into(),
            "-d".into(),
            workdir.to_string_lossy().into_owned(),
            "-R".into(),
            self.scanner.lint_ruleset.clone(),
            "-f".into(),
            "json".into(),
            "-r".into(),
            raw_report.to_string_lossy().into_owned(),
        ]
    }

    pub fn scanner_args(
        &self,
        key: &str,
        repository: &RepositoryDescriptor,
        workdir: &Path,
        external_report: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![
            format!("-Dsonar.projectKey={key}"),
            format!("-Dsonar.projectName={}", repository.full_name),
            format!("-Dsonar.projectBaseDir={}", workdir.display()),
            "-Dsonar.sources=.".to_string(),
            format!("-Dsonar.host.url={}", self.host_url),
        ];
        if let Some(token) = &self.token {
            args.push(format!("-Dsonar.token={token}"));
        }
        if let Some(report) = external_report {
            let exclusions = self
                .scanner
                .lint_extensions
                .iter()
                .map(|ext| format!("**/*.{ext}"))
                .collect::<Vec<_>>()
                .join(",");
            if !exclusions.is_empty() {
                args.push(format!("-Dsonar.exclusions={exclusions}"));
            }
            args.push(format!(
                "-Dsonar.externalIssuesReportPaths={}",
                report.display()
            ));
        }
        args.extend(self.scanner.extra_args.iter().cloned());
        args
    }

    /// Run the lint pass (if configured) and then the scanner.
    pub async fn run(
        &self,
        repository: &RepositoryDescriptor,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome> {
        let key = project_key(&repository.full_name);
        let external_report = match self.scanner.lint_cmd.as_deref() {
            Some(cmd) if self.lint_enabled() => {
                Some(self.run_lint(cmd, &key, workdir, cancel).await?)
            }
            _ => None,
        };

        let args = self.scanner_args(&key, repository, workdir, external_report.as_deref());
        let status = run_process(
            &self.scanner.scanner_cmd,
            &args,
            workdir,
            self.token.as_deref(),
            cancel,
        )
        .await?;
        if !status.success {
            return Err(AnalysisError::AnalysisFailure(format!(
                "scanner for {key} exited with {}{}",
                status.describe(),
                status.stderr_hint()
            )));
        }
        info!(project = %key, "scan finished");
        Ok(ScanOutcome {
            project_key: key,
            external_report,
        })
    }

    async fn run_lint(
        &self,
        cmd: &str,
        key: &str,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dir = self.report_dir(key);
        tokio::fs::create_dir_all(&dir).await?;
        let raw = dir.join("lint-report.json");
        let converted = dir.join("external-issues.json");

        let status = run_process(cmd, &self.lint_args(workdir, &raw), workdir, None, cancel).await?;
        let ok = status.success || status.code == Some(LINT_VIOLATIONS_EXIT);
        if !ok {
            return Err(AnalysisError::AnalysisFailure(format!(
                "lint pass for {key} exited with {}{}",
                status.describe(),
                status.stderr_hint()
            )));
        }

        let engine = self.engine_id.clone();
        let base = workdir.to_path_buf();
        let out = converted.clone();
        tokio::task::spawn_blocking(move || lint::convert_report_file(&raw, &out, &engine, &base))
            .await
            .map_err(|e| AnalysisError::AnalysisFailure(format!("report conversion aborted: {e}")))??;
        Ok(converted)
    }
}

#[derive(Debug)]
struct ProcessStatus {
    success: bool,
    code: Option<i32>,
    stderr_tail: Vec<String>,
}

impl ProcessStatus {
    fn from_exit(status: ExitStatus, stderr_tail: Vec<String>) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
            stderr_tail,
        }
    }

    fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("status {code}"),
            None => "a signal".to_string(),
        }
    }

    fn stderr_hint(&self) -> String {
        match self.stderr_tail.last() {
            Some(line) => format!(": {line}"),
            None => String::new(),
        }
    }
}

/// Split a configured command into program and leading arguments, honouring
/// shell quoting.
fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = shlex::split(command)
        .ok_or_else(|| {
            AnalysisError::AnalysisFailure(format!("unbalanced quoting in command: {command}"))
        })?
        .into_iter();
    let program = parts
        .next()
        .ok_or_else(|| AnalysisError::AnalysisFailure("empty command".into()))?;
    Ok((program, parts.collect()))
}

fn redact(line: &str, secret: Option<&str>) -> String {
    match secret {
        Some(s) if !s.is_empty() => line.replace(s, REDACTED),
        _ => line.to_string(),
    }
}

async fn run_process(
    command: &str,
    args: &[String],
    cwd: &Path,
    secret: Option<&str>,
    cancel: &CancellationToken,
) -> Result<ProcessStatus> {
    let (program, mut full_args) = split_command(command)?;
    full_args.extend(args.iter().cloned());

    let shown = redact(&format!("{program} {}", full_args.join(" ")), secret);
    info!(command = %shown, cwd = %cwd.display(), "starting subprocess");

    let mut child = Command::new(&program)
        .args(&full_args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AnalysisError::AnalysisFailure(format!("failed to spawn {program}: {e}")))?;

    let stdout_task = child.stdout.take().map(|out| {
        let name = program.clone();
        let secret = secret.map(str::to_string);
        tokio::spawn(async move { drain(out, &name, secret.as_deref(), false).await })
    });
    let stderr_task = child.stderr.take().map(|err| {
        let name = program.clone();
        let secret = secret.map(str::to_string);
        tokio::spawn(async move { drain(err, &name, secret.as_deref(), true).await })
    });

    let exit = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            warn!(program = %program, "cancelled, killing subprocess");
            let _ = child.kill().await;
            if let Some(t) = stdout_task { t.abort(); }
            if let Some(t) = stderr_task { t.abort(); }
            return Err(AnalysisError::Cancelled);
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    let stderr_tail = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    let status = ProcessStatus::from_exit(exit, stderr_tail);
    debug!(program = %program, code = ?status.code, "subprocess exited");
    Ok(status)
}

/// Log every line of a stream; return the last few lines.
async fn drain<R>(reader: R, program: &str, secret: Option<&str>, is_stderr: bool) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                let line = redact(raw.trim_end_matches(['\n', '\r']), secret);
                if is_stderr {
                    warn!(target: "repolens::subprocess", program = %program, "{line}");
                } else {
                    debug!(target: "repolens::subprocess", program = %program, "{line}");
                }
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                warn!(program = %program, error = %e, "stream read failed, discarding the rest");
                // the child must still see its pipe emptied
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    warn!(program = %program, error = %e, "stream discard failed");
                }
                break;
            }
        }
    }
    tail.into_iter().collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    fn descriptor() -> RepositoryDescriptor {
        RepositoryDescriptor {
            id: 42,
            full_name: "octo/engine".into(),
            language: Some("Java".into()),
            stargazers_count: 0,
            forks_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            pushed_at: None,
        }
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        // run through sh so the test never execs a file it just wrote
        format!("sh {}", path.display())
    }

    fn runner(dir: &TempDir, scanner_cmd: String, lint_cmd: Option<String>) -> StaticAnalysisRunner {
        let scanner = ScannerConfig {
            scanner_cmd,
            lint_cmd,
            reports_dir: dir.path().join("reports"),
            ..ScannerConfig::default()
        };
        let qg = QualityGateConfig {
            host_url: "http://sonar.local/api".into(),
            token: Some("s3cret".into()),
            lint_engine_id: "pmd".into(),
        };
        StaticAnalysisRunner::new(&scanner, &qg)
    }

    const LINT_OK: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-r" ]; then out="$2"; fi
  shift
done
printf '%s' '{"files":[{"filename":"Main.java","violations":[{"beginline":1,"description":"x","rule":"R","priority":2}]}]}' > "$out"
exit 4"#;

    #[test]
    fn scanner_args_carry_key_host_and_token() {
        let dir = tempdir().unwrap();
        let r = runner(&dir, "sonar-scanner".into(), None);
        let args = r.scanner_args("octo_engine", &descriptor(), Path::new("/w"), None);
        assert!(args.contains(&"-Dsonar.projectKey=octo_engine".to_string()));
        assert!(args.contains(&"-Dsonar.projectName=octo/engine".to_string()));
        assert!(args.contains(&"-Dsonar.projectBaseDir=/w".to_string()));
        assert!(args.contains(&"-Dsonar.sources=.".to_string()));
        assert!(args.contains(&"-Dsonar.host.url=http://sonar.local".to_string()));
        assert!(args.contains(&"-Dsonar.token=s3cret".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("-Dsonar.exclusions")));

        let with_lint = r.scanner_args(
            "octo_engine",
            &descriptor(),
            Path::new("/w"),
            Some(Path::new("/r/ext.json")),
        );
        assert!(with_lint.contains(&"-Dsonar.exclusions=**/*.java".to_string()));
        assert!(with_lint.contains(&"-Dsonar.externalIssuesReportPaths=/r/ext.json".to_string()));
    }

    #[test]
    fn redaction_hides_token() {
        assert_eq!(redact("-Dsonar.token=s3cret", Some("s3cret")), "-Dsonar.token=***");
        assert_eq!(redact("plain", None), "plain");
    }

    #[tokio::test]
    async fn successful_scan_without_lint() {
        let dir = tempdir().unwrap();
        let r = runner(&dir, script(&dir, "scan.sh", "echo scanning; exit 0"), None);
        let out = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.project_key, "octo_engine");
        assert!(out.external_report.is_none());
    }

    #[tokio::test]
    async fn non_zero_scanner_exit_is_analysis_failure() {
        let dir = tempdir().unwrap();
        let r = runner(
            &dir,
            script(&dir, "scan.sh", "echo 'EXECUTION FAILURE' >&2; exit 2"),
            None,
        );
        let err = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AnalysisError::AnalysisFailure(msg) => {
                assert!(msg.contains("status 2"));
                assert!(msg.contains("EXECUTION FAILURE"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn heavy_output_on_both_streams_does_not_stall() {
        let dir = tempdir().unwrap();
        // well past a 64 KiB pipe buffer on each stream
        let body = "i=0\nwhile [ $i -lt 4000 ]; do\n  echo \"stdout line $i padding padding padding\"\n  echo \"stderr line $i padding padding padding\" >&2\n  i=$((i+1))\ndone\nexit 0";
        let r = runner(&dir, script(&dir, "noisy.sh", body), None);
        let out = tokio::time::timeout(
            Duration::from_secs(30),
            r.run(&descriptor(), dir.path(), &CancellationToken::new()),
        )
        .await
        .expect("scan stalled")
        .unwrap();
        assert_eq!(out.project_key, "octo_engine");
    }

    #[tokio::test]
    async fn non_utf8_output_is_drained_to_the_end() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("finished");
        let body = format!(
            "printf 'caf\\351\\n'\ni=0\nwhile [ $i -lt 20000 ]; do\n  echo \"line $i padding padding padding\"\n  i=$((i+1))\ndone\ntouch {}\nexit 0",
            marker.display()
        );
        let r = runner(&dir, script(&dir, "latin1.sh", &body), None);
        let out = tokio::time::timeout(
            Duration::from_secs(30),
            r.run(&descriptor(), dir.path(), &CancellationToken::new()),
        )
        .await
        .expect("scan stalled")
        .unwrap();
        assert_eq!(out.project_key, "octo_engine");
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn non_utf8_stderr_tail_is_kept_lossily() {
        let dir = tempdir().unwrap();
        let r = runner(
            &dir,
            script(&dir, "scan.sh", "printf 'caf\\351 broke\\n' >&2; exit 3"),
            None,
        );
        let err = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            AnalysisError::AnalysisFailure(msg) => {
                assert!(msg.contains("status 3"));
                assert!(msg.contains("caf\u{FFFD} broke"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn command_lines_follow_shell_quoting() {
        let (program, args) =
            split_command(r#"sonar-scanner "-Dsonar.projectName=My App" -X"#).unwrap();
        assert_eq!(program, "sonar-scanner");
        assert_eq!(args, ["-Dsonar.projectName=My App", "-X"]);

        let err = split_command(r#"sh "unterminated"#).unwrap_err();
        assert!(matches!(err, AnalysisError::AnalysisFailure(_)));
        let err = split_command("   ").unwrap_err();
        assert!(matches!(err, AnalysisError::AnalysisFailure(_)));
    }

    #[tokio::test]
    async fn quoted_program_path_with_spaces_runs() {
        let dir = tempdir().unwrap();
        let tools = dir.path().join("scanner tools");
        fs::create_dir_all(&tools).unwrap();
        let path = tools.join("scan.sh");
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let r = runner(&dir, format!("sh '{}'", path.display()), None);
        let out = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.project_key, "octo_engine");
    }

    #[tokio::test]
    async fn lint_exit_four_is_success_and_report_is_converted() {
        let dir = tempdir().unwrap();
        let r = runner(
            &dir,
            script(&dir, "scan.sh", "exit 0"),
            Some(script(&dir, "lint.sh", LINT_OK)),
        );
        let out = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        let report = out.external_report.unwrap();
        let converted: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap();
        assert_eq!(converted["issues"][0]["severity"], "CRITICAL");
        assert_eq!(converted["issues"][0]["engineId"], "pmd");
    }

    #[tokio::test]
    async fn lint_hard_failure_stops_before_scan() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("scanned");
        let r = runner(
            &dir,
            script(&dir, "scan.sh", &format!("touch {}", marker.display())),
            Some(script(&dir, "lint.sh", "exit 1")),
        );
        let err = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::AnalysisFailure(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempdir().unwrap();
        let r = runner(&dir, script(&dir, "slow.sh", "sleep 30"), None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            r.run(&descriptor(), dir.path(), &cancel),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
    }

    #[tokio::test]
    async fn missing_program_is_analysis_failure() {
        let dir = tempdir().unwrap();
        let r = runner(&dir, "/definitely/not/here".into(), None);
        let err = r
            .run(&descriptor(), dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::AnalysisFailure(_)));
    }
}
