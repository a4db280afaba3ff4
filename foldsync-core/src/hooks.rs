//! Post-sync hooks: HTTP requests and commands fired after each successful
//! file copy. Hook failures are recorded in the status registry and never
//! propagate to the sync caller.

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use reqwest::Method;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CommandHook, HttpHook, Pair};
use crate::filter::hook_matches;

const HTTP_TIMEOUT: Duration = Duration::from_secs(20);
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(300);

const MAX_SUCCESS_BODY: usize = 4096;
const MAX_ERROR_BODY: usize = 2000;
const MAX_COMMAND_OUTPUT: usize = 4000;
const MAX_DISPLAY_SNIPPET: usize = 1000;

/// Commands the dispatcher refuses to run.
const DANGEROUS_COMMANDS: [&str; 13] = [
    "rm", "rmdir", "del", "erase", "format", "mkfs", "shutdown", "reboot", "halt", "poweroff",
    "dd", "fdisk", "parted",
];

const DANGEROUS_PATTERNS: [&str; 8] = [
    " rm -rf", " rm -r ", " del /s", " :> ", " >/dev/sd", "--force", "/f /s", "sudo rm",
];

/// Seam between the copy engine / watcher and the hook implementation.
/// `rel_path` always uses forward slashes. Implementations must not fail
/// out of this call.
#[async_trait]
pub trait HookSink: Send + Sync {
    async fn file_synced(&self, token: &CancellationToken, pair: &Pair, rel_path: &str);
}

/// Sink that does nothing.
pub struct NoopHooks;

#[async_trait]
impl HookSink for NoopHooks {
    async fn file_synced(&self, _token: &CancellationToken, _pair: &Pair, _rel_path: &str) {}
}

/// Outcome of the most recent hook execution for a pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStatus {
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub hook_type: String,
    pub success: bool,
    pub info: String,
}

/// Latest hook status per pair, owned by the pair manager and injected
/// into the runner.
#[derive(Default)]
pub struct HookStatusRegistry {
    inner: Mutex<HashMap<String, HookStatus>>,
}

impl HookStatusRegistry {
    pub fn record(&self, pair_id: &str, status: HookStatus) {
        self.inner.lock().unwrap().insert(pair_id.to_string(), status);
    }

    pub fn last(&self, pair_id: &str) -> Option<HookStatus> {
        self.inner.lock().unwrap().get(pair_id).cloned()
    }
}

/// Executes a pair's hooks with template substitution, filtering, retries
/// and status tracking.
pub struct HookRunner {
    client: reqwest::Client,
    statuses: Arc<HookStatusRegistry>,
}

struct TemplateVars {
    rel_path: String,
    basename: String,
    source_path: String,
    target_path: String,
    timestamp: String,
}

impl TemplateVars {
    fn new(pair: &Pair, rel_path: &str) -> Self {
        let basename = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();
        Self {
            rel_path: rel_path.to_string(),
            basename,
            source_path: pair.source.join(rel_path).to_string_lossy().into_owned(),
            target_path: pair.target.join(rel_path).to_string_lossy().into_owned(),
            timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Substitute the `{{.Field}}` template variables.
    fn render(&self, template: &str) -> String {
        template
            .replace("{{.RelPath}}", &self.rel_path)
            .replace("{{.Basename}}", &self.basename)
            .replace("{{.SourcePath}}", &self.source_path)
            .replace("{{.TargetPath}}", &self.target_path)
            .replace("{{.Timestamp}}", &self.timestamp)
    }
}

impl HookRunner {
    pub fn new(statuses: Arc<HookStatusRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, statuses }
    }

    /// Run every hook of `pair` that matches `rel_path`.
    pub async fn run_hooks(&self, token: &CancellationToken, pair: &Pair, rel_path: &str) {
        if pair.hooks.is_empty() {
            return;
        }
        let vars = TemplateVars::new(pair, rel_path);
        for hook in &pair.hooks {
            if !hook_matches(&hook.match_extensions, &hook.match_globs, rel_path) {
                continue;
            }
            match (&hook.http, &hook.command) {
                (Some(http), _) if !http.url.trim().is_empty() => {
                    self.run_http_hook(token, pair, http, &vars).await;
                }
                (_, Some(command)) if !command.executable.trim().is_empty() => {
                    self.run_command_hook(token, pair, command, &vars).await;
                }
                _ => {
                    warn!(pair = %pair.id, file = rel_path, "unknown hook type");
                    self.record(pair, &vars, "unknown", false, "unknown hook type");
                }
            }
        }
    }

    async fn run_http_hook(
        &self,
        token: &CancellationToken,
        pair: &Pair,
        http: &HttpHook,
        vars: &TemplateVars,
    ) {
        let started = Instant::now();
        let method_text = http.method.trim().to_uppercase();
        let method = if method_text.is_empty() {
            Method::POST
        } else {
            match Method::from_bytes(method_text.as_bytes()) {
                Ok(m) => m,
                Err(_) => {
                    self.record(pair, vars, "http", false, &format!("invalid method {method_text:?}"));
                    return;
                }
            }
        };
        let url = http.url.trim();

        let body = vars.render(&http.body_template);
        let has_body = method != Method::GET && !body.is_empty();

        let mut attempt: u32 = 0;
        let mut backoff = RETRY_INITIAL_BACKOFF;
        let max_retries = pair.hook_retries();
        loop {
            let mut request = self.client.request(method.clone(), url);
            for (key, value) in &http.headers {
                if key.eq_ignore_ascii_case("content-type") && !has_body {
                    continue;
                }
                request = request.header(key.as_str(), value.as_str());
            }
            if has_body {
                if !header_present(&http.headers, "content-type") {
                    request = request.header("Content-Type", "application/json");
                }
                request = request.body(body.clone());
            }
            if !header_present(&http.headers, "accept") {
                request = request.header("Accept", "application/json, */*;q=0.1");
            }

            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    self.record(pair, vars, "http", false, "cancelled");
                    return;
                }
                res = request.send() => res,
            };

            let failure = match outcome {
                Ok(response) if response.status().is_success() => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let snippet = truncate(text.trim(), MAX_DISPLAY_SNIPPET);
                    let mut summary = format!(
                        "HTTP {} in {}ms",
                        status.as_u16(),
                        started.elapsed().as_millis()
                    );
                    if !snippet.is_empty() {
                        let shown = truncate(&snippet, MAX_SUCCESS_BODY);
                        summary.push_str("; ");
                        summary.push_str(&shown);
                    }
                    info!(pair = %pair.id, file = %vars.rel_path, elapsed_ms = started.elapsed().as_millis() as u64, "http hook success");
                    self.record(pair, vars, "http", true, &summary);
                    return;
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let mut message = format!(
                        "HTTP {} {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("")
                    );
                    let body = truncate(body.trim(), MAX_ERROR_BODY);
                    if !body.is_empty() {
                        message.push_str("; ");
                        message.push_str(&body);
                    }
                    message
                }
                Err(err) => err.to_string(),
            };

            attempt += 1;
            if attempt > max_retries {
                error!(pair = %pair.id, file = %vars.rel_path, error = %failure, "http hook failed");
                self.record(pair, vars, "http", false, &failure);
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
        }
    }

    async fn run_command_hook(
        &self,
        token: &CancellationToken,
        pair: &Pair,
        command: &CommandHook,
        vars: &TemplateVars,
    ) {
        let started = Instant::now();
        let args: Vec<String> = command.args.iter().map(|arg| vars.render(arg)).collect();

        if !command_is_safe(&command.executable, &args) {
            self.record(pair, vars, "command", false, "command rejected by safety checks");
            return;
        }

        let mut cmd = tokio::process::Command::new(&command.executable);
        cmd.args(&args).kill_on_drop(true);
        if !command.work_dir.trim().is_empty() {
            cmd.current_dir(command.work_dir.trim());
        }
        for (key, value) in &command.env_vars {
            cmd.env(key, value);
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => {
                self.record(pair, vars, "command", false, "cancelled");
                return;
            }
            out = cmd.output() => out,
        };

        match outcome {
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                let text = truncate(text.trim(), MAX_COMMAND_OUTPUT);
                if output.status.success() {
                    info!(pair = %pair.id, file = %vars.rel_path, elapsed_ms = started.elapsed().as_millis() as u64, "command hook success");
                    self.record(pair, vars, "command", true, &text);
                } else {
                    error!(pair = %pair.id, file = %vars.rel_path, output = %text, "command hook failed");
                    let message = if text.is_empty() { output.status.to_string() } else { text };
                    self.record(pair, vars, "command", false, &message);
                }
            }
            Err(err) => {
                error!(pair = %pair.id, file = %vars.rel_path, error = %err, "command hook failed");
                self.record(pair, vars, "command", false, &err.to_string());
            }
        }
    }

    fn record(&self, pair: &Pair, vars: &TemplateVars, hook_type: &str, success: bool, info: &str) {
        self.statuses.record(
            &pair.id,
            HookStatus {
                timestamp: Utc::now(),
                file: vars.rel_path.clone(),
                hook_type: hook_type.to_string(),
                success,
                info: info.to_string(),
            },
        );
    }
}

#[async_trait]
impl HookSink for HookRunner {
    async fn file_synced(&self, token: &CancellationToken, pair: &Pair, rel_path: &str) {
        self.run_hooks(token, pair, rel_path).await;
    }
}

fn header_present(headers: &BTreeMap<String, String>, name: &str) -> bool {
    headers.keys().any(|key| key.eq_ignore_ascii_case(name))
}

fn command_is_safe(executable: &str, args: &[String]) -> bool {
    let base = Path::new(executable)
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    for dangerous in DANGEROUS_COMMANDS {
        if base == dangerous || base.starts_with(&format!("{dangerous}.")) {
            return false;
        }
    }
    let full = format!("{} {}", executable.to_lowercase(), args.join(" ").to_lowercase());
    !DANGEROUS_PATTERNS.iter().any(|pattern| full.contains(pattern))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Hook;
    use std::path::PathBuf;

    fn pair() -> Pair {
        Pair {
            id: "p1".into(),
            source: PathBuf::from("/data/src"),
            target: PathBuf::from("/data/dst"),
            ..Pair::default()
        }
    }

    #[test]
    fn template_substitution() {
        let vars = TemplateVars::new(&pair(), "sub/report.pdf");
        let body = vars.render(r#"{"file":"{{.RelPath}}","name":"{{.Basename}}"}"#);
        assert_eq!(body, r#"{"file":"sub/report.pdf","name":"report.pdf"}"#);
        let arg = vars.render("{{.SourcePath}}");
        assert!(arg.ends_with("report.pdf"));
        assert!(arg.contains("src"));
    }

    #[test]
    fn template_leaves_unknown_placeholders() {
        let vars = TemplateVars::new(&pair(), "a.txt");
        assert_eq!(vars.render("{{.Nope}}"), "{{.Nope}}");
    }

    #[test]
    fn command_safety_rejects_destructive_commands() {
        assert!(!command_is_safe("rm", &["-rf".into(), "/".into()]));
        assert!(!command_is_safe("/bin/rm", &[]));
        assert!(!command_is_safe("dd", &[]));
        assert!(!command_is_safe("deploy.sh", &["--force".into()]));
        assert!(command_is_safe("curl", &["http://localhost".into()]));
        assert!(command_is_safe("touch", &["/tmp/marker".into()]));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 100), "short");
        let long = "é".repeat(100);
        let cut = truncate(&long, 11);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 14);
    }

    #[tokio::test]
    async fn command_hook_records_status() {
        let registry = Arc::new(HookStatusRegistry::default());
        let runner = HookRunner::new(Arc::clone(&registry));
        let mut p = pair();
        p.hooks.push(Hook {
            command: Some(CommandHook {
                executable: "echo".into(),
                args: vec!["{{.RelPath}}".into()],
                ..CommandHook::default()
            }),
            ..Hook::default()
        });

        let token = CancellationToken::new();
        runner.run_hooks(&token, &p, "sub/file.txt").await;

        let status = registry.last("p1").expect("status recorded");
        assert!(status.success);
        assert_eq!(status.hook_type, "command");
        assert_eq!(status.file, "sub/file.txt");
        assert!(status.info.contains("sub/file.txt"));
    }

    #[tokio::test]
    async fn hook_filters_skip_non_matching_files() {
        let registry = Arc::new(HookStatusRegistry::default());
        let runner = HookRunner::new(Arc::clone(&registry));
        let mut p = pair();
        p.hooks.push(Hook {
            match_extensions: vec![".jar".into()],
            command: Some(CommandHook { executable: "echo".into(), ..CommandHook::default() }),
            ..Hook::default()
        });

        let token = CancellationToken::new();
        runner.run_hooks(&token, &p, "docs/readme.txt").await;
        assert!(registry.last("p1").is_none());
    }
}
