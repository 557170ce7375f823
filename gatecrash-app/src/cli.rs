//! Command-line surface and its translation into the engine's config types.

use anyhow::{bail, Context};
use clap::Parser;
use gatecrash_common::{ClientConfig, FilterConfig, ScanConfig};
use gatecrash_modules::BypassModule;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "gatecrash",
    about = "401/403 bypass scanner: mutated HTTP requests with byte-exact fidelity",
    version
)]
pub struct Cli {
    /// Single target URL.
    #[arg(short = 'u', long = "url")]
    pub url: Option<String>,

    /// File with one target URL per line.
    #[arg(short = 'l', long = "url-list", conflicts_with = "url")]
    pub url_list: Option<PathBuf>,

    /// File with substitute hosts for the http_host module.
    #[arg(long = "shf", value_name = "HOSTS_FILE")]
    pub substitute_hosts_file: Option<PathBuf>,

    /// Modules to run: comma-separated names or `all`.
    #[arg(short = 'm', long = "modules", default_value = "all")]
    pub modules: String,

    /// Concurrent request workers.
    #[arg(short = 't', long = "threads", default_value_t = 15)]
    pub threads: usize,

    /// Per-request timeout in milliseconds.
    #[arg(short = 'T', long = "timeout", value_name = "MS", default_value_t = 20_000)]
    pub timeout_ms: u64,

    /// Fixed inter-request delay in milliseconds (global, all workers).
    #[arg(long = "delay", value_name = "MS", default_value_t = 0)]
    pub delay_ms: u64,

    /// Retry attempts for retryable transport failures.
    #[arg(long = "max-retries", default_value_t = 2)]
    pub max_retries: u32,

    /// Base retry backoff in milliseconds (scales with the attempt number).
    #[arg(long = "retry-delay", value_name = "MS", default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// Consecutive failures before a host is dropped for the module run.
    #[arg(long = "max-cfr", value_name = "N", default_value_t = 5)]
    pub max_consecutive_failed_reqs: u32,

    /// Status codes to keep: comma-separated list, or `all`/`*`.
    #[arg(long = "mc", value_name = "STATUS_LIST")]
    pub match_status_codes: Option<String>,

    /// Content-Type substrings to keep (comma-separated).
    #[arg(long = "mct", value_name = "CT_LIST")]
    pub match_content_types: Option<String>,

    /// Minimum Content-Length to keep.
    #[arg(long = "min-cl")]
    pub min_content_length: Option<u64>,

    /// Maximum Content-Length to keep.
    #[arg(long = "max-cl")]
    pub max_content_length: Option<u64>,

    /// HTTP CONNECT proxy, e.g. http://127.0.0.1:8080.
    #[arg(short = 'x', long = "proxy")]
    pub proxy: Option<String>,

    /// Extra IP-spoofing header names (repeatable).
    #[arg(long = "spoof-header", value_name = "NAME")]
    pub spoof_headers: Vec<String>,

    /// Extra spoofed IP values (repeatable).
    #[arg(long = "spoof-ip", value_name = "IP")]
    pub spoof_ips: Vec<String>,

    /// Response body preview size in bytes.
    #[arg(long = "rbps", value_name = "BYTES", default_value_t = 1024)]
    pub response_body_preview_size: usize,

    /// Close the response reader at the preview cap instead of draining the
    /// body (costs connection reuse on every capped response).
    #[arg(long = "stream")]
    pub stream_response_body: bool,

    /// Replay a debug token instead of scanning.
    #[arg(long = "resend", value_name = "TOKEN")]
    pub resend: Option<String>,

    /// How many copies to send with --resend.
    #[arg(long = "resend-count", value_name = "N", default_value_t = 1)]
    pub resend_count: usize,

    /// Rewrite the payload table directory from the embedded defaults.
    #[arg(long = "update-payloads")]
    pub update_payloads: bool,

    /// Directory of payload tables overriding the embedded defaults.
    #[arg(long = "payload-dir", value_name = "DIR")]
    pub payload_dir: Option<PathBuf>,

    /// Results file: `.db`/`.sqlite` selects SQLite, anything else JSONL.
    #[arg(short = 'o', long = "output", default_value = "gatecrash_results.jsonl")]
    pub output: PathBuf,

    /// Mirror logs to stderr.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    pub fn scan_config(&self) -> anyhow::Result<ScanConfig> {
        if self.threads == 0 {
            bail!("-t/--threads must be at least 1");
        }

        let client = ClientConfig {
            request_timeout: Duration::from_millis(self.timeout_ms),
            response_body_preview_size: self.response_body_preview_size,
            stream_response_body: self.stream_response_body,
            proxy: self.proxy.clone(),
            ..Default::default()
        };
        client.validate()?;

        Ok(ScanConfig {
            threads: self.threads,
            delay: Duration::from_millis(self.delay_ms),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_consecutive_failed_reqs: self.max_consecutive_failed_reqs.max(1),
            filters: self.filters()?,
            client,
            ..Default::default()
        })
    }

    /// `--mc` semantics: absent or `all`/`*` keeps every status; an empty
    /// value keeps none; otherwise exactly the listed codes.
    fn filters(&self) -> anyhow::Result<FilterConfig> {
        let match_status_codes = match self.match_status_codes.as_deref() {
            None => None,
            Some(raw) if raw.trim().eq_ignore_ascii_case("all") || raw.trim() == "*" => None,
            Some(raw) => {
                let mut codes = Vec::new();
                for part in raw.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    codes.push(
                        part.parse::<u16>()
                            .with_context(|| format!("bad status code {part:?} in --mc"))?,
                    );
                }
                Some(codes)
            }
        };

        let match_content_types = self
            .match_content_types
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(FilterConfig {
            match_status_codes,
            match_content_types,
            min_content_length: self.min_content_length,
            max_content_length: self.max_content_length,
        })
    }

    pub fn selected_modules(&self) -> anyhow::Result<Vec<BypassModule>> {
        BypassModule::parse_selection(&self.modules).map_err(Into::into)
    }

    /// Resolve the target list from `-u` / `-l`.
    pub fn targets(&self) -> anyhow::Result<Vec<String>> {
        if let Some(url) = &self.url {
            return Ok(vec![url.clone()]);
        }
        let Some(path) = &self.url_list else {
            bail!("either -u URL or -l URLS_FILE is required");
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading URL list {}", path.display()))?;
        let urls: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            bail!("URL list {} is empty", path.display());
        }
        Ok(urls)
    }

    pub fn substitute_hosts(&self) -> anyhow::Result<Vec<String>> {
        let Some(path) = &self.substitute_hosts_file else {
            return Ok(Vec::new());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading hosts file {}", path.display()))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("gatecrash").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_scanner_expectations() {
        let cli = parse(&["-u", "http://h/x"]);
        let cfg = cli.scan_config().unwrap();
        assert_eq!(cfg.threads, 15);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.max_consecutive_failed_reqs, 5);
        assert_eq!(cfg.client.response_body_preview_size, 1024);
        assert!(!cfg.client.stream_response_body);
        assert!(cfg.filters.match_status_codes.is_none());

        let cli = parse(&["-u", "http://h/x", "--stream"]);
        assert!(cli.scan_config().unwrap().client.stream_response_body);
    }

    #[test]
    fn mc_all_star_and_lists() {
        let cli = parse(&["-u", "http://h/x", "--mc", "all"]);
        assert!(cli.scan_config().unwrap().filters.match_status_codes.is_none());

        let cli = parse(&["-u", "http://h/x", "--mc", "*"]);
        assert!(cli.scan_config().unwrap().filters.match_status_codes.is_none());

        let cli = parse(&["-u", "http://h/x", "--mc", "200,301"]);
        assert_eq!(
            cli.scan_config().unwrap().filters.match_status_codes,
            Some(vec![200, 301])
        );

        let cli = parse(&["-u", "http://h/x", "--mc", ""]);
        assert_eq!(
            cli.scan_config().unwrap().filters.match_status_codes,
            Some(vec![])
        );

        let cli = parse(&["-u", "http://h/x", "--mc", "2xx"]);
        assert!(cli.scan_config().is_err());
    }

    #[test]
    fn module_selection_errors_bubble() {
        let cli = parse(&["-u", "http://h/x", "-m", "dumb_check,bogus"]);
        assert!(cli.selected_modules().is_err());
        let cli = parse(&["-u", "http://h/x", "-m", "dumb_check,mid_paths"]);
        assert_eq!(cli.selected_modules().unwrap().len(), 2);
    }

    #[test]
    fn targets_require_a_source() {
        let cli = parse(&["--resend", "token"]);
        assert!(cli.targets().is_err());
    }

    #[test]
    fn url_list_file_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("urls.txt");
        std::fs::write(&path, "# comment\nhttp://a/x\n\nhttp://b/y\n").unwrap();
        let cli = parse(&["-l", path.to_str().unwrap()]);
        assert_eq!(cli.targets().unwrap(), vec!["http://a/x", "http://b/y"]);
    }
}
