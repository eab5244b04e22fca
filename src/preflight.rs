use std::path::Path;

use crate::{config::Config, models::QuotaStore, render::Renderer};

/// Maximum size of a recipients source file preflight will accept.
const MAX_RECIPIENTS_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct PreflightReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PreflightReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Checks that must pass before a campaign is allowed to start. Cheap and
/// synchronous except for the quota headroom check, which needs a
/// round-trip to storage.
pub struct Preflight<'a> {
    config: &'a Config,
    renderer: &'a dyn Renderer,
    quota: &'a QuotaStore,
}

impl<'a> Preflight<'a> {
    pub fn new(config: &'a Config, renderer: &'a dyn Renderer, quota: &'a QuotaStore) -> Self {
        Self {
            config,
            renderer,
            quota,
        }
    }

    pub async fn check(
        &self,
        template_id: &str,
        recipients_path: Option<&Path>,
        expose_webhook_endpoint: bool,
    ) -> PreflightReport {
        let mut report = PreflightReport::default();

        if self.config.provider.api_key.trim().is_empty() {
            report.error("provider API key is missing");
        }

        // `from_email` is already a parsed `EmailAddress`, so syntactic
        // validity was enforced at config load time; this check exists to
        // catch a caller constructing `Config` by hand for tests.
        if self.config.provider.from_email.to_string().is_empty() {
            report.error("from address is missing");
        }

        if !self.renderer.has_template(template_id) {
            report.error(format!("template id does not resolve: {template_id}"));
        }

        if let Some(path) = recipients_path {
            self.check_recipients_path(path, &mut report);
        }

        match self.quota.used_today().await {
            Ok(snapshot) if snapshot.used >= snapshot.limit => {
                report.error("daily quota has no headroom remaining");
            }
            Ok(_) => {}
            Err(e) => report.error(format!("could not read daily quota: {e}")),
        }

        if expose_webhook_endpoint && self.config.webhook.secret.is_none() {
            report.warn("webhook endpoint is exposed without a configured signing secret");
        }

        report
    }

    fn check_recipients_path(&self, path: &Path, report: &mut PreflightReport) {
        match std::fs::metadata(path) {
            Ok(metadata) => {
                if !metadata.is_file() {
                    report.error(format!("recipients source is not a file: {}", path.display()));
                } else if metadata.len() == 0 {
                    report.error("recipients source is empty");
                } else if metadata.len() > MAX_RECIPIENTS_BYTES {
                    report.error(format!(
                        "recipients source exceeds the {MAX_RECIPIENTS_BYTES}-byte size bound"
                    ));
                }
            }
            Err(e) => report.error(format!(
                "recipients source is not readable: {} ({e})",
                path.display()
            )),
        }
    }
}
