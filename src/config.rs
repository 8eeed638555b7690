//! Controller configuration
//!
//! Every setting is a command-line flag with an environment variable
//! fallback, so the operator can be configured from a Deployment's `env`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::admission::{AdmissionConfig, DEFAULT_ADMISSION_REPO_PATH, DEFAULT_ADMISSION_REPO_URL};
use crate::kinds::KindTable;
use crate::source::GitCredentials;
use crate::Error;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Settings for the controller
#[derive(Args, Clone, Debug)]
pub struct ControllerArgs {
    /// Base directory for application workspaces (`<root>/<namespace>/<name>`)
    #[arg(long, env = "WORKSPACE_ROOT", default_value = crate::DEFAULT_WORKSPACE_ROOT)]
    pub workspace_root: PathBuf,

    /// Actor allowed to create anything without access review
    #[arg(long, env = "SUPERUSER", default_value = crate::DEFAULT_SUPERUSER)]
    pub superuser: String,

    /// Annotation holding the user that created a MicroApplication
    #[arg(long, env = "CREATOR_ANNOTATION", default_value = crate::CREATOR_ANNOTATION)]
    pub creator_annotation: String,

    /// Field manager for creates and status writes
    #[arg(long, env = "FIELD_MANAGER", default_value = crate::FIELD_MANAGER)]
    pub field_manager: String,

    /// Deadline in seconds for one reconciliation
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 300)]
    pub reconcile_timeout_secs: u64,

    /// SSH key or token file for private repositories
    #[arg(long, env = "GIT_CREDENTIALS_PATH")]
    pub git_credentials_path: Option<PathBuf>,

    /// Extra kind mappings, comma separated (`Kind.group=plural[:cluster]`)
    #[arg(long, env = "KIND_PLURALS", value_delimiter = ',')]
    pub kind_plurals: Vec<String>,

    /// Seed the kind table from API discovery at startup
    #[arg(long, env = "DISCOVER_KINDS", default_value_t = false)]
    pub discover_kinds: bool,

    /// Install the admission companion at startup
    #[arg(long, env = "INSTALL_ADMISSION_CONTROLLER", default_value_t = false)]
    pub install_admission_controller: bool,

    /// Repository of the admission companion
    #[arg(long, env = "ADMISSION_CONTROLLER_REPO_URL", default_value = DEFAULT_ADMISSION_REPO_URL)]
    pub admission_controller_repo_url: String,

    /// Manifest path inside the admission companion repository
    #[arg(long, env = "ADMISSION_CONTROLLER_REPO_PATH", default_value = DEFAULT_ADMISSION_REPO_PATH)]
    pub admission_controller_repo_path: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl ControllerArgs {
    /// Deadline for one reconciliation
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    /// Credentials for private repositories, if configured
    pub fn git_credentials(&self) -> Option<GitCredentials> {
        self.git_credentials_path
            .clone()
            .map(|path| GitCredentials { path })
    }

    /// Where the admission companion is installed from
    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            repo_url: self.admission_controller_repo_url.clone(),
            manifest_path: self.admission_controller_repo_path.clone(),
        }
    }

    /// Built-in kind table plus the configured extra mappings
    pub fn kind_table(&self) -> Result<KindTable, Error> {
        let mut table = KindTable::with_builtin_kinds();
        for entry in self.kind_plurals.iter().filter(|e| !e.trim().is_empty()) {
            table.parse_entry(entry)?;
        }
        Ok(table)
    }

    /// Validate settings that clap cannot check on its own
    pub fn validate(&self) -> Result<(), Error> {
        if self.reconcile_timeout_secs == 0 {
            return Err(Error::validation("reconcile timeout must be at least 1s"));
        }
        if self.superuser.trim().is_empty() {
            return Err(Error::validation("superuser must not be empty"));
        }
        if self.creator_annotation.trim().is_empty() {
            return Err(Error::validation("creator annotation must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::KindResolver;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ControllerArgs,
    }

    fn parse(argv: &[&str]) -> ControllerArgs {
        let mut full = vec!["microapp"];
        full.extend_from_slice(argv);
        TestCli::try_parse_from(full).unwrap().args
    }

    #[test]
    fn defaults_match_the_operator_contract() {
        let args = parse(&[]);
        assert_eq!(args.workspace_root, PathBuf::from("/tmp"));
        assert_eq!(args.superuser, "kube:admin");
        assert_eq!(args.creator_annotation, "generated-creator");
        assert_eq!(args.reconcile_timeout(), Duration::from_secs(300));
        assert!(!args.install_admission_controller);
        assert_eq!(args.admission(), AdmissionConfig::default());
        assert_eq!(args.log_format, LogFormat::Text);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn kind_plurals_extend_the_builtin_table() {
        let args = parse(&[
            "--kind-plurals",
            "Widget.example.com=widgets,Tenant.example.com=tenants:cluster",
        ]);
        let table = args.kind_table().unwrap();
        assert_eq!(
            table.resolve("example.com/v1", "Widget").unwrap().plural,
            "widgets"
        );
        assert!(!table.resolve("example.com/v1", "Tenant").unwrap().namespaced);
        assert!(table.resolve("apps/v1", "Deployment").is_ok());
    }

    #[test]
    fn malformed_kind_plural_is_rejected() {
        let args = parse(&["--kind-plurals", "Widget"]);
        assert!(args.kind_table().is_err());
    }

    #[test]
    fn admission_settings_are_overridable() {
        let args = parse(&[
            "--install-admission-controller",
            "--admission-controller-repo-url",
            "https://git.example.com/admission",
            "--admission-controller-repo-path",
            "manifests/kubernetes",
        ]);
        assert!(args.install_admission_controller);
        let admission = args.admission();
        assert_eq!(admission.repo_url, "https://git.example.com/admission");
        assert_eq!(admission.manifest_path, "manifests/kubernetes");
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let args = parse(&["--reconcile-timeout-secs", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn credentials_path_becomes_git_credentials() {
        let args = parse(&["--git-credentials-path", "/etc/microapp/id_ed25519"]);
        assert_eq!(
            args.git_credentials().unwrap().path,
            PathBuf::from("/etc/microapp/id_ed25519")
        );
        assert!(parse(&[]).git_credentials().is_none());
    }

    #[test]
    fn json_log_format_parses() {
        assert_eq!(parse(&["--log-format", "json"]).log_format, LogFormat::Json);
    }
}
