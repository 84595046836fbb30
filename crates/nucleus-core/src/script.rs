//! Shell script rendering.
//!
//! Scripts are rendered from a typed [`ScriptParams`] into an ordered list of
//! lines. Rendering is pure: no I/O, and the same params always give the same
//! lines. All quoting of interpolated values happens here.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{ConfigError, Result};
use crate::secrets::REDACTED;
use crate::types::ReconfigurationRequest;

pub const MASTER_PASSWORD: &str = "master_password";
pub const SERVICE_PASSWORD: &str = "service_password";

const NUCLEUS_DATA_ROOT: &str = "/var/lib/omni/nucleus-data";
const NUCLEUS_INSTANCE_NAME: &str = "nucleus_server";

// ---------------------------------------------------------------------------
// ScriptTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptTemplate {
    /// Installs the Nucleus server tools and generates/starts the Nucleus stack.
    NucleusServer,
    /// Installs nginx and generates the reverse proxy config for a Nucleus server.
    ReverseProxy,
}

impl ScriptTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptTemplate::NucleusServer => "nucleus_server",
            ScriptTemplate::ReverseProxy => "reverse_proxy",
        }
    }

    /// Credential bindings the template interpolates.
    pub fn required_credentials(&self) -> &'static [&'static str] {
        match self {
            ScriptTemplate::NucleusServer => &[MASTER_PASSWORD, SERVICE_PASSWORD],
            ScriptTemplate::ReverseProxy => &[],
        }
    }
}

impl fmt::Display for ScriptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ScriptParams
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct ScriptParams {
    pub template: ScriptTemplate,
    pub artifacts_bucket: String,
    pub domain: String,
    pub addresses: Vec<String>,
    pub nucleus_build: Option<String>,
    /// Credential binding → value. Values are never printed.
    pub credentials: BTreeMap<String, String>,
}

impl ScriptParams {
    pub fn from_request(req: &ReconfigurationRequest, credentials: BTreeMap<String, String>) -> Self {
        Self {
            template: req.template,
            artifacts_bucket: req.artifacts_bucket.clone(),
            domain: req.domain.clone(),
            addresses: req.addresses.clone(),
            nucleus_build: req.nucleus_build.clone(),
            credentials,
        }
    }
}

impl fmt::Debug for ScriptParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credentials: Vec<&str> = self.credentials.keys().map(String::as_str).collect();
        f.debug_struct("ScriptParams")
            .field("template", &self.template)
            .field("artifacts_bucket", &self.artifacts_bucket)
            .field("domain", &self.domain)
            .field("addresses", &self.addresses)
            .field("nucleus_build", &self.nucleus_build)
            .field("credentials", &credentials)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// An ordered, immutable list of shell lines. Remembers which interpolated
/// values are sensitive so it can print itself safely.
#[derive(Clone, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
    sensitive: Vec<String>,
}

impl Script {
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            lines,
            sensitive: Vec::new(),
        }
    }

    pub fn with_sensitive(lines: Vec<String>, sensitive: Vec<String>) -> Self {
        let sensitive = sensitive.into_iter().filter(|s| !s.is_empty()).collect();
        Self { lines, sensitive }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines with every sensitive value (quoted or bare) replaced by `REDACTED`.
    pub fn redacted_lines(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|line| {
                let mut out = line.clone();
                for value in &self.sensitive {
                    out = out.replace(&shell_quote(value), REDACTED);
                    out = out.replace(value.as_str(), REDACTED);
                }
                out
            })
            .collect()
    }

    /// Redact sensitive values out of arbitrary text (e.g. remote command output).
    /// Values shorter than [`MIN_SUBSTRING_REDACT`] chars are only replaced
    /// where they stand alone, not inside longer words.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.sensitive {
            out = if value.chars().count() < MIN_SUBSTRING_REDACT {
                replace_standalone(&out, value)
            } else {
                out.replace(value.as_str(), REDACTED)
            };
        }
        out
    }
}

/// Shortest sensitive value redacted wherever it occurs in free text.
pub const MIN_SUBSTRING_REDACT: usize = 4;

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replace occurrences of `value` not glued to a word character on either side.
fn replace_standalone(text: &str, value: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    for (pos, _) in text.match_indices(value) {
        let end = pos + value.len();
        let glued_before = text[..pos].chars().next_back().is_some_and(is_word_char);
        let glued_after = text[end..].chars().next().is_some_and(is_word_char);
        if glued_before || glued_after {
            continue;
        }
        out.push_str(&text[copied..pos]);
        out.push_str(REDACTED);
        copied = end;
    }
    out.push_str(&text[copied..]);
    out
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("lines", &self.redacted_lines())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ScriptBuilder
// ---------------------------------------------------------------------------

pub trait ScriptBuilder: Send + Sync {
    fn build(&self, params: &ScriptParams) -> Result<Script>;
}

/// The built-in templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateScriptBuilder;

impl ScriptBuilder for TemplateScriptBuilder {
    fn build(&self, params: &ScriptParams) -> Result<Script> {
        validate(params)?;
        match params.template {
            ScriptTemplate::NucleusServer => nucleus_server(params),
            ScriptTemplate::ReverseProxy => reverse_proxy(params),
        }
    }
}

fn nucleus_server(params: &ScriptParams) -> Result<Script> {
    let build = required("nucleus_build", params.nucleus_build.as_deref())?;
    if !build_re().is_match(build) {
        return Err(ConfigError::Template(format!(
            "nucleus_build '{build}' is not a valid build name"
        )));
    }
    let master = credential(params, MASTER_PASSWORD)?;
    let service = credential(params, SERVICE_PASSWORD)?;
    let bucket = &params.artifacts_bucket;
    let server = params.addresses.first().unwrap_or(&params.domain);
    let archive = format!("./stack/{build}.tar.gz");

    let lines = vec![
        r#"echo "------------------------ NUCLEUS SERVER CONFIG ------------------------""#.to_string(),
        r#"echo "INSTALLING NUCLEUS SERVER TOOLS ----------------------------------""#.to_string(),
        "cd /opt || exit 1".to_string(),
        format!(
            "sudo aws s3 cp --recursive {} ./nucleusServer",
            shell_quote(&format!("s3://{bucket}/tools/nucleusServer/"))
        ),
        "cd nucleusServer || exit 1".to_string(),
        "sudo pip3 install -r requirements.txt".to_string(),
        r#"echo "GENERATING NUCLEUS STACK ----------------------------------""#.to_string(),
        format!(
            "sudo nst generate-nucleus-stack --server-ip {} --reverse-proxy-domain {} \
             --instance-name {NUCLEUS_INSTANCE_NAME} --master-password {} --service-password {} \
             --data-root {NUCLEUS_DATA_ROOT} --nucleus-stack-tarfile {}",
            shell_quote(server),
            shell_quote(&params.domain),
            shell_quote(master),
            shell_quote(service),
            shell_quote(&archive),
        ),
        r#"echo "STARTING NUCLEUS STACK ----------------------------------""#.to_string(),
        "sudo nst start-nucleus-stack".to_string(),
    ];
    Ok(Script::with_sensitive(
        lines,
        vec![master.to_string(), service.to_string()],
    ))
}

fn reverse_proxy(params: &ScriptParams) -> Result<Script> {
    if params.addresses.is_empty() {
        return Err(ConfigError::Template(
            "missing required parameter 'addresses'".to_string(),
        ));
    }
    let bucket = &params.artifacts_bucket;
    let server_args = params
        .addresses
        .iter()
        .map(|a| format!("--server-address {}", shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ");

    let lines = vec![
        r#"echo "------------------------ REVERSE PROXY CONFIG ------------------------""#.to_string(),
        r#"echo "UPDATING PACKAGES ----------------------------------""#.to_string(),
        "sudo yum update -y".to_string(),
        r#"echo "INSTALLING DEPENDENCIES ----------------------------------""#.to_string(),
        "sudo yum install -y aws-cfn-bootstrap gcc openssl-devel bzip2-devel libffi-devel zlib-devel python-pip nginx".to_string(),
        r#"echo "INSTALLING REVERSE PROXY TOOLS ----------------------------------""#.to_string(),
        "cd /opt || exit 1".to_string(),
        format!(
            "sudo aws s3 cp --recursive {} ./reverseProxy",
            shell_quote(&format!("s3://{bucket}/tools/reverseProxy/"))
        ),
        "cd reverseProxy || exit 1".to_string(),
        "sudo pip3 install -r requirements.txt".to_string(),
        format!(
            "sudo rpt generate-nginx-config --domain {} {server_args}",
            shell_quote(&params.domain)
        ),
        r#"echo "STARTING NGINX ----------------------------------""#.to_string(),
        "sudo systemctl start nginx".to_string(),
        "sudo systemctl enable nginx".to_string(),
    ];
    Ok(Script::new(lines))
}

// ---------------------------------------------------------------------------
// Validation and quoting
// ---------------------------------------------------------------------------

static BUCKET_RE: OnceLock<Regex> = OnceLock::new();
static BUILD_RE: OnceLock<Regex> = OnceLock::new();

fn bucket_re() -> &'static Regex {
    BUCKET_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9.\-]{1,61}[a-z0-9]$").unwrap())
}

fn build_re() -> &'static Regex {
    BUILD_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._+\-]*$").unwrap())
}

fn validate(params: &ScriptParams) -> Result<()> {
    required("artifacts_bucket", Some(params.artifacts_bucket.as_str()))?;
    required("domain", Some(params.domain.as_str()))?;
    if !bucket_re().is_match(&params.artifacts_bucket) {
        return Err(ConfigError::Template(format!(
            "artifacts_bucket '{}' is not a valid bucket name",
            params.artifacts_bucket
        )));
    }
    single_line("domain", &params.domain)?;
    for address in &params.addresses {
        required("addresses", Some(address.as_str()))?;
        single_line("addresses", address)?;
    }
    for (binding, value) in &params.credentials {
        if value.contains(['\n', '\r', '\0']) {
            return Err(ConfigError::Template(format!(
                "credential '{binding}' contains a line break"
            )));
        }
    }
    Ok(())
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Template(format!(
            "missing required parameter '{name}'"
        ))),
    }
}

fn single_line(name: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r', '\0']) {
        return Err(ConfigError::Template(format!(
            "parameter '{name}' contains a line break"
        )));
    }
    Ok(())
}

fn credential<'a>(params: &'a ScriptParams, binding: &str) -> Result<&'a str> {
    match params.credentials.get(binding) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Template(format!(
            "missing required credential '{binding}'"
        ))),
    }
}

/// Single-quote a value for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
