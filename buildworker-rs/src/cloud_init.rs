//! Machine-init (cloud-init) document synthesis.
//!
//! The bootstrap document is assembled as a typed [`CloudConfig`] and then
//! rendered into cloud-init's `#cloud-config` format in a single pass. The
//! document must be a pure function of [`BootstrapInputs`]: the compute
//! instance is replaced whenever its bytes change, so any non-determinism here
//! would cause spurious replacements.

use std::fmt;

use base64::Engine;
use thiserror::Error;
use tracing::{event, Level};

use crate::image::ImageReference;
use crate::proxy_config::ReverseProxyConfig;
use crate::secrets::{SecretBundle, SecretValue};

pub const PROXY_CONFIG_PATH: &str = "/etc/caddy/config.json";
pub const PROXY_CONFIG_PERMISSIONS: &str = "0644";
pub const DATA_DIR: &str = "/data/caddy";
pub const CONTAINER_NAME: &str = "caddy";

const GO_TOOLCHAIN_URL: &str = "https://go.dev/dl/go1.24.1.linux-amd64.tar.gz";
const GO_ROOT: &str = "/usr/local/go";
const CONTAINER_PATH: &str =
    "/usr/local/go/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const PREREQUISITE_PACKAGES: [&str; 5] = [
    "apt-transport-https",
    "ca-certificates",
    "curl",
    "gnupg",
    "lsb-release",
];

const DOCKER_REPO_SETUP: [&str; 6] = [
    "curl -fsSL https://download.docker.com/linux/ubuntu/gpg | gpg --dearmor -o /usr/share/keyrings/docker-archive-keyring.gpg",
    "echo \"deb [arch=$(dpkg --print-architecture) signed-by=/usr/share/keyrings/docker-archive-keyring.gpg] https://download.docker.com/linux/ubuntu $(lsb_release -cs) stable\" | tee /etc/apt/sources.list.d/docker.list > /dev/null",
    "apt-get update",
    "apt-get install -y docker-ce docker-ce-cli containerd.io",
    "systemctl enable docker",
    "systemctl start docker",
];

/// Indentation of `write_files` content relative to the document root.
const CONTENT_INDENT: usize = 6;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("failed to encode reverse-proxy configuration: {0}")]
    ProxyConfig(#[from] serde_json::Error),
}

/// Everything the bootstrap document depends on.
#[derive(Debug, Clone)]
pub struct BootstrapInputs {
    pub container_image: ImageReference,
    pub registry_host: String,
    pub registry_username: Option<SecretValue>,
    pub registry_password: Option<SecretValue>,
    pub reverse_proxy_config: ReverseProxyConfig,
}

impl BootstrapInputs {
    /// Assemble inputs, taking the registry host from the image reference.
    pub fn new(
        container_image: ImageReference,
        secrets: &SecretBundle,
        reverse_proxy_config: ReverseProxyConfig,
    ) -> Self {
        BootstrapInputs {
            registry_host: container_image.registry_host().to_string(),
            container_image,
            registry_username: secrets.registry_username.clone(),
            registry_password: secrets.registry_password.clone(),
            reverse_proxy_config,
        }
    }
}

/// A rendered machine-init document.
///
/// May contain registry credentials, so `Debug` only shows its size.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapDocument(String);

impl BootstrapDocument {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The document as attached to a compute instance's custom data.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0.as_bytes())
    }
}

impl fmt::Debug for BootstrapDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BootstrapDocument({} bytes)", self.0.len())
    }
}

/// Typed model of the subset of `#cloud-config` used here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub package_update: bool,
    pub package_upgrade: bool,
    pub packages: Vec<String>,
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFile {
    pub path: String,
    pub permissions: String,
    pub content: String,
}

impl CloudConfig {
    pub fn render(&self) -> String {
        let mut out = String::from("#cloud-config\n");

        out.push_str(&format!("package_update: {}\n", self.package_update));
        out.push_str(&format!("package_upgrade: {}\n", self.package_upgrade));
        out.push_str("packages:\n");
        for package in &self.packages {
            out.push_str(&format!("  - {package}\n"));
        }

        out.push_str("\nwrite_files:\n");
        for file in &self.write_files {
            out.push_str(&format!("  - path: {}\n", file.path));
            out.push_str(&format!("    permissions: '{}'\n", file.permissions));
            out.push_str("    content: |\n");
            out.push_str(&indent(&file.content, CONTENT_INDENT));
        }

        out.push_str("\nruncmd:\n");
        for command in &self.runcmd {
            if needs_block_scalar(command) {
                out.push_str("  - |\n");
                out.push_str(&indent(command, 4));
            } else {
                out.push_str(&format!("  - {command}\n"));
            }
        }

        out
    }
}

/// Prefix every non-empty line of `text` with `width` spaces. Every line,
/// including the last, is newline-terminated.
fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    let mut out = String::with_capacity(text.len() + width * 8);
    for line in text.lines() {
        if !line.is_empty() {
            out.push_str(&pad);
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Whether a command cannot be written as a plain YAML scalar.
fn needs_block_scalar(command: &str) -> bool {
    command.contains('\n')
        || command.contains(": ")
        || command.contains(" #")
        || command.ends_with(':')
        || command.starts_with(|c: char| "-?:,[]{}#&*!|>'\"%@`".contains(c))
}

/// Single-quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

/// Quote `value` for a POSIX shell only if it contains characters outside of
/// the set that is safe as a bare word.
fn shell_word(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
    if safe {
        value.to_string()
    } else {
        shell_quote(value)
    }
}

fn registry_login(inputs: &BootstrapInputs) -> String {
    let username = shell_quote(inputs.registry_username.as_ref().map_or("", |u| u.expose()));
    let password = shell_quote(inputs.registry_password.as_ref().map_or("", |p| p.expose()));
    let registry = if inputs.registry_host.is_empty() {
        String::new()
    } else {
        format!("{} ", shell_word(&inputs.registry_host))
    };

    // The test is evaluated at boot. Absent credentials render as empty
    // strings and turn the login into a no-op.
    format!(
        "if [ -n {username} ] && [ -n {password} ]; then\n  \
         echo {password} | docker login {registry}-u {username} --password-stdin\n\
         fi\n"
    )
}

/// Assemble the typed machine-init model for `inputs`.
pub fn cloud_config(inputs: &BootstrapInputs) -> Result<CloudConfig, SynthesisError> {
    let proxy_config = inputs.reverse_proxy_config.to_canonical_json()?;
    let image = shell_word(inputs.container_image.as_str());

    let mut runcmd = vec![format!("mkdir -p {DATA_DIR}")];
    runcmd.extend(DOCKER_REPO_SETUP.iter().map(|c| c.to_string()));
    runcmd.push(registry_login(inputs));
    runcmd.push(format!("curl -fsSL {GO_TOOLCHAIN_URL} | tar -C /usr/local -xz"));
    runcmd.push(format!("docker pull {image}"));
    runcmd.push(format!(
        "docker run -d --restart=always --name {CONTAINER_NAME} \
         -p 80:80 -p 443:443 \
         -v {PROXY_CONFIG_PATH}:{PROXY_CONFIG_PATH}:ro \
         -v {DATA_DIR}:/data \
         -v {GO_ROOT}:{GO_ROOT} \
         -e PATH=\"{CONTAINER_PATH}\" \
         {image} caddy run --config {PROXY_CONFIG_PATH}"
    ));

    Ok(CloudConfig {
        package_update: true,
        package_upgrade: true,
        packages: PREREQUISITE_PACKAGES.iter().map(|p| p.to_string()).collect(),
        write_files: vec![WriteFile {
            path: PROXY_CONFIG_PATH.to_string(),
            permissions: PROXY_CONFIG_PERMISSIONS.to_string(),
            content: proxy_config,
        }],
        runcmd,
    })
}

/// Synthesize the bootstrap document for `inputs`.
pub fn synthesize(inputs: &BootstrapInputs) -> Result<BootstrapDocument, SynthesisError> {
    let document = BootstrapDocument(cloud_config(inputs)?.render());

    event!(
        Level::DEBUG,
        image = %inputs.container_image,
        registry_host = %inputs.registry_host,
        bytes = document.0.len(),
        "Synthesized bootstrap document"
    );

    Ok(document)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::domain::Domain;
    use crate::proxy_config;
    use crate::secrets::test::HASH;
    use crate::secrets::BcryptHash;

    fn inputs(image: &str, secrets: SecretBundle) -> BootstrapInputs {
        let domain = Domain::ephemeral("1.2.3.4".parse().unwrap());
        let proxy = proxy_config::build(&domain, &secrets.auth_password_hash);
        BootstrapInputs::new(ImageReference::parse(image).unwrap(), &secrets, proxy)
    }

    fn bundle() -> SecretBundle {
        SecretBundle::new(BcryptHash::parse(HASH).unwrap())
    }

    #[test]
    fn indents_every_line() {
        assert_eq!(indent("a\n  b\n\nc", 2), "  a\n    b\n\n  c\n");
    }

    #[test]
    fn quotes_shell_values() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_word("ghcr.io/org/img:tag"), "ghcr.io/org/img:tag");
        assert_eq!(shell_word("a b"), "'a b'");
    }

    #[test]
    fn document_layout() {
        let doc = synthesize(&inputs("ghcr.io/org/img:tag", bundle())).unwrap();
        let text = doc.as_str();

        assert!(text.starts_with(
            "#cloud-config\n\
             package_update: true\n\
             package_upgrade: true\n\
             packages:\n  - apt-transport-https\n"
        ));
        assert!(text.contains(
            "write_files:\n  - path: /etc/caddy/config.json\n    permissions: '0644'\n    content: |\n      {\n"
        ));

        // Sections appear in a fixed order:
        let positions: Vec<usize> = [
            "packages:",
            "write_files:",
            "runcmd:",
            "  - mkdir -p /data/caddy\n",
            "  - systemctl start docker\n",
            "  - |\n    if [ -n",
            "  - docker pull ghcr.io/org/img:tag\n",
            "  - docker run -d --restart=always --name caddy -p 80:80 -p 443:443",
        ]
        .iter()
        .map(|needle| text.find(needle).unwrap())
        .collect();
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(positions, sorted);

        assert!(text.contains(
            "-v /etc/caddy/config.json:/etc/caddy/config.json:ro -v /data/caddy:/data"
        ));
        assert!(text.ends_with("ghcr.io/org/img:tag caddy run --config /etc/caddy/config.json\n"));
    }

    #[test]
    fn embedded_config_round_trips() {
        let inputs = inputs("ghcr.io/org/img:tag", bundle());
        let config = cloud_config(&inputs).unwrap();
        assert_eq!(
            config.write_files[0].content,
            inputs.reverse_proxy_config.to_canonical_json().unwrap()
        );

        // Strip the block indentation back off and parse the JSON:
        let text = config.render();
        let start = text.find("    content: |\n").unwrap() + "    content: |\n".len();
        let end = text.find("\nruncmd:").unwrap();
        let embedded: String = text[start..end]
            .lines()
            .map(|l| l.strip_prefix("      ").unwrap_or(l))
            .collect::<Vec<_>>()
            .join("\n");
        let parsed: serde_json::Value = serde_json::from_str(&embedded).unwrap();
        assert_eq!(
            parsed["apps"]["http"]["servers"]["srv0"]["routes"][0]["match"][0]["host"][0],
            "1.2.3.4.sslip.io"
        );
    }

    #[test]
    fn login_parameterized_with_credentials() {
        let secrets = bundle().with_registry_credentials(Some("bot".into()), Some("s3cr3t".into()));
        let doc = synthesize(&inputs("ghcr.io/org/img:tag", secrets)).unwrap();

        assert!(doc.as_str().contains(
            "    if [ -n 'bot' ] && [ -n 's3cr3t' ]; then\n      \
             echo 's3cr3t' | docker login ghcr.io -u 'bot' --password-stdin\n    fi\n"
        ));
    }

    #[test]
    fn login_inert_without_credentials() {
        let doc = synthesize(&inputs("img:tag", bundle())).unwrap();
        assert!(doc
            .as_str()
            .contains("    if [ -n '' ] && [ -n '' ]; then\n      echo '' | docker login -u '' --password-stdin\n"));

        let half = bundle().with_registry_credentials(Some("bot".into()), None);
        let doc = synthesize(&inputs("img:tag", half)).unwrap();
        assert!(doc.as_str().contains("[ -n 'bot' ] && [ -n '' ]"));
    }

    #[test]
    fn base64_custom_data() {
        let doc = synthesize(&inputs("img:tag", bundle())).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(doc.to_base64())
            .unwrap();
        assert_eq!(decoded, doc.as_str().as_bytes());
    }
}
