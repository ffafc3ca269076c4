//! Reverse-proxy (Caddy) routing and authentication configuration.
//!
//! The configuration is held in a typed model whose shape cannot express
//! anything but the one route this worker needs: a host match on the worker's
//! domain, followed by an authentication gate and the build handler, in that
//! order. It is encoded into Caddy's JSON configuration format by
//! [`ReverseProxyConfig::to_canonical_json`].

use std::time::Duration;

use serde::Serialize;

use crate::domain::Domain;
use crate::secrets::BcryptHash;

/// Username of the single HTTP basic auth account.
pub const AUTH_USERNAME: &str = "caddy";

/// Upstream timeout of the build handler. Compiles can be slow.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

pub const SERVER_NAME: &str = "srv0";
pub const HTTPS_LISTEN_ADDRESS: &str = ":443";

/// Indentation of the canonical JSON encoding.
const JSON_INDENT: &[u8] = b"      ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseProxyConfig {
    listen: String,
    route: Route,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    host: String,
    chain: HandlerChain,
    terminal: bool,
}

/// The ordered handler chain of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerChain {
    pub authentication: BasicAuthentication,
    pub build: BuildHandler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Authentication,
    Build,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuthentication {
    pub username: String,
    pub password_hash: BcryptHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildHandler {
    pub purge_module_cache: bool,
    pub timeout: Duration,
}

/// Build the reverse-proxy configuration for `domain`.
pub fn build(domain: &Domain, auth_password_hash: &BcryptHash) -> ReverseProxyConfig {
    ReverseProxyConfig {
        listen: HTTPS_LISTEN_ADDRESS.to_string(),
        route: Route {
            host: domain.name(),
            chain: HandlerChain {
                authentication: BasicAuthentication {
                    username: AUTH_USERNAME.to_string(),
                    password_hash: auth_password_hash.clone(),
                },
                build: BuildHandler {
                    purge_module_cache: true,
                    timeout: BUILD_TIMEOUT,
                },
            },
            terminal: true,
        },
    }
}

impl ReverseProxyConfig {
    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn routes(&self) -> &[Route] {
        std::slice::from_ref(&self.route)
    }

    /// Encode into Caddy's JSON format.
    ///
    /// Object keys are emitted in a fixed order with a fixed indentation, so
    /// equal configurations always encode to identical bytes.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(JSON_INDENT);
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        wire::Document::from(self).serialize(&mut ser)?;

        String::from_utf8(buf).map_err(<serde_json::Error as serde::ser::Error>::custom)
    }
}

impl Route {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }
}

impl HandlerChain {
    pub fn stages(&self) -> [Stage; 2] {
        [Stage::Authentication, Stage::Build]
    }
}

mod wire {
    //! Caddy JSON structures, borrowed from the typed model.

    use std::collections::BTreeMap;

    use serde::Serialize;

    use crate::secrets::BcryptHash;

    #[derive(Serialize)]
    pub struct Document<'a> {
        apps: Apps<'a>,
    }

    #[derive(Serialize)]
    struct Apps<'a> {
        http: HttpApp<'a>,
    }

    #[derive(Serialize)]
    struct HttpApp<'a> {
        servers: BTreeMap<&'static str, Server<'a>>,
    }

    #[derive(Serialize)]
    struct Server<'a> {
        listen: Vec<&'a str>,
        routes: Vec<Route<'a>>,
    }

    #[derive(Serialize)]
    struct Route<'a> {
        #[serde(rename = "match")]
        matchers: Vec<HostMatcher<'a>>,
        handle: Vec<Handler<'a>>,
        terminal: bool,
    }

    #[derive(Serialize)]
    struct HostMatcher<'a> {
        host: Vec<&'a str>,
    }

    #[derive(Serialize)]
    struct Subroute<'a> {
        handle: Vec<Handler<'a>>,
    }

    #[derive(Serialize)]
    #[serde(tag = "handler", rename_all = "snake_case")]
    enum Handler<'a> {
        Subroute { routes: Vec<Subroute<'a>> },
        Authentication { providers: Providers<'a> },
        CaddyBuilder { purge_module_cache: bool, timeout: u64 },
    }

    #[derive(Serialize)]
    struct Providers<'a> {
        http_basic: HttpBasic<'a>,
    }

    #[derive(Serialize)]
    struct HttpBasic<'a> {
        accounts: Vec<Account<'a>>,
        hash: Hash,
    }

    #[derive(Serialize)]
    struct Account<'a> {
        username: &'a str,
        password: &'a BcryptHash,
    }

    #[derive(Serialize)]
    struct Hash {
        algorithm: &'static str,
    }

    impl<'a> From<&'a super::ReverseProxyConfig> for Document<'a> {
        fn from(config: &'a super::ReverseProxyConfig) -> Self {
            let route = &config.route;
            let chain = &route.chain;

            let authentication = Handler::Authentication {
                providers: Providers {
                    http_basic: HttpBasic {
                        accounts: vec![Account {
                            username: chain.authentication.username.as_str(),
                            password: &chain.authentication.password_hash,
                        }],
                        hash: Hash {
                            algorithm: "bcrypt",
                        },
                    },
                },
            };

            // Durations are integer nanoseconds in Caddy's JSON encoding:
            let build = Handler::CaddyBuilder {
                purge_module_cache: chain.build.purge_module_cache,
                timeout: u64::try_from(chain.build.timeout.as_nanos()).unwrap_or(u64::MAX),
            };

            let server = Server {
                listen: vec![config.listen.as_str()],
                routes: vec![Route {
                    matchers: vec![HostMatcher {
                        host: vec![route.host.as_str()],
                    }],
                    handle: vec![Handler::Subroute {
                        routes: vec![
                            Subroute {
                                handle: vec![authentication],
                            },
                            Subroute {
                                handle: vec![build],
                            },
                        ],
                    }],
                    terminal: route.terminal,
                }],
            };

            Document {
                apps: Apps {
                    http: HttpApp {
                        servers: BTreeMap::from([(super::SERVER_NAME, server)]),
                    },
                },
            }
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::{json, Value};

    use super::*;
    use crate::secrets::test::HASH;

    fn config() -> ReverseProxyConfig {
        let domain = Domain::ManagedRecord {
            hostname: "worker-0".into(),
            zone: "infra.example.com".into(),
        };
        build(&domain, &BcryptHash::parse(HASH).unwrap())
    }

    #[test]
    fn typed_route_shape() {
        let config = config();
        assert_eq!(config.listen(), ":443");
        assert_eq!(config.routes().len(), 1);

        let route = &config.routes()[0];
        assert_eq!(route.host(), "worker-0.infra.example.com");
        assert!(route.is_terminal());
        assert_eq!(route.chain().stages(), [Stage::Authentication, Stage::Build]);
        assert_eq!(route.chain().authentication.username, AUTH_USERNAME);
        assert!(route.chain().build.purge_module_cache);
        assert_eq!(route.chain().build.timeout, Duration::from_secs(600));
    }

    #[test]
    fn encodes_caddy_json() {
        let encoded: Value = serde_json::from_str(&config().to_canonical_json().unwrap()).unwrap();

        let expected = json!({
            "apps": {
                "http": {
                    "servers": {
                        "srv0": {
                            "listen": [":443"],
                            "routes": [{
                                "match": [{"host": ["worker-0.infra.example.com"]}],
                                "handle": [{
                                    "handler": "subroute",
                                    "routes": [
                                        {
                                            "handle": [{
                                                "handler": "authentication",
                                                "providers": {
                                                    "http_basic": {
                                                        "accounts": [{
                                                            "username": "caddy",
                                                            "password": HASH,
                                                        }],
                                                        "hash": {"algorithm": "bcrypt"},
                                                    },
                                                },
                                            }],
                                        },
                                        {
                                            "handle": [{
                                                "handler": "caddy_builder",
                                                "purge_module_cache": true,
                                                "timeout": 600_000_000_000u64,
                                            }],
                                        },
                                    ],
                                }],
                                "terminal": true,
                            }],
                        },
                    },
                },
            },
        });

        assert_eq!(encoded, expected);
    }

    #[test]
    fn non_ascii_host_is_encoded_verbatim() {
        let domain = Domain::ManagedRecord {
            hostname: "bäcker".into(),
            zone: "infra.example.com".into(),
        };
        let encoded = build(&domain, &BcryptHash::parse(HASH).unwrap())
            .to_canonical_json()
            .unwrap();
        assert!(encoded.contains("\"bäcker.infra.example.com\""));
        assert!(!encoded.contains('\u{fffd}'));
    }

    #[test]
    fn canonical_encoding_is_stable() {
        let a = config().to_canonical_json().unwrap();
        let b = config().to_canonical_json().unwrap();
        assert_eq!(a, b);

        // Fixed key order and indentation:
        assert!(a.starts_with("{\n      \"apps\": {\n            \"http\": {"));
        let handler_pos = a.find("\"handler\": \"caddy_builder\"").unwrap();
        let purge_pos = a.find("\"purge_module_cache\"").unwrap();
        let timeout_pos = a.find("\"timeout\"").unwrap();
        assert!(handler_pos < purge_pos && purge_pos < timeout_pos);
    }
}
