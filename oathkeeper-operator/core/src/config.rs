//! The Oathkeeper service configuration document.
//!
//! The document skeleton is fixed. Only two things vary: the identity provider's endpoints
//! (absent until an identity provider is related) and the list of rule repositories.

use crate::{OATHKEEPER_API_PORT, OATHKEEPER_PROXY_PORT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SESSION_COOKIE: &str = "ory_kratos_session";

/// Endpoints published by the identity provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEndpoints {
    /// Where unauthenticated browser requests are redirected.
    pub login_url: Option<String>,

    /// Where session cookies are checked.
    pub session_check_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub log: Log,
    pub serve: Serve,
    pub errors: Errors,
    pub access_rules: AccessRulesConfig,
    pub authenticators: Authenticators,
    pub authorizers: Authorizers,
    pub mutators: Mutators,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub level: String,
    pub format: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Serve {
    pub api: Listener,
    pub proxy: Listener,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub port: u16,
    pub cors: Cors,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cors {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Errors {
    pub fallback: Vec<String>,
    pub handlers: ErrorHandlers,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlers {
    pub json: Toggle<JsonErrors>,
    pub redirect: Toggle<RedirectErrors>,
}

/// An optional Oathkeeper strategy and its configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toggle<C> {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<C>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonErrors {
    pub verbose: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectErrors {
    pub to: Option<String>,
    pub when: Vec<RedirectWhen>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectWhen {
    pub error: Vec<String>,
    pub request: RedirectRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRequest {
    pub header: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRulesConfig {
    pub matching_strategy: String,
    pub repositories: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticators {
    pub noop: Toggle<()>,
    pub anonymous: Toggle<AnonymousAuthenticator>,
    pub cookie_session: Toggle<CookieSessionAuthenticator>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymousAuthenticator {
    pub subject: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSessionAuthenticator {
    pub check_session_url: Option<String>,
    pub preserve_path: bool,
    pub extra_from: String,
    pub subject_from: String,
    pub only: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorizers {
    pub allow: Toggle<()>,
    pub deny: Toggle<()>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutators {
    pub noop: Toggle<()>,
    pub header: Toggle<HeaderMutator>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMutator {
    pub headers: BTreeMap<String, String>,
}

/// Renders the service configuration.
///
/// `rule_locations` are the paths of every rule artifact as seen by the workload; they are
/// referenced in the given order.
pub fn compose<S: AsRef<str>>(identity: &IdentityEndpoints, rule_locations: &[S]) -> ServiceConfig {
    ServiceConfig {
        log: Log {
            level: "info".to_string(),
            format: "json".to_string(),
        },
        serve: Serve {
            api: Listener::new(OATHKEEPER_API_PORT),
            proxy: Listener::new(OATHKEEPER_PROXY_PORT),
        },
        errors: Errors {
            fallback: vec!["json".to_string()],
            handlers: ErrorHandlers {
                json: Toggle::enabled(JsonErrors { verbose: true }),
                redirect: Toggle::enabled(RedirectErrors {
                    to: identity.login_url.clone(),
                    when: vec![RedirectWhen {
                        error: strings(&["unauthorized", "forbidden"]),
                        request: RedirectRequest {
                            header: [("accept".to_string(), strings(&["text/html"]))]
                                .into_iter()
                                .collect(),
                        },
                    }],
                }),
            },
        },
        access_rules: AccessRulesConfig {
            matching_strategy: "regexp".to_string(),
            repositories: rule_locations
                .iter()
                .map(|location| repository_url(location.as_ref()))
                .collect(),
        },
        authenticators: Authenticators {
            noop: Toggle::on(),
            anonymous: Toggle::enabled(AnonymousAuthenticator {
                subject: "anonymous".to_string(),
            }),
            cookie_session: Toggle::enabled(CookieSessionAuthenticator {
                check_session_url: identity.session_check_url.clone(),
                preserve_path: true,
                extra_from: "@this".to_string(),
                subject_from: "identity.id".to_string(),
                only: vec![SESSION_COOKIE.to_string()],
            }),
        },
        authorizers: Authorizers {
            allow: Toggle::on(),
            deny: Toggle::on(),
        },
        mutators: Mutators {
            noop: Toggle::on(),
            header: Toggle::enabled(HeaderMutator {
                headers: [("X-User".to_string(), "{{ print .Subject }}".to_string())]
                    .into_iter()
                    .collect(),
            }),
        },
    }
}

fn repository_url(location: &str) -> String {
    format!("file://{location}")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

// === impl ServiceConfig ===

impl ServiceConfig {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

// === impl Listener ===

impl Listener {
    fn new(port: u16) -> Self {
        Self {
            port,
            cors: Cors {
                enabled: true,
                allowed_origins: strings(&["*"]),
                allowed_methods: strings(&["POST", "GET", "PUT", "PATCH", "DELETE"]),
                allowed_headers: strings(&["Authorization", "Content-Type"]),
                exposed_headers: strings(&["Content-Type"]),
                allow_credentials: true,
            },
        }
    }
}

// === impl Toggle ===

impl<C> Toggle<C> {
    fn on() -> Self {
        Self {
            enabled: true,
            config: None,
        }
    }

    fn enabled(config: C) -> Self {
        Self {
            enabled: true,
            config: Some(config),
        }
    }
}
